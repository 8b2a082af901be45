//! The compile pass: one sequential walk of the schema tree and the byte
//! buffer in lock-step, producing the cursor tree.
//!
//! Sequences and byte-strings are self-delimiting, so a variable's byte
//! extent is only discoverable by walking everything before it; the pass
//! is inherently a single left-to-right traversal and nothing here may
//! read ahead or decode out of order. The buffer position is threaded
//! through an explicit [`ByteWalker`] value rather than hidden state, so
//! the non-reentrant shape of the pass is enforced by the signatures.

use std::collections::HashMap;
use std::sync::Arc;

use dap4_dmr::{DapType, Dataset, Variable};

use crate::checksum::{ChecksumMode, ChecksumSource, ChecksumTracker, CHECKSUM_SIZE};
use crate::cursor::{CursorArena, CursorId, CursorKind, CursorNode, DataBuffer, COUNT_SIZE};
use crate::error::{DecodeError, DecodeResult};
use crate::odometer::Odometer;

/// Explicit read position over the shared data buffer.
///
/// Every compile step consumes bytes through this value; there is no
/// other position bookkeeping.
#[derive(Debug)]
pub(crate) struct ByteWalker<'a> {
    buffer: &'a DataBuffer,
    pos: u64,
}

impl<'a> ByteWalker<'a> {
    fn new(buffer: &'a DataBuffer) -> Self {
        Self { buffer, pos: 0 }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn remaining(&self) -> u64 {
        self.buffer.len() as u64 - self.pos
    }

    fn skip(&mut self, n: u64) -> DecodeResult<()> {
        if n > self.remaining() {
            return Err(DecodeError::MalformedStream(format!(
                "attempt to advance {n} bytes with only {} remaining",
                self.remaining()
            )));
        }
        self.pos += n;
        Ok(())
    }

    /// Consume an 8-byte count field (low 32 bits significant).
    fn read_count(&mut self) -> DecodeResult<u64> {
        let count = self.buffer.length_prefix(self.pos)?;
        self.pos += COUNT_SIZE as u64;
        Ok(count)
    }

    /// Consume the 4-byte trailing checksum after a variable's span.
    fn read_checksum(&mut self) -> DecodeResult<u32> {
        if self.remaining() < CHECKSUM_SIZE as u64 {
            return Err(DecodeError::MalformedStream(
                "short serialization: missing trailing checksum".into(),
            ));
        }
        let value = self.buffer.get_u32(self.pos)?;
        self.pos += CHECKSUM_SIZE as u64;
        Ok(value)
    }
}

/// Output of a compile pass: the cursor arena, the top-level variable
/// registry, and the populated checksum tracker.
#[derive(Debug)]
pub struct CompiledData {
    pub arena: CursorArena,
    pub variables: HashMap<String, CursorId>,
    pub checksums: ChecksumTracker,
}

/// Compile the dechunked `buffer` against `dataset`.
///
/// Walks every top-level variable in declaration order, building its
/// cursor tree and recording its byte extent; when `checksum` is on, the
/// 4 bytes after each top-level span are read as the remote CRC32 and the
/// local value is recomputed over the recorded extent.
pub fn compile(
    dataset: &Dataset,
    buffer: &DataBuffer,
    checksum: ChecksumMode,
) -> DecodeResult<CompiledData> {
    let mut arena = CursorArena::new();
    let mut walker = ByteWalker::new(buffer);
    let mut variables = HashMap::new();
    let mut checksums = ChecksumTracker::new();
    let mut spans: Vec<(String, u64, u64)> = Vec::new();

    for var in &dataset.variables {
        let start = walker.position();
        let id = compile_var(&mut arena, &mut walker, var)?;
        let extent = walker.position() - start;
        tracing::debug!(
            variable = %var.name,
            offset = start,
            extent,
            "compiled top-level variable"
        );
        variables.insert(var.name.clone(), id);
        spans.push((var.name.clone(), start, extent));
        if checksum.enabled() {
            let remote = walker.read_checksum()?;
            checksums.record(ChecksumSource::Remote, &var.name, remote);
        }
    }
    if walker.remaining() > 0 {
        tracing::warn!(
            trailing = walker.remaining(),
            "unconsumed bytes after final variable"
        );
    }

    if checksum.enabled() {
        for (name, offset, extent) in &spans {
            checksums.begin();
            checksums.update(buffer.slice_at(*offset, *extent)?);
            let local = checksums.end();
            checksums.record(ChecksumSource::Local, name, local);
        }
    }

    Ok(CompiledData {
        arena,
        variables,
        checksums,
    })
}

fn compile_var(
    arena: &mut CursorArena,
    walker: &mut ByteWalker<'_>,
    var: &Arc<Variable>,
) -> DecodeResult<CursorId> {
    match &var.ty {
        DapType::Atomic(_) | DapType::Enum(_) => compile_atomic(arena, walker, var),
        DapType::Structure(_) => compile_compound_array(arena, walker, var, false),
        DapType::Sequence(_) => compile_compound_array(arena, walker, var, true),
    }
}

/// Atomic variable: fixed-size types occupy `dim_product * elemsize`
/// contiguous bytes; variable-size types are walked element by element,
/// recording each element's absolute offset in the byte-string table.
fn compile_atomic(
    arena: &mut CursorArena,
    walker: &mut ByteWalker<'_>,
    var: &Arc<Variable>,
) -> DecodeResult<CursorId> {
    let ty = var.ty.decode_as().ok_or_else(|| {
        DecodeError::UnsupportedType(format!("variable '{}' is not atomic", var.name))
    })?;
    let offset = walker.position();
    let dim_product = element_count(var)?;

    let (extent, bytestrings) = match ty.size() {
        Some(elem) => {
            let total = dim_product.checked_mul(elem as u64).ok_or_else(|| {
                DecodeError::MalformedStream(format!(
                    "byte extent of '{}' overflows ({dim_product} elements of {elem} bytes)",
                    var.name
                ))
            })?;
            walker.skip(total)?;
            (total, None)
        }
        None => {
            // Every element starts with its 8-byte length prefix, so
            // the count alone bounds the minimum bytes required.
            let floor = dim_product.checked_mul(COUNT_SIZE as u64);
            if floor.map_or(true, |f| f > walker.remaining()) {
                return Err(DecodeError::MalformedStream(format!(
                    "'{}' declares {dim_product} variable-length elements with only {} bytes remaining",
                    var.name,
                    walker.remaining()
                )));
            }
            let mut positions = Vec::with_capacity(dim_product as usize);
            for _ in 0..dim_product {
                positions.push(walker.position());
                let len = walker.read_count()?;
                walker.skip(len)?;
            }
            (walker.position() - offset, Some(positions))
        }
    };

    Ok(arena.alloc(CursorNode {
        var: Arc::clone(var),
        offset,
        extent,
        kind: CursorKind::Atomic {
            dim_product,
            bytestrings,
        },
    }))
}

/// Structure/sequence variable: one element per flattened index, each
/// compiled in stream order.
fn compile_compound_array(
    arena: &mut CursorArena,
    walker: &mut ByteWalker<'_>,
    var: &Arc<Variable>,
    is_sequence: bool,
) -> DecodeResult<CursorId> {
    let offset = walker.position();
    let count = element_count(var)?;
    // Every element carries at least one byte of serialized content, so
    // a multi-element count beyond the remaining buffer cannot be met.
    if count > walker.remaining().max(1) {
        return Err(DecodeError::MalformedStream(format!(
            "'{}' declares {count} elements with only {} bytes remaining",
            var.name,
            walker.remaining()
        )));
    }
    let mut elements = vec![CursorId(usize::MAX); count as usize];
    for flat in Odometer::full(&var.shape())? {
        let element = if is_sequence {
            compile_sequence(arena, walker, var)?
        } else {
            compile_structure(arena, walker, var)?
        };
        elements[flat as usize] = element;
    }
    let extent = walker.position() - offset;
    let kind = if is_sequence {
        CursorKind::SeqArray { elements }
    } else {
        CursorKind::StructArray { elements }
    };
    Ok(arena.alloc(CursorNode {
        var: Arc::clone(var),
        offset,
        extent,
        kind,
    }))
}

/// One structure instance: every field compiled in declared order,
/// filled exactly once.
fn compile_structure(
    arena: &mut CursorArena,
    walker: &mut ByteWalker<'_>,
    var: &Arc<Variable>,
) -> DecodeResult<CursorId> {
    let st = container_type(var)?;
    let offset = walker.position();
    let id = arena.alloc(CursorNode {
        var: Arc::clone(var),
        offset,
        extent: 0,
        kind: CursorKind::Structure {
            fields: vec![None; st.fields.len()],
        },
    });
    for (m, field) in st.fields.iter().enumerate() {
        let fid = compile_var(arena, walker, field)?;
        arena.fill_field(id, m, fid)?;
    }
    arena.node_mut(id).extent = walker.position() - offset;
    Ok(id)
}

/// One sequence instance: an 8-byte record count, then that many records
/// each carrying all declared fields.
fn compile_sequence(
    arena: &mut CursorArena,
    walker: &mut ByteWalker<'_>,
    var: &Arc<Variable>,
) -> DecodeResult<CursorId> {
    let st = container_type(var)?;
    let offset = walker.position();
    let id = arena.alloc(CursorNode {
        var: Arc::clone(var),
        offset,
        extent: 0,
        kind: CursorKind::Sequence {
            records: Vec::new(),
        },
    });
    let nrecs = walker.read_count()?;
    if nrecs > walker.remaining().max(1) {
        return Err(DecodeError::MalformedStream(format!(
            "'{}' declares {nrecs} records with only {} bytes remaining",
            var.name,
            walker.remaining()
        )));
    }
    for r in 0..nrecs {
        let rec_offset = walker.position();
        let rec = arena.alloc(CursorNode {
            var: Arc::clone(var),
            offset: rec_offset,
            extent: 0,
            kind: CursorKind::Record {
                index: r,
                fields: vec![None; st.fields.len()],
            },
        });
        for (m, field) in st.fields.iter().enumerate() {
            let fid = compile_var(arena, walker, field)?;
            arena.fill_field(rec, m, fid)?;
        }
        arena.node_mut(rec).extent = walker.position() - rec_offset;
        arena.add_record(id, rec)?;
    }
    arena.node_mut(id).extent = walker.position() - offset;
    Ok(id)
}

/// Flattened element count with overflow rejected. Dimension sizes come
/// straight from the server's DMR and are untrusted.
fn element_count(var: &Variable) -> DecodeResult<u64> {
    var.checked_dim_product().ok_or_else(|| {
        DecodeError::MalformedStream(format!(
            "element count of '{}' overflows a 64-bit index",
            var.name
        ))
    })
}

fn container_type(var: &Variable) -> DecodeResult<&Arc<dap4_dmr::StructType>> {
    var.ty.container().ok_or_else(|| {
        DecodeError::SchemaMismatch(format!("variable '{}' is not a compound type", var.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{CursorScheme, DapValue};
    use crate::dechunk::ByteOrder;
    use bytes::Bytes;
    use dap4_dmr::{AtomicType, Dimension, StructType};

    fn int32_var(name: &str, dims: Vec<Dimension>) -> Arc<Variable> {
        Arc::new(Variable::new(name, DapType::Atomic(AtomicType::Int32), dims))
    }

    fn struct_var(name: &str, dims: Vec<Dimension>, seq: bool) -> Arc<Variable> {
        let st = Arc::new(StructType {
            name: name.to_string(),
            fields: vec![
                int32_var("x", vec![]),
                Arc::new(Variable::new(
                    "y",
                    DapType::Atomic(AtomicType::Float64),
                    vec![],
                )),
            ],
        });
        let ty = if seq {
            DapType::Sequence(st)
        } else {
            DapType::Structure(st)
        };
        Arc::new(Variable::new(name, ty, dims))
    }

    fn dataset(vars: Vec<Arc<Variable>>) -> Dataset {
        Dataset {
            name: "d".into(),
            variables: vars,
            ..Default::default()
        }
    }

    #[test]
    fn atomic_then_string_advances_position_once() {
        // int32 [2], then string scalar "hi"
        let mut raw = Vec::new();
        raw.extend_from_slice(&7i32.to_be_bytes());
        raw.extend_from_slice(&9i32.to_be_bytes());
        raw.extend_from_slice(&2u64.to_be_bytes());
        raw.extend_from_slice(b"hi");

        let ds = dataset(vec![
            int32_var("a", vec![Dimension::anonymous(2)]),
            Arc::new(Variable::new(
                "s",
                DapType::Atomic(AtomicType::String),
                vec![],
            )),
        ]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        let compiled = compile(&ds, &buf, ChecksumMode::Off).unwrap();

        let a = compiled
            .arena
            .cursor(&buf, compiled.variables["a"]);
        assert_eq!(a.read(1).unwrap().into_value().unwrap(), DapValue::Int32(9));
        let s = compiled
            .arena
            .cursor(&buf, compiled.variables["s"]);
        assert_eq!(s.offset(), 8);
        assert_eq!(s.extent(), 10);
        assert_eq!(
            s.read(0).unwrap().into_value().unwrap(),
            DapValue::String("hi".into())
        );
    }

    #[test]
    fn structure_array_compiles_fields_in_order() {
        // 2 elements of { x: int32, y: float64 }
        let mut raw = Vec::new();
        for i in 0..2 {
            raw.extend_from_slice(&(i as i32).to_be_bytes());
            raw.extend_from_slice(&(i as f64 * 0.5).to_be_bytes());
        }
        let ds = dataset(vec![struct_var("p", vec![Dimension::anonymous(2)], false)]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        let compiled = compile(&ds, &buf, ChecksumMode::Off).unwrap();

        let arr = compiled.arena.cursor(&buf, compiled.variables["p"]);
        assert_eq!(arr.scheme(), CursorScheme::StructArray);
        for i in 0..2u64 {
            let elem = arr.read(i).unwrap().into_cursor().unwrap();
            assert_eq!(elem.scheme(), CursorScheme::Structure);
            assert_eq!(elem.field_index("x").unwrap(), 0);
            let x = elem.read_field(0).unwrap();
            assert_eq!(
                x.read(0).unwrap().into_value().unwrap(),
                DapValue::Int32(i as i32)
            );
            let y = elem.read_field(1).unwrap();
            assert_eq!(
                y.read(0).unwrap().into_value().unwrap(),
                DapValue::Float64(i as f64 * 0.5)
            );
        }
        assert!(matches!(
            arr.read(2).unwrap_err(),
            DecodeError::SchemaMismatch(_)
        ));
    }

    #[test]
    fn sequence_compiles_counted_records() {
        // scalar sequence of { x: int32, y: float64 } with 3 records
        let mut raw = Vec::new();
        raw.extend_from_slice(&3u64.to_be_bytes());
        for i in 0..3 {
            raw.extend_from_slice(&(10 + i as i32).to_be_bytes());
            raw.extend_from_slice(&(i as f64).to_be_bytes());
        }
        let ds = dataset(vec![struct_var("obs", vec![], true)]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        let compiled = compile(&ds, &buf, ChecksumMode::Off).unwrap();

        let arr = compiled.arena.cursor(&buf, compiled.variables["obs"]);
        assert_eq!(arr.scheme(), CursorScheme::SeqArray);
        let seq = arr.read(0).unwrap().into_cursor().unwrap();
        assert_eq!(seq.record_count().unwrap(), 3);
        for r in 0..3u64 {
            let rec = seq.read_record(r).unwrap();
            assert_eq!(rec.record_index().unwrap(), r);
            let x = rec.read_field(0).unwrap();
            assert_eq!(
                x.read(0).unwrap().into_value().unwrap(),
                DapValue::Int32(10 + r as i32)
            );
        }
        assert!(matches!(
            seq.read_record(3).unwrap_err(),
            DecodeError::SchemaMismatch(_)
        ));
    }

    #[test]
    fn checksums_recorded_per_top_level_variable() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&5i32.to_be_bytes());
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_be_bytes());

        let ds = dataset(vec![int32_var("v", vec![])]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        let compiled = compile(&ds, &buf, ChecksumMode::On).unwrap();
        assert_eq!(
            compiled.checksums.get(ChecksumSource::Local, "v"),
            Some(crc)
        );
        assert_eq!(
            compiled.checksums.get(ChecksumSource::Remote, "v"),
            Some(crc)
        );
        compiled.checksums.verify(&ds, false).unwrap();
    }

    #[test]
    fn missing_trailing_checksum_is_malformed() {
        let raw = 5i32.to_be_bytes().to_vec();
        let ds = dataset(vec![int32_var("v", vec![])]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::On).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn overflowing_dim_product_is_malformed() {
        // 2^32 x 2^32 elements overflows the flat index space
        let ds = dataset(vec![int32_var(
            "v",
            vec![Dimension::anonymous(1 << 32), Dimension::anonymous(1 << 32)],
        )]);
        let buf = DataBuffer::new(Bytes::new(), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn overflowing_byte_extent_is_malformed() {
        // 2^61 Int64 elements: the count fits but the byte extent wraps
        let ds = dataset(vec![Arc::new(Variable::new(
            "v",
            DapType::Atomic(AtomicType::Int64),
            vec![Dimension::anonymous(1 << 61)],
        ))]);
        let buf = DataBuffer::new(Bytes::new(), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn bytestring_count_beyond_buffer_is_malformed() {
        // a million declared strings cannot fit their length prefixes
        let ds = dataset(vec![Arc::new(Variable::new(
            "s",
            DapType::Atomic(AtomicType::String),
            vec![Dimension::anonymous(1_000_000)],
        ))]);
        let buf = DataBuffer::new(Bytes::from_static(&[0u8; 16]), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn compound_element_count_beyond_buffer_is_malformed() {
        let ds = dataset(vec![struct_var("p", vec![Dimension::anonymous(1 << 40)], false)]);
        let buf = DataBuffer::new(Bytes::from_static(&[0u8; 8]), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn runaway_record_count_is_malformed() {
        // count claims 2^31 records but only 4 bytes follow
        let mut raw = Vec::new();
        raw.extend_from_slice(&(1u64 << 31).to_be_bytes());
        raw.extend_from_slice(&0i32.to_be_bytes());
        let ds = dataset(vec![struct_var("obs", vec![], true)]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }

    #[test]
    fn truncated_sequence_count_is_malformed() {
        let raw = vec![0u8; 4]; // too short for an 8-byte count
        let ds = dataset(vec![struct_var("obs", vec![], true)]);
        let buf = DataBuffer::new(Bytes::from(raw), ByteOrder::Big);
        assert!(matches!(
            compile(&ds, &buf, ChecksumMode::Off).unwrap_err(),
            DecodeError::MalformedStream(_)
        ));
    }
}
