//! Lazy, offset-based access to decoded variable data.
//!
//! A cursor identifies one instance of a schema node inside the dechunked
//! byte buffer: a byte offset, an extent, and per-scheme bookkeeping (a
//! byte-string offset table for variable-length atomics, field lists for
//! structures and records, record lists for sequences, element lists for
//! container arrays). Cursors are created once by the compiler in a single
//! forward pass; afterwards everything is read-only and freely shared.
//!
//! Storage is arena-based: all cursors of one response live in a
//! [`CursorArena`] owned by the data source, children are arena indices,
//! and the public [`Cursor`] handle borrows arena and buffer together, so
//! the buffer necessarily outlives every cursor created against it.

use std::sync::Arc;

use bytes::Bytes;
use dap4_dmr::{AtomicType, Variable};

use crate::dechunk::ByteOrder;
use crate::error::{DecodeError, DecodeResult};
use crate::odometer::{Odometer, Slice};

/// Size of the 8-byte length prefix used by strings, opaques, and
/// sequence record counts. The low 32 bits are significant; the high 32
/// are reserved and must be zero.
pub const COUNT_SIZE: usize = 8;

/// The dechunked data payload tagged with its negotiated byte order.
///
/// The order is fixed by the first chunk's header flags and never changes
/// for the life of the buffer.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    bytes: Bytes,
    order: ByteOrder,
}

impl DataBuffer {
    pub fn new(bytes: Bytes, order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Bounds-checked subslice.
    pub fn slice_at(&self, offset: u64, len: u64) -> DecodeResult<&[u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| {
                DecodeError::MalformedStream(format!(
                    "byte range {offset}+{len} exceeds buffer of {} bytes",
                    self.bytes.len()
                ))
            })?;
        Ok(&self.bytes[start..end])
    }

    fn get_array<const N: usize>(&self, offset: u64) -> DecodeResult<[u8; N]> {
        let slice = self.slice_at(offset, N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn get_u32(&self, offset: u64) -> DecodeResult<u32> {
        let raw = self.get_array::<4>(offset)?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }

    pub fn get_u64(&self, offset: u64) -> DecodeResult<u64> {
        let raw = self.get_array::<8>(offset)?;
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(raw),
            ByteOrder::Little => u64::from_le_bytes(raw),
        })
    }

    /// Read an 8-byte length prefix at `offset`. The high 32 bits are
    /// reserved; a nonzero value there means the stream is malformed.
    pub fn length_prefix(&self, offset: u64) -> DecodeResult<u64> {
        let raw = self.get_u64(offset)?;
        if raw >> 32 != 0 {
            return Err(DecodeError::MalformedStream(format!(
                "length prefix at offset {offset} has nonzero reserved bits: {raw:#018x}"
            )));
        }
        Ok(raw)
    }
}

/// The six cursor schemes of the DAP4 data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorScheme {
    Atomic,
    StructArray,
    Structure,
    SeqArray,
    Sequence,
    Record,
}

/// Index of a cursor within its response's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub(crate) usize);

/// Per-scheme cursor payload. Only the fields a scheme needs exist in its
/// variant; exhaustive matching replaces the runtime scheme assertions of
/// a class hierarchy.
#[derive(Debug)]
pub(crate) enum CursorKind {
    Atomic {
        dim_product: u64,
        /// Absolute per-element offsets for variable-length data; `None`
        /// for fixed-size types.
        bytestrings: Option<Vec<u64>>,
    },
    StructArray {
        elements: Vec<CursorId>,
    },
    Structure {
        fields: Vec<Option<CursorId>>,
    },
    SeqArray {
        elements: Vec<CursorId>,
    },
    Sequence {
        records: Vec<CursorId>,
    },
    Record {
        index: u64,
        fields: Vec<Option<CursorId>>,
    },
}

impl CursorKind {
    fn scheme(&self) -> CursorScheme {
        match self {
            CursorKind::Atomic { .. } => CursorScheme::Atomic,
            CursorKind::StructArray { .. } => CursorScheme::StructArray,
            CursorKind::Structure { .. } => CursorScheme::Structure,
            CursorKind::SeqArray { .. } => CursorScheme::SeqArray,
            CursorKind::Sequence { .. } => CursorScheme::Sequence,
            CursorKind::Record { .. } => CursorScheme::Record,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CursorNode {
    pub var: Arc<Variable>,
    pub offset: u64,
    pub extent: u64,
    pub kind: CursorKind,
}

/// Arena holding every cursor of one response.
#[derive(Debug, Default)]
pub struct CursorArena {
    nodes: Vec<CursorNode>,
}

impl CursorArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn alloc(&mut self, node: CursorNode) -> CursorId {
        let id = CursorId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub(crate) fn node(&self, id: CursorId) -> &CursorNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: CursorId) -> &mut CursorNode {
        &mut self.nodes[id.0]
    }

    /// Fill field slot `m` of a structure or record cursor. Each slot is
    /// filled exactly once; a second fill is a schema mismatch.
    pub(crate) fn fill_field(
        &mut self,
        id: CursorId,
        m: usize,
        field: CursorId,
    ) -> DecodeResult<()> {
        let node = self.node_mut(id);
        let fields = match &mut node.kind {
            CursorKind::Structure { fields } | CursorKind::Record { fields, .. } => fields,
            _ => {
                return Err(DecodeError::SchemaMismatch(format!(
                    "adding field to non-structure/record cursor for '{}'",
                    node.var.name
                )))
            }
        };
        let slot = fields.get_mut(m).ok_or_else(|| {
            DecodeError::SchemaMismatch(format!("field index {m} out of range"))
        })?;
        if slot.is_some() {
            return Err(DecodeError::SchemaMismatch(format!(
                "duplicate fill of field {m}"
            )));
        }
        *slot = Some(field);
        Ok(())
    }

    pub(crate) fn add_record(&mut self, id: CursorId, record: CursorId) -> DecodeResult<()> {
        let node = self.node_mut(id);
        match &mut node.kind {
            CursorKind::Sequence { records } => {
                records.push(record);
                Ok(())
            }
            _ => Err(DecodeError::SchemaMismatch(format!(
                "adding record to non-sequence cursor for '{}'",
                node.var.name
            ))),
        }
    }

    /// Public handle for an arena entry, tied to the buffer's lifetime.
    pub fn cursor<'a>(&'a self, buffer: &'a DataBuffer, id: CursorId) -> Cursor<'a> {
        Cursor {
            arena: self,
            buffer,
            id,
        }
    }
}

/// A single decoded atomic value.
#[derive(Debug, Clone, PartialEq)]
pub enum DapValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Char(char),
    String(String),
    Opaque(Bytes),
}

/// Result of a single-index [`Cursor::read`]: an atomic value, or a
/// cursor for container schemes.
#[derive(Debug, Clone)]
pub enum CursorValue<'a> {
    Atomic(DapValue),
    Container(Cursor<'a>),
}

impl<'a> CursorValue<'a> {
    pub fn into_value(self) -> DecodeResult<DapValue> {
        match self {
            CursorValue::Atomic(v) => Ok(v),
            CursorValue::Container(c) => Err(DecodeError::SchemaMismatch(format!(
                "expected an atomic value, got a {:?} cursor",
                c.scheme()
            ))),
        }
    }

    pub fn into_cursor(self) -> DecodeResult<Cursor<'a>> {
        match self {
            CursorValue::Container(c) => Ok(c),
            CursorValue::Atomic(_) => Err(DecodeError::SchemaMismatch(
                "expected a container cursor, got an atomic value".into(),
            )),
        }
    }
}

/// Read-only handle to one compiled cursor.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    arena: &'a CursorArena,
    buffer: &'a DataBuffer,
    id: CursorId,
}

impl<'a> Cursor<'a> {
    fn node(&self) -> &'a CursorNode {
        self.arena.node(self.id)
    }

    pub fn scheme(&self) -> CursorScheme {
        self.node().kind.scheme()
    }

    pub fn variable(&self) -> &'a Arc<Variable> {
        &self.node().var
    }

    /// Byte offset of this cursor's span within the buffer.
    pub fn offset(&self) -> u64 {
        self.node().offset
    }

    /// Byte length of this cursor's span.
    pub fn extent(&self) -> u64 {
        self.node().extent
    }

    pub fn is_scalar(&self) -> bool {
        self.node().var.rank() == 0
    }

    /// Read the value at flat `index`: a decoded atomic value for atomic
    /// cursors, the addressed element cursor for container arrays, and
    /// the cursor itself for scalar structure/sequence/record cursors.
    pub fn read(&self, index: u64) -> DecodeResult<CursorValue<'a>> {
        match &self.node().kind {
            CursorKind::Atomic { .. } => Ok(CursorValue::Atomic(self.read_atomic(index)?)),
            CursorKind::Structure { .. }
            | CursorKind::Sequence { .. }
            | CursorKind::Record { .. } => Ok(CursorValue::Container(*self)),
            CursorKind::StructArray { elements } | CursorKind::SeqArray { elements } => {
                let id = elements.get(index as usize).copied().ok_or_else(|| {
                    DecodeError::SchemaMismatch(format!(
                        "element index {index} out of range for '{}' ({} elements)",
                        self.node().var.name,
                        elements.len()
                    ))
                })?;
                Ok(CursorValue::Container(self.arena.cursor(self.buffer, id)))
            }
        }
    }

    /// Read the atomic values selected by `slices`, in odometer order.
    ///
    /// This is the bulk-read path: a Cartesian walk calling the
    /// single-index read for every point.
    pub fn read_slices(&self, slices: &[Slice]) -> DecodeResult<Vec<DapValue>> {
        if !matches!(self.node().kind, CursorKind::Atomic { .. }) {
            return Err(DecodeError::SchemaMismatch(format!(
                "bulk value read on non-atomic cursor for '{}'",
                self.node().var.name
            )));
        }
        let odom = Odometer::new(slices.to_vec(), &self.node().var.shape())?;
        let mut values = Vec::with_capacity(odom.total_size() as usize);
        for index in odom {
            values.push(self.read_atomic(index)?);
        }
        Ok(values)
    }

    /// Read the element cursors selected by `slices` from a structure or
    /// sequence array, in odometer order.
    pub fn read_elements(&self, slices: &[Slice]) -> DecodeResult<Vec<Cursor<'a>>> {
        if !matches!(
            self.node().kind,
            CursorKind::StructArray { .. } | CursorKind::SeqArray { .. }
        ) {
            return Err(DecodeError::SchemaMismatch(format!(
                "element read on non-array cursor for '{}'",
                self.node().var.name
            )));
        }
        let odom = Odometer::new(slices.to_vec(), &self.node().var.shape())?;
        let mut out = Vec::with_capacity(odom.total_size() as usize);
        for index in odom {
            out.push(self.read(index)?.into_cursor()?);
        }
        Ok(out)
    }

    /// Resolve a field name to its declared position.
    pub fn field_index(&self, name: &str) -> DecodeResult<usize> {
        let st = self.node().var.ty.container().ok_or_else(|| {
            DecodeError::SchemaMismatch(format!(
                "field lookup on non-compound variable '{}'",
                self.node().var.name
            ))
        })?;
        st.field_index(name).ok_or_else(|| {
            DecodeError::SchemaMismatch(format!(
                "unknown field '{name}' in '{}'",
                self.node().var.name
            ))
        })
    }

    /// Return the pre-compiled field cursor at position `m`.
    pub fn read_field(&self, m: usize) -> DecodeResult<Cursor<'a>> {
        let fields = match &self.node().kind {
            CursorKind::Structure { fields } | CursorKind::Record { fields, .. } => fields,
            _ => {
                return Err(DecodeError::SchemaMismatch(format!(
                    "field read on non-structure/record cursor for '{}'",
                    self.node().var.name
                )))
            }
        };
        let id = fields
            .get(m)
            .copied()
            .flatten()
            .ok_or_else(|| DecodeError::SchemaMismatch(format!("field index {m} out of range")))?;
        Ok(self.arena.cursor(self.buffer, id))
    }

    /// Number of decoded records (sequence cursors only).
    pub fn record_count(&self) -> DecodeResult<u64> {
        match &self.node().kind {
            CursorKind::Sequence { records } => Ok(records.len() as u64),
            _ => Err(DecodeError::SchemaMismatch(format!(
                "record count on non-sequence cursor for '{}'",
                self.node().var.name
            ))),
        }
    }

    /// Return record `i` of a sequence cursor.
    pub fn read_record(&self, i: u64) -> DecodeResult<Cursor<'a>> {
        match &self.node().kind {
            CursorKind::Sequence { records } => {
                let id = records.get(i as usize).copied().ok_or_else(|| {
                    DecodeError::SchemaMismatch(format!(
                        "record index {i} out of bounds for '{}' ({} records)",
                        self.node().var.name,
                        records.len()
                    ))
                })?;
                Ok(self.arena.cursor(self.buffer, id))
            }
            _ => Err(DecodeError::SchemaMismatch(format!(
                "record read on non-sequence cursor for '{}'",
                self.node().var.name
            ))),
        }
    }

    /// Ordinal of a record cursor within its owning sequence.
    pub fn record_index(&self) -> DecodeResult<u64> {
        match &self.node().kind {
            CursorKind::Record { index, .. } => Ok(*index),
            _ => Err(DecodeError::SchemaMismatch(format!(
                "record index on non-record cursor for '{}'",
                self.node().var.name
            ))),
        }
    }

    fn read_atomic(&self, index: u64) -> DecodeResult<DapValue> {
        let node = self.node();
        let CursorKind::Atomic {
            dim_product,
            bytestrings,
        } = &node.kind
        else {
            return Err(DecodeError::SchemaMismatch(format!(
                "atomic read on {:?} cursor for '{}'",
                node.kind.scheme(),
                node.var.name
            )));
        };
        if index >= *dim_product {
            return Err(DecodeError::SchemaMismatch(format!(
                "index {index} out of range for '{}' ({dim_product} elements)",
                node.var.name
            )));
        }
        let ty = node.var.ty.decode_as().ok_or_else(|| {
            DecodeError::UnsupportedType(format!(
                "variable '{}' has no atomic decoding",
                node.var.name
            ))
        })?;
        match ty.size() {
            Some(elem) => self.decode_fixed(ty, node.offset + index * elem as u64),
            None => {
                let table = bytestrings.as_ref().ok_or_else(|| {
                    DecodeError::MalformedStream(format!(
                        "no byte-string table compiled for '{}'",
                        node.var.name
                    ))
                })?;
                self.decode_bytestring(ty, table[index as usize])
            }
        }
    }

    fn decode_fixed(&self, ty: AtomicType, offset: u64) -> DecodeResult<DapValue> {
        let buf = self.buffer;
        Ok(match ty {
            AtomicType::Int8 => DapValue::Int8(buf.slice_at(offset, 1)?[0] as i8),
            AtomicType::UInt8 => DapValue::UInt8(buf.slice_at(offset, 1)?[0]),
            // 7-bit ASCII, not UTF-8: mask the high bit
            AtomicType::Char => DapValue::Char((buf.slice_at(offset, 1)?[0] & 0x7f) as char),
            AtomicType::Int16 => {
                let raw = buf.slice_at(offset, 2)?;
                let raw = [raw[0], raw[1]];
                DapValue::Int16(match buf.order() {
                    ByteOrder::Big => i16::from_be_bytes(raw),
                    ByteOrder::Little => i16::from_le_bytes(raw),
                })
            }
            AtomicType::UInt16 => {
                let raw = buf.slice_at(offset, 2)?;
                let raw = [raw[0], raw[1]];
                DapValue::UInt16(match buf.order() {
                    ByteOrder::Big => u16::from_be_bytes(raw),
                    ByteOrder::Little => u16::from_le_bytes(raw),
                })
            }
            AtomicType::Int32 => DapValue::Int32(buf.get_u32(offset)? as i32),
            AtomicType::UInt32 => DapValue::UInt32(buf.get_u32(offset)?),
            AtomicType::Int64 => DapValue::Int64(buf.get_u64(offset)? as i64),
            AtomicType::UInt64 => DapValue::UInt64(buf.get_u64(offset)?),
            AtomicType::Float32 => DapValue::Float32(f32::from_bits(buf.get_u32(offset)?)),
            AtomicType::Float64 => DapValue::Float64(f64::from_bits(buf.get_u64(offset)?)),
            AtomicType::String | AtomicType::Opaque => {
                return Err(DecodeError::UnsupportedType(
                    "variable-size type in fixed-size decode".into(),
                ))
            }
        })
    }

    /// Decode one length-prefixed element via its byte-string table entry.
    /// Entries are absolute buffer offsets and need not be contiguous.
    fn decode_bytestring(&self, ty: AtomicType, position: u64) -> DecodeResult<DapValue> {
        let len = self.buffer.length_prefix(position)?;
        let raw = self.buffer.slice_at(position + COUNT_SIZE as u64, len)?;
        Ok(match ty {
            AtomicType::String => DapValue::String(String::from_utf8_lossy(raw).into_owned()),
            AtomicType::Opaque => DapValue::Opaque(Bytes::copy_from_slice(raw)),
            other => {
                return Err(DecodeError::UnsupportedType(format!(
                    "byte-string decode of fixed-size type {other:?}"
                )))
            }
        })
    }
}
