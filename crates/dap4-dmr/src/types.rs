//! The immutable DMR schema tree.
//!
//! Nodes are built once by the parser and shared via `Arc` so that data
//! cursors can hold their schema node without borrowing the dataset tree.

use std::sync::Arc;

/// Attribute carrying a remotely computed CRC32 for a variable.
pub const CHECKSUM_ATTRIBUTE: &str = "_DAP4_Checksum_CRC32";

/// Dataset-level attribute some servers use to declare the payload byte
/// order in the DMR. The chunk-header flag remains authoritative.
pub const LITTLE_ENDIAN_ATTRIBUTE: &str = "_DAP4_Little_Endian";

/// DAP4 atomic value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// 7-bit ASCII character, one byte on the wire
    Char,
    /// Length-prefixed UTF-8 string
    String,
    /// Length-prefixed raw byte sequence
    Opaque,
}

impl AtomicType {
    /// Serialized element size in bytes, or `None` for the
    /// variable-length types (String, Opaque).
    pub fn size(&self) -> Option<usize> {
        match self {
            AtomicType::Int8 | AtomicType::UInt8 | AtomicType::Char => Some(1),
            AtomicType::Int16 | AtomicType::UInt16 => Some(2),
            AtomicType::Int32 | AtomicType::UInt32 | AtomicType::Float32 => Some(4),
            AtomicType::Int64 | AtomicType::UInt64 | AtomicType::Float64 => Some(8),
            AtomicType::String | AtomicType::Opaque => None,
        }
    }

    /// True if every element occupies the same number of bytes.
    pub fn is_fixed_size(&self) -> bool {
        self.size().is_some()
    }

    /// Map a DMR element name (e.g. `Int32`, `URL`) to an atomic type.
    ///
    /// `Byte` is the DAP4 alias for `UInt8`; `URL` is serialized
    /// identically to `String`.
    pub fn from_dmr_name(name: &str) -> Option<Self> {
        Some(match name {
            "Int8" => AtomicType::Int8,
            "UInt8" | "Byte" => AtomicType::UInt8,
            "Int16" => AtomicType::Int16,
            "UInt16" => AtomicType::UInt16,
            "Int32" => AtomicType::Int32,
            "UInt32" => AtomicType::UInt32,
            "Int64" => AtomicType::Int64,
            "UInt64" => AtomicType::UInt64,
            "Float32" => AtomicType::Float32,
            "Float64" => AtomicType::Float64,
            "Char" => AtomicType::Char,
            "String" | "URL" => AtomicType::String,
            "Opaque" => AtomicType::Opaque,
            _ => return None,
        })
    }
}

/// A named enumeration type with a declared integer base type.
#[derive(Debug, Clone)]
pub struct EnumType {
    pub name: String,
    /// Underlying integer type; enum values are serialized and decoded
    /// as this type.
    pub base: AtomicType,
}

/// A structure or sequence type: a named, ordered list of fields.
#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Arc<Variable>>,
}

impl StructType {
    /// Resolve a field name to its declared position.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// The base type of a variable.
#[derive(Debug, Clone)]
pub enum DapType {
    Atomic(AtomicType),
    Enum(Arc<EnumType>),
    Structure(Arc<StructType>),
    Sequence(Arc<StructType>),
}

impl DapType {
    /// The atomic type a value of this type decodes as, if any.
    /// Enumerations decode as their declared base integer type.
    pub fn decode_as(&self) -> Option<AtomicType> {
        match self {
            DapType::Atomic(t) => Some(*t),
            DapType::Enum(e) => Some(e.base),
            _ => None,
        }
    }

    /// The struct/sequence field list, if this is a container type.
    pub fn container(&self) -> Option<&Arc<StructType>> {
        match self {
            DapType::Structure(s) | DapType::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, DapType::Atomic(_) | DapType::Enum(_))
    }
}

/// One dimension of a variable: a fixed extent, optionally named when it
/// references a dataset-level `<Dimension>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: Option<String>,
    pub size: u64,
}

impl Dimension {
    pub fn anonymous(size: u64) -> Self {
        Self { name: None, size }
    }

    pub fn named(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: Some(name.into()),
            size,
        }
    }
}

/// A DMR attribute: a name plus one or more string-typed values.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

/// A variable declaration: name, base type, and ordered dimension list.
///
/// Fields of structures and sequences are themselves `Variable`s; only
/// variables declared directly under the dataset root are "top-level".
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: DapType,
    pub dims: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: DapType, dims: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            ty,
            dims,
            attributes: Vec::new(),
        }
    }

    /// Number of dimensions; 0 for a scalar.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension extents in declaration order.
    pub fn shape(&self) -> Vec<u64> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// Product of all dimension extents (1 for a scalar), saturating at
    /// `u64::MAX`.
    pub fn dim_product(&self) -> u64 {
        self.dims
            .iter()
            .fold(1u64, |acc, d| acc.saturating_mul(d.size))
    }

    /// Product of all dimension extents, or `None` when it overflows.
    /// Declared sizes come from the server and are untrusted input.
    pub fn checked_dim_product(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1u64, |acc, d| acc.checked_mul(d.size))
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The CRC32 the DMR itself declares for this variable, when the
    /// server chose to publish checksums as attributes rather than (or in
    /// addition to) trailing stream bytes.
    pub fn declared_checksum(&self) -> Option<u32> {
        let attr = self.find_attribute(CHECKSUM_ATTRIBUTE)?;
        attr.values.first()?.trim().parse::<u32>().ok()
    }
}

/// The dataset root: shared dimension declarations, enumeration types,
/// and the ordered list of top-level variables.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub enums: Vec<Arc<EnumType>>,
    pub variables: Vec<Arc<Variable>>,
    pub attributes: Vec<Attribute>,
}

impl Dataset {
    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Byte order the DMR itself declares, when the server publishes
    /// one. Informational only: the first chunk's header flag decides
    /// how the payload is decoded.
    pub fn declared_little_endian(&self) -> Option<bool> {
        let attr = self.find_attribute(LITTLE_ENDIAN_ATTRIBUTE)?;
        let v = attr.values.first()?.trim();
        Some(v == "1" || v.eq_ignore_ascii_case("true"))
    }

    /// Look up a top-level variable by name.
    pub fn find_variable(&self, name: &str) -> Option<&Arc<Variable>> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Look up a dataset-level dimension declaration by name. Accepts a
    /// leading `/` (DMR dimension references are rooted paths).
    pub fn find_dimension(&self, name: &str) -> Option<&Dimension> {
        let name = name.strip_prefix('/').unwrap_or(name);
        self.dimensions
            .iter()
            .find(|d| d.name.as_deref() == Some(name))
    }

    /// Look up an enumeration type declaration by name.
    pub fn find_enum(&self, name: &str) -> Option<&Arc<EnumType>> {
        let name = name.strip_prefix('/').unwrap_or(name);
        self.enums.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_sizes() {
        assert_eq!(AtomicType::Int8.size(), Some(1));
        assert_eq!(AtomicType::UInt16.size(), Some(2));
        assert_eq!(AtomicType::Float32.size(), Some(4));
        assert_eq!(AtomicType::UInt64.size(), Some(8));
        assert_eq!(AtomicType::String.size(), None);
        assert_eq!(AtomicType::Opaque.size(), None);
        assert!(!AtomicType::String.is_fixed_size());
    }

    #[test]
    fn dmr_type_names() {
        assert_eq!(AtomicType::from_dmr_name("Byte"), Some(AtomicType::UInt8));
        assert_eq!(AtomicType::from_dmr_name("URL"), Some(AtomicType::String));
        assert_eq!(AtomicType::from_dmr_name("Int128"), None);
    }

    #[test]
    fn enum_decodes_as_base() {
        let e = DapType::Enum(Arc::new(EnumType {
            name: "cloud_class".into(),
            base: AtomicType::Int16,
        }));
        assert_eq!(e.decode_as(), Some(AtomicType::Int16));
        assert!(e.is_atomic());
    }

    #[test]
    fn field_index_lookup() {
        let st = StructType {
            name: "point".into(),
            fields: vec![
                Arc::new(Variable::new(
                    "x",
                    DapType::Atomic(AtomicType::Int32),
                    vec![],
                )),
                Arc::new(Variable::new(
                    "y",
                    DapType::Atomic(AtomicType::Float64),
                    vec![],
                )),
            ],
        };
        assert_eq!(st.field_index("x"), Some(0));
        assert_eq!(st.field_index("y"), Some(1));
        assert_eq!(st.field_index("z"), None);
    }

    #[test]
    fn declared_checksum_parses() {
        let mut v = Variable::new("t", DapType::Atomic(AtomicType::Int32), vec![]);
        v.attributes.push(Attribute {
            name: CHECKSUM_ATTRIBUTE.into(),
            values: vec!["305419896".into()],
        });
        assert_eq!(v.declared_checksum(), Some(0x12345678));
    }

    #[test]
    fn dim_product_overflow_is_detected() {
        let v = Variable::new(
            "big",
            DapType::Atomic(AtomicType::Int32),
            vec![Dimension::anonymous(1 << 32), Dimension::anonymous(1 << 32)],
        );
        assert_eq!(v.checked_dim_product(), None);
        assert_eq!(v.dim_product(), u64::MAX);
        let ok = Variable::new(
            "small",
            DapType::Atomic(AtomicType::Int32),
            vec![Dimension::anonymous(6), Dimension::anonymous(7)],
        );
        assert_eq!(ok.checked_dim_product(), Some(42));
    }

    #[test]
    fn declared_byte_order_attribute() {
        let mut ds = Dataset::default();
        assert_eq!(ds.declared_little_endian(), None);
        ds.attributes.push(Attribute {
            name: LITTLE_ENDIAN_ATTRIBUTE.into(),
            values: vec!["1".into()],
        });
        assert_eq!(ds.declared_little_endian(), Some(true));
        ds.attributes[0].values = vec!["0".into()];
        assert_eq!(ds.declared_little_endian(), Some(false));
    }

    #[test]
    fn scalar_dim_product_is_one() {
        let v = Variable::new("s", DapType::Atomic(AtomicType::Float64), vec![]);
        assert_eq!(v.rank(), 0);
        assert_eq!(v.dim_product(), 1);
        let a = Variable::new(
            "a",
            DapType::Atomic(AtomicType::Float64),
            vec![Dimension::anonymous(3), Dimension::anonymous(4)],
        );
        assert_eq!(a.dim_product(), 12);
        assert_eq!(a.shape(), vec![3, 4]);
    }
}
