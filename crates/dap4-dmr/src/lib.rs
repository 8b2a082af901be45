//! DAP4 dataset metadata (DMR) model.
//!
//! The DMR is the textual schema that precedes a DAP4 data stream: it
//! declares the dataset's dimensions, variables, and nested container
//! types. This crate holds the immutable in-memory form of that schema
//! plus a parser for the DMR subset the decoding engine exercises.
//!
//! The tree is read-only once parsed; the decoding engine walks it in
//! lock-step with the serialized byte stream but never mutates it.

pub mod error;
pub mod parse;
pub mod types;

pub use error::{DmrError, DmrResult};
pub use parse::parse_dmr;
pub use types::{
    AtomicType, Attribute, DapType, Dataset, Dimension, EnumType, StructType, Variable,
    CHECKSUM_ATTRIBUTE, LITTLE_ENDIAN_ATTRIBUTE,
};
