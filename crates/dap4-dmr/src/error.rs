//! Error types for DMR parsing.

use thiserror::Error;

/// Result type for DMR operations.
pub type DmrResult<T> = Result<T, DmrError>;

/// Error types for DMR parsing.
#[derive(Debug, Error)]
pub enum DmrError {
    /// Malformed XML in the DMR document
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Structurally invalid DMR document
    #[error("Invalid DMR: {0}")]
    Invalid(String),

    /// Variable or field declared with an unrecognized type
    #[error("Unknown DAP4 type: {0}")]
    UnknownType(String),

    /// A <Dim name=.../> reference with no matching <Dimension> declaration
    #[error("Undefined dimension reference: {0}")]
    UndefinedDimension(String),

    /// An <Enum enum=.../> reference with no matching <Enumeration>
    #[error("Undefined enumeration reference: {0}")]
    UndefinedEnumeration(String),

    /// Missing required XML attribute
    #[error("Element <{element}> is missing attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: String,
    },
}
