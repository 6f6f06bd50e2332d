//! Error types for the scheduling core.

use thiserror::Error;

use crate::category::OpCategory;
use crate::operation::OperationId;

/// Result type alias for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Error variants for scheduler operations.
///
/// The scheduler never fails an I/O operation. These errors only surface
/// for rejected configuration, setup failures, and host protocol misuse.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Wraps standard I/O errors (configuration file access).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A batch-size limit of zero was requested.
    #[error("Invalid batch size limit for {category}: must be at least 1")]
    InvalidBatchSizeLimit {
        /// The category whose limit was being set.
        category: OpCategory,
    },

    /// The refill ratio was outside 0..=100.
    #[error("Invalid refill ratio {ratio}: must be within 0..=100")]
    InvalidRefillRatio {
        /// The rejected ratio.
        ratio: i64,
    },

    /// Pre-allocating per-operation scheduling metadata failed.
    #[error("Metadata pool allocation failed for {entries} entries")]
    MetadataPool {
        /// Number of entries that could not be reserved.
        entries: usize,
    },

    /// An operation with this identity is already tracked.
    #[error("Operation already tracked: {id}")]
    DuplicateOperation {
        /// The duplicated operation identity.
        id: OperationId,
    },

    /// The operation is not tracked by the scheduler.
    #[error("Operation not found: {id}")]
    UnknownOperation {
        /// The unknown operation identity.
        id: OperationId,
    },

    /// An operation cannot be merged into itself.
    #[error("Cannot merge operation {id} into itself")]
    InvalidMerge {
        /// The operation named as both survivor and absorbed.
        id: OperationId,
    },

    /// No attribute with this name exists.
    #[error("Unknown attribute: {name}")]
    UnknownAttribute {
        /// The requested attribute name.
        name: String,
    },

    /// The attribute is write-only.
    #[error("Attribute is not readable: {name}")]
    AttributeNotReadable {
        /// The attribute name.
        name: &'static str,
    },

    /// The attribute is read-only.
    #[error("Attribute is not writable: {name}")]
    AttributeNotWritable {
        /// The attribute name.
        name: &'static str,
    },

    /// The value written to an attribute could not be accepted.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidAttributeValue {
        /// The attribute name.
        name: &'static str,
        /// The rejected input.
        value: String,
    },

    /// Configuration file could not be parsed.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the error.
        reason: String,
    },
}
