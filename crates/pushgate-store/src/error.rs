//! Error types for the pushgate metric store.

use thiserror::Error;

/// Result type alias for metric store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during metric store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open persistence file: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid grouping key: {0}")]
    InvalidGroupingKey(String),

    #[error("label {label:?} of metric {metric:?} is {found:?}, grouping key says {expected:?}")]
    LabelConflict {
        metric: String,
        label: String,
        found: String,
        expected: String,
    },

    #[error("metric family {name:?} is already pushed as {existing} in another group, got {pushed}")]
    InconsistentType {
        name: String,
        existing: String,
        pushed: String,
    },

    #[error("metric name {0:?} is reserved")]
    ReservedName(String),

    #[error("metric store is shut down")]
    ShutDown,
}

impl StoreError {
    /// Whether the error was caused by the content of a write request
    /// rather than by the store itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidGroupingKey(_)
                | Self::LabelConflict { .. }
                | Self::InconsistentType { .. }
                | Self::ReservedName(_)
        )
    }
}
