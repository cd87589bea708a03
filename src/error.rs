use thiserror::Error;

/// Errors surfaced across the log's public interface.
///
/// `TryAppend` and `ReadAsync` encode their expected-failure paths (a full
/// page, an out-of-range address) as `Option`/`bool` rather than variants
/// here. This enum is reserved for the kinds that are actually exceptional.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record at address {address}: invalid length {length}")]
    CorruptRecord { address: u64, length: i64 },

    #[error("corrupt commit metadata: {reason}")]
    CorruptMetadata { reason: String },

    #[error("log has been disposed")]
    Disposed,

    #[error("device failure: {0}")]
    DeviceFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, LogError>;
