//! Единый тип ошибок библиотеки.
//!
//! Kinds mirror the failure classes callers have to tell apart:
//! - Overflow: log has no room for the record (non-`try` put);
//! - InvalidArgument: caller bug (bad slot, write below watermark, ...);
//! - InvalidData: checksum mismatch on a direct record read;
//! - OutOfMemory: the heap allocator returned nothing;
//! - Closed: any operation after `close()`;
//! - ConcurrentModification: iterator outlived a `clear()`;
//! - IllegalState: no current transaction, deleted handle, read-shared writes;
//! - Unsupported: channel operations with no mapped-file equivalent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PmemError {
    #[error("insufficient space in log")]
    Overflow,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("out of memory: no free element for size {size}")]
    OutOfMemory { size: u64 },

    #[error("resource is closed")]
    Closed,

    #[error("log cleared after iterator creation")]
    ConcurrentModification,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl PmemError {
    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        PmemError::InvalidArgument(msg.into())
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        PmemError::IllegalState(msg.into())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        PmemError::IllegalState(format!("{} lock poisoned", what))
    }
}

pub type Result<T> = std::result::Result<T, PmemError>;
