// Error taxonomy for the watchpoint and FastStorage engines.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All error kinds this crate can surface, matched one-to-one against the
/// public FFI status codes in `crate::api::ffi`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInit,

    #[error("invalid address range: addr={addr:#x} len={len}")]
    InvalidAddr { addr: usize, len: usize },

    #[error("out of memory")]
    NoMemory,

    #[error("mprotect failed on page {page_addr:#x}: errno {errno}")]
    Mprotect { page_addr: usize, errno: i32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage full: need {needed} bytes, {available} available")]
    Full { needed: u64, available: u64 },

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Status codes mirrored at the `extern "C"` boundary (SPEC_FULL.md §6).
pub const STATUS_OK: i32 = 0;
pub const STATUS_NOT_INIT: i32 = -1;
pub const STATUS_INVALID_ADDR: i32 = -2;
pub const STATUS_NO_MEMORY: i32 = -3;
pub const STATUS_MPROTECT: i32 = -4;
pub const STATUS_NOT_FOUND: i32 = -5;
pub const STATUS_FULL: i32 = -6;
pub const STATUS_CORRUPT: i32 = -7;

impl From<&EngineError> for i32 {
    fn from(e: &EngineError) -> i32 {
        match e {
            EngineError::NotInit => STATUS_NOT_INIT,
            EngineError::InvalidAddr { .. } => STATUS_INVALID_ADDR,
            EngineError::NoMemory => STATUS_NO_MEMORY,
            EngineError::Mprotect { .. } => STATUS_MPROTECT,
            EngineError::NotFound(_) => STATUS_NOT_FOUND,
            EngineError::Full { .. } => STATUS_FULL,
            EngineError::Corrupt(_) => STATUS_CORRUPT,
            // I/O and serialization failures at the storage edge are reported
            // to FFI callers as a generic corruption/unavailability signal.
            EngineError::Io(_) | EngineError::Json(_) => STATUS_CORRUPT,
        }
    }
}

impl From<EngineError> for i32 {
    fn from(e: EngineError) -> i32 {
        (&e).into()
    }
}
