//! Wire framing error types.

use thiserror::Error;

/// Wire framing errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame ends before the declared field does
    #[error("truncated frame")]
    Truncated,

    /// Unknown frame type
    #[error("unknown frame type {0}")]
    UnknownType(u8),

    /// Field exceeds its size limit
    #[error("{field} exceeds {limit} bytes")]
    FieldTooLong {
        /// Which field overran
        field: &'static str,
        /// The limit that was exceeded
        limit: usize,
    },

    /// Error message or connect field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),
}
