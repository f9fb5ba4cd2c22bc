//! Error types for the protocol layer.
//!
//! Every variant means the same thing to the caller: the bytes at hand
//! are not a valid envelope, so the frame is dropped and the connection
//! that produced it is closed. The variants exist so logs say why.

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame header is malformed: unknown kind, out-of-range
    /// message id, or a length that cannot hold a header.
    #[error("malformed frame: {0}")]
    Framing(String),

    /// A field read would run past the end of the body.
    #[error("cursor overrun: needed {needed} bytes, {remaining} remaining")]
    CursorOverrun {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left after the cursor.
        remaining: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid string field: {0}")]
    InvalidString(#[from] std::str::Utf8Error),

    /// The frame is larger than the receiver accepts, or larger than
    /// the 32-bit length prefix can express.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        len: usize,
        /// Largest size allowed.
        max: usize,
    },
}
