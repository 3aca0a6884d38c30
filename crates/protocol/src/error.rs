//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("Unexpected end of data")]
    UnexpectedEof,

    #[error("Invalid flag value: {0}")]
    InvalidFlag(u8),

    #[error("String is not valid UTF-8")]
    InvalidUtf8,
}
