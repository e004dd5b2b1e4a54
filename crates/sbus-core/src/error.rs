//! Codec error type

/// Errors raised while encoding or decoding wire data.
///
/// The engine never propagates these past its manager loop; a malformed
/// datagram is logged and dropped with the link state unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame size {0} outside valid bounds")]
    FrameSize(usize),
    #[error("declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("bad crc: expected {expected:#06x}, got {actual:#06x}")]
    BadCrc { expected: u16, actual: u16 },
    #[error("unknown frame attribute {0:#04x}")]
    UnknownFrameKind(u8),
    #[error("unknown command opcode {0:#04x}")]
    UnknownCommand(u8),
    #[error("truncated payload: need {needed} bytes, got {got}")]
    TruncatedPayload { needed: usize, got: usize },
}
