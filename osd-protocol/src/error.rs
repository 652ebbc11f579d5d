use std::io;

use thiserror::Error;

/// Reasons a complete frame is rejected by the decoder.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum Malformed {
    #[error("unknown packet class {0}")]
    UnknownClass(u8),
    #[error("frame ends before the declared payload length")]
    Truncated,
    #[error("{0} trailing bytes after the payload")]
    TrailingBytes(usize),
    #[error("payload of {got} bytes exceeds the maximum of {max}")]
    Oversized { max: usize, got: usize },
}

/// Errors that may occur when decoding a packet from a byte buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum DecodeError {
    /// The buffer holds the beginning of a packet, but not all of it.
    /// Decoding can be resumed once `needed` more bytes are available.
    #[error("incomplete packet, {needed} more bytes needed")]
    Incomplete { needed: usize },
    /// The packet is complete but cannot be interpreted.
    /// `frame_len` bytes belong to the offending packet and may be skipped.
    #[error("malformed packet: {reason}")]
    Malformed { reason: Malformed, frame_len: usize },
}

impl DecodeError {
    /// The number of bytes occupied by a rejected packet, if the packet was complete.
    pub fn frame_len(&self) -> Option<usize> {
        match self {
            DecodeError::Incomplete { .. } => None,
            DecodeError::Malformed { frame_len, .. } => Some(*frame_len),
        }
    }
}

/// Errors that may occur when encoding a packet.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload of {got} bytes exceeds the MTU of {max} bytes")]
    OversizedPayload { max: usize, got: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors when interpreting the payload of an otherwise well-formed packet.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PayloadError {
    #[error("payload too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("invalid register width of {0} bits")]
    InvalidWidth(u8),
}

impl PayloadError {
    pub(crate) fn check_len(payload: &[u8], expected: usize) -> Result<(), PayloadError> {
        if payload.len() < expected {
            Err(PayloadError::TooShort {
                expected,
                got: payload.len(),
            })
        } else {
            Ok(())
        }
    }
}
