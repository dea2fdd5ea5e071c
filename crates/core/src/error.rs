//! Error types for ambit-sync-core.

use thiserror::Error;

/// Malformed or mismatched reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes arrived than the frame header declared.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Checksum carried in the frame does not match the computed one.
    #[error("checksum mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { received: u16, computed: u16 },

    /// Reply sequence number does not match the request.
    #[error("unexpected sequence number: expected {expected}, got {actual}")]
    UnexpectedSequence { expected: u16, actual: u16 },

    /// Reply carries a different command code than the request.
    #[error("unexpected command: expected 0x{expected:04X}, got 0x{actual:04X}")]
    UnexpectedCommand { expected: u16, actual: u16 },

    /// Continuation report arrived out of order.
    #[error("unexpected report part: expected {expected}, got {actual}")]
    UnexpectedPart { expected: u8, actual: u8 },

    /// Payload does not fit the selected framing variant.
    #[error("payload too large: {len} bytes (maximum {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Report or frame structure is invalid.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID handle open/write/read failure.
    #[error("HID transport error: {0}")]
    Transport(String),

    /// No reply within the read deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Reply frame failed validation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Page or entry chain reported by the device is invalid.
    #[error("chain corruption at 0x{address:08X}: {reason}")]
    ChainCorruption { address: u32, reason: &'static str },

    /// Driver capability absent or unknown framing variant.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Operation not permitted in the current log/session state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Bounds-checked read ran past the end of a buffer.
    #[error("buffer underrun: need {needed} bytes at offset {offset}, {available} available")]
    BufferUnderrun {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Reply payload is well-framed but its content is unusable.
    #[error("invalid reply to command 0x{command:04X}: {reason}")]
    InvalidReply { command: u16, reason: String },

    /// Device not found during enumeration.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device is known but has no usable driver.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Caller-supplied argument rejected before any device traffic.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Permission denied opening the HID device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
