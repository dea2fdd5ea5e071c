//! Caller-side error classification and retry.
//!
//! [`Protocol::command`] never retries. Callers that can safely repeat an
//! exchange (the session handshake, idempotent reads) use [`send_with_retry`].

use crate::error::{Error, FrameError, Result};
use crate::frame::Framing;
use crate::protocol::{Protocol, Reply};
use tracing::{debug, warn};

/// Classification of communication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout or a garbled exchange that may succeed on retry.
    Transient,
    /// Device is disconnected; stop retrying.
    Disconnected,
    /// Permission denied opening the device.
    PermissionDenied,
    /// The driver or framing does not support the request.
    Unsupported,
    /// Reply content or device state is unusable.
    InvalidResponse,
}

impl ErrorClass {
    /// Classify an error for retry decisions.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Self::Transient,
            Error::Frame(frame) => match frame {
                FrameError::Truncated { .. }
                | FrameError::ChecksumMismatch { .. }
                | FrameError::UnexpectedSequence { .. }
                | FrameError::UnexpectedPart { .. } => Self::Transient,
                FrameError::UnexpectedCommand { .. }
                | FrameError::Malformed(_)
                | FrameError::PayloadTooLarge { .. } => Self::InvalidResponse,
            },
            Error::PermissionDenied(_) => Self::PermissionDenied,
            Error::DeviceNotFound(_) => Self::Disconnected,
            Error::UnsupportedOperation(_) | Error::UnsupportedDevice(_) => Self::Unsupported,
            Error::Transport(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("disconnect")
                    || lower.contains("not found")
                    || lower.contains("no such device")
                {
                    Self::Disconnected
                } else if lower.contains("permission") || lower.contains("access denied") {
                    Self::PermissionDenied
                } else if lower.contains("timeout") || lower.contains("timed out") {
                    Self::Transient
                } else {
                    Self::InvalidResponse
                }
            }
            Error::ChainCorruption { .. }
            | Error::InvalidState(_)
            | Error::BufferUnderrun { .. }
            | Error::InvalidReply { .. }
            | Error::InvalidInput(_)
            | Error::Config(_) => Self::InvalidResponse,
        }
    }

    /// Whether this error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Send a command, retrying transient failures up to `max_retries` extra times.
///
/// Each attempt is a fresh exchange with its own sequence number.
pub fn send_with_retry(
    protocol: &mut Protocol,
    command: u16,
    payload: &[u8],
    framing: Framing,
    max_retries: u32,
) -> Result<Reply> {
    let mut attempt = 0;
    loop {
        match protocol.command(command, payload, framing) {
            Ok(reply) => {
                if attempt > 0 {
                    debug!(
                        command = format_args!("0x{:04X}", command),
                        "Command succeeded on attempt {}",
                        attempt + 1
                    );
                }
                return Ok(reply);
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                if !class.is_retryable() || attempt == max_retries {
                    warn!(
                        "Command 0x{:04X} failed (class={:?}, attempt={}/{}): {}",
                        command,
                        class,
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }
                debug!(
                    "Command 0x{:04X} transient error (attempt {}/{}): {}, retrying...",
                    command,
                    attempt + 1,
                    max_retries + 1,
                    e
                );
                attempt += 1;
            }
        }
    }
}
