//! Command/response exchange over an exclusively owned HID transport.
//!
//! One call to [`Protocol::command`] is one exchange: assign a sequence
//! number, encode and send the frame, reassemble the reply, validate it.
//! No retries happen here; see [`crate::comm`] for caller-side retry.

use crate::config::ProtocolConfig;
use crate::cursor::ByteCursor;
use crate::error::{Error, FrameError, Result};
use crate::frame::{split_reports, Frame, Framing, ReportAssembler, REPORT_LEN};
use crate::transport::HidTransport;
use tracing::{debug, trace, warn};

/// Sequence number of the first command in a session.
pub const INITIAL_SEQUENCE: u16 = 0;

/// Ambit command codes.
pub mod commands {
    pub const DEVICE_INFO: u16 = 0x0000;
    pub const TIME: u16 = 0x0300;
    pub const DATE: u16 = 0x0302;
    pub const STATUS: u16 = 0x0306;
    pub const PERSONAL_SETTINGS: u16 = 0x0B00;
    pub const LOG_COUNT: u16 = 0x0B06;
    pub const LOG_HEAD_FIRST: u16 = 0x0B07;
    pub const LOG_HEAD_PEEK: u16 = 0x0B08;
    pub const LOG_HEAD_STEP: u16 = 0x0B0A;
    pub const LOG_HEAD: u16 = 0x0B0B;
    pub const GPS_ORBIT_HEAD: u16 = 0x0B15;
    pub const DATA_WRITE: u16 = 0x0B16;
    pub const LOG_READ: u16 = 0x0B17;
    pub const DATA_TAIL_LEN: u16 = 0x0B18;
    pub const LOCK_CHECK: u16 = 0x0B19;
    pub const LOCK_SET: u16 = 0x0B1A;
    pub const WRITE_START: u16 = 0x0B1B;
}

/// An owned reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bounds-checked reader over the payload.
    pub fn cursor(&self) -> ByteCursor<'_> {
        ByteCursor::new(&self.payload)
    }

    /// Fail with [`Error::InvalidReply`] unless the payload holds at least `min` bytes.
    pub fn require_len(&self, min: usize) -> Result<()> {
        if self.payload.len() < min {
            return Err(Error::InvalidReply {
                command: self.command,
                reason: format!("{} bytes, expected at least {min}", self.payload.len()),
            });
        }
        Ok(())
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// A device session's command channel.
pub struct Protocol {
    transport: Box<dyn HidTransport>,
    sequence: u16,
    read_timeout_ms: i32,
}

impl Protocol {
    pub fn new(transport: Box<dyn HidTransport>, config: &ProtocolConfig) -> Self {
        Self {
            transport,
            sequence: INITIAL_SEQUENCE,
            read_timeout_ms: i32::try_from(config.read_timeout_ms).unwrap_or(i32::MAX),
        }
    }

    /// Sequence number the next command will use.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Send a command and wait for its validated reply.
    ///
    /// The sequence counter advances exactly once per call, whether or not
    /// the exchange succeeds. Late replies to earlier commands are dropped
    /// while waiting.
    pub fn command(&mut self, command: u16, payload: &[u8], framing: Framing) -> Result<Reply> {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let encoded = Frame::new(command, sequence, payload.to_vec()).encode(framing)?;
        trace!(
            command = format_args!("0x{:04X}", command),
            sequence,
            framing = ?framing,
            payload_len = payload.len(),
            "TX"
        );
        for report in split_reports(&encoded) {
            self.transport.write_report(&report)?;
        }

        let expected_sequence = match framing {
            Framing::Legacy => sequence & 0x00FF,
            _ => sequence,
        };
        let reply = loop {
            let raw = self.receive(framing, command)?;
            let reply = Frame::decode(framing, &raw)?;
            if reply.sequence == expected_sequence {
                break reply;
            }
            if is_older(reply.sequence, expected_sequence, framing) {
                debug!(
                    expected = expected_sequence,
                    actual = reply.sequence,
                    command = format_args!("0x{:04X}", reply.command),
                    "Dropping late reply"
                );
                continue;
            }
            warn!(
                expected = expected_sequence,
                actual = reply.sequence,
                "Reply sequence mismatch"
            );
            return Err(FrameError::UnexpectedSequence {
                expected: expected_sequence,
                actual: reply.sequence,
            }
            .into());
        };
        if reply.command != command {
            return Err(FrameError::UnexpectedCommand {
                expected: command,
                actual: reply.command,
            }
            .into());
        }

        trace!(
            command = format_args!("0x{:04X}", command),
            sequence,
            payload_len = reply.payload.len(),
            "RX"
        );
        Ok(Reply {
            command: reply.command,
            sequence,
            payload: reply.payload,
        })
    }

    fn receive(&mut self, framing: Framing, command: u16) -> Result<Vec<u8>> {
        let mut assembler = ReportAssembler::new(framing);
        let mut report = [0u8; REPORT_LEN];
        loop {
            let n = self.transport.read_report(&mut report, self.read_timeout_ms)?;
            if n == 0 {
                return Err(Error::Timeout(format!(
                    "no reply to command 0x{command:04X} within {}ms (missing {:?} bytes)",
                    self.read_timeout_ms,
                    assembler.missing()
                )));
            }
            if let Some(frame) = assembler.push(&report[..n])? {
                return Ok(frame);
            }
        }
    }
}

/// True when `actual` precedes `expected` within half the sequence space.
///
/// Legacy frames carry only the low byte, so the window is 8 bits wide there.
fn is_older(actual: u16, expected: u16, framing: Framing) -> bool {
    match framing {
        Framing::Legacy => {
            let behind = (expected as u8).wrapping_sub(actual as u8);
            behind != 0 && behind < 0x80
        }
        _ => {
            let behind = expected.wrapping_sub(actual);
            behind != 0 && behind < 0x8000
        }
    }
}
