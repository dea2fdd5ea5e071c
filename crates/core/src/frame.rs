//! Ambit wire framing: frame encoding/decoding and HID report chunking.
//!
//! A command frame is carried in one or more 64-byte HID reports:
//!
//! ```text
//! report:   [0x3F][n][marker][part][ n frame bytes ... zero padding ]
//! marker:   0x5D first part, 0x5E continuation
//! ```
//!
//! Three frame layouts exist, selected per command (all fields little-endian):
//!
//! ```text
//! current:  cmd:u16 len:u16 seq:u16 | payload | crc:u16
//! legacy:   cmd:u16 len:u8  seq:u8  | crc:u16 | payload
//! extended: cmd:u16 len:u32 seq:u16 | payload | crc:u16
//! ```
//!
//! The checksum always covers header then payload; legacy places it between them.

use crate::crc16::{crc16, crc16_continue};
use crate::error::{Error, FrameError, Result};

/// HID report ID used by Ambit watches.
pub const REPORT_ID: u8 = 0x3F;
/// Full HID report length (including report ID).
pub const REPORT_LEN: usize = 64;
/// Report header: report ID, data length, part marker, part index.
pub const REPORT_HEADER_LEN: usize = 4;
/// Frame bytes carried per report.
pub const REPORT_DATA_LEN: usize = REPORT_LEN - REPORT_HEADER_LEN;

/// Part marker for the first report of a frame.
pub const MARKER_FIRST: u8 = 0x5D;
/// Part marker for continuation reports.
pub const MARKER_CONTINUATION: u8 = 0x5E;

const CRC_LEN: usize = 2;

/// Frame layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Standard layout used by current firmware.
    Current,
    /// Reduced header used by first-generation hardware and the device-info handshake.
    Legacy,
    /// Widened length field for newer firmware.
    Extended,
}

impl Framing {
    /// Map the numeric selector used in driver tables (0=current, 1=legacy, 2=extended).
    pub fn from_selector(selector: u32) -> Result<Self> {
        match selector {
            0 => Ok(Self::Current),
            1 => Ok(Self::Legacy),
            2 => Ok(Self::Extended),
            other => Err(Error::UnsupportedOperation(format!(
                "unknown framing variant {other}"
            ))),
        }
    }

    /// Header length in bytes, excluding the checksum.
    pub fn header_len(self) -> usize {
        match self {
            Self::Current => 6,
            Self::Legacy => 4,
            Self::Extended => 8,
        }
    }

    /// Largest payload the length field can express.
    pub fn max_payload(self) -> usize {
        match self {
            Self::Current => u16::MAX as usize,
            Self::Legacy => u8::MAX as usize,
            Self::Extended => u32::MAX as usize,
        }
    }

    /// Bytes needed before [`Framing::frame_len`] can answer.
    fn prefix_len(self) -> usize {
        match self {
            Self::Legacy => self.header_len() + CRC_LEN,
            _ => self.header_len(),
        }
    }

    /// Total frame length declared by a (possibly partial) frame prefix.
    ///
    /// Returns `None` until enough bytes have arrived to read the length field.
    pub fn frame_len(self, prefix: &[u8]) -> Option<usize> {
        if prefix.len() < self.prefix_len() {
            return None;
        }
        let payload_len = match self {
            Self::Current => u16::from_le_bytes([prefix[2], prefix[3]]) as usize,
            Self::Legacy => prefix[2] as usize,
            Self::Extended => {
                u32::from_le_bytes([prefix[2], prefix[3], prefix[4], prefix[5]]) as usize
            }
        };
        Some(self.header_len() + payload_len + CRC_LEN)
    }
}

/// One command or reply unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            command,
            sequence,
            payload,
        }
    }

    /// Encode into a contiguous frame (not yet split into reports).
    pub fn encode(&self, framing: Framing) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len > framing.max_payload() {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: framing.max_payload(),
            }
            .into());
        }

        let mut buf = Vec::with_capacity(framing.header_len() + len + CRC_LEN);
        buf.extend_from_slice(&self.command.to_le_bytes());
        match framing {
            Framing::Current => {
                buf.extend_from_slice(&(len as u16).to_le_bytes());
                buf.extend_from_slice(&self.sequence.to_le_bytes());
            }
            Framing::Legacy => {
                buf.push(len as u8);
                buf.push(self.sequence as u8);
            }
            Framing::Extended => {
                buf.extend_from_slice(&(len as u32).to_le_bytes());
                buf.extend_from_slice(&self.sequence.to_le_bytes());
            }
        }

        let crc = crc16_continue(&self.payload, crc16(&buf));
        if framing == Framing::Legacy {
            buf.extend_from_slice(&crc.to_le_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            buf.extend_from_slice(&self.payload);
            buf.extend_from_slice(&crc.to_le_bytes());
        }
        Ok(buf)
    }

    /// Decode a complete frame. Trailing bytes beyond the declared length are ignored.
    ///
    /// Legacy frames only carry the low byte of the sequence number.
    pub fn decode(framing: Framing, data: &[u8]) -> Result<Self> {
        let total = framing.frame_len(data).ok_or(FrameError::Truncated {
            expected: framing.prefix_len(),
            actual: data.len(),
        })?;
        if data.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                actual: data.len(),
            }
            .into());
        }

        let header_len = framing.header_len();
        let header = &data[..header_len];
        let command = u16::from_le_bytes([data[0], data[1]]);
        let sequence = match framing {
            Framing::Current => u16::from_le_bytes([data[4], data[5]]),
            Framing::Legacy => data[3] as u16,
            Framing::Extended => u16::from_le_bytes([data[6], data[7]]),
        };

        let (payload, received) = if framing == Framing::Legacy {
            let received = u16::from_le_bytes([data[header_len], data[header_len + 1]]);
            (&data[header_len + CRC_LEN..total], received)
        } else {
            let received = u16::from_le_bytes([data[total - 2], data[total - 1]]);
            (&data[header_len..total - CRC_LEN], received)
        };

        let computed = crc16_continue(payload, crc16(header));
        if computed != received {
            return Err(FrameError::ChecksumMismatch { received, computed }.into());
        }

        Ok(Self {
            command,
            sequence,
            payload: payload.to_vec(),
        })
    }
}

/// Split an encoded frame into HID reports.
pub fn split_reports(frame: &[u8]) -> Vec<[u8; REPORT_LEN]> {
    frame
        .chunks(REPORT_DATA_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let mut report = [0u8; REPORT_LEN];
            report[0] = REPORT_ID;
            report[1] = chunk.len() as u8;
            report[2] = if i == 0 {
                MARKER_FIRST
            } else {
                MARKER_CONTINUATION
            };
            report[3] = i as u8;
            report[REPORT_HEADER_LEN..REPORT_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Accumulates HID reports until a full frame has arrived.
#[derive(Debug)]
pub struct ReportAssembler {
    framing: Framing,
    buf: Vec<u8>,
    next_part: u8,
}

impl ReportAssembler {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: Vec::new(),
            next_part: 0,
        }
    }

    /// Bytes still missing, if the frame length is already known.
    pub fn missing(&self) -> Option<usize> {
        self.framing
            .frame_len(&self.buf)
            .map(|total| total.saturating_sub(self.buf.len()))
    }

    /// Feed one report. Returns the complete frame bytes once the declared length is met.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>> {
        if report.len() < REPORT_HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: REPORT_HEADER_LEN,
                actual: report.len(),
            }
            .into());
        }
        if report[0] != REPORT_ID {
            return Err(FrameError::Malformed("unknown report id").into());
        }

        let len = report[1] as usize;
        if len > REPORT_DATA_LEN {
            return Err(FrameError::Malformed("report data length exceeds report").into());
        }
        if report.len() < REPORT_HEADER_LEN + len {
            return Err(FrameError::Truncated {
                expected: REPORT_HEADER_LEN + len,
                actual: report.len(),
            }
            .into());
        }

        let expected_marker = if self.next_part == 0 && self.buf.is_empty() {
            MARKER_FIRST
        } else {
            MARKER_CONTINUATION
        };
        if report[2] != expected_marker {
            return Err(FrameError::Malformed("unexpected part marker").into());
        }
        if report[3] != self.next_part {
            return Err(FrameError::UnexpectedPart {
                expected: self.next_part,
                actual: report[3],
            }
            .into());
        }
        self.next_part = self.next_part.wrapping_add(1);
        self.buf
            .extend_from_slice(&report[REPORT_HEADER_LEN..REPORT_HEADER_LEN + len]);

        match self.framing.frame_len(&self.buf) {
            Some(total) if self.buf.len() >= total => {
                let mut frame = std::mem::take(&mut self.buf);
                frame.truncate(total);
                Ok(Some(frame))
            }
            _ => Ok(None),
        }
    }
}
