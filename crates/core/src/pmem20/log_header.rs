//! Log entry header layout.
//!
//! ```text
//! 0   magic 0x59 0x5C
//! 2   header length u16
//! 4   next entry u32
//! 8   prev entry u32
//! 12  timestamp (8 bytes, see crate::time)
//! 20  activity type u8, reserved u8
//! 22  activity name [16], NUL padded
//! 38  duration ms u32
//! 42  distance m u32
//! 46  sample count u32
//! 50  body address u32
//! 54  body length u32
//! 58  reserved [6]
//! ```

use crate::cursor::ByteCursor;
use crate::device::c_string;
use crate::error::{Error, Result};
use crate::time::DateTime;
use serde::Serialize;

/// Fixed size of an entry header on the device.
pub const ENTRY_HEADER_LEN: usize = 64;
/// Leading bytes of every entry header.
pub const ENTRY_MAGIC: [u8; 2] = [0x59, 0x5C];
/// Width of the activity name field.
pub const ACTIVITY_NAME_LEN: usize = 16;

/// Metadata describing one log entry, available before its body is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogHeader {
    pub date_time: DateTime,
    pub activity_type: u8,
    pub activity_name: String,
    pub duration_ms: u32,
    pub distance_m: u32,
    pub sample_count: u32,
    /// First page of the body.
    pub body_address: u32,
    /// Declared body length in bytes.
    pub body_length: u32,
}

/// A reconstructed log entry. The body is owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub header: LogHeader,
    pub body: Vec<u8>,
}

/// Neighbouring entries in the device's entry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EntryLinks {
    pub next: u32,
    pub prev: u32,
}

impl LogHeader {
    /// Parse a header read from `address`. A bad magic or length is chain corruption.
    pub(crate) fn parse(address: u32, data: &[u8]) -> Result<(EntryLinks, Self)> {
        let mut cur = ByteCursor::new(data);
        if cur.read_array::<2>()? != ENTRY_MAGIC {
            return Err(Error::ChainCorruption {
                address,
                reason: "entry header magic mismatch",
            });
        }
        if (cur.read_u16_le()? as usize) < ENTRY_HEADER_LEN {
            return Err(Error::ChainCorruption {
                address,
                reason: "entry header length too small",
            });
        }
        let links = EntryLinks {
            next: cur.read_u32_le()?,
            prev: cur.read_u32_le()?,
        };
        let date_time = DateTime::read(&mut cur)?;
        let activity_type = cur.read_u8()?;
        cur.skip(1)?;
        let activity_name = c_string(cur.read_bytes(ACTIVITY_NAME_LEN)?);
        let header = Self {
            date_time,
            activity_type,
            activity_name,
            duration_ms: cur.read_u32_le()?,
            distance_m: cur.read_u32_le()?,
            sample_count: cur.read_u32_le()?,
            body_address: cur.read_u32_le()?,
            body_length: cur.read_u32_le()?,
        };
        Ok((links, header))
    }

    /// Serialize into the on-device layout. Used to build simulated log images.
    #[cfg(test)]
    pub(crate) fn to_bytes(&self, links: EntryLinks) -> [u8; ENTRY_HEADER_LEN] {
        let mut out = [0u8; ENTRY_HEADER_LEN];
        out[0..2].copy_from_slice(&ENTRY_MAGIC);
        out[2..4].copy_from_slice(&(ENTRY_HEADER_LEN as u16).to_le_bytes());
        out[4..8].copy_from_slice(&links.next.to_le_bytes());
        out[8..12].copy_from_slice(&links.prev.to_le_bytes());
        out[12..20].copy_from_slice(&self.date_time.to_bytes());
        out[20] = self.activity_type;
        let name = self.activity_name.as_bytes();
        let n = name.len().min(ACTIVITY_NAME_LEN);
        out[22..22 + n].copy_from_slice(&name[..n]);
        out[38..42].copy_from_slice(&self.duration_ms.to_le_bytes());
        out[42..46].copy_from_slice(&self.distance_m.to_le_bytes());
        out[46..50].copy_from_slice(&self.sample_count.to_le_bytes());
        out[50..54].copy_from_slice(&self.body_address.to_le_bytes());
        out[54..58].copy_from_slice(&self.body_length.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> LogHeader {
        LogHeader {
            date_time: DateTime {
                year: 2014,
                month: 6,
                day: 1,
                hour: 7,
                minute: 30,
                msec: 0,
            },
            activity_type: 3,
            activity_name: "Trail running".into(),
            duration_ms: 3_600_000,
            distance_m: 10_250,
            sample_count: 3600,
            body_address: 0x000F_4A40,
            body_length: 5000,
        }
    }

    #[test]
    fn parse_reads_all_fields() {
        let links = EntryLinks {
            next: 0x0010_0000,
            prev: 0x000F_0000,
        };
        let bytes = header().to_bytes(links);
        let (parsed_links, parsed) = LogHeader::parse(0x1000, &bytes).unwrap();
        assert_eq!(parsed_links, links);
        assert_eq!(parsed, header());
    }

    #[test]
    fn bad_magic_is_chain_corruption() {
        let mut bytes = header().to_bytes(EntryLinks::default());
        bytes[0] = 0xFF;
        assert!(matches!(
            LogHeader::parse(0x2000, &bytes),
            Err(Error::ChainCorruption { address: 0x2000, .. })
        ));
    }

    #[test]
    fn short_buffer_is_underrun() {
        let bytes = header().to_bytes(EntryLinks::default());
        assert!(matches!(
            LogHeader::parse(0, &bytes[..40]),
            Err(Error::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn long_name_is_truncated_to_field() {
        let mut h = header();
        h.activity_name = "A very long activity name".into();
        let (_, parsed) = LogHeader::parse(0, &h.to_bytes(EntryLinks::default())).unwrap();
        assert_eq!(parsed.activity_name, "A very long acti");
    }
}
