//! Device timestamp representation.

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;

/// Wire length of a timestamp: year u16, month, day, hour, minute, msec u16.
pub const DATE_TIME_LEN: usize = 8;

/// A wall-clock timestamp as the watch stores it (no time zone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    /// Seconds within the minute, in milliseconds.
    pub msec: u16,
}

impl DateTime {
    pub(crate) fn read(cur: &mut ByteCursor<'_>) -> Result<Self> {
        Ok(Self {
            year: cur.read_u16_le()?,
            month: cur.read_u8()?,
            day: cur.read_u8()?,
            hour: cur.read_u8()?,
            minute: cur.read_u8()?,
            msec: cur.read_u16_le()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; DATE_TIME_LEN] {
        let year = self.year.to_le_bytes();
        let msec = self.msec.to_le_bytes();
        [
            year[0],
            year[1],
            self.month,
            self.day,
            self.hour,
            self.minute,
            msec[0],
            msec[1],
        ]
    }

    /// Convert to a chrono timestamp. Fails for values the device should never report.
    pub fn to_naive(&self) -> Result<NaiveDateTime> {
        NaiveDate::from_ymd_opt(i32::from(self.year), u32::from(self.month), u32::from(self.day))
            .and_then(|d| {
                d.and_hms_milli_opt(
                    u32::from(self.hour),
                    u32::from(self.minute),
                    u32::from(self.msec / 1000),
                    u32::from(self.msec % 1000),
                )
            })
            .ok_or_else(|| Error::InvalidInput(format!("invalid device timestamp {self:?}")))
    }
}

impl TryFrom<NaiveDateTime> for DateTime {
    type Error = Error;

    fn try_from(value: NaiveDateTime) -> Result<Self> {
        let year = u16::try_from(value.year())
            .map_err(|_| Error::InvalidInput(format!("year {} out of range", value.year())))?;
        // Leap seconds are folded into the last second of the minute.
        let millis = value.nanosecond().min(999_999_999) / 1_000_000;
        Ok(Self {
            year,
            month: value.month() as u8,
            day: value.day() as u8,
            hour: value.hour() as u8,
            minute: value.minute() as u8,
            msec: (value.second() * 1000 + millis) as u16,
        })
    }
}

impl std::fmt::Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.msec / 1000,
            self.msec % 1000
        )
    }
}
