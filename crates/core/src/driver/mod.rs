//! Device driver capability interface.
//!
//! Each hardware family implements [`DeviceDriver`]. Operations a family
//! lacks keep the default body, which reports `UnsupportedOperation`;
//! [`DeviceDriver::capabilities`] says up front which ones exist.

mod ambit;
mod basic;

pub use ambit::{
    AmbitDriver, PMEM20_GPS_ORBIT_SIZE, PMEM20_GPS_ORBIT_START, PMEM20_LOG_SIZE, PMEM20_LOG_START,
};
pub use basic::BasicDriver;

use crate::device::{DeviceInfo, DriverFamily, KnownDevice};
use crate::error::{Error, Result};
use crate::frame::Framing;
use crate::pmem20::{LogEntry, LogHeader, OrbitWrite};
use crate::protocol::{commands, Protocol};
use crate::time::DateTime;
use bitflags::bitflags;
use serde::Serialize;
use tracing::debug;

bitflags! {
    /// Operations a driver implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const LOCK_LOG = 1 << 0;
        const DATE_TIME_SET = 1 << 1;
        const STATUS = 1 << 2;
        const PERSONAL_SETTINGS = 1 << 3;
        const LOG_READ = 1 << 4;
        const GPS_ORBIT_HEADER = 1 << 5;
        const GPS_ORBIT_WRITE = 1 << 6;
    }
}

impl Capabilities {
    /// Name of a single capability, for error messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::LOCK_LOG => "log lock",
            Self::DATE_TIME_SET => "date/time set",
            Self::STATUS => "status",
            Self::PERSONAL_SETTINGS => "personal settings",
            Self::LOG_READ => "log read",
            Self::GPS_ORBIT_HEADER => "GPS orbit header read",
            Self::GPS_ORBIT_WRITE => "GPS orbit write",
            _ => "combined capabilities",
        }
    }
}

/// Battery and charge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    /// Charge in percent.
    pub charge: u8,
}

/// Personal settings block as the device returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonalSettings {
    pub raw: Vec<u8>,
}

/// Log read progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Entries on the device.
    pub total: u32,
    /// Entries visited so far, skipped or not.
    pub done: u32,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            (u64::from(self.done.min(self.total)) * 100 / u64::from(self.total)) as u8
        }
    }
}

/// Result of an orbit write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrbitWriteOutcome {
    /// The device already holds data with the same header.
    AlreadyCurrent,
    Written(OrbitWrite),
}

/// Receiver for a streaming log read.
///
/// The implementing value is the caller's context; the driver hands it back
/// on every call.
pub trait LogSink {
    /// Whether to skip fetching the body of this entry.
    fn skip(&mut self, _header: &LogHeader) -> bool {
        false
    }

    /// Receive one fully assembled entry.
    fn push(&mut self, entry: LogEntry);

    fn progress(&mut self, _progress: Progress) {}
}

/// The capability table one hardware family implements.
pub trait DeviceDriver: Send {
    fn family(&self) -> DriverFamily;

    fn capabilities(&self) -> Capabilities;

    /// Called once after the handshake.
    fn init(&mut self, _protocol: &mut Protocol, _info: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    /// Called once when the session closes. Must not fail.
    fn deinit(&mut self, _protocol: &mut Protocol) {}

    /// Acquire (`true`) or release (`false`) the device-side log lock.
    fn lock_log(&mut self, _protocol: &mut Protocol, _lock: bool) -> Result<()> {
        Err(unsupported(Capabilities::LOCK_LOG))
    }

    fn date_time_set(&mut self, _protocol: &mut Protocol, _date_time: &DateTime) -> Result<()> {
        Err(unsupported(Capabilities::DATE_TIME_SET))
    }

    fn status_get(&mut self, _protocol: &mut Protocol) -> Result<DeviceStatus> {
        Err(unsupported(Capabilities::STATUS))
    }

    fn personal_settings_get(&mut self, _protocol: &mut Protocol) -> Result<PersonalSettings> {
        Err(unsupported(Capabilities::PERSONAL_SETTINGS))
    }

    /// Stream log entries into `sink`, oldest first. Returns the number pushed.
    ///
    /// Stops at the first error; entries already pushed stay pushed.
    fn log_read(&mut self, _protocol: &mut Protocol, _sink: &mut dyn LogSink) -> Result<usize> {
        Err(unsupported(Capabilities::LOG_READ))
    }

    fn gps_orbit_header_read(&mut self, _protocol: &mut Protocol) -> Result<[u8; 8]> {
        Err(unsupported(Capabilities::GPS_ORBIT_HEADER))
    }

    fn gps_orbit_write(
        &mut self,
        _protocol: &mut Protocol,
        _data: &[u8],
    ) -> Result<OrbitWriteOutcome> {
        Err(unsupported(Capabilities::GPS_ORBIT_WRITE))
    }
}

pub(crate) fn unsupported(capability: Capabilities) -> Error {
    Error::UnsupportedOperation(format!(
        "{} is not supported by this device",
        capability.describe()
    ))
}

/// Build the driver for a known-device table row.
pub fn create_driver(device: &KnownDevice) -> Result<Box<dyn DeviceDriver>> {
    match device.family {
        Some(DriverFamily::Ambit) => {
            let page_size = u16::try_from(device.driver_param).map_err(|_| {
                Error::UnsupportedDevice(format!(
                    "{}: page size 0x{:X} out of range",
                    device.name, device.driver_param
                ))
            })?;
            Ok(Box::new(AmbitDriver::new(page_size)?))
        }
        Some(DriverFamily::Basic) => {
            let framing = Framing::from_selector(device.driver_param)?;
            Ok(Box::new(BasicDriver::new(framing)))
        }
        None => Err(Error::UnsupportedDevice(format!(
            "{} ({}) with this firmware is not supported",
            device.name, device.model
        ))),
    }
}

// Commands every family answers the same way.

pub(crate) fn read_status(protocol: &mut Protocol, framing: Framing) -> Result<DeviceStatus> {
    let reply = protocol.command(commands::STATUS, &[], framing)?;
    reply.require_len(2)?;
    let status = DeviceStatus {
        charge: reply.payload[1],
    };
    debug!(charge = status.charge, "Device status");
    Ok(status)
}

pub(crate) fn read_personal_settings(
    protocol: &mut Protocol,
    framing: Framing,
) -> Result<PersonalSettings> {
    let reply = protocol.command(commands::PERSONAL_SETTINGS, &[], framing)?;
    Ok(PersonalSettings {
        raw: reply.into_payload(),
    })
}

/// Set the clock: a date command followed by a time command.
pub(crate) fn write_date_time(
    protocol: &mut Protocol,
    framing: Framing,
    date_time: &DateTime,
) -> Result<()> {
    let full = date_time.to_bytes();
    let mut date = [0u8; 8];
    date[..4].copy_from_slice(&full[..4]);
    protocol.command(commands::DATE, &date, framing)?;
    protocol.command(commands::TIME, &full, framing)?;
    debug!(%date_time, "Clock set");
    Ok(())
}
