//! Ambit / Ambit2 driver: pmem20 log storage, GPS orbit upload, log lock.

use super::{
    read_personal_settings, read_status, write_date_time, Capabilities, DeviceDriver,
    DeviceStatus, LogSink, OrbitWriteOutcome, PersonalSettings, Progress,
};
use crate::device::{DeviceInfo, DriverFamily};
use crate::error::{Error, Result};
use crate::frame::Framing;
use crate::pmem20::{LogHeader, Pmem20};
use crate::protocol::{commands, Protocol, Reply};
use crate::time::DateTime;
use tracing::{debug, info, trace, warn};

/// Start of the log region in device memory.
pub const PMEM20_LOG_START: u32 = 0x000F_4240;
/// Size of the log region.
pub const PMEM20_LOG_SIZE: u32 = 0x0029_F630;
/// Start of the GPS orbit (SGEE) area.
pub const PMEM20_GPS_ORBIT_START: u32 = 0x0007_04F0;
/// The orbit area runs up to the log region.
pub const PMEM20_GPS_ORBIT_SIZE: u32 = PMEM20_LOG_START - PMEM20_GPS_ORBIT_START;

/// log-head-first / log-head-peek value meaning another header follows.
const MORE_ENTRIES: u32 = 0x0400;

const FRAMING: Framing = Framing::Current;

/// Byte range of the orbit data that the device reports as its orbit header.
const ORBIT_HEADER_SOURCE: std::ops::Range<usize> = 6..14;

pub struct AmbitDriver {
    pmem: Pmem20,
}

impl AmbitDriver {
    pub fn new(page_size: u16) -> Result<Self> {
        Ok(Self {
            pmem: Pmem20::new(page_size, FRAMING)?,
        })
    }

    pub fn page_size(&self) -> u16 {
        self.pmem.page_size()
    }

    fn log_count(protocol: &mut Protocol) -> Result<u16> {
        let reply = protocol.command(commands::LOG_COUNT, &[], FRAMING)?;
        let mut cur = reply.cursor();
        cur.skip(2)?;
        cur.read_u16_le()
    }

    fn more_entries(reply: &Reply) -> Result<bool> {
        Ok(reply.cursor().read_u32_le()? == MORE_ENTRIES)
    }

    /// Walk the headers with the log-head commands until one is wanted.
    ///
    /// The walk is bounded by the device's log count.
    fn needs_sync(protocol: &mut Protocol, sink: &mut dyn LogSink, count: u16) -> Result<bool> {
        let first = protocol.command(commands::LOG_HEAD_FIRST, &[], FRAMING)?;
        let mut more = Self::more_entries(&first)?;
        let mut seen = 0;
        while more && seen < count {
            protocol.command(commands::LOG_HEAD_STEP, &[], FRAMING)?;
            let reply = protocol.command(commands::LOG_HEAD, &[], FRAMING)?;
            let mut cur = reply.cursor();
            let address = cur.read_u32_le()?;
            cur.skip(4)?;
            let (_, header) = LogHeader::parse(address, cur.rest())?;
            seen += 1;
            if !sink.skip(&header) {
                debug!(date_time = %header.date_time, "Found entry to sync");
                return Ok(true);
            }
            more = Self::more_entries(&protocol.command(commands::LOG_HEAD_PEEK, &[], FRAMING)?)?;
        }
        Ok(false)
    }

    fn stream_entries(&mut self, protocol: &mut Protocol, sink: &mut dyn LogSink) -> Result<usize> {
        let total = self.pmem.entry_count()?;
        let mut done = 0;
        let mut pushed = 0;
        while let Some(header) = self.pmem.next_header(protocol)? {
            done += 1;
            if sink.skip(&header) {
                trace!(date_time = %header.date_time, "Skipping entry");
            } else {
                let entry = self.pmem.read_current_entry(protocol)?;
                debug!(
                    date_time = %entry.header.date_time,
                    body_len = entry.body.len(),
                    "Entry read"
                );
                sink.push(entry);
                pushed += 1;
            }
            sink.progress(Progress {
                total: total.max(done),
                done,
            });
        }
        Ok(pushed)
    }
}

impl DeviceDriver for AmbitDriver {
    fn family(&self) -> DriverFamily {
        DriverFamily::Ambit
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn init(&mut self, _protocol: &mut Protocol, info: &DeviceInfo) -> Result<()> {
        info!(
            model = %info.model,
            page_size = format_args!("0x{:X}", self.pmem.page_size()),
            "Ambit driver ready"
        );
        Ok(())
    }

    fn deinit(&mut self, _protocol: &mut Protocol) {
        self.pmem.log_close();
    }

    fn lock_log(&mut self, protocol: &mut Protocol, lock: bool) -> Result<()> {
        let reply = protocol.command(commands::LOCK_CHECK, &[], FRAMING)?;
        let current = reply.cursor().read_u32_le()?;
        if (current != 0) == lock {
            debug!(locked = lock, "Log lock already in requested state");
            return Ok(());
        }
        let value = u32::from(lock).to_le_bytes();
        if let Err(e) = protocol.command(commands::LOCK_SET, &value, FRAMING) {
            // The device may have applied the set before the reply was lost.
            if lock {
                let unlock = 0u32.to_le_bytes();
                if let Err(release) = protocol.command(commands::LOCK_SET, &unlock, FRAMING) {
                    warn!(error = %release, "Failed to undo partial log lock");
                }
            }
            return Err(e);
        }
        info!(locked = lock, "Log lock changed");
        Ok(())
    }

    fn date_time_set(&mut self, protocol: &mut Protocol, date_time: &DateTime) -> Result<()> {
        write_date_time(protocol, FRAMING, date_time)
    }

    fn status_get(&mut self, protocol: &mut Protocol) -> Result<DeviceStatus> {
        read_status(protocol, FRAMING)
    }

    fn personal_settings_get(&mut self, protocol: &mut Protocol) -> Result<PersonalSettings> {
        read_personal_settings(protocol, FRAMING)
    }

    fn log_read(&mut self, protocol: &mut Protocol, sink: &mut dyn LogSink) -> Result<usize> {
        let count = Self::log_count(protocol)?;
        info!(entries = count, "Reading logs");
        if count == 0 || !Self::needs_sync(protocol, sink, count)? {
            info!("No entries to sync");
            sink.progress(Progress {
                total: u32::from(count),
                done: u32::from(count),
            });
            return Ok(0);
        }

        self.pmem.log_open(protocol, PMEM20_LOG_START, PMEM20_LOG_SIZE)?;
        let result = self.stream_entries(protocol, sink);
        self.pmem.log_close();
        let pushed = result?;
        info!(pushed, "Log read complete");
        Ok(pushed)
    }

    fn gps_orbit_header_read(&mut self, protocol: &mut Protocol) -> Result<[u8; 8]> {
        let reply = protocol.command(commands::GPS_ORBIT_HEAD, &[], FRAMING)?;
        let mut cur = reply.cursor();
        cur.skip(1)?;
        cur.read_array()
    }

    fn gps_orbit_write(
        &mut self,
        protocol: &mut Protocol,
        data: &[u8],
    ) -> Result<OrbitWriteOutcome> {
        if data.len() < ORBIT_HEADER_SOURCE.end {
            return Err(Error::InvalidInput(format!(
                "orbit data is {} bytes, too short to carry a header",
                data.len()
            )));
        }

        let current = self.gps_orbit_header_read(protocol)?;
        // Orbit data carries the year big-endian; the device reports it little-endian.
        let mut candidate = [0u8; 8];
        candidate[0] = data[7];
        candidate[1] = data[6];
        candidate[2..].copy_from_slice(&data[8..ORBIT_HEADER_SOURCE.end]);
        if current == candidate {
            info!("GPS orbit data already up to date");
            return Ok(OrbitWriteOutcome::AlreadyCurrent);
        }

        self.pmem.open_for_write(PMEM20_GPS_ORBIT_START, PMEM20_GPS_ORBIT_SIZE)?;
        let result = self.pmem.write_orbit(protocol, data, true);
        self.pmem.log_close();
        Ok(OrbitWriteOutcome::Written(result?))
    }
}
