//! An open device session: handshake, driver selection, guarded operations.

use crate::comm::send_with_retry;
use crate::config::Config;
use crate::device::{find_known_device, DeviceInfo, DiscoveredDevice, KnownDevice};
use crate::driver::{
    create_driver, unsupported, Capabilities, DeviceDriver, DeviceStatus, LogSink,
    OrbitWriteOutcome, PersonalSettings,
};
use crate::error::{Error, Result};
use crate::frame::Framing;
use crate::protocol::{commands, Protocol};
use crate::time::DateTime;
use crate::transport::{HidApiTransport, HidTransport};
use tracing::{debug, info, warn};

/// Host version announced in the device-info request.
const HOST_VERSION: [u8; 4] = [0x02, 0x00, 0x2D, 0x00];

/// One open watch. Dropping the session finalizes the driver.
pub struct Session {
    protocol: Protocol,
    info: DeviceInfo,
    device: &'static KnownDevice,
    driver: Box<dyn DeviceDriver>,
}

impl Session {
    /// Identify the watch behind `transport` and bind its driver.
    pub fn open(
        transport: Box<dyn HidTransport>,
        vendor_id: u16,
        product_id: u16,
        config: &Config,
    ) -> Result<Self> {
        let mut protocol = Protocol::new(transport, &config.protocol);
        let reply = send_with_retry(
            &mut protocol,
            commands::DEVICE_INFO,
            &HOST_VERSION,
            Framing::Legacy,
            config.protocol.handshake_retries,
        )?;
        let info = DeviceInfo::parse(vendor_id, product_id, &reply.payload)?;
        debug!(
            model = %info.model,
            serial = %info.serial,
            fw = %info.fw_version,
            hw = %info.hw_version,
            "Device identified"
        );

        let device = find_known_device(vendor_id, product_id, &info.model, info.fw_version)
            .ok_or_else(|| {
                Error::UnsupportedDevice(format!(
                    "{} (0x{vendor_id:04X}:0x{product_id:04X}) firmware {}",
                    info.model, info.fw_version
                ))
            })?;
        let mut driver = create_driver(device)?;
        driver.init(&mut protocol, &info)?;

        info!(
            name = device.name,
            serial = %info.serial,
            family = ?driver.family(),
            "Session opened"
        );
        Ok(Self {
            protocol,
            info,
            device,
            driver,
        })
    }

    /// Open a discovered HID device.
    pub fn open_hid(device: &DiscoveredDevice, config: &Config) -> Result<Self> {
        let transport = HidApiTransport::open_path(&device.path)?;
        Self::open(Box::new(transport), device.vendor_id, device.product_id, config)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn device(&self) -> &'static KnownDevice {
        self.device
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    fn require(&self, capability: Capabilities) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(unsupported(capability))
        }
    }

    pub fn status(&mut self) -> Result<DeviceStatus> {
        self.require(Capabilities::STATUS)?;
        self.driver.status_get(&mut self.protocol)
    }

    pub fn personal_settings(&mut self) -> Result<PersonalSettings> {
        self.require(Capabilities::PERSONAL_SETTINGS)?;
        self.driver.personal_settings_get(&mut self.protocol)
    }

    pub fn set_date_time(&mut self, date_time: &DateTime) -> Result<()> {
        self.require(Capabilities::DATE_TIME_SET)?;
        self.driver.date_time_set(&mut self.protocol, date_time)
    }

    /// Set the watch clock to the host's local time.
    pub fn sync_time(&mut self) -> Result<DateTime> {
        let now = DateTime::try_from(chrono::Local::now().naive_local())?;
        self.set_date_time(&now)?;
        Ok(now)
    }

    pub fn gps_orbit_header(&mut self) -> Result<[u8; 8]> {
        self.require(Capabilities::GPS_ORBIT_HEADER)?;
        self.driver.gps_orbit_header_read(&mut self.protocol)
    }

    /// Stream log entries into `sink` while holding the device log lock.
    pub fn read_logs(&mut self, sink: &mut dyn LogSink) -> Result<usize> {
        self.require(Capabilities::LOG_READ)?;
        self.with_log_lock(|driver, protocol| driver.log_read(protocol, sink))
    }

    /// Upload GPS orbit data while holding the device log lock.
    pub fn write_gps_orbit(&mut self, data: &[u8]) -> Result<OrbitWriteOutcome> {
        self.require(Capabilities::GPS_ORBIT_WRITE)?;
        self.with_log_lock(|driver, protocol| driver.gps_orbit_write(protocol, data))
    }

    /// Run `op` between a lock acquire and a release.
    ///
    /// A failed acquire skips `op`. The release runs on every path after a
    /// successful acquire; when both fail, the error from `op` is returned.
    fn with_log_lock<T>(
        &mut self,
        op: impl FnOnce(&mut dyn DeviceDriver, &mut Protocol) -> Result<T>,
    ) -> Result<T> {
        if !self.supports(Capabilities::LOCK_LOG) {
            return op(self.driver.as_mut(), &mut self.protocol);
        }

        self.driver.lock_log(&mut self.protocol, true)?;
        let result = op(self.driver.as_mut(), &mut self.protocol);
        let release = self.driver.lock_log(&mut self.protocol, false);

        match (result, release) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release log lock after error");
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.deinit(&mut self.protocol);
        debug!(serial = %self.info.serial, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::pids;
    use crate::sim::SimulatedWatch;
    use crate::SUUNTO_VID;

    fn open(watch: &SimulatedWatch) -> Result<Session> {
        let (vid, pid) = {
            let state = watch.state();
            (state.vendor_id, state.product_id)
        };
        Session::open(Box::new(watch.clone()), vid, pid, &Config::default())
    }

    #[test]
    fn handshake_uses_legacy_framing_and_host_version() {
        let watch = SimulatedWatch::new();
        let session = open(&watch).unwrap();
        assert_eq!(session.info().model, "Duck");
        assert_eq!(session.info().serial, "SIM0001");
        assert_eq!(session.device().name, "Suunto Ambit2");
        assert_eq!(watch.state().requests[0], (commands::DEVICE_INFO, HOST_VERSION.to_vec()));
    }

    #[test]
    fn handshake_retries_stale_reply() {
        let watch = SimulatedWatch::new();
        watch.state().stale_replies = 1;
        open(&watch).unwrap();
        assert_eq!(watch.state().count(commands::DEVICE_INFO), 2);
    }

    #[test]
    fn handshake_gives_up_after_configured_retries() {
        let watch = SimulatedWatch::new();
        watch.state().silent_commands.insert(commands::DEVICE_INFO);
        assert!(matches!(open(&watch), Err(Error::Timeout(_))));
        let expected = Config::default().protocol.handshake_retries as usize + 1;
        assert_eq!(watch.state().count(commands::DEVICE_INFO), expected);
    }

    #[test]
    fn unknown_model_is_unsupported_device() {
        let watch = SimulatedWatch::new().with_identity(pids::AMBIT2, "Penguin", [2, 0, 0, 0]);
        assert!(matches!(open(&watch), Err(Error::UnsupportedDevice(_))));
    }

    #[test]
    fn old_firmware_is_unsupported_device() {
        let watch = SimulatedWatch::new().with_identity(pids::AMBIT2, "Duck", [0, 3, 0, 0]);
        assert!(matches!(open(&watch), Err(Error::UnsupportedDevice(_))));
    }

    #[test]
    fn missing_capability_sends_nothing() {
        let watch = SimulatedWatch::new().with_identity(pids::AMBIT3_PEAK, "Emu", [2, 0, 0, 0]);
        watch.state().framing = Framing::Extended;
        let mut session = open(&watch).unwrap();
        let before = watch.state().requests.len();
        assert!(matches!(
            session.gps_orbit_header(),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            session.write_gps_orbit(&[0; 32]),
            Err(Error::UnsupportedOperation(_))
        ));
        assert_eq!(watch.state().requests.len(), before);
        assert_eq!(session.status().unwrap().charge, 87);
    }

    #[test]
    fn sync_time_sets_host_clock() {
        let watch = SimulatedWatch::new();
        let mut session = open(&watch).unwrap();
        let set = session.sync_time().unwrap();
        let state = watch.state();
        assert_eq!(state.count(commands::DATE), 1);
        let time = state.requests.iter().find(|(c, _)| *c == commands::TIME).unwrap();
        assert_eq!(time.1, set.to_bytes().to_vec());
    }

    #[test]
    fn vendor_id_must_match_table() {
        let watch = SimulatedWatch::new();
        let result =
            Session::open(Box::new(watch.clone()), 0x1234, pids::AMBIT2, &Config::default());
        assert!(matches!(result, Err(Error::UnsupportedDevice(_))));
        assert_ne!(SUUNTO_VID, 0x1234);
    }
}
