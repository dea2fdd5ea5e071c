//! Driver for units without pmem20 support: status, clock and settings.

use super::{
    read_personal_settings, read_status, write_date_time, Capabilities, DeviceDriver, DeviceStatus,
    PersonalSettings,
};
use crate::device::{DeviceInfo, DriverFamily};
use crate::error::Result;
use crate::frame::Framing;
use crate::protocol::Protocol;
use crate::time::DateTime;
use tracing::info;

pub struct BasicDriver {
    framing: Framing,
}

impl BasicDriver {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl DeviceDriver for BasicDriver {
    fn family(&self) -> DriverFamily {
        DriverFamily::Basic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STATUS | Capabilities::DATE_TIME_SET | Capabilities::PERSONAL_SETTINGS
    }

    fn init(&mut self, _protocol: &mut Protocol, info: &DeviceInfo) -> Result<()> {
        info!(model = %info.model, framing = ?self.framing, "Basic driver ready");
        Ok(())
    }

    fn date_time_set(&mut self, protocol: &mut Protocol, date_time: &DateTime) -> Result<()> {
        write_date_time(protocol, self.framing, date_time)
    }

    fn status_get(&mut self, protocol: &mut Protocol) -> Result<DeviceStatus> {
        read_status(protocol, self.framing)
    }

    fn personal_settings_get(&mut self, protocol: &mut Protocol) -> Result<PersonalSettings> {
        read_personal_settings(protocol, self.framing)
    }
}
