//! Device model: discovery, identity, and the known-device table.

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::SUUNTO_VID;
use serde::Serialize;
use tracing::{debug, info};

/// Firmware or hardware version as reported by the device (major.minor.build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, build: u16) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Decode the 4-byte wire form `[major, minor, build_lo, build_hi]`.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], u16::from_le_bytes([bytes[2], bytes[3]]))
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Identity reported by the device-info handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Internal model code, e.g. "Duck".
    pub model: String,
    pub serial: String,
    pub fw_version: FirmwareVersion,
    pub hw_version: FirmwareVersion,
}

/// Length of the device-info reply body.
pub const DEVICE_INFO_LEN: usize = 40;

impl DeviceInfo {
    /// Parse a device-info reply: model[16] serial[16] fw[4] hw[4].
    pub fn parse(vendor_id: u16, product_id: u16, data: &[u8]) -> Result<Self> {
        let mut cur = ByteCursor::new(data);
        let model = c_string(cur.read_bytes(16)?);
        let serial = c_string(cur.read_bytes(16)?);
        let fw_version = FirmwareVersion::from_bytes(cur.read_array()?);
        let hw_version = FirmwareVersion::from_bytes(cur.read_array()?);
        Ok(Self {
            vendor_id,
            product_id,
            model,
            serial,
            fw_version,
            hw_version,
        })
    }
}

/// Decode a NUL-padded fixed-width string field.
pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Hardware families with a driver implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverFamily {
    /// Ambit/Ambit2: pmem20 log storage and orbit writes.
    Ambit,
    /// Status, clock and settings only.
    Basic,
}

/// One row of the known-device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: &'static str,
    /// Oldest firmware this row applies to.
    pub min_fw: FirmwareVersion,
    pub name: &'static str,
    /// `None` marks a recognized but unsupported unit.
    pub family: Option<DriverFamily>,
    /// Opaque per-family parameter: page size for `Ambit`, framing selector for `Basic`.
    pub driver_param: u32,
}

/// Known Suunto product IDs.
pub mod pids {
    pub const AMBIT: u16 = 0x0010;
    pub const AMBIT2: u16 = 0x0019;
    pub const AMBIT2_S: u16 = 0x001A;
    pub const AMBIT3_PEAK: u16 = 0x001B;
    pub const AMBIT3_SPORT: u16 = 0x001C;
    pub const AMBIT2_R: u16 = 0x001D;
}

const fn row(
    product_id: u16,
    model: &'static str,
    min_fw: FirmwareVersion,
    name: &'static str,
    family: Option<DriverFamily>,
    driver_param: u32,
) -> KnownDevice {
    KnownDevice {
        vendor_id: SUUNTO_VID,
        product_id,
        model,
        min_fw,
        name,
        family,
        driver_param,
    }
}

/// Rows are matched top to bottom; newer firmware rows come first.
pub static KNOWN_DEVICES: &[KnownDevice] = &[
    row(
        pids::AMBIT3_SPORT,
        "Finch",
        FirmwareVersion::new(0, 0, 0),
        "Suunto Ambit3 Sport",
        Some(DriverFamily::Basic),
        2,
    ),
    row(
        pids::AMBIT3_PEAK,
        "Emu",
        FirmwareVersion::new(0, 0, 0),
        "Suunto Ambit3 Peak",
        Some(DriverFamily::Basic),
        2,
    ),
    row(
        pids::AMBIT2_R,
        "Greentit",
        FirmwareVersion::new(0, 0, 0),
        "Suunto Ambit2 R",
        Some(DriverFamily::Ambit),
        0x0400,
    ),
    row(
        pids::AMBIT2_S,
        "Colibri",
        FirmwareVersion::new(1, 1, 2),
        "Suunto Ambit2 S",
        Some(DriverFamily::Ambit),
        0x0400,
    ),
    row(pids::AMBIT2_S, "Colibri", FirmwareVersion::new(0, 2, 3), "Suunto Ambit2 S", None, 0x0400),
    row(
        pids::AMBIT2,
        "Duck",
        FirmwareVersion::new(1, 1, 2),
        "Suunto Ambit2",
        Some(DriverFamily::Ambit),
        0x0400,
    ),
    row(pids::AMBIT2, "Duck", FirmwareVersion::new(0, 2, 2), "Suunto Ambit2", None, 0x0400),
    row(
        pids::AMBIT,
        "Bluebird",
        FirmwareVersion::new(1, 9, 0),
        "Suunto Ambit",
        Some(DriverFamily::Ambit),
        0x0200,
    ),
    row(
        pids::AMBIT,
        "Bluebird",
        FirmwareVersion::new(1, 6, 0),
        "Suunto Ambit",
        Some(DriverFamily::Basic),
        1,
    ),
    row(pids::AMBIT, "Bluebird", FirmwareVersion::new(0, 0, 0), "Suunto Ambit", None, 0),
];

/// Whether any table row uses this vendor/product pair.
pub fn is_known_device(vendor_id: u16, product_id: u16) -> bool {
    KNOWN_DEVICES
        .iter()
        .any(|d| d.vendor_id == vendor_id && d.product_id == product_id)
}

/// Find the table row for a device identity.
pub fn find_known_device(
    vendor_id: u16,
    product_id: u16,
    model: &str,
    fw_version: FirmwareVersion,
) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES.iter().find(|d| {
        d.vendor_id == vendor_id
            && d.product_id == product_id
            && d.model == model
            && fw_version >= d.min_fw
    })
}

/// A HID device found during enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
    pub serial: Option<String>,
}

/// Discover all connected Ambit watches.
///
/// Enumerates USB HID devices and returns info for any recognized product IDs.
pub fn discover_devices() -> Result<Vec<DiscoveredDevice>> {
    debug!("Starting HID device enumeration");
    let api = hidapi::HidApi::new().map_err(|e| Error::Transport(e.to_string()))?;

    let mut devices = Vec::new();
    for info in api.device_list() {
        if !is_known_device(info.vendor_id(), info.product_id()) {
            continue;
        }
        info!(
            vid = format_args!("0x{:04X}", info.vendor_id()),
            pid = format_args!("0x{:04X}", info.product_id()),
            path = %info.path().to_string_lossy(),
            "Found Ambit device"
        );
        devices.push(DiscoveredDevice {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            path: info.path().to_string_lossy().into_owned(),
            serial: info.serial_number().map(|s| s.to_string()),
        });
    }

    debug!(count = devices.len(), "Device enumeration complete");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_bytes(model: &str, serial: &str, fw: [u8; 4], hw: [u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; DEVICE_INFO_LEN];
        data[..model.len()].copy_from_slice(model.as_bytes());
        data[16..16 + serial.len()].copy_from_slice(serial.as_bytes());
        data[32..36].copy_from_slice(&fw);
        data[36..40].copy_from_slice(&hw);
        data
    }

    #[test]
    fn parse_device_info() {
        let data = info_bytes("Duck", "ABC123", [1, 2, 0x10, 0x00], [0x4B, 0, 0, 0]);
        let info = DeviceInfo::parse(SUUNTO_VID, pids::AMBIT2, &data).unwrap();
        assert_eq!(info.model, "Duck");
        assert_eq!(info.serial, "ABC123");
        assert_eq!(info.fw_version, FirmwareVersion::new(1, 2, 16));
        assert_eq!(info.fw_version.to_string(), "1.2.16");
    }

    #[test]
    fn parse_device_info_rejects_short_reply() {
        let data = vec![0u8; DEVICE_INFO_LEN - 1];
        assert!(matches!(
            DeviceInfo::parse(SUUNTO_VID, pids::AMBIT2, &data),
            Err(Error::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn firmware_ordering() {
        assert!(FirmwareVersion::new(1, 9, 0) > FirmwareVersion::new(1, 6, 400));
        assert!(FirmwareVersion::new(2, 0, 0) > FirmwareVersion::new(1, 255, 65535));
        assert!(FirmwareVersion::new(1, 1, 3) > FirmwareVersion::new(1, 1, 2));
    }

    #[test]
    fn lookup_selects_by_firmware() {
        let bluebird = |fw| find_known_device(SUUNTO_VID, pids::AMBIT, "Bluebird", fw);
        let new = bluebird(FirmwareVersion::new(2, 1, 0)).unwrap();
        assert_eq!(new.family, Some(DriverFamily::Ambit));
        assert_eq!(new.driver_param, 0x0200);

        let old = bluebird(FirmwareVersion::new(1, 6, 5)).unwrap();
        assert_eq!(old.family, Some(DriverFamily::Basic));

        let ancient = bluebird(FirmwareVersion::new(1, 0, 0)).unwrap();
        assert_eq!(ancient.family, None);
    }

    #[test]
    fn lookup_requires_matching_model() {
        let fw = FirmwareVersion::new(2, 0, 0);
        assert!(find_known_device(SUUNTO_VID, pids::AMBIT2, "Colibri", fw).is_none());
        assert!(find_known_device(0x1234, pids::AMBIT2, "Duck", fw).is_none());
    }

    #[test]
    fn known_device_pairs() {
        assert!(is_known_device(SUUNTO_VID, pids::AMBIT2_R));
        assert!(!is_known_device(SUUNTO_VID, 0x0001));
    }

    #[test]
    fn c_string_stops_at_nul() {
        assert_eq!(c_string(b"Run\0\0garbage"), "Run");
        assert_eq!(c_string(b"Full"), "Full");
    }
}
