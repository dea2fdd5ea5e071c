//! ambit-sync-core: Suunto Ambit USB HID protocol, device drivers, and the
//! pmem20 paged log engine.
//!
//! A [`session::Session`] owns one device connection. It performs the
//! device-info handshake, binds the driver for the hardware family, and
//! exposes the driver's capabilities. Log reads and orbit writes on the
//! Ambit family go through [`pmem20::Pmem20`].

pub mod comm;
pub mod config;
pub mod crc16;
pub mod cursor;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod pmem20;
pub mod protocol;
pub mod session;
#[cfg(test)]
mod sim;
pub mod time;
pub mod transport;

/// Suunto USB Vendor ID.
pub const SUUNTO_VID: u16 = 0x1493;

pub use config::Config;
pub use error::{Error, Result};
pub use session::Session;
