//! HID transport abstraction for device communication.
//!
//! Provides a trait-based transport layer so that real HID devices and
//! mock devices share the same interface. The transport moves whole
//! 64-byte reports; framing lives in [`crate::frame`].

use crate::error::{Error, Result};
use tracing::debug;

/// Abstraction over raw HID report read/write.
pub trait HidTransport: Send {
    /// Write one HID report (report ID first). Returns bytes written.
    fn write_report(&self, report: &[u8]) -> Result<usize>;

    /// Read one HID report into `buf`, waiting at most `timeout_ms`.
    ///
    /// Returns `Ok(0)` when the timeout elapsed without data.
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

/// HID transport backed by a `hidapi` device handle.
///
/// Closing happens when the value is dropped.
pub struct HidApiTransport {
    device: hidapi::HidDevice,
}

impl HidApiTransport {
    /// Open the first device matching vendor and product ID.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let api = hidapi::HidApi::new().map_err(|e| Error::Transport(format!("hidapi init: {e}")))?;
        let target = format!("VID=0x{vendor_id:04X} PID=0x{product_id:04X}");
        let device = api
            .open(vendor_id, product_id)
            .map_err(|e| classify_open_error(&target, e))?;
        debug!(
            vid = format_args!("0x{:04X}", vendor_id),
            pid = format_args!("0x{:04X}", product_id),
            "Opened HID device"
        );
        Ok(Self { device })
    }

    /// Open a device by its platform path (as reported by discovery).
    pub fn open_path(path: &str) -> Result<Self> {
        let api = hidapi::HidApi::new().map_err(|e| Error::Transport(format!("hidapi init: {e}")))?;
        let cpath = std::ffi::CString::new(path)
            .map_err(|_| Error::InvalidInput(format!("device path contains NUL: {path}")))?;
        let device = api
            .open_path(&cpath)
            .map_err(|e| classify_open_error(path, e))?;
        debug!(path, "Opened HID device");
        Ok(Self { device })
    }
}

fn classify_open_error(target: &str, err: hidapi::HidError) -> Error {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        Error::PermissionDenied(format!("{target}: {msg}"))
    } else if lower.contains("no such device") || lower.contains("not found") {
        Error::DeviceNotFound(format!("{target}: {msg}"))
    } else {
        Error::Transport(format!("open HID device ({target}): {msg}"))
    }
}

impl HidTransport for HidApiTransport {
    fn write_report(&self, report: &[u8]) -> Result<usize> {
        self.device
            .write(report)
            .map_err(|e| Error::Transport(format!("write: {e}")))
    }

    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        self.device
            .read_timeout(buf, timeout_ms)
            .map_err(|e| Error::Transport(format!("read_timeout: {e}")))
    }
}

/// A scripted HID transport for testing.
///
/// Records every written report and hands out queued replies in order.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::frame::{split_reports, Frame, Framing, REPORT_LEN};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Inner {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        fail_writes: bool,
    }

    /// Mock transport returning preconfigured reports.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a raw report for the next read.
        pub fn queue_report(&self, report: Vec<u8>) {
            self.inner.lock().unwrap().replies.push_back(report);
        }

        /// Queue every report of an encoded reply frame.
        pub fn queue_frame(&self, framing: Framing, frame: &Frame) {
            let bytes = frame.encode(framing).unwrap();
            for report in split_reports(&bytes) {
                self.queue_report(report.to_vec());
            }
        }

        pub fn fail_writes(&self) {
            self.inner.lock().unwrap().fail_writes = true;
        }

        /// All reports written so far.
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.inner.lock().unwrap().written.clone()
        }
    }

    impl HidTransport for MockTransport {
        fn write_report(&self, report: &[u8]) -> Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_writes {
                return Err(Error::Transport("mock: write failed".into()));
            }
            assert_eq!(report.len(), REPORT_LEN, "reports are always full length");
            inner.written.push(report.to_vec());
            Ok(report.len())
        }

        fn read_report(&self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            match inner.replies.pop_front() {
                Some(report) => {
                    let n = report.len().min(buf.len());
                    buf[..n].copy_from_slice(&report[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }
}
