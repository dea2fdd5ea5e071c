//! A simulated watch for tests.
//!
//! Decodes request frames written to it, answers every command the library
//! issues and records what it saw. Faults are injected by editing the
//! shared [`SimState`].

use crate::device::pids;
use crate::driver::{LogSink, Progress};
use crate::error::Result;
use crate::frame::{split_reports, Frame, Framing, ReportAssembler, REPORT_HEADER_LEN, REPORT_LEN};
use crate::pmem20::{EntryLinks, LogEntry, LogHeader, REGION_HEADER_LEN};
use crate::protocol::commands;
use crate::time::DateTime;
use crate::transport::HidTransport;
use crate::SUUNTO_VID;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Value of the "more entries" word in log-head replies.
const MORE_ENTRIES: u32 = 0x0400;

#[derive(Debug, Clone)]
pub struct SimPage {
    pub next: u32,
    pub prev: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct SimState {
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: String,
    pub serial: String,
    pub fw: [u8; 4],
    pub hw: [u8; 4],
    /// Framing of every command other than device-info.
    pub framing: Framing,
    pub charge: u8,
    pub lock: u32,
    pub settings: Vec<u8>,
    pub orbit_header: [u8; 8],
    pub pages: HashMap<u32, SimPage>,
    pub log_count: u16,
    /// Entry headers in the order log-head walks them.
    pub heads: Vec<[u8; 64]>,
    head_index: Option<usize>,
    /// Log-read requests for these addresses get no reply.
    pub silent_pages: HashSet<u32>,
    /// Commands that get no reply.
    pub silent_commands: HashSet<u16>,
    /// Commands whose next reply is lost after the command takes effect.
    pub lost_replies: HashSet<u16>,
    /// Commands whose next reply is held back until another reply is sent.
    pub delayed_replies: HashSet<u16>,
    /// Number of upcoming replies sent with a wrong sequence number.
    pub stale_replies: usize,
    /// Every decoded request, in order.
    pub requests: Vec<(u16, Vec<u8>)>,
    /// Sequence number of every decoded request.
    pub sequences: Vec<u16>,
    pub write_starts: Vec<u32>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub tails: Vec<(u32, u32)>,
    /// Every value written with lock-set.
    pub lock_sets: Vec<u32>,
    incoming: Option<(Framing, ReportAssembler)>,
    outgoing: VecDeque<[u8; REPORT_LEN]>,
    held: Vec<[u8; REPORT_LEN]>,
}

impl SimState {
    /// Number of requests seen for `command`.
    pub fn count(&self, command: u16) -> usize {
        self.requests.iter().filter(|(c, _)| *c == command).count()
    }

    /// `(address, length)` of every log-read request.
    pub fn log_reads(&self) -> Vec<(u32, u32)> {
        self.requests
            .iter()
            .filter(|(c, _)| *c == commands::LOG_READ)
            .map(|(_, p)| (le32(&p[0..4]), le32(&p[4..8])))
            .collect()
    }

    fn handle(&mut self, command: u16, payload: &[u8]) -> Option<Vec<u8>> {
        self.requests.push((command, payload.to_vec()));
        if self.silent_commands.contains(&command) {
            return None;
        }
        let reply = match command {
            commands::DEVICE_INFO => {
                let mut out = vec![0u8; 40];
                put_str(&mut out[..16], &self.model);
                put_str(&mut out[16..32], &self.serial);
                out[32..36].copy_from_slice(&self.fw);
                out[36..40].copy_from_slice(&self.hw);
                out
            }
            commands::STATUS => vec![0, self.charge],
            commands::DATE | commands::TIME | commands::LOG_HEAD_STEP => {
                if command == commands::LOG_HEAD_STEP {
                    self.head_index = Some(self.head_index.map_or(0, |i| i + 1));
                }
                Vec::new()
            }
            commands::PERSONAL_SETTINGS => self.settings.clone(),
            commands::LOG_COUNT => {
                let mut out = vec![0, 0];
                out.extend_from_slice(&self.log_count.to_le_bytes());
                out
            }
            commands::LOG_HEAD_FIRST => {
                self.head_index = None;
                more(!self.heads.is_empty())
            }
            commands::LOG_HEAD_PEEK => {
                let next = self.head_index.map_or(0, |i| i + 1);
                more(next < self.heads.len())
            }
            commands::LOG_HEAD => {
                let header = self.head_index.and_then(|i| self.heads.get(i))?;
                let mut out = Vec::with_capacity(72);
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&64u32.to_le_bytes());
                out.extend_from_slice(header);
                out
            }
            commands::GPS_ORBIT_HEAD => {
                let mut out = vec![0];
                out.extend_from_slice(&self.orbit_header);
                out
            }
            commands::WRITE_START => {
                self.write_starts.push(le32(&payload[0..4]));
                Vec::new()
            }
            commands::DATA_WRITE => {
                let address = le32(&payload[0..4]);
                let len = le32(&payload[4..8]) as usize;
                self.writes.push((address, payload[8..8 + len].to_vec()));
                Vec::new()
            }
            commands::DATA_TAIL_LEN => {
                self.tails.push((le32(&payload[0..4]), le32(&payload[4..8])));
                Vec::new()
            }
            commands::LOG_READ => {
                let address = le32(&payload[0..4]);
                let len = le32(&payload[4..8]);
                if self.silent_pages.contains(&address) {
                    return None;
                }
                let (next, prev, data) = match self.pages.get(&address) {
                    Some(page) => (page.next, page.prev, page.data.clone()),
                    None => (0, 0, Vec::new()),
                };
                let mut out = Vec::with_capacity(16 + len as usize);
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&next.to_le_bytes());
                out.extend_from_slice(&prev.to_le_bytes());
                let mut body = data;
                body.resize(len as usize, 0);
                out.extend_from_slice(&body);
                out
            }
            commands::LOCK_CHECK => self.lock.to_le_bytes().to_vec(),
            commands::LOCK_SET => {
                self.lock = le32(&payload[0..4]);
                self.lock_sets.push(self.lock);
                Vec::new()
            }
            _ => return None,
        };
        if self.lost_replies.remove(&command) {
            return None;
        }
        Some(reply)
    }
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn more(more: bool) -> Vec<u8> {
    let value = if more { MORE_ENTRIES } else { 0 };
    value.to_le_bytes().to_vec()
}

fn put_str(field: &mut [u8], value: &str) {
    let n = value.len().min(field.len());
    field[..n].copy_from_slice(&value.as_bytes()[..n]);
}

/// Shared handle to a simulated watch; clones see the same state.
#[derive(Clone)]
pub struct SimulatedWatch {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedWatch {
    /// An Ambit2 ("Duck", firmware 2.0.0) speaking the current framing.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                vendor_id: SUUNTO_VID,
                product_id: pids::AMBIT2,
                model: "Duck".into(),
                serial: "SIM0001".into(),
                fw: [2, 0, 0, 0],
                hw: [0x4B, 0, 0, 0],
                framing: Framing::Current,
                charge: 87,
                lock: 0,
                settings: vec![0xA5; 32],
                orbit_header: [0; 8],
                pages: HashMap::new(),
                log_count: 0,
                heads: Vec::new(),
                head_index: None,
                silent_pages: HashSet::new(),
                silent_commands: HashSet::new(),
                lost_replies: HashSet::new(),
                delayed_replies: HashSet::new(),
                stale_replies: 0,
                requests: Vec::new(),
                sequences: Vec::new(),
                write_starts: Vec::new(),
                writes: Vec::new(),
                tails: Vec::new(),
                lock_sets: Vec::new(),
                incoming: None,
                outgoing: VecDeque::new(),
                held: Vec::new(),
            })),
        }
    }

    /// Identify as a different model.
    pub fn with_identity(self, product_id: u16, model: &str, fw: [u8; 4]) -> Self {
        {
            let mut state = self.state();
            state.product_id = product_id;
            state.model = model.into();
            state.fw = fw;
        }
        self
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Store a page, zero-padded to `page_size`.
    pub fn put_page(&self, address: u32, page_size: u16, next: u32, prev: u32, data: &[u8]) {
        let mut data = data.to_vec();
        data.resize(page_size as usize, 0);
        self.state().pages.insert(address, SimPage { next, prev, data });
    }

    /// Lay out a complete log region and return each entry's address.
    ///
    /// Page 0 holds the region header; each entry takes one header page
    /// followed by its body pages.
    pub fn install_log(
        &self,
        mem_start: u32,
        page_size: u16,
        entries: Vec<(LogHeader, Vec<u8>)>,
    ) -> Vec<u32> {
        let page = page_size as u32;
        let mut next_page = mem_start + page;
        let mut placed = Vec::with_capacity(entries.len());
        for (mut header, body) in entries {
            let entry_address = next_page;
            next_page += page;
            header.body_address = next_page;
            header.body_length = body.len() as u32;
            let body_pages = body.chunks(page as usize).count() as u32;
            for (i, chunk) in body.chunks(page as usize).enumerate() {
                let address = next_page + i as u32 * page;
                let next = if (i as u32) + 1 < body_pages { address + page } else { 0xFFFF_FFFF };
                let prev = if i == 0 { entry_address } else { address - page };
                self.put_page(address, page_size, next, prev, chunk);
            }
            next_page += body_pages * page;
            placed.push((entry_address, header));
        }

        let addresses: Vec<u32> = placed.iter().map(|(a, _)| *a).collect();
        let mut heads = Vec::with_capacity(placed.len());
        for (i, (address, header)) in placed.iter().enumerate() {
            let links = EntryLinks {
                next: addresses.get(i + 1).copied().unwrap_or(0),
                prev: if i == 0 { mem_start } else { addresses[i - 1] },
            };
            let bytes = header.to_bytes(links);
            self.put_page(*address, page_size, links.next, links.prev, &bytes);
            heads.push(bytes);
        }

        let mut region = [0u8; REGION_HEADER_LEN];
        region[0..4].copy_from_slice(&addresses.last().copied().unwrap_or(0).to_le_bytes());
        region[4..8].copy_from_slice(&addresses.first().copied().unwrap_or(0).to_le_bytes());
        region[8..12].copy_from_slice(&(addresses.len() as u32).to_le_bytes());
        region[12..16].copy_from_slice(&next_page.to_le_bytes());
        self.put_page(mem_start, page_size, 0, 0, &region);

        let mut state = self.state();
        state.log_count = addresses.len() as u16;
        state.heads = heads;
        addresses
    }

    /// Point an installed entry's header at a different next entry.
    pub fn relink_entry(&self, address: u32, next: u32) {
        let mut state = self.state();
        let page = state.pages.get_mut(&address).expect("entry page installed");
        page.data[4..8].copy_from_slice(&next.to_le_bytes());
    }
}

impl HidTransport for SimulatedWatch {
    fn write_report(&self, report: &[u8]) -> Result<usize> {
        let mut guard = self.state();
        let state = &mut *guard;
        let (framing, assembler) = state.incoming.get_or_insert_with(|| {
            let framing = request_framing(report, state.framing);
            (framing, ReportAssembler::new(framing))
        });
        let framing = *framing;
        let Some(raw) = assembler.push(report).expect("well-formed request report") else {
            return Ok(report.len());
        };
        state.incoming = None;

        let request = Frame::decode(framing, &raw).expect("well-formed request frame");
        state.sequences.push(request.sequence);
        if let Some(payload) = state.handle(request.command, &request.payload) {
            let sequence = if state.stale_replies > 0 {
                state.stale_replies -= 1;
                request.sequence.wrapping_add(1)
            } else {
                request.sequence
            };
            let encoded = Frame::new(request.command, sequence, payload)
                .encode(framing)
                .expect("encodable reply");
            if state.delayed_replies.remove(&request.command) {
                state.held.extend(split_reports(&encoded));
            } else {
                let held = std::mem::take(&mut state.held);
                state.outgoing.extend(held);
                state.outgoing.extend(split_reports(&encoded));
            }
        }
        Ok(report.len())
    }

    fn read_report(&self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
        match self.state().outgoing.pop_front() {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

/// Framing of a request, decided from its first report.
///
/// The command code leads every framing; device-info always uses legacy.
fn request_framing(first: &[u8], configured: Framing) -> Framing {
    let command = u16::from_le_bytes([first[REPORT_HEADER_LEN], first[REPORT_HEADER_LEN + 1]]);
    if command == commands::DEVICE_INFO {
        Framing::Legacy
    } else {
        configured
    }
}

/// A header whose fields vary with `n`; body address and length are filled in by `install_log`.
pub fn sample_header(n: u8) -> LogHeader {
    LogHeader {
        date_time: DateTime {
            year: 2014,
            month: 6,
            day: 1 + n % 28,
            hour: 8,
            minute: n % 60,
            msec: 0,
        },
        activity_type: n,
        activity_name: format!("Activity {n}"),
        duration_ms: 60_000 * u32::from(n),
        distance_m: 1000 * u32::from(n),
        sample_count: u32::from(n) * 10,
        body_address: 0,
        body_length: 0,
    }
}

/// Log sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct CollectSink {
    /// Activity types to skip.
    pub skip_types: Vec<u8>,
    pub skip_calls: usize,
    pub entries: Vec<LogEntry>,
    pub progress: Vec<Progress>,
}

impl CollectSink {
    pub fn skipping(types: &[u8]) -> Self {
        Self {
            skip_types: types.to_vec(),
            ..Self::default()
        }
    }
}

impl LogSink for CollectSink {
    fn skip(&mut self, header: &LogHeader) -> bool {
        self.skip_calls += 1;
        self.skip_types.contains(&header.activity_type)
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    fn progress(&mut self, progress: Progress) {
        self.progress.push(progress);
    }
}
