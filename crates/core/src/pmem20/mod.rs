//! pmem20: paged on-device memory holding activity logs and GPS orbit data.
//!
//! The device stores a region as fixed-size pages. The first page holds the
//! region header; log entries are a singly linked chain of entry headers,
//! and every multi-page object is a chain of pages whose `next`/`prev`
//! pointers arrive with each log-read reply.
//!
//! Every pointer the device reports is validated before it is followed:
//! it must lie in the region, be page aligned and not repeat within the
//! current walk. A walk of `len` bytes issues at most `ceil(len / page)`
//! page reads.

mod log_header;
mod page_cache;

pub use log_header::{LogEntry, LogHeader, ACTIVITY_NAME_LEN, ENTRY_HEADER_LEN, ENTRY_MAGIC};
#[cfg(test)]
pub(crate) use log_header::EntryLinks;

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::frame::Framing;
use crate::protocol::{commands, Protocol};
use page_cache::{PageCache, PageLinks};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashSet;
use tracing::{debug, info, trace};

/// Region header at the first page: last, first, count, next-free (u32 each).
pub const REGION_HEADER_LEN: usize = 16;
/// Length of the hash block prepended to hashed orbit data: u32 length + SHA-256.
pub const ORBIT_HASH_PREFIX_LEN: usize = 4 + 32;

/// Iteration cursor over the entry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub current: u32,
    pub next: u32,
    pub prev: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    AtEntry,
    Exhausted,
}

/// Outcome of an orbit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrbitWrite {
    pub start_address: u32,
    pub bytes_written: usize,
    pub pages: usize,
}

/// State of an open log region.
#[derive(Debug)]
struct PagedLog {
    page_size: usize,
    framing: Framing,
    mem_start: u32,
    mem_size: u32,
    first_entry: u32,
    last_entry: u32,
    entries: u32,
    next_free_address: u32,
    cursor: LogCursor,
    position: Position,
    visited_entries: HashSet<u32>,
    current_header: Option<LogHeader>,
    cache: PageCache,
}

impl PagedLog {
    fn mem_end(&self) -> u64 {
        u64::from(self.mem_start) + u64::from(self.mem_size)
    }

    /// Page index of a device-reported address, or chain corruption.
    fn page_index(&self, address: u32) -> Result<usize> {
        if address < self.mem_start || u64::from(address) >= self.mem_end() {
            return Err(Error::ChainCorruption {
                address,
                reason: "address outside log region",
            });
        }
        let offset = (address - self.mem_start) as usize;
        if offset % self.page_size != 0 {
            return Err(Error::ChainCorruption {
                address,
                reason: "address not page aligned",
            });
        }
        Ok(offset / self.page_size)
    }

    /// Make sure at least `want` bytes of the page are cached, fetching if needed.
    fn load_page(
        &mut self,
        protocol: &mut Protocol,
        address: u32,
        index: usize,
        want: usize,
    ) -> Result<PageLinks> {
        if let Some(links) = self.cache.lookup(index, want) {
            trace!(address = format_args!("0x{:08X}", address), "Page cache hit");
            return Ok(links);
        }

        let mut request = [0u8; 8];
        request[..4].copy_from_slice(&address.to_le_bytes());
        request[4..].copy_from_slice(&(want as u32).to_le_bytes());
        let reply = protocol.command(commands::LOG_READ, &request, self.framing)?;

        let mut cur = reply.cursor();
        let reply_address = cur.read_u32_le()?;
        let reply_len = cur.read_u32_le()? as usize;
        let links = PageLinks {
            next: cur.read_u32_le()?,
            prev: cur.read_u32_le()?,
        };
        if reply_address != address || reply_len < want || reply_len > self.page_size {
            return Err(Error::InvalidReply {
                command: commands::LOG_READ,
                reason: format!(
                    "requested {want} bytes at 0x{address:08X}, \
                     got {reply_len} at 0x{reply_address:08X}"
                ),
            });
        }
        let data = cur.read_bytes(reply_len)?;
        self.cache.store(index, links, data);

        debug!(
            address = format_args!("0x{:08X}", address),
            len = reply_len,
            next = format_args!("0x{:08X}", links.next),
            "Fetched page"
        );
        Ok(links)
    }

    /// Follow the page chain from `address` until `length` bytes are assembled.
    fn walk(&mut self, protocol: &mut Protocol, address: u32, length: usize) -> Result<Vec<u8>> {
        if length as u64 > u64::from(self.mem_size) {
            return Err(Error::ChainCorruption {
                address,
                reason: "declared length exceeds log region",
            });
        }

        let max_hops = length.div_ceil(self.page_size);
        let mut out = Vec::with_capacity(length);
        let mut visited = HashSet::with_capacity(max_hops);
        let mut page = address;
        for _ in 0..max_hops {
            let index = self.page_index(page)?;
            if !visited.insert(page) {
                return Err(Error::ChainCorruption {
                    address: page,
                    reason: "page chain revisits a page",
                });
            }
            let want = (length - out.len()).min(self.page_size);
            let links = self.load_page(protocol, page, index, want)?;
            out.extend_from_slice(self.cache.data(index, want));
            page = links.next;
        }
        Ok(out)
    }
}

/// The paged memory engine for one device session.
#[derive(Debug)]
pub struct Pmem20 {
    page_size: u16,
    framing: Framing,
    log: Option<PagedLog>,
}

impl Pmem20 {
    /// Create an engine for a device with the given page size.
    pub fn new(page_size: u16, framing: Framing) -> Result<Self> {
        if (page_size as usize) < ENTRY_HEADER_LEN {
            return Err(Error::InvalidInput(format!(
                "page size {page_size} is smaller than an entry header"
            )));
        }
        Ok(Self {
            page_size,
            framing,
            log: None,
        })
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn is_open(&self) -> bool {
        self.log.is_some()
    }

    fn ready(&self) -> Result<&PagedLog> {
        self.log.as_ref().ok_or(Error::InvalidState("log is not open"))
    }

    fn ready_mut(&mut self) -> Result<&mut PagedLog> {
        self.log.as_mut().ok_or(Error::InvalidState("log is not open"))
    }

    /// Number of entries the region header declared.
    pub fn entry_count(&self) -> Result<u32> {
        Ok(self.ready()?.entries)
    }

    pub fn next_free_address(&self) -> Result<u32> {
        Ok(self.ready()?.next_free_address)
    }

    pub fn cursor(&self) -> Result<LogCursor> {
        Ok(self.ready()?.cursor)
    }

    /// Pages held in the read-ahead buffer.
    pub fn pages_cached(&self) -> usize {
        self.log.as_ref().map_or(0, |log| log.cache.pages_seen())
    }

    /// Open the region `[mem_start, mem_start + mem_size)` and read its header.
    pub fn log_open(
        &mut self,
        protocol: &mut Protocol,
        mem_start: u32,
        mem_size: u32,
    ) -> Result<()> {
        if self.log.is_some() {
            return Err(Error::InvalidState("log already open"));
        }
        if mem_size == 0 || mem_start.checked_add(mem_size).is_none() {
            return Err(Error::InvalidInput(format!(
                "invalid log region 0x{mem_start:08X}+0x{mem_size:X}"
            )));
        }

        let page_size = self.page_size as usize;
        let mut log = PagedLog {
            page_size,
            framing: self.framing,
            mem_start,
            mem_size,
            first_entry: 0,
            last_entry: 0,
            entries: 0,
            next_free_address: 0,
            cursor: LogCursor {
                current: mem_start,
                next: mem_start,
                prev: mem_start,
            },
            position: Position::BeforeFirst,
            visited_entries: HashSet::new(),
            current_header: None,
            cache: PageCache::new(page_size, mem_size as usize),
        };

        let header = log.walk(protocol, mem_start, REGION_HEADER_LEN)?;
        let mut cur = ByteCursor::new(&header);
        log.last_entry = cur.read_u32_le()?;
        log.first_entry = cur.read_u32_le()?;
        log.entries = cur.read_u32_le()?;
        log.next_free_address = cur.read_u32_le()?;

        if log.entries as usize > log.cache.page_count() {
            return Err(Error::ChainCorruption {
                address: mem_start,
                reason: "entry count exceeds region capacity",
            });
        }
        if log.entries > 0 {
            log.page_index(log.first_entry)?;
            log.page_index(log.last_entry)?;
        }
        if log.next_free_address < mem_start || u64::from(log.next_free_address) > log.mem_end() {
            return Err(Error::ChainCorruption {
                address: log.next_free_address,
                reason: "next free address outside log region",
            });
        }
        log.cursor.next = log.first_entry;

        info!(
            start = format_args!("0x{:08X}", mem_start),
            size = mem_size,
            entries = log.entries,
            first = format_args!("0x{:08X}", log.first_entry),
            last = format_args!("0x{:08X}", log.last_entry),
            "Log opened"
        );
        self.log = Some(log);
        Ok(())
    }

    /// Open a region that carries no region header, ready for writes at its start.
    ///
    /// The GPS orbit area is written this way: no entries, next free address
    /// at `mem_start`, and no device traffic.
    pub fn open_for_write(&mut self, mem_start: u32, mem_size: u32) -> Result<()> {
        if self.log.is_some() {
            return Err(Error::InvalidState("log already open"));
        }
        if mem_size == 0 || mem_start.checked_add(mem_size).is_none() {
            return Err(Error::InvalidInput(format!(
                "invalid region 0x{mem_start:08X}+0x{mem_size:X}"
            )));
        }
        let page_size = self.page_size as usize;
        self.log = Some(PagedLog {
            page_size,
            framing: self.framing,
            mem_start,
            mem_size,
            first_entry: 0,
            last_entry: 0,
            entries: 0,
            next_free_address: mem_start,
            cursor: LogCursor {
                current: mem_start,
                next: 0,
                prev: mem_start,
            },
            position: Position::Exhausted,
            visited_entries: HashSet::new(),
            current_header: None,
            cache: PageCache::new(page_size, mem_size as usize),
        });
        debug!(
            start = format_args!("0x{:08X}", mem_start),
            size = mem_size,
            "Region opened for writing"
        );
        Ok(())
    }

    /// Release the read-ahead buffer and bitmap. No-op when not open.
    pub fn log_close(&mut self) {
        if let Some(log) = self.log.take() {
            debug!(
                pages_fetched = log.cache.pages_seen(),
                "Log closed"
            );
        }
    }

    /// Advance to the next entry and return its header without fetching the body.
    ///
    /// Returns `Ok(None)` once the chain is exhausted. On error the cursor is
    /// left where it was.
    pub fn next_header(&mut self, protocol: &mut Protocol) -> Result<Option<LogHeader>> {
        let log = self.ready_mut()?;
        let target = match log.position {
            Position::Exhausted => return Ok(None),
            Position::BeforeFirst if log.entries == 0 => {
                log.position = Position::Exhausted;
                return Ok(None);
            }
            Position::BeforeFirst => log.first_entry,
            Position::AtEntry if log.visited_entries.len() as u32 >= log.entries => {
                log.position = Position::Exhausted;
                return Ok(None);
            }
            Position::AtEntry => log.cursor.next,
        };

        if log.visited_entries.contains(&target) {
            return Err(Error::ChainCorruption {
                address: target,
                reason: "entry chain loops",
            });
        }
        let bytes = log.walk(protocol, target, ENTRY_HEADER_LEN)?;
        let (links, header) = LogHeader::parse(target, &bytes)?;

        let hop = log.visited_entries.len() as u32 + 1;
        if hop == log.entries && target != log.last_entry {
            return Err(Error::ChainCorruption {
                address: target,
                reason: "entry chain does not end at the log tail",
            });
        }
        if hop < log.entries && target == log.last_entry {
            return Err(Error::ChainCorruption {
                address: target,
                reason: "entry chain reached the log tail early",
            });
        }

        log.visited_entries.insert(target);
        log.cursor = LogCursor {
            current: target,
            next: links.next,
            prev: links.prev,
        };
        log.position = Position::AtEntry;
        log.current_header = Some(header.clone());
        trace!(
            address = format_args!("0x{:08X}", target),
            body_length = header.body_length,
            "Entry header"
        );
        Ok(Some(header))
    }

    /// Assemble `length` bytes by walking the page chain from `address`.
    ///
    /// Never returns a partial buffer; the cursor does not move.
    pub fn read_entry(
        &mut self,
        protocol: &mut Protocol,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.ready_mut()?.walk(protocol, address, length)
    }

    /// Read the body of the entry under the cursor.
    pub fn read_current_entry(&mut self, protocol: &mut Protocol) -> Result<LogEntry> {
        let log = self.ready_mut()?;
        let header = match (log.position, &log.current_header) {
            (Position::AtEntry, Some(header)) => header.clone(),
            _ => return Err(Error::InvalidState("no entry under the cursor")),
        };
        let body = log.walk(protocol, header.body_address, header.body_length as usize)?;
        Ok(LogEntry { header, body })
    }

    /// Write orbit data page by page starting at the region's next free address.
    ///
    /// With `include_hash`, the written stream is `len:u32 | sha256(data) | data`.
    /// A tail-length command always follows the last page, carrying that page's
    /// byte count (a full page when the length divides evenly).
    pub fn write_orbit(
        &mut self,
        protocol: &mut Protocol,
        data: &[u8],
        include_hash: bool,
    ) -> Result<OrbitWrite> {
        let log = self.ready_mut()?;
        if data.is_empty() {
            return Err(Error::InvalidInput("orbit data is empty".into()));
        }

        let stream: Cow<'_, [u8]> = if include_hash {
            let len = u32::try_from(data.len())
                .map_err(|_| Error::InvalidInput("orbit data exceeds 4 GiB".into()))?;
            let mut buf = Vec::with_capacity(ORBIT_HASH_PREFIX_LEN + data.len());
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&Sha256::digest(data));
            buf.extend_from_slice(data);
            Cow::Owned(buf)
        } else {
            Cow::Borrowed(data)
        };

        let start = log.next_free_address;
        if u64::from(start) + stream.len() as u64 > log.mem_end() {
            return Err(Error::InvalidInput(format!(
                "orbit data ({} bytes) does not fit at 0x{start:08X}",
                stream.len()
            )));
        }

        protocol.command(commands::WRITE_START, &start.to_le_bytes(), log.framing)?;

        let mut address = start;
        let mut tail = (start, 0u32);
        let mut pages = 0;
        for chunk in stream.chunks(log.page_size) {
            // Drop cached copies before the device can overwrite them.
            let offset = (address - log.mem_start) as usize;
            let first_page = offset / log.page_size;
            let last_page = (offset + chunk.len() - 1) / log.page_size;
            for index in first_page..=last_page {
                log.cache.forget(index);
            }

            let mut payload = Vec::with_capacity(8 + chunk.len());
            payload.extend_from_slice(&address.to_le_bytes());
            payload.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            payload.extend_from_slice(chunk);
            protocol.command(commands::DATA_WRITE, &payload, log.framing)?;
            trace!(address = format_args!("0x{:08X}", address), len = chunk.len(), "Wrote page");

            tail = (address, chunk.len() as u32);
            address += chunk.len() as u32;
            pages += 1;
        }

        let mut tail_payload = [0u8; 8];
        tail_payload[..4].copy_from_slice(&tail.0.to_le_bytes());
        tail_payload[4..].copy_from_slice(&tail.1.to_le_bytes());
        protocol.command(commands::DATA_TAIL_LEN, &tail_payload, log.framing)?;

        log.next_free_address = address;

        info!(
            start = format_args!("0x{:08X}", start),
            bytes = stream.len(),
            pages,
            hashed = include_hash,
            "Orbit data written"
        );
        Ok(OrbitWrite {
            start_address: start,
            bytes_written: stream.len(),
            pages,
        })
    }
}
