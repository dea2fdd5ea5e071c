//! Pages fetched during one open log session.

/// Chain pointers the device reports alongside a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PageLinks {
    pub next: u32,
    pub prev: u32,
}

/// One bit per page of the log region.
#[derive(Debug, Clone)]
pub(crate) struct SeenBitmap {
    words: Vec<u64>,
    len: usize,
}

impl SeenBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Read-ahead buffer covering the whole region plus the seen bitmap.
///
/// A page may be cached with fewer bytes than a full page when the walk
/// that fetched it only needed a prefix; `fill` tracks how much is valid.
#[derive(Debug)]
pub(crate) struct PageCache {
    page_size: usize,
    seen: SeenBitmap,
    fill: Vec<usize>,
    links: Vec<PageLinks>,
    buffer: Vec<u8>,
}

impl PageCache {
    pub fn new(page_size: usize, region_size: usize) -> Self {
        let pages = region_size.div_ceil(page_size);
        Self {
            page_size,
            seen: SeenBitmap::new(pages),
            fill: vec![0; pages],
            links: vec![PageLinks::default(); pages],
            buffer: vec![0; pages * page_size],
        }
    }

    pub fn page_count(&self) -> usize {
        self.seen.len()
    }

    pub fn pages_seen(&self) -> usize {
        self.seen.count()
    }

    /// Links of a cached page, if at least `len` bytes of it are held.
    pub fn lookup(&self, index: usize, len: usize) -> Option<PageLinks> {
        (self.seen.get(index) && self.fill[index] >= len).then(|| self.links[index])
    }

    /// First `len` bytes of a cached page.
    pub fn data(&self, index: usize, len: usize) -> &[u8] {
        let start = index * self.page_size;
        &self.buffer[start..start + len]
    }

    /// Record a fetched page. `data` never exceeds the page size.
    pub fn store(&mut self, index: usize, links: PageLinks, data: &[u8]) {
        let start = index * self.page_size;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.fill[index] = self.fill[index].max(data.len());
        self.links[index] = links;
        self.seen.set(index);
    }

    /// Drop a page so the next access fetches it again.
    pub fn forget(&mut self, index: usize) {
        if index < self.fill.len() {
            self.seen.clear(index);
            self.fill[index] = 0;
        }
    }
}
