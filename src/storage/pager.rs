//! The pager: page I/O, page cache, allocator and transaction shadow buffer
//! (spec §4.1).
//!
//! Every byte read or written to disk passes through here. Durability beyond
//! single-process rollback is an explicit non-goal (spec §1), so there is no
//! write-ahead log: `commit_tx` simply writes dirty pages to the file, and
//! `rollback_tx` restores cached pages from the shadow copies taken on first
//! write.

use log::{debug, error, trace};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::page::{PageBuf, PAGE_SIZE};

/// Resident-page cache cap. Spec §4.1 requires cache misses that would
/// exceed a hard cap to be fatal; we relax that (as the spec explicitly
/// permits) to LRU eviction of clean, unshadowed pages, and only fall back
/// to the fatal path when every resident page is pinned by an open
/// transaction.
const CACHE_CAPACITY: usize = 256;

/// A page is created lazily on first `get_page`/`allocate_page` and never
/// destroyed until the file closes (spec §3 "Lifecycles").
pub struct Pager {
    file: File,

    /// Number of pages actually present in the backing file.
    file_length_pages: u32,

    /// Allocator high-water mark: number of pages known to the pager,
    /// including ones allocated in memory but not yet flushed.
    num_pages: u32,

    cache: HashMap<u32, PageBuf>,
    /// Recency queue for eviction; most-recently-used at the back.
    recency: VecDeque<u32>,

    /// Pages mutated since the last flush/commit that still need a disk
    /// write. Populated by `flush` while a transaction is open (so commit
    /// can replay them); written through immediately otherwise.
    dirty: HashSet<u32>,

    transaction_active: bool,
    /// Pre-mutation bytes of every page touched for the first time inside
    /// the active transaction (spec's "shadow copy").
    shadow: HashMap<u32, PageBuf>,
    /// Pages allocated during the active transaction; rolled back by
    /// discarding the buffer and restoring the allocator high-water mark,
    /// per spec §9 "Rollback scope".
    allocated_in_tx: HashSet<u32>,
    num_pages_at_tx_start: u32,

    /// Count of `read_page`/`write_page` calls, i.e. page accesses. Exists
    /// so tests can observe that an indexed lookup costs O(log n) page
    /// accesses against a full scan's O(n) (spec §8 scenario 4); not used
    /// by any production code path.
    access_count: u64,
}

/// Logs a fatal I/O condition and aborts the process, per spec §7's "Fatal
/// errors: I/O failures, partial writes, inability to acquire a page. Abort
/// the process with a diagnostic."
pub fn fatal(context: &str, err: &dyn std::fmt::Display) -> ! {
    error!("fatal pager error ({context}): {err}");
    std::process::exit(1);
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len % PAGE_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "page file length is not a multiple of the page size",
            ));
        }
        let file_length_pages = (file_len / PAGE_SIZE as u64) as u32;
        Ok(Pager {
            file,
            file_length_pages,
            num_pages: file_length_pages,
            cache: HashMap::new(),
            recency: VecDeque::new(),
            dirty: HashSet::new(),
            transaction_active: false,
            shadow: HashMap::new(),
            allocated_in_tx: HashSet::new(),
            num_pages_at_tx_start: 0,
            access_count: 0,
        })
    }

    /// Number of `read_page`/`write_page` calls so far. See `access_count`.
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn file_length_pages(&self) -> u32 {
        self.file_length_pages
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Returns the page number that will be handed out next, and grows the
    /// allocator high-water mark. The backing buffer is materialized lazily
    /// by the next `get_page`/`write_page` call (spec §3 "Lifecycles").
    pub fn allocate_page(&mut self) -> u32 {
        let n = self.num_pages;
        self.num_pages += 1;
        if self.transaction_active {
            self.allocated_in_tx.insert(n);
        }
        trace!("allocated page {n}");
        n
    }

    /// Read-only access to a page. Never shadows.
    pub fn read_page(&mut self, n: u32) -> &PageBuf {
        self.ensure_loaded(n);
        self.touch(n);
        self.cache.get(&n).unwrap()
    }

    /// Writable access to a page. Shadows the pre-mutation bytes on the
    /// first write inside an active transaction.
    pub fn write_page(&mut self, n: u32) -> &mut PageBuf {
        self.ensure_loaded(n);
        self.touch(n);
        if self.transaction_active && !self.allocated_in_tx.contains(&n) && !self.shadow.contains_key(&n) {
            let snapshot = *self.cache.get(&n).unwrap();
            self.shadow.insert(n, snapshot);
        }
        self.dirty.insert(n);
        self.cache.get_mut(&n).unwrap()
    }

    /// Persists a page. Outside a transaction this hits disk immediately
    /// (single-writer, no WAL: a crash between autocommit-style operations
    /// simply loses the last op, which is within the stated non-goals).
    /// Inside a transaction the write is deferred to `commit_tx`.
    pub fn flush(&mut self, n: u32) {
        if self.transaction_active {
            // Already tracked as dirty by `write_page`; replay at commit.
            return;
        }
        let Some(&data) = self.cache.get(&n) else { return };
        self.write_page_raw(n, &data);
        self.dirty.remove(&n);
    }

    fn write_page_raw(&mut self, n: u32, data: &PageBuf) {
        let offset = n as u64 * PAGE_SIZE as u64;
        if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
            fatal("seek", &e);
        }
        if let Err(e) = self.file.write_all(data) {
            fatal("partial write", &e);
        }
        if let Err(e) = self.file.flush() {
            fatal("flush", &e);
        }
        if n >= self.file_length_pages {
            self.file_length_pages = n + 1;
        }
    }

    fn ensure_loaded(&mut self, n: u32) {
        if self.cache.contains_key(&n) {
            return;
        }
        self.make_room();
        let mut buf = [0u8; PAGE_SIZE];
        if n < self.file_length_pages {
            let offset = n as u64 * PAGE_SIZE as u64;
            if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
                fatal("seek", &e);
            }
            if let Err(e) = self.file.read_exact(&mut buf) {
                fatal("short read", &e);
            }
        }
        if n >= self.num_pages {
            self.num_pages = n + 1;
        }
        self.cache.insert(n, buf);
    }

    fn touch(&mut self, n: u32) {
        self.access_count += 1;
        self.recency.retain(|&p| p != n);
        self.recency.push_back(n);
    }

    /// Evicts the least-recently-used clean, unshadowed page if the cache
    /// is at capacity. A cache at capacity with every resident page pinned
    /// (dirty or shadowed) cannot make room; per spec that is fatal.
    fn make_room(&mut self) {
        if self.cache.len() < CACHE_CAPACITY {
            return;
        }
        for i in 0..self.recency.len() {
            let candidate = self.recency[i];
            if !self.dirty.contains(&candidate) && !self.shadow.contains_key(&candidate) {
                self.cache.remove(&candidate);
                self.recency.remove(i);
                debug!("evicted page {candidate} from cache");
                return;
            }
        }
        fatal(
            "page cache exhausted",
            &format!("{CACHE_CAPACITY} pages resident and pinned, cannot evict"),
        );
    }

    pub fn begin_tx(&mut self) {
        self.transaction_active = true;
        self.shadow.clear();
        self.allocated_in_tx.clear();
        self.dirty.clear();
        self.num_pages_at_tx_start = self.num_pages;
    }

    pub fn commit_tx(&mut self) {
        let dirty: Vec<u32> = self.dirty.iter().copied().collect();
        for n in dirty {
            if let Some(&data) = self.cache.get(&n) {
                self.write_page_raw(n, &data);
            }
        }
        self.dirty.clear();
        self.shadow.clear();
        self.allocated_in_tx.clear();
        self.transaction_active = false;
    }

    pub fn rollback_tx(&mut self) {
        for (n, bytes) in self.shadow.drain() {
            self.cache.insert(n, bytes);
        }
        for n in self.allocated_in_tx.drain() {
            self.cache.remove(&n);
            self.recency.retain(|&p| p != n);
        }
        self.num_pages = self.num_pages_at_tx_start;
        self.dirty.clear();
        self.transaction_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{set_parent, PAGE_SIZE};

    fn tmp_path() -> std::path::PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        std::mem::forget(dir);
        path
    }

    #[test]
    fn allocate_and_roundtrip() {
        let mut pager = Pager::open(tmp_path()).unwrap();
        let n = pager.allocate_page();
        assert_eq!(n, 0);
        set_parent(pager.write_page(n), 7);
        pager.flush(n);
        assert_eq!(crate::storage::page::get_parent(pager.read_page(n)), 7);
    }

    #[test]
    fn rollback_restores_pre_tx_bytes() {
        let path = tmp_path();
        let mut pager = Pager::open(&path).unwrap();
        let n = pager.allocate_page();
        set_parent(pager.write_page(n), 1);
        pager.flush(n);

        pager.begin_tx();
        set_parent(pager.write_page(n), 99);
        pager.flush(n);
        pager.rollback_tx();

        assert_eq!(crate::storage::page::get_parent(pager.read_page(n)), 1);
    }

    #[test]
    fn rollback_discards_pages_allocated_in_tx() {
        let mut pager = Pager::open(tmp_path()).unwrap();
        pager.begin_tx();
        let n = pager.allocate_page();
        set_parent(pager.write_page(n), 5);
        pager.rollback_tx();
        assert_eq!(pager.num_pages(), 0);
    }

    #[test]
    fn commit_persists_across_reopen() {
        let path = tmp_path();
        {
            let mut pager = Pager::open(&path).unwrap();
            pager.begin_tx();
            let n = pager.allocate_page();
            set_parent(pager.write_page(n), 42);
            pager.flush(n);
            pager.commit_tx();
        }
        let mut reopened = Pager::open(&path).unwrap();
        assert_eq!(reopened.num_pages(), 1);
        assert_eq!(crate::storage::page::get_parent(reopened.read_page(0)), 42);
    }

    #[test]
    fn rollback_leaves_file_byte_identical() {
        let path = tmp_path();
        let mut pager = Pager::open(&path).unwrap();
        let n = pager.allocate_page();
        set_parent(pager.write_page(n), 3);
        pager.flush(n);
        drop(pager);
        let before = std::fs::read(&path).unwrap();

        let mut pager = Pager::open(&path).unwrap();
        pager.begin_tx();
        let n2 = pager.allocate_page();
        set_parent(pager.write_page(n2), 123);
        set_parent(pager.write_page(0), 77);
        pager.flush(0);
        pager.rollback_tx();
        drop(pager);

        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }
}
