//! The chaptered, file-backed persistent store (§4.3): a per-handle
//! write-forward journal partitioned into fixed-count "chapters"
//! (`FILE_DATA_COUNT` objects per `.dat` file) with a companion `.tbl`
//! deletion bitmap, an in-memory reclaim cache keyed by data id, and three
//! independent file cursors (write/read/retrieve) plus a relinquish
//! cursor over the free table.
//!
//! Grounded in the teacher's `DiskManager` (`storage/disk.rs` in the
//! teacher lineage): a `File` behind a lock, explicit `seek`/`read_exact`/
//! `write_all` on raw byte records, and a stats struct alongside the data
//! path. This module drops the teacher's read-ahead/write-behind/io_uring
//! machinery — none of it is asked for by the spec, which wants strict
//! append-order writes and a direct-mapped cache instead (see DESIGN.md).

mod cache;
mod chapter;
mod table;

pub use cache::CacheEntry;
pub use table::FreeTable;

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{FileStoreAttr, FILE_DATA_COUNT, FILE_MAX_STORES};
use crate::error::{BpError, Result};
use chapter::ObjectHeader;

/// A blocking call's deadline (§5): negative milliseconds means wait
/// forever, zero means don't block at all, positive is a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    NonBlocking,
    Millis(u64),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::NonBlocking => Some(Instant::now()),
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        }
    }
}

impl From<i64> for Timeout {
    fn from(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Infinite
        } else if ms == 0 {
            Timeout::NonBlocking
        } else {
            Timeout::Millis(ms as u64)
        }
    }
}

/// An object handed back by `dequeue`/`retrieve`. `sid` is always the
/// caller-meaningful, freshly-overwritten storage id — never the
/// (untrustworthy) persisted one (§9 Open Question (b)).
#[derive(Debug, Clone)]
pub struct StoreObject {
    pub sid: u64,
    pub handle: i32,
    pub payload: Arc<Vec<u8>>,
}

/// Ambient, non-spec observability counters (§A.5), in the teacher's
/// `DiskStats`/`BufferPoolStats` idiom.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStoreStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub objects_enqueued: u64,
    pub objects_relinquished: u64,
    pub chapters_opened: u64,
    pub chapters_reclaimed: u64,
}

#[derive(Default)]
struct Cursor {
    file: Option<File>,
    file_id: Option<u32>,
    error: bool,
}

impl Cursor {
    fn close(&mut self) {
        self.file = None;
        self.file_id = None;
    }
}

struct StoreState {
    write_cursor: Cursor,
    read_cursor: Cursor,
    retrieve_cursor: Cursor,
    /// Next sid to be assigned by `enqueue` (1-based).
    write_data_id: u32,
    /// Next sid to be returned by `dequeue` (1-based).
    read_data_id: u32,
    /// Last sid returned by `retrieve`, or 0 if none yet.
    retrieve_data_id: u32,
    /// Chapter the in-memory `free_table` belongs to.
    relinquish_file_id: Option<u32>,
    free_table: FreeTable,
    data_count: u64,
    cache: cache::ReclaimCache,
    stats: FileStoreStats,
}

/// One file-store instance. Shared via `Arc` inside a `StoreHandle`;
/// internal mutable state lives behind a single `parking_lot::Mutex`
/// (§5's "coarse-grained locking... each file-store handle owns a single
/// lock protecting all of its state").
pub struct Store {
    service_id: u32,
    root: PathBuf,
    state: Mutex<StoreState>,
    condvar: Condvar,
}

fn handle_table() -> &'static Mutex<Vec<bool>> {
    static TABLE: OnceLock<Mutex<Vec<bool>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(vec![false; FILE_MAX_STORES]))
}

fn next_service_id() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An owning handle onto one store instance. Dropping it without calling
/// `destroy` leaks the handle-table slot (by design: the C original's
/// "double-destroy is fatal" assertion is the misuse Rust's ownership
/// already rules out at compile time, since `destroy` consumes `self`).
pub struct StoreHandle {
    slot: usize,
    store: Arc<Store>,
}

impl StoreHandle {
    /// Pick a free slot in the fixed-size handle table (`FILE_MAX_STORES`),
    /// assign a fresh `service_id`, and create the root directory.
    pub fn create(attr: FileStoreAttr) -> Result<Self> {
        let mut table = handle_table().lock();
        let slot = table
            .iter()
            .position(|occupied| !occupied)
            .ok_or_else(|| BpError::FailedOs("file store handle table exhausted".into()))?;
        table[slot] = true;
        drop(table);

        let service_id = next_service_id();
        fs::create_dir_all(&attr.root_path)?;
        tracing::debug!(service_id, root = %attr.root_path.display(), "file store created");

        let store = Store {
            service_id,
            root: attr.root_path,
            state: Mutex::new(StoreState {
                write_cursor: Cursor::default(),
                read_cursor: Cursor::default(),
                retrieve_cursor: Cursor::default(),
                write_data_id: 1,
                read_data_id: 1,
                retrieve_data_id: 0,
                relinquish_file_id: None,
                free_table: FreeTable::empty(),
                data_count: 0,
                cache: cache::ReclaimCache::new(attr.cache_size),
                stats: FileStoreStats::default(),
            }),
            condvar: Condvar::new(),
        };
        Ok(Self { slot, store: Arc::new(store) })
    }

    /// Close all open descriptors, flush any pending free-table, and free
    /// the handle-table slot.
    pub fn destroy(self) {
        {
            let mut st = self.store.state.lock();
            if let Some(file_id) = st.relinquish_file_id {
                if st.free_table.free_cnt > 0 {
                    let path = self.store.chapter_path(file_id, "tbl");
                    let _ = st.free_table.save(&path);
                }
            }
            st.write_cursor.close();
            st.read_cursor.close();
            st.retrieve_cursor.close();
        }
        let mut table = handle_table().lock();
        table[self.slot] = false;
        tracing::debug!(service_id = self.store.service_id, "file store destroyed");
    }

    pub fn enqueue(&self, buf1: &[u8], buf2: &[u8], timeout: impl Into<Timeout>) -> Result<u64> {
        self.store.enqueue(buf1, buf2, timeout.into())
    }

    pub fn dequeue(&self, timeout: impl Into<Timeout>) -> Result<StoreObject> {
        self.store.dequeue(timeout.into())
    }

    pub fn retrieve(&self, sid: u64, timeout: impl Into<Timeout>) -> Result<StoreObject> {
        self.store.retrieve(sid, timeout.into())
    }

    pub fn release(&self, sid: u64) -> Result<()> {
        self.store.release(sid)
    }

    pub fn relinquish(&self, sid: u64) -> Result<()> {
        self.store.relinquish(sid)
    }

    pub fn getcount(&self) -> u64 {
        self.store.state.lock().data_count
    }

    pub fn stats(&self) -> FileStoreStats {
        self.store.state.lock().stats
    }
}

impl Store {
    fn chapter_path(&self, file_id: u32, ext: &str) -> PathBuf {
        self.root.join(format!("{}_{}.{}", self.service_id, file_id, ext))
    }

    /// Ensure `cursor` is open on `file_id`'s chapter for append, opening
    /// (and, on a flagged error, re-syncing) as needed.
    fn ensure_write_chapter(&self, st: &mut StoreState, file_id: u32, offset: u32) -> Result<()> {
        if st.write_cursor.file.is_some() && st.write_cursor.file_id == Some(file_id) && !st.write_cursor.error {
            return Ok(());
        }
        let path = self.chapter_path(file_id, "dat");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| BpError::failed_store(format!("open write chapter {file_id}: {e}")))?;
        if st.write_cursor.error {
            tracing::warn!(file_id, offset, "re-syncing write cursor after prior error");
            let pos = chapter::walk_records(&mut file, offset)?;
            file.seek(SeekFrom::Start(pos))?;
        } else {
            file.seek(SeekFrom::End(0))?;
        }
        st.write_cursor = Cursor { file: Some(file), file_id: Some(file_id), error: false };
        st.stats.chapters_opened += 1;
        tracing::debug!(file_id, "write chapter opened");
        Ok(())
    }

    fn ensure_read_chapter(&self, st: &mut StoreState, file_id: u32, offset: u32) -> Result<()> {
        if st.read_cursor.file.is_some() && st.read_cursor.file_id == Some(file_id) && !st.read_cursor.error {
            return Ok(());
        }
        let path = self.chapter_path(file_id, "dat");
        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| BpError::failed_store(format!("open read chapter {file_id}: {e}")))?;
        if st.read_cursor.error {
            tracing::warn!(file_id, offset, "re-syncing read cursor after prior error");
            let pos = chapter::walk_records(&mut file, offset)?;
            file.seek(SeekFrom::Start(pos))?;
        } else if offset > 0 {
            let pos = chapter::walk_records(&mut file, offset)?;
            file.seek(SeekFrom::Start(pos))?;
        }
        st.read_cursor = Cursor { file: Some(file), file_id: Some(file_id), error: false };
        st.stats.chapters_opened += 1;
        tracing::debug!(file_id, "read chapter opened");
        Ok(())
    }

    /// Retrieve always repositions explicitly by walking from the
    /// chapter's start — simpler than, and behaviorally equivalent to,
    /// the source's "seek forward from the previous retrieve offset
    /// unless it regressed" optimization (documented in DESIGN.md).
    fn open_retrieve_chapter(&self, st: &mut StoreState, file_id: u32, offset: u32) -> Result<()> {
        let path = self.chapter_path(file_id, "dat");
        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| BpError::failed_store(format!("open retrieve chapter {file_id}: {e}")))?;
        let pos = chapter::walk_records(&mut file, offset)?;
        file.seek(SeekFrom::Start(pos))?;
        st.retrieve_cursor = Cursor { file: Some(file), file_id: Some(file_id), error: false };
        st.stats.chapters_opened += 1;
        Ok(())
    }

    fn enqueue(&self, buf1: &[u8], buf2: &[u8], _timeout: Timeout) -> Result<u64> {
        let mut st = self.state.lock();
        let data_id = st.write_data_id - 1;
        let file_id = data_id >> 8;
        let offset = data_id & 0xFF;

        self.ensure_write_chapter(&mut st, file_id, offset)?;

        let payload_len = buf1.len() + buf2.len();
        let object_size = (chapter::OBJECT_HDR_LEN + payload_len) as u32;
        let hdr = ObjectHeader { handle: self.service_id as i32, sid: chapter::SID_VACANT, size: payload_len as u32 };

        let mut record = Vec::with_capacity(4 + object_size as usize);
        record.extend_from_slice(&object_size.to_le_bytes());
        record.extend_from_slice(&hdr.encode());
        record.extend_from_slice(buf1);
        record.extend_from_slice(buf2);

        let write_result = {
            use std::io::Write;
            let file = st.write_cursor.file.as_mut().expect("write cursor just ensured open");
            file.write_all(&record).and_then(|_| file.flush())
        };

        match write_result {
            Ok(()) => {
                let chapter_now_full = (data_id + 1) % FILE_DATA_COUNT == 0;
                st.write_data_id += 1;
                st.data_count += 1;
                st.stats.objects_enqueued += 1;
                st.stats.bytes_written += record.len() as u64;
                if chapter_now_full {
                    st.write_cursor.close();
                }
                self.condvar.notify_all();
                Ok(data_id as u64 + 1)
            }
            Err(e) => {
                st.write_cursor.error = true;
                st.write_cursor.file = None;
                Err(BpError::failed_store(format!("enqueue write failed: {e}")))
            }
        }
    }

    fn dequeue(&self, timeout: Timeout) -> Result<StoreObject> {
        let deadline = timeout.deadline();
        let mut st = self.state.lock();
        loop {
            if st.read_data_id != st.write_data_id {
                break;
            }
            match deadline {
                None => self.condvar.wait(&mut st),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(BpError::Timeout);
                    }
                    self.condvar.wait_for(&mut st, d - now);
                    if st.read_data_id == st.write_data_id && Instant::now() >= d {
                        return Err(BpError::Timeout);
                    }
                }
            }
        }

        let data_id = st.read_data_id - 1;
        let file_id = data_id >> 8;
        let offset = data_id & 0xFF;
        self.ensure_read_chapter(&mut st, file_id, offset)?;

        let read_result = {
            let file = st.read_cursor.file.as_mut().expect("read cursor just ensured open");
            chapter::read_record(file)
        };
        let (_, payload) = match read_result {
            Ok(v) => v,
            Err(e) => {
                st.read_cursor.error = true;
                st.read_cursor.file = None;
                return Err(e);
            }
        };

        let sid = st.read_data_id as u64;
        let chapter_now_done = (data_id + 1) % FILE_DATA_COUNT == 0;
        let payload = Arc::new(payload);
        st.stats.bytes_read += payload.len() as u64;
        self.cache_insert_waiting(&mut st, data_id, payload.clone(), deadline)?;
        st.read_data_id += 1;
        if chapter_now_done {
            st.read_cursor.close();
        }
        Ok(StoreObject { sid, handle: self.service_id as i32, payload })
    }

    fn retrieve(&self, sid: u64, timeout: Timeout) -> Result<StoreObject> {
        let deadline = timeout.deadline();
        let mut st = self.state.lock();
        let data_id = (sid - 1) as u32;

        if let Some(entry) = st.cache.get(data_id) {
            let payload = entry.payload.clone();
            let idx = st.cache.index(data_id);
            if let Some(e) = st.cache.entry_at_mut(idx) {
                e.locked = true;
            }
            st.retrieve_data_id = data_id;
            return Ok(StoreObject { sid, handle: self.service_id as i32, payload });
        }

        let file_id = data_id >> 8;
        let offset = data_id & 0xFF;
        self.open_retrieve_chapter(&mut st, file_id, offset)?;

        let read_result = {
            let file = st.retrieve_cursor.file.as_mut().expect("retrieve cursor just opened");
            chapter::read_record(file)
        };
        let (_, payload) = match read_result {
            Ok(v) => v,
            Err(e) => {
                st.retrieve_cursor.error = true;
                st.retrieve_cursor.file = None;
                return Err(e);
            }
        };

        let payload = Arc::new(payload);
        st.stats.bytes_read += payload.len() as u64;
        self.cache_insert_waiting(&mut st, data_id, payload.clone(), deadline)?;
        st.retrieve_data_id = data_id;
        Ok(StoreObject { sid, handle: self.service_id as i32, payload })
    }

    /// Insert into the reclaim cache, locked, waiting out any currently
    /// locked occupant of the target slot (§5's second suspension point).
    fn cache_insert_waiting(
        &self,
        st: &mut parking_lot::MutexGuard<'_, StoreState>,
        data_id: u32,
        payload: Arc<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            let idx = st.cache.index(data_id);
            let occupied_and_locked = matches!(st.cache.entry_at(idx), Some(e) if e.locked);
            if !occupied_and_locked {
                st.cache.insert(data_id, payload, true);
                return Ok(());
            }
            match deadline {
                None => self.condvar.wait(st),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(BpError::Timeout);
                    }
                    self.condvar.wait_for(st, d - now);
                    if Instant::now() >= d {
                        let still_locked = matches!(st.cache.entry_at(idx), Some(e) if e.locked);
                        if still_locked {
                            return Err(BpError::Timeout);
                        }
                    }
                }
            }
        }
    }

    fn release(&self, sid: u64) -> Result<()> {
        let mut st = self.state.lock();
        let data_id = (sid - 1) as u32;
        let idx = st.cache.index(data_id);
        match st.cache.entry_at_mut(idx) {
            Some(e) if e.data_id == data_id => {
                e.locked = false;
                self.condvar.notify_all();
                Ok(())
            }
            _ => Err(BpError::failed_store("release: no matching cache entry")),
        }
    }

    fn relinquish(&self, sid: u64) -> Result<()> {
        let mut st = self.state.lock();
        let data_id = (sid - 1) as u32;
        let file_id = data_id >> 8;
        let offset = (data_id & 0xFF) as usize;

        st.cache.clear_if_matches(data_id);

        if st.relinquish_file_id != Some(file_id) {
            if let Some(prev_file_id) = st.relinquish_file_id {
                if st.free_table.free_cnt > 0 {
                    let path = self.chapter_path(prev_file_id, "tbl");
                    st.free_table.save(&path)?;
                }
            }
            let path = self.chapter_path(file_id, "tbl");
            st.free_table = FreeTable::load(&path)?;
            st.relinquish_file_id = Some(file_id);
        }

        if st.free_table.mark_freed(offset) {
            st.data_count = st.data_count.saturating_sub(1);
            st.stats.objects_relinquished += 1;
        }

        if st.free_table.is_full() {
            let dat_path = self.chapter_path(file_id, "dat");
            let tbl_path = self.chapter_path(file_id, "tbl");
            let _ = fs::remove_file(&dat_path);
            let _ = fs::remove_file(&tbl_path);
            st.free_table = FreeTable::empty();
            st.relinquish_file_id = None;
            st.stats.chapters_reclaimed += 1;
            tracing::debug!(file_id, "chapter fully reclaimed, .dat/.tbl deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_in(dir: &tempfile::TempDir) -> StoreHandle {
        StoreHandle::create(FileStoreAttr { root_path: dir.path().to_path_buf(), cache_size: 64 }).unwrap()
    }

    #[test]
    fn s1_enqueue_dequeue_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);

        let sid = h.enqueue(b"AB", b"CD", -1i64).unwrap();
        assert_eq!(sid, 1);

        let obj = h.dequeue(0i64).unwrap();
        assert_eq!(obj.sid, 1);
        assert_eq!(obj.payload.as_slice(), b"ABCD");

        h.release(1).unwrap();
        h.destroy();
    }

    #[test]
    fn s2_chapter_boundary_and_full_reclamation() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);

        for i in 0..256u8 {
            h.enqueue(&[i], b"", -1i64).unwrap();
        }
        let entries_after_fill: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(!entries_after_fill.is_empty(), "chapter .dat file should exist while objects are live");

        for sid in 1..=256u64 {
            h.relinquish(sid).unwrap();
        }
        assert_eq!(h.getcount(), 0);

        // every *_0.dat / *_0.tbl under this service id must be gone
        let mut remaining = fs::read_dir(dir.path()).unwrap();
        assert!(remaining.next().is_none(), "chapter files should be fully reclaimed");
        h.destroy();
    }

    #[test]
    fn s3_out_of_order_retrieve_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);

        h.enqueue(b"one", b"", -1i64).unwrap();
        h.enqueue(b"two", b"", -1i64).unwrap();
        h.enqueue(b"three", b"", -1i64).unwrap();

        let o3 = h.retrieve(3, -1i64).unwrap();
        assert_eq!(o3.payload.as_slice(), b"three");
        let o1 = h.retrieve(1, -1i64).unwrap();
        assert_eq!(o1.payload.as_slice(), b"one");
        let o2 = h.retrieve(2, -1i64).unwrap();
        assert_eq!(o2.payload.as_slice(), b"two");

        // repeat without relinquish: same bytes, no I/O error
        let o3_again = h.retrieve(3, -1i64).unwrap();
        assert_eq!(o3_again.payload.as_slice(), b"three");
        h.destroy();
    }

    #[test]
    fn store_order_matches_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);
        let sids: Vec<u64> = (0..10u8).map(|i| h.enqueue(&[i], b"", -1i64).unwrap()).collect();
        assert_eq!(sids, (1..=10).collect::<Vec<_>>());
        for expected_sid in sids {
            let obj = h.dequeue(0i64).unwrap();
            assert_eq!(obj.sid, expected_sid);
        }
        h.destroy();
    }

    #[test]
    fn dequeue_times_out_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);
        let err = h.dequeue(0i64).unwrap_err();
        assert!(matches!(err, BpError::Timeout));
        h.destroy();
    }

    #[test]
    fn release_mismatch_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);
        h.enqueue(b"x", b"", -1i64).unwrap();
        let err = h.release(999).unwrap_err();
        assert!(matches!(err, BpError::FailedStore(_)));
        h.destroy();
    }

    #[test]
    fn getcount_tracks_enqueue_and_relinquish() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle_in(&dir);
        h.enqueue(b"a", b"", -1i64).unwrap();
        h.enqueue(b"b", b"", -1i64).unwrap();
        assert_eq!(h.getcount(), 2);
        h.relinquish(1).unwrap();
        assert_eq!(h.getcount(), 1);
        h.destroy();
    }
}
