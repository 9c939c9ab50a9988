// # FastStorage
//
// A memory-mapped append-log key-value store with an in-memory
// open-addressed hash index (SPEC_FULL.md §4.2). The log is append-only;
// deletion is logical (an index tombstone). The index is rebuilt from the
// log on every `open()` rather than persisted.
//
// Used for two purposes by the watchpoint engine: a spill target for
// change values too large to inline into a `ChangeEvent`, and the
// secondary persistence namespace for canonical JSONL change records.
// Both uses share one instance, distinguished only by key prefix.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Advice, MmapMut, MmapOptions};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::index::HashIndex;
use crate::storage::record::{RecordHeader, StoreHeader, HEADER_SIZE, RECORD_HEADER_SIZE};

/// Counters reported through `get_stats` for one FastStorage instance.
#[derive(Debug, Clone, Default)]
pub struct FastStorageStats {
    pub entry_count: u64,
    pub write_count: u64,
    pub read_count: u64,
    pub file_size: u64,
    pub next_free_offset: u64,
}

struct Inner {
    file: File,
    mmap: MmapMut,
    index: HashIndex,
    file_size: u64,
    next_free_offset: AtomicU64,
    entry_count: AtomicU64,
    write_count: AtomicU64,
    read_count: AtomicU64,
    dirty: bool,
}

/// An mmap'd append-log key-value store, guarded by a readers-writer lock
/// (writes exclusive, reads shared, per SPEC_FULL.md §5).
pub struct FastStorage {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl FastStorage {
    /// Opens (creating if absent) the store at `path` with at least
    /// `capacity` bytes of backing file, and rebuilds the in-memory index
    /// (initially sized to `index_capacity` slots, rounded up to the next
    /// power of two) by scanning the record log from `HEADER_SIZE`.
    pub fn open(path: impl AsRef<Path>, capacity: u64, index_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (file, mut mmap, file_size) = open_mapping(&path, capacity)?;

        let header = StoreHeader::decode(&mmap[0..HEADER_SIZE]);
        let mut index = HashIndex::with_capacity(index_capacity);
        let next_free_offset;
        let mut entry_count = 0u64;
        let mut write_count = 0u64;
        let mut read_count = 0u64;

        match header {
            Some(h) if h.next_free_offset >= HEADER_SIZE as u64 && h.next_free_offset <= file_size => {
                let valid_end = rebuild_index(&mmap, HEADER_SIZE as u64, file_size, &mut index);
                if valid_end != h.next_free_offset {
                    warn!(
                        recorded = h.next_free_offset,
                        scanned = valid_end,
                        "faststorage: header next_free_offset disagrees with scan, truncating to last valid record"
                    );
                }
                next_free_offset = valid_end;
                entry_count = index.len() as u64;
                write_count = h.write_count;
                read_count = h.read_count;
            }
            Some(_) | None => {
                debug!(path = %path.display(), "faststorage: no valid header found, initializing fresh store");
                next_free_offset = HEADER_SIZE as u64;
            }
        }

        write_header(
            &mut mmap,
            next_free_offset,
            entry_count,
            write_count,
            read_count,
        );

        Ok(Self {
            inner: RwLock::new(Inner {
                file,
                mmap,
                index,
                file_size,
                next_free_offset: AtomicU64::new(next_free_offset),
                entry_count: AtomicU64::new(entry_count),
                write_count: AtomicU64::new(write_count),
                read_count: AtomicU64::new(read_count),
                dirty: true,
            }),
            path,
        })
    }

    /// Appends `(key, value)`, overwriting any prior live record for `key`
    /// in the index (the old physical bytes remain on disk but are no
    /// longer reachable).
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        let needed = RECORD_HEADER_SIZE as u64 + key.len() as u64 + value.len() as u64;
        let offset = inner.next_free_offset.load(Ordering::Relaxed);
        if offset + needed > inner.file_size {
            return Err(EngineError::Full {
                needed,
                available: inner.file_size.saturating_sub(offset),
            });
        }

        let checksum = crate::storage::checksum::hardware_crc32c(value);
        let rh = RecordHeader::new(key.len() as u32, value.len() as u64, checksum);
        let off = offset as usize;
        inner.mmap[off..off + RECORD_HEADER_SIZE].copy_from_slice(&rh.encode());
        let key_start = off + RECORD_HEADER_SIZE;
        inner.mmap[key_start..key_start + key.len()].copy_from_slice(key);
        let val_start = key_start + key.len();
        inner.mmap[val_start..val_start + value.len()].copy_from_slice(value);

        let existed = inner.index.contains(key);
        inner.index.insert(key, offset);
        if !existed {
            inner.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        inner.write_count.fetch_add(1, Ordering::Relaxed);
        inner
            .next_free_offset
            .store(offset + needed, Ordering::Relaxed);
        inner.dirty = true;
        Ok(())
    }

    /// Looks up `key` and returns a zero-copy borrow of its value bytes.
    pub fn read(&self, key: &[u8]) -> Result<impl std::ops::Deref<Target = [u8]> + '_> {
        let guard = self.inner.read();
        let offset = guard
            .index
            .get(key)
            .ok_or_else(|| EngineError::NotFound(format!("key {:?}", String::from_utf8_lossy(key))))?;
        guard.read_count.fetch_add(1, Ordering::Relaxed);

        RwLockReadGuard::try_map(guard, |inner| record_value_slice(&inner.mmap, offset))
            .map_err(|_| EngineError::Corrupt("index pointed at an unreadable record".into()))
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.inner.read().index.contains(key)
    }

    /// Number of live (non-tombstoned) entries.
    pub fn size(&self) -> u64 {
        self.inner.read().entry_count.load(Ordering::Relaxed)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.index.remove(key) {
            inner.entry_count.fetch_sub(1, Ordering::Relaxed);
            inner.dirty = true;
            Ok(())
        } else {
            Err(EngineError::NotFound(format!(
                "key {:?}",
                String::from_utf8_lossy(key)
            )))
        }
    }

    /// Persists the header if dirty and issues an asynchronous msync.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.dirty {
            return Ok(());
        }
        let next_free_offset = inner.next_free_offset.load(Ordering::Relaxed);
        let entry_count = inner.entry_count.load(Ordering::Relaxed);
        let write_count = inner.write_count.load(Ordering::Relaxed);
        let read_count = inner.read_count.load(Ordering::Relaxed);
        write_header(
            &mut inner.mmap,
            next_free_offset,
            entry_count,
            write_count,
            read_count,
        );
        inner.mmap.flush_async()?;
        inner.dirty = false;
        Ok(())
    }

    pub fn stats(&self) -> FastStorageStats {
        let inner = self.inner.read();
        FastStorageStats {
            entry_count: inner.entry_count.load(Ordering::Relaxed),
            write_count: inner.write_count.load(Ordering::Relaxed),
            read_count: inner.read_count.load(Ordering::Relaxed),
            file_size: inner.file_size,
            next_free_offset: inner.next_free_offset.load(Ordering::Relaxed),
        }
    }

    /// Rewrites the log with only the currently-live records, in place,
    /// then replaces the backing file's tail with zeroed free space.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let live: Vec<(Vec<u8>, u64)> = inner
            .index
            .iter()
            .map(|(k, off)| (k.to_vec(), off))
            .collect();

        let mut pairs = Vec::with_capacity(live.len());
        for (key, offset) in live {
            let value = record_value_slice(&inner.mmap, offset)
                .ok_or_else(|| EngineError::Corrupt("compact: dangling index entry".into()))?
                .to_vec();
            pairs.push((key, value));
        }

        let mut new_index = HashIndex::with_capacity(inner.index.capacity());
        let mut cursor = HEADER_SIZE as u64;
        let mut entry_count = 0u64;
        for (key, value) in &pairs {
            let needed = RECORD_HEADER_SIZE as u64 + key.len() as u64 + value.len() as u64;
            if cursor + needed > inner.file_size {
                return Err(EngineError::Full {
                    needed,
                    available: inner.file_size.saturating_sub(cursor),
                });
            }
            let checksum = crate::storage::checksum::hardware_crc32c(value);
            let rh = RecordHeader::new(key.len() as u32, value.len() as u64, checksum);
            let off = cursor as usize;
            inner.mmap[off..off + RECORD_HEADER_SIZE].copy_from_slice(&rh.encode());
            let key_start = off + RECORD_HEADER_SIZE;
            inner.mmap[key_start..key_start + key.len()].copy_from_slice(key);
            let val_start = key_start + key.len();
            inner.mmap[val_start..val_start + value.len()].copy_from_slice(value);
            new_index.insert(key, cursor);
            cursor += needed;
            entry_count += 1;
        }

        let tail_start = cursor as usize;
        let tail_end = inner.file_size as usize;
        if tail_start < tail_end {
            inner.mmap[tail_start..tail_end].fill(0);
        }

        inner.index = new_index;
        inner.entry_count.store(entry_count, Ordering::Relaxed);
        inner.next_free_offset.store(cursor, Ordering::Relaxed);
        inner.dirty = true;
        debug!(entries = entry_count, "faststorage: compacted in place");
        Ok(())
    }

    /// Flushes and unmaps. Consumes the store; further use is a compile
    /// error, matching the idempotent-on-the-API-surface `close()` that
    /// the `Engine` wraps (see `api.rs`).
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_mapping(path: &Path, capacity: u64) -> Result<(File, MmapMut, u64)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let metadata = file.metadata()?;
    let mut file_size = metadata.len();
    if file_size < capacity {
        file.set_len(capacity)?;
        file_size = capacity;
    }

    let mut mmap = unsafe { MmapOptions::new().len(file_size as usize).map_mut(&file)? };
    let _ = mmap.advise(Advice::WillNeed);
    let _ = mmap.advise(Advice::Sequential);
    let _ = mmap.lock();
    Ok((file, mmap, file_size))
}

fn write_header(
    mmap: &mut MmapMut,
    next_free_offset: u64,
    entry_count: u64,
    write_count: u64,
    read_count: u64,
) {
    let header = StoreHeader {
        magic: crate::storage::record::STORE_MAGIC,
        next_free_offset,
        entry_count,
        write_count,
        read_count,
    };
    mmap[0..HEADER_SIZE].copy_from_slice(&header.encode());
}

/// Scans records from `start` to `limit`, inserting `(key, offset)` into
/// `index` for each valid one, and returns the offset one past the last
/// valid record (i.e. the prefix bound, §8 "Crash recovery").
fn rebuild_index(mmap: &MmapMut, start: u64, limit: u64, index: &mut HashIndex) -> u64 {
    let mut offset = start;
    let mut scanned = 0u64;
    loop {
        if offset + RECORD_HEADER_SIZE as u64 > limit {
            break;
        }
        let off = offset as usize;
        let rh = match RecordHeader::decode(&mmap[off..off + RECORD_HEADER_SIZE]) {
            Some(rh) => rh,
            None => break,
        };
        let total = rh.total_len();
        if offset + total > limit {
            break;
        }
        let key_start = off + RECORD_HEADER_SIZE;
        let key_end = key_start + rh.key_len as usize;
        let val_end = key_end + rh.value_len as usize;
        let value = &mmap[key_end..val_end];
        if crate::storage::checksum::hardware_crc32c(value) != rh.checksum {
            warn!(offset, "faststorage: checksum mismatch during rebuild, truncating");
            break;
        }
        index.insert(&mmap[key_start..key_end], offset);
        offset += total;
        scanned += 1;
    }
    debug!(records = scanned, valid_end = offset, "faststorage: rebuild scan complete");
    offset
}

fn record_value_slice(mmap: &MmapMut, offset: u64) -> Option<&[u8]> {
    let off = offset as usize;
    if off + RECORD_HEADER_SIZE > mmap.len() {
        return None;
    }
    let rh = RecordHeader::decode(&mmap[off..off + RECORD_HEADER_SIZE])?;
    let key_end = off + RECORD_HEADER_SIZE + rh.key_len as usize;
    let val_end = key_end + rh.value_len as usize;
    if val_end > mmap.len() {
        return None;
    }
    Some(&mmap[key_end..val_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_overwrite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.db");
        let store = FastStorage::open(&path, 1 << 20, 16).unwrap();

        store.write(b"k1", b"v1").unwrap();
        store.write(b"k2", b"vv2").unwrap();
        store.write(b"k1", b"V1!").unwrap();

        assert_eq!(&*store.read(b"k1").unwrap(), b"V1!");
        assert_eq!(&*store.read(b"k2").unwrap(), b"vv2");
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn reopen_preserves_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.db");
        {
            let store = FastStorage::open(&path, 1 << 20, 16).unwrap();
            store.write(b"a", b"1").unwrap();
            store.write(b"b", b"22").unwrap();
            store.flush().unwrap();
        }
        let store = FastStorage::open(&path, 1 << 20, 16).unwrap();
        assert_eq!(&*store.read(b"a").unwrap(), b"1");
        assert_eq!(&*store.read(b"b").unwrap(), b"22");
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn read_of_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FastStorage::open(dir.path().join("fs.db"), 1 << 16, 16).unwrap();
        assert!(matches!(store.read(b"nope"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn write_past_capacity_fails_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = FastStorage::open(dir.path().join("fs.db"), HEADER_SIZE as u64 + 32, 16).unwrap();
        let big = vec![0u8; 1024];
        assert!(matches!(
            store.write(b"k", &big),
            Err(EngineError::Full { .. })
        ));
    }

    #[test]
    fn delete_removes_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = FastStorage::open(dir.path().join("fs.db"), 1 << 16, 16).unwrap();
        store.write(b"k", b"v").unwrap();
        assert!(store.exists(b"k"));
        store.delete(b"k").unwrap();
        assert!(!store.exists(b"k"));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn crash_recovery_truncates_at_last_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.db");
        {
            let store = FastStorage::open(&path, 1 << 16, 16).unwrap();
            store.write(b"a", b"hello").unwrap();
            store.write(b"b", b"world").unwrap();
            store.flush().unwrap();
            // No flush after this write: simulates the header lagging
            // behind the log (dirty shutdown), relying on the rebuild scan.
            store.write(b"c", b"!").unwrap();
        }
        let store = FastStorage::open(&path, 1 << 16, 16).unwrap();
        assert_eq!(&*store.read(b"a").unwrap(), b"hello");
        assert_eq!(&*store.read(b"b").unwrap(), b"world");
        assert_eq!(&*store.read(b"c").unwrap(), b"!");
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn compact_drops_overwritten_physical_records_but_keeps_live_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FastStorage::open(dir.path().join("fs.db"), 1 << 16, 16).unwrap();
        store.write(b"k1", b"v1").unwrap();
        store.write(b"k1", b"v1-updated").unwrap();
        store.write(b"k2", b"v2").unwrap();
        store.compact().unwrap();
        assert_eq!(&*store.read(b"k1").unwrap(), b"v1-updated");
        assert_eq!(&*store.read(b"k2").unwrap(), b"v2");
        assert_eq!(store.size(), 2);
    }
}
