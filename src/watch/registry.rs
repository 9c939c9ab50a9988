// # Watch Registry
//
// Owns every armed `Region`/`PageRecord` and publishes the lock-free
// page-to-shadow lookup table the trap handler reads.
//
// `watch`/`unwatch`/`rearm_page` hold `inner`, an ordinary
// `parking_lot::RwLock`, the same way this crate's `FastStorage` guards
// its mmap and index. That lock is never touched from the signal path.
//
// The trap handler instead reads `shadow_table`, an `AtomicPtr` to a
// fixed open-addressed `ShadowTable` snapshot. It deliberately does not
// use `crate::concurrent::epoch`: `Epoch::pin()` takes a `Mutex` on a
// thread's first pin and `Epoch::defer`/`try_collect` can call into the
// allocator, and both are unsound inside a signal handler. Instead the
// whole table is rebuilt and republished with a single `swap` whenever
// the armed-page set changes (always under `inner`'s write lock), and
// the previous generation is pushed onto `retired`, a plain `Mutex`-
// guarded `Vec` freed only in `shutdown`, once no trap can still be
// reading an old generation.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{AdapterId, LanguageTag, RegionId, ScopeTag, ThreadId};
use crate::error::{EngineError, Result};
use crate::watch::region::{page_range, PageRecord, Region, PAGE_SIZE};

/// Parameters for declaring a new watched region (SPEC_FULL.md §3).
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub base: usize,
    pub size: usize,
    pub name: Option<String>,
    pub adapter_id: AdapterId,
    pub scope: ScopeTag,
    pub language: LanguageTag,
    pub creator_thread: ThreadId,
    pub thread_name: Option<String>,
    pub user_data: usize,
}

enum ShadowSlot {
    Empty,
    Occupied {
        page_addr: usize,
        shadow_ptr: *mut u8,
        dirty: Arc<AtomicBool>,
    },
}

/// Open-addressed snapshot of every currently armed page, rebuilt on
/// every `watch`/`unwatch`/`rearm_page`. Lookups are wait-free: fixed
/// number of probes, no allocation, no locks.
struct ShadowTable {
    slots: Box<[ShadowSlot]>,
    mask: usize,
}

// SAFETY: `shadow_ptr` points into a `PageRecord::shadow` buffer kept
// alive for this table's whole lifetime (the registry only frees a
// generation after retiring it past any in-flight trap). Read-only
// after construction.
unsafe impl Send for ShadowTable {}
unsafe impl Sync for ShadowTable {}

impl ShadowTable {
    fn build(pages: &BTreeMap<usize, PageRecord>) -> Self {
        let armed = pages.values().filter(|r| r.armed).count();
        let capacity = (armed.max(1) * 2).next_power_of_two().max(4);
        let mask = capacity - 1;
        let mut slots: Vec<ShadowSlot> = (0..capacity).map(|_| ShadowSlot::Empty).collect();

        for (&page_addr, rec) in pages.iter() {
            if !rec.armed {
                continue;
            }
            let mut idx = Self::hash(page_addr) & mask;
            loop {
                match slots[idx] {
                    ShadowSlot::Empty => {
                        slots[idx] = ShadowSlot::Occupied {
                            page_addr,
                            shadow_ptr: rec.shadow.as_ptr() as *mut u8,
                            dirty: rec.dirty.clone(),
                        };
                        break;
                    }
                    ShadowSlot::Occupied { .. } => idx = (idx + 1) & mask,
                }
            }
        }

        Self {
            slots: slots.into_boxed_slice(),
            mask,
        }
    }

    #[inline]
    fn hash(page_addr: usize) -> usize {
        let x = (page_addr as u64 >> 12).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (x >> 32) as usize
    }

    /// Wait-free, signal-handler-safe lookup of a page's shadow buffer
    /// pointer and shared dirty flag.
    fn lookup(&self, page_addr: usize) -> Option<(*mut u8, &Arc<AtomicBool>)> {
        let len = self.slots.len();
        let mut idx = Self::hash(page_addr) & self.mask;
        for _ in 0..len {
            match &self.slots[idx] {
                ShadowSlot::Empty => return None,
                ShadowSlot::Occupied {
                    page_addr: pa,
                    shadow_ptr,
                    dirty,
                } => {
                    if *pa == page_addr {
                        return Some((*shadow_ptr, dirty));
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }
}

struct RegistryInner {
    pages: BTreeMap<usize, PageRecord>,
    regions: BTreeMap<RegionId, Region>,
}

/// Owns all watched regions and the page-level bookkeeping behind them.
pub struct WatchRegistry {
    inner: RwLock<RegistryInner>,
    shadow_table: AtomicPtr<ShadowTable>,
    retired: Mutex<Vec<Box<ShadowTable>>>,
    next_region_id: AtomicU64,
}

impl WatchRegistry {
    pub fn new() -> Self {
        let initial = Box::into_raw(Box::new(ShadowTable::build(&BTreeMap::new())));
        Self {
            inner: RwLock::new(RegistryInner {
                pages: BTreeMap::new(),
                regions: BTreeMap::new(),
            }),
            shadow_table: AtomicPtr::new(initial),
            retired: Mutex::new(Vec::new()),
            next_region_id: AtomicU64::new(1),
        }
    }

    /// Declares a new watched region: validates the address range, arms
    /// every overlapping page (snapshotting and `mprotect`-ing pages not
    /// already armed), and republishes the shadow table.
    pub fn watch(&self, req: WatchRequest) -> Result<RegionId> {
        validate_range(req.base, req.size)?;

        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        let (first_page, last_page) = page_range(req.base, req.size);

        let mut inner = self.inner.write();
        let mut page = first_page;
        loop {
            let rec = inner
                .pages
                .entry(page)
                .or_insert_with(PageRecord::new_unarmed);
            if !rec.armed {
                // SAFETY: `page` was validated above and is page-aligned;
                // copying PAGE_SIZE bytes stays within the mapped page.
                unsafe {
                    std::ptr::copy_nonoverlapping(page as *const u8, rec.shadow.as_mut_ptr(), PAGE_SIZE);
                }
                arm_page(page)?;
                rec.armed = true;
            }
            if !rec.regions.contains(&id) {
                rec.regions.push(id);
            }
            if page == last_page {
                break;
            }
            page += PAGE_SIZE;
        }

        inner.regions.insert(
            id,
            Region {
                id,
                base: req.base,
                size: req.size,
                name: req.name,
                adapter_id: req.adapter_id,
                scope: req.scope,
                language: req.language,
                creator_thread: req.creator_thread,
                thread_name: req.thread_name,
                user_data: req.user_data,
            },
        );

        self.republish(&inner.pages);
        debug!(region_id = id, base = req.base, size = req.size, "region watched");
        Ok(id)
    }

    /// Removes a watched region. Pages left with no remaining overlapping
    /// region are disarmed (`mprotect` restored to read-write).
    pub fn unwatch(&self, id: RegionId) -> Result<()> {
        let mut inner = self.inner.write();
        let region = inner
            .regions
            .remove(&id)
            .ok_or_else(|| EngineError::NotFound(format!("region {id}")))?;

        let (first_page, last_page) = page_range(region.base, region.size);
        let mut page = first_page;
        loop {
            if let Some(rec) = inner.pages.get_mut(&page) {
                rec.regions.retain(|&r| r != id);
                if rec.regions.is_empty() {
                    if rec.armed {
                        disarm_page(page)?;
                        rec.armed = false;
                    }
                    inner.pages.remove(&page);
                }
            }
            if page == last_page {
                break;
            }
            page += PAGE_SIZE;
        }

        self.republish(&inner.pages);
        debug!(region_id = id, "region unwatched");
        Ok(())
    }

    /// Wait-free lookup used only from the trap handler.
    pub fn shadow_lookup(&self, page_addr: usize) -> Option<(*mut u8, Arc<AtomicBool>)> {
        // SAFETY: the pointer always refers to a live, fully-initialized
        // `ShadowTable` published by `republish`; old generations are
        // only freed in `shutdown`, after which no trap may run.
        let table = unsafe { &*self.shadow_table.load(Ordering::Acquire) };
        table.lookup(page_addr).map(|(ptr, dirty)| (ptr, dirty.clone()))
    }

    /// Number of currently watched (armed) regions.
    pub fn region_count(&self) -> usize {
        self.inner.read().regions.len()
    }

    /// Region ids currently overlapping `page_addr`, for building events.
    pub fn regions_for_page(&self, page_addr: usize) -> Vec<Region> {
        let inner = self.inner.read();
        inner
            .pages
            .get(&page_addr)
            .map(|rec| {
                rec.regions
                    .iter()
                    .filter_map(|id| inner.regions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reconstructs a region's full last-known-good contents by
    /// stitching together the shadow of every page it overlaps. Untracked
    /// pages (shouldn't happen for an armed region, but kept defensive)
    /// contribute zeroed bytes.
    pub fn region_shadow(&self, region: &Region) -> Vec<u8> {
        let inner = self.inner.read();
        let mut out = vec![0u8; region.size];
        let (first_page, last_page) = page_range(region.base, region.size);
        let mut page = first_page;
        loop {
            let (start, end) = region.slice_within_page(page);
            if end > start {
                let region_off = (page + start) - region.base;
                if let Some(rec) = inner.pages.get(&page) {
                    out[region_off..region_off + (end - start)].copy_from_slice(&rec.shadow[start..end]);
                }
            }
            if page == last_page {
                break;
            }
            page += PAGE_SIZE;
        }
        out
    }

    /// Refreshes a page's shadow snapshot from live memory, clears its
    /// dirty flag, and re-applies write protection. Called by the event
    /// worker after it has finished building events for a batch.
    pub fn rearm_page(&self, page_addr: usize) -> Result<()> {
        let inner = self.inner.read();
        let Some(rec) = inner.pages.get(&page_addr) else {
            return Ok(());
        };
        if !rec.armed {
            return Ok(());
        }
        // SAFETY: `page_addr` is page-aligned and was previously armed,
        // so it remains a valid page in this process.
        unsafe {
            let shadow_ptr = rec.shadow.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(page_addr as *const u8, shadow_ptr, PAGE_SIZE);
        }
        rec.dirty.store(false, Ordering::Release);
        arm_page(page_addr)
    }

    /// Disarms every page and clears all regions. Only safe once the
    /// trap handler has been uninstalled and the event worker stopped.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for (&page, rec) in inner.pages.iter_mut() {
            if rec.armed {
                if let Err(err) = disarm_page(page) {
                    warn!(page, ?err, "failed to restore page protection during shutdown");
                }
                rec.armed = false;
            }
        }
        inner.pages.clear();
        inner.regions.clear();
        self.republish(&inner.pages);

        let mut retired = self.retired.lock();
        for table in retired.drain(..) {
            drop(table);
        }
        Ok(())
    }

    fn republish(&self, pages: &BTreeMap<usize, PageRecord>) {
        let new_table = Box::new(ShadowTable::build(pages));
        let new_ptr = Box::into_raw(new_table);
        let old_ptr = self.shadow_table.swap(new_ptr, Ordering::AcqRel);
        if !old_ptr.is_null() {
            // SAFETY: `old_ptr` was the previously published table; no
            // trap can still be dereferencing it after this swap is
            // visible, but an in-flight one started just before the
            // swap might be -- so it is retired, not freed, until
            // `shutdown`.
            self.retired.lock().push(unsafe { Box::from_raw(old_ptr) });
        }
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        let ptr = self.shadow_table.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

fn validate_range(base: usize, size: usize) -> Result<()> {
    if base == 0 || size == 0 {
        return Err(EngineError::InvalidAddr { addr: base, len: size });
    }
    let (first_page, last_page) = page_range(base, size);
    let n_pages = (last_page - first_page) / PAGE_SIZE + 1;
    let mut vec = vec![0u8; n_pages];
    // SAFETY: `mincore` only reads page-table metadata for the given
    // range; a bad `base` surfaces as `EFAULT`/`ENOMEM`, not UB.
    let rc = unsafe { libc::mincore(first_page as *mut c_void, (n_pages * PAGE_SIZE) as libc::size_t, vec.as_mut_ptr()) };
    if rc != 0 {
        return Err(EngineError::InvalidAddr { addr: base, len: size });
    }
    Ok(())
}

fn arm_page(page_addr: usize) -> Result<()> {
    // SAFETY: `page_addr` is page-aligned and was already confirmed
    // resident via `mincore` in `watch`, or was armed before in `rearm_page`.
    let rc = unsafe { libc::mprotect(page_addr as *mut c_void, PAGE_SIZE, libc::PROT_READ) };
    if rc != 0 {
        return Err(EngineError::Mprotect {
            page_addr,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        });
    }
    Ok(())
}

fn disarm_page(page_addr: usize) -> Result<()> {
    // SAFETY: same as `arm_page`; restores the page to its normal
    // read-write protection.
    let rc = unsafe { libc::mprotect(page_addr as *mut c_void, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(EngineError::Mprotect {
            page_addr,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::region::page_floor;

    fn default_request(base: usize, size: usize) -> WatchRequest {
        WatchRequest {
            base,
            size,
            name: Some("x".into()),
            adapter_id: 0,
            scope: ScopeTag::Local,
            language: LanguageTag::Native,
            creator_thread: 1,
            thread_name: None,
            user_data: 0,
        }
    }

    #[test]
    fn watch_then_unwatch_round_trips() {
        let registry = WatchRegistry::new();
        let buf = vec![0u8; PAGE_SIZE * 2].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static [u8] = Box::leak(buf);

        let id = registry.watch(default_request(base, leaked.len())).unwrap();
        let page = page_floor(base);
        assert!(registry.shadow_lookup(page).is_some());

        registry.unwatch(id).unwrap();
        assert!(registry.shadow_lookup(page).is_none());
    }

    #[test]
    fn watch_rejects_null_address() {
        let registry = WatchRegistry::new();
        let err = registry.watch(default_request(0, 8)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAddr { .. }));
    }

    #[test]
    fn unwatch_unknown_region_is_not_found() {
        let registry = WatchRegistry::new();
        let err = registry.unwatch(9999).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn overlapping_regions_share_one_page_record() {
        let registry = WatchRegistry::new();
        let buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static [u8] = Box::leak(buf);

        let a = registry.watch(default_request(base, 8)).unwrap();
        let b = registry.watch(default_request(base + 16, 8)).unwrap();
        let page = page_floor(base);
        assert_eq!(registry.regions_for_page(page).len(), 2);

        registry.unwatch(a).unwrap();
        assert!(registry.shadow_lookup(page).is_some());
        registry.unwatch(b).unwrap();
        assert!(registry.shadow_lookup(page).is_none());
    }

    #[test]
    fn region_shadow_spans_multiple_pages() {
        let registry = WatchRegistry::new();
        let buf = vec![0u8; PAGE_SIZE * 2].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static [u8] = Box::leak(buf);

        let id = registry.watch(default_request(base, leaked.len())).unwrap();
        let region = registry.regions_for_page(page_floor(base))[0].clone();
        assert_eq!(region.id, id);

        let shadow = registry.region_shadow(&region);
        assert_eq!(shadow.len(), leaked.len());
        assert!(shadow.iter().all(|&b| b == 0));
    }
}
