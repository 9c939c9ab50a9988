// # Public API & Lifecycle
//
// The safe Rust `Engine` facade (SPEC_FULL.md §4.7) wiring every other
// module into one process-wide singleton, plus the `ffi` submodule's
// thin `extern "C"` layer over it for non-Rust bindings.
//
// Uses the `once_cell::sync::OnceCell<Arc<T>>` singleton pattern already
// established elsewhere in this crate, adapted to support genuine
// `init`/`shutdown` cycles (not just one-shot startup): the `OnceCell`
// is set exactly once, to a `Mutex` whose contents come and go across
// `init`/`shutdown` pairs, rather than holding the engine state itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::adapter::AdapterRegistry;
use crate::common::{AdapterId, LanguageTag, RegionId, ScopeTag, ThreadId};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::storage::{FastStorage, FastStorageStats};
use crate::watch::{
    ChangeCallback, ChangeEvent, EventRing, EventWorker, RingStats, WatchRegistry, WatchRequest,
    WorkerStats,
};
use crate::watch::trap;

/// Combined health/counters snapshot returned by `get_stats`.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub ring: RingStats,
    pub storage: FastStorageStats,
    pub worker: WorkerStats,
    pub regions_armed: usize,
    pub adapters_registered: usize,
}

struct EngineState {
    registry: Arc<WatchRegistry>,
    ring: Arc<EventRing>,
    storage: Arc<FastStorage>,
    worker: Mutex<Option<EventWorker>>,
    adapters: AdapterRegistry,
    config: EngineConfig,
    refcount: AtomicU64,
}

static ENGINE: OnceCell<Mutex<Option<Arc<EngineState>>>> = OnceCell::new();

fn slot() -> &'static Mutex<Option<Arc<EngineState>>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

fn current() -> Result<Arc<EngineState>> {
    slot().lock().as_ref().cloned().ok_or(EngineError::NotInit)
}

/// Idempotent: a second `init` while already running increments a
/// refcount and returns `Ok(())` without touching any state.
pub fn init(config: EngineConfig) -> Result<()> {
    let mut guard = slot().lock();
    if let Some(state) = guard.as_ref() {
        state.refcount.fetch_add(1, Ordering::AcqRel);
        return Ok(());
    }

    let registry = Arc::new(WatchRegistry::new());
    let ring = Arc::new(EventRing::new(config.ring_capacity));
    let storage = Arc::new(FastStorage::open(
        &config.storage_path,
        config.storage_capacity,
        config.index_capacity,
    )?);

    trap::install(registry.clone(), ring.clone(), config.rearm_policy)?;

    let worker = EventWorker::spawn(
        registry.clone(),
        ring.clone(),
        storage.clone(),
        config.inline_threshold,
        config.preview_len,
        config.worker_batch_size,
        config.worker_max_backoff,
        config.persistence_enabled,
    );

    *guard = Some(Arc::new(EngineState {
        registry,
        ring,
        storage,
        worker: Mutex::new(Some(worker)),
        adapters: AdapterRegistry::new(),
        config,
        refcount: AtomicU64::new(1),
    }));
    info!("engine initialized");
    Ok(())
}

/// Idempotent: decrements the refcount; only the call that brings it to
/// zero actually drains the worker, removes the trap handler, and
/// disarms every page.
pub fn shutdown() -> Result<()> {
    let mut guard = slot().lock();
    let Some(state) = guard.as_ref().cloned() else {
        return Ok(());
    };
    if state.refcount.fetch_sub(1, Ordering::AcqRel) > 1 {
        return Ok(());
    }

    if let Some(mut worker) = state.worker.lock().take() {
        worker.stop(state.config.shutdown_deadline);
    }
    trap::uninstall();
    state.registry.shutdown()?;
    state.storage.flush()?;
    *guard = None;
    info!("engine shut down");
    Ok(())
}

pub fn watch(base: usize, size: usize, name: Option<String>, user_data: usize) -> Result<RegionId> {
    let state = current()?;
    state.registry.watch(WatchRequest {
        base,
        size,
        name,
        adapter_id: 0,
        scope: ScopeTag::Both,
        language: LanguageTag::Unknown,
        creator_thread: 0,
        thread_name: None,
        user_data,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn watch_extended(
    base: usize,
    size: usize,
    name: Option<String>,
    adapter_id: AdapterId,
    scope: ScopeTag,
    language: LanguageTag,
    creator_thread: ThreadId,
    thread_name: Option<String>,
    user_data: usize,
) -> Result<RegionId> {
    let state = current()?;
    state.registry.watch(WatchRequest {
        base,
        size,
        name,
        adapter_id,
        scope,
        language,
        creator_thread,
        thread_name,
        user_data,
    })
}

/// Returns `Ok(true)` if `region_id` was found and removed, `Ok(false)`
/// if it was never watched (or already unwatched).
pub fn unwatch(region_id: RegionId) -> Result<bool> {
    let state = current()?;
    match state.registry.unwatch(region_id) {
        Ok(()) => Ok(true),
        Err(EngineError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn set_callback(callback: Option<ChangeCallback>) -> Result<()> {
    let state = current()?;
    if let Some(worker) = state.worker.lock().as_ref() {
        worker.set_callback(callback);
    }
    Ok(())
}

pub fn check_changes(max: usize) -> Result<Vec<ChangeEvent>> {
    let state = current()?;
    Ok(state
        .worker
        .lock()
        .as_ref()
        .map(|w| w.check_changes(max))
        .unwrap_or_default())
}

pub fn get_stats() -> Result<EngineStats> {
    let state = current()?;
    let worker_stats = state
        .worker
        .lock()
        .as_ref()
        .map(|w| w.stats())
        .unwrap_or_default();
    Ok(EngineStats {
        ring: state.ring.stats(),
        storage: state.storage.stats(),
        worker: worker_stats,
        regions_armed: state.registry.region_count(),
        adapters_registered: state.adapters.len(),
    })
}

pub fn register_adapter(name: &str) -> Result<AdapterId> {
    let state = current()?;
    Ok(state.adapters.register(name))
}

pub fn unregister_adapter(id: AdapterId) -> Result<bool> {
    let state = current()?;
    Ok(state.adapters.unregister(id))
}

/// "Watch every variable currently in scope" has no precise semantic at
/// this layer (SPEC_FULL.md §9 Open Questions): resolving language-level
/// scope to byte ranges is a binding responsibility. This performs no
/// memory access and always returns `InvalidAddr`.
pub fn watch_auto_scope(_adapter_id: AdapterId, _thread_id: ThreadId) -> Result<RegionId> {
    debug!("watch_auto_scope called: scope enumeration is a binding responsibility, not core");
    Err(EngineError::InvalidAddr { addr: 0, len: 0 })
}

/// `extern "C"` surface translating the safe API above to the status
/// codes and C-ABI shapes of SPEC_FULL.md §6. Per-language bindings that
/// actually consume this surface are out of scope (§1); this module
/// only has to be a faithful, minimal translation.
pub mod ffi {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::slice;

    use crate::error::{
        STATUS_CORRUPT, STATUS_FULL, STATUS_INVALID_ADDR, STATUS_MPROTECT, STATUS_NOT_FOUND,
        STATUS_NOT_INIT, STATUS_NO_MEMORY, STATUS_OK,
    };

    fn status_of(err: &EngineError) -> i32 {
        i32::from(err)
    }

    unsafe fn str_from_c(ptr: *const c_char) -> Option<String> {
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }

    #[no_mangle]
    pub extern "C" fn memwatch_init(
        ring_capacity: usize,
        storage_path: *const c_char,
        storage_capacity: u64,
    ) -> i32 {
        let mut config = EngineConfig::default();
        if ring_capacity > 0 {
            config.ring_capacity = ring_capacity;
        }
        if storage_capacity > 0 {
            config.storage_capacity = storage_capacity;
        }
        // SAFETY: caller-provided C string, nul-terminated per the FFI
        // contract; `str_from_c` handles a null pointer.
        if let Some(path) = unsafe { str_from_c(storage_path) } {
            if !path.is_empty() {
                config.storage_path = path.into();
            }
        }
        match super::init(config) {
            Ok(()) => STATUS_OK,
            Err(e) => status_of(&e),
        }
    }

    #[no_mangle]
    pub extern "C" fn memwatch_shutdown() -> i32 {
        match super::shutdown() {
            Ok(()) => STATUS_OK,
            Err(e) => status_of(&e),
        }
    }

    /// Returns the new region id, or 0 on failure.
    #[no_mangle]
    pub extern "C" fn memwatch_watch(
        addr: usize,
        size: usize,
        name: *const c_char,
        user_data: usize,
    ) -> u64 {
        // SAFETY: see `str_from_c`.
        let name = unsafe { str_from_c(name) };
        super::watch(addr, size, name, user_data).unwrap_or(0)
    }

    #[no_mangle]
    #[allow(clippy::too_many_arguments)]
    pub extern "C" fn memwatch_watch_extended(
        addr: usize,
        size: usize,
        name: *const c_char,
        adapter_id: u32,
        scope: u8,
        language: u8,
        thread_id: u64,
        thread_name: *const c_char,
        user_data: usize,
    ) -> u64 {
        // SAFETY: see `str_from_c`.
        let name = unsafe { str_from_c(name) };
        let thread_name = unsafe { str_from_c(thread_name) };
        super::watch_extended(
            addr,
            size,
            name,
            adapter_id,
            ScopeTag::from(scope),
            LanguageTag::from(language),
            thread_id,
            thread_name,
            user_data,
        )
        .unwrap_or(0)
    }

    /// Returns 1 if the region existed and was removed, 0 otherwise.
    #[no_mangle]
    pub extern "C" fn memwatch_unwatch(region_id: u64) -> i32 {
        match super::unwatch(region_id) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(_) => 0,
        }
    }

    #[no_mangle]
    pub extern "C" fn memwatch_register_adapter(name: *const c_char) -> u32 {
        // SAFETY: see `str_from_c`.
        match unsafe { str_from_c(name) } {
            Some(name) => super::register_adapter(&name).unwrap_or(0),
            None => 0,
        }
    }

    #[no_mangle]
    pub extern "C" fn memwatch_unregister_adapter(adapter_id: u32) -> i32 {
        match super::unregister_adapter(adapter_id) {
            Ok(true) => 1,
            _ => 0,
        }
    }

    /// C representation of a `ChangeEvent`. `old_value`/`new_value` are
    /// null when the corresponding `storage_key_*` is non-null (spilled),
    /// and vice versa, matching the xor invariant of SPEC_FULL.md §3.
    #[repr(C)]
    pub struct CChangeEvent {
        pub handle: u64,
        pub seq: u64,
        pub timestamp_ns: u64,
        pub adapter_id: u32,
        pub region_id: u64,
        pub fault_ip: usize,
        pub thread_id: u64,
        pub language: u8,
        pub scope: u8,
        pub old_preview_ptr: *const u8,
        pub old_preview_len: usize,
        pub new_preview_ptr: *const u8,
        pub new_preview_len: usize,
        pub old_value_ptr: *const u8,
        pub old_value_len: usize,
        pub new_value_ptr: *const u8,
        pub new_value_len: usize,
        pub storage_key_old: *const c_char,
        pub storage_key_new: *const c_char,
        pub user_data: usize,
    }

    /// Backing allocation kept alive for one outstanding `CChangeEvent`
    /// until `memwatch_free_event` releases it.
    struct EventHandle {
        event: ChangeEvent,
        key_old: Option<CString>,
        key_new: Option<CString>,
    }

    static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
    static HANDLES: OnceCell<Mutex<HashMap<u64, EventHandle>>> = OnceCell::new();

    fn handles() -> &'static Mutex<HashMap<u64, EventHandle>> {
        HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
    }

    fn to_c_event(handle_id: u64, h: &EventHandle) -> CChangeEvent {
        let e = &h.event;
        let (old_value_ptr, old_value_len) = e
            .old
            .as_ref()
            .and_then(|v| v.inline_value())
            .map(|b| (b.as_ptr(), b.len()))
            .unwrap_or((std::ptr::null(), 0));
        let (new_value_ptr, new_value_len) = e
            .new
            .as_ref()
            .and_then(|v| v.inline_value())
            .map(|b| (b.as_ptr(), b.len()))
            .unwrap_or((std::ptr::null(), 0));

        CChangeEvent {
            handle: handle_id,
            seq: e.seq,
            timestamp_ns: e.timestamp_ns,
            adapter_id: e.adapter_id,
            region_id: e.region_id,
            fault_ip: e.fault_ip,
            thread_id: e.thread_id,
            language: e.language as u8,
            scope: e.scope as u8,
            old_preview_ptr: e.old_preview.as_ptr(),
            old_preview_len: e.old_preview.len(),
            new_preview_ptr: e.new_preview.as_ptr(),
            new_preview_len: e.new_preview.len(),
            old_value_ptr,
            old_value_len,
            new_value_ptr,
            new_value_len,
            storage_key_old: h
                .key_old
                .as_ref()
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null()),
            storage_key_new: h
                .key_new
                .as_ref()
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null()),
            user_data: e.user_data,
        }
    }

    /// Fills up to `max` events into `out`, returning the number written,
    /// or a negative status code on failure.
    #[no_mangle]
    pub extern "C" fn memwatch_check_changes(out: *mut CChangeEvent, max: usize) -> i64 {
        if out.is_null() || max == 0 {
            return 0;
        }
        let events = match super::check_changes(max) {
            Ok(events) => events,
            Err(e) => return status_of(&e) as i64,
        };
        // SAFETY: caller guarantees `out` points at `max` writable
        // `CChangeEvent` slots.
        let out_slice = unsafe { slice::from_raw_parts_mut(out, max) };
        let mut table = handles().lock();
        let n = events.len().min(max);
        for (slot, event) in out_slice.iter_mut().zip(events.into_iter()).take(n) {
            let handle_id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
            let key_old = event
                .old
                .as_ref()
                .and_then(|v| v.storage_key())
                .and_then(|k| CString::new(k).ok());
            let key_new = event
                .new
                .as_ref()
                .and_then(|v| v.storage_key())
                .and_then(|k| CString::new(k).ok());
            let handle = EventHandle { event, key_old, key_new };
            *slot = to_c_event(handle_id, &handle);
            table.insert(handle_id, handle);
        }
        n as i64
    }

    /// Idempotent: freeing an unknown or already-freed handle is a no-op.
    #[no_mangle]
    pub extern "C" fn memwatch_free_event(handle: u64) {
        handles().lock().remove(&handle);
    }

    #[repr(C)]
    pub struct CEngineStats {
        pub ring_len: usize,
        pub ring_capacity: usize,
        pub ring_drop_count: u64,
        pub storage_entry_count: u64,
        pub storage_file_size: u64,
        pub events_emitted: u64,
        pub callback_panics: u64,
        pub adapters_registered: usize,
    }

    #[no_mangle]
    pub extern "C" fn memwatch_get_stats(out: *mut CEngineStats) -> i32 {
        if out.is_null() {
            return STATUS_INVALID_ADDR;
        }
        match super::get_stats() {
            Ok(stats) => {
                // SAFETY: caller guarantees `out` is a valid, writable
                // `CEngineStats`.
                unsafe {
                    *out = CEngineStats {
                        ring_len: stats.ring.len,
                        ring_capacity: stats.ring.capacity,
                        ring_drop_count: stats.ring.drop_count,
                        storage_entry_count: stats.storage.entry_count,
                        storage_file_size: stats.storage.file_size,
                        events_emitted: stats.worker.events_emitted,
                        callback_panics: stats.worker.callback_panics,
                        adapters_registered: stats.adapters_registered,
                    };
                }
                STATUS_OK
            }
            Err(e) => status_of(&e),
        }
    }

    /// Unused placeholder kept only so every status constant named in
    /// SPEC_FULL.md §6 is referenced somewhere in this module.
    #[allow(dead_code)]
    fn _all_status_codes_referenced() -> [i32; 7] {
        [
            STATUS_OK,
            STATUS_NOT_INIT,
            STATUS_INVALID_ADDR,
            STATUS_NO_MEMORY,
            STATUS_MPROTECT,
            STATUS_NOT_FOUND,
            STATUS_FULL,
        ]
    }

    // Keep `c_void` imported for bindings that pass opaque callback
    // context pointers through `set_callback`-style registration points.
    #[allow(unused_imports)]
    use c_void as _;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage_path = dir.path().join("engine.faststorage");
        config.ring_capacity = 64;
        config
    }

    #[test]
    fn lifecycle_and_watch_unwatch_and_events() {
        let dir = tempfile::tempdir().unwrap();

        // The engine is a process-wide singleton: guard against another
        // test in this binary leaving it initialized.
        let _ = shutdown();

        init(test_config(&dir)).unwrap();
        init(test_config(&dir)).unwrap(); // idempotent: refcount now 2

        let adapter_id = register_adapter("native").unwrap();

        let buf = vec![0u8; crate::watch::PAGE_SIZE].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static mut [u8] = Box::leak(buf);

        let region_id = watch_extended(
            base,
            8,
            Some("counter".into()),
            adapter_id,
            ScopeTag::Local,
            LanguageTag::Native,
            0,
            None,
            0,
        )
        .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        set_callback(Some(Box::new(move |_e| {
            received2.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        leaked[0] = 0x7F;

        let start = std::time::Instant::now();
        while received.load(Ordering::SeqCst) == 0 && start.elapsed() < std::time::Duration::from_secs(2) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);

        let stats = get_stats().unwrap();
        assert_eq!(stats.adapters_registered, 1);

        assert!(unwatch(region_id).unwrap());
        assert!(!unwatch(region_id).unwrap());

        assert!(unregister_adapter(adapter_id).unwrap());

        // One extra shutdown just decrements the refcount from the
        // double `init` above; the engine is still running.
        shutdown().unwrap();
        assert!(get_stats().is_ok());
        shutdown().unwrap();
        assert!(matches!(get_stats(), Err(EngineError::NotInit)));
    }

    #[test]
    fn watch_auto_scope_is_a_descriptive_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let _ = shutdown();
        init(test_config(&dir)).unwrap();
        assert!(matches!(
            watch_auto_scope(0, 0),
            Err(EngineError::InvalidAddr { .. })
        ));
        shutdown().unwrap();
    }
}
