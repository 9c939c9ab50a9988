// # Event Worker
//
// The single dedicated thread that drains the event ring, turns each
// `RawFault` into one `ChangeEvent` per overlapping region, fans it out
// to the user callback and the poll buffer, persists a canonical JSONL
// record, and re-arms touched pages once a batch is done
// (SPEC_FULL.md §4.6).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::concurrent::{Backoff, LockFreeQueue};
use crate::storage::FastStorage;
use crate::watch::event::{ChangeEvent, SourceContext, StoredChangeRecord, ValueSlot};
use crate::watch::region::{Region, PAGE_SIZE};
use crate::watch::registry::WatchRegistry;
use crate::watch::ring::EventRing;

/// A user callback invoked once per emitted event, from the worker
/// thread only (SPEC_FULL.md §5). Exceptions (panics) are caught and
/// counted, never propagated into the worker loop.
pub type ChangeCallback = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub events_emitted: u64,
    pub batches_processed: u64,
    pub callback_panics: u64,
    pub spill_failures: u64,
    pub persist_failures: u64,
}

struct WorkerShared {
    registry: Arc<WatchRegistry>,
    ring: Arc<EventRing>,
    storage: Arc<FastStorage>,
    callback: Mutex<Option<ChangeCallback>>,
    poll_buffer: LockFreeQueue<ChangeEvent>,
    seq: AtomicU64,
    inline_threshold: usize,
    preview_len: usize,
    batch_size: usize,
    max_backoff: Duration,
    persistence_enabled: bool,
    events_emitted: AtomicU64,
    batches_processed: AtomicU64,
    callback_panics: AtomicU64,
    spill_failures: AtomicU64,
    persist_failures: AtomicU64,
    stop: AtomicBool,
}

/// Owns the worker thread's handle and shared counters/buffers.
pub struct EventWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl EventWorker {
    pub fn spawn(
        registry: Arc<WatchRegistry>,
        ring: Arc<EventRing>,
        storage: Arc<FastStorage>,
        inline_threshold: usize,
        preview_len: usize,
        batch_size: usize,
        max_backoff: Duration,
        persistence_enabled: bool,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            registry,
            ring,
            storage,
            callback: Mutex::new(None),
            poll_buffer: LockFreeQueue::new(),
            seq: AtomicU64::new(1),
            inline_threshold,
            preview_len,
            batch_size,
            max_backoff,
            persistence_enabled,
            events_emitted: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            spill_failures: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("memwatch-event-worker".into())
            .spawn(move || run(worker_shared))
            .expect("spawn event worker thread");

        debug!("event worker started");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn set_callback(&self, callback: Option<ChangeCallback>) {
        *self.shared.callback.lock().unwrap() = callback;
    }

    /// Drains up to `max` accumulated events from the poll buffer.
    pub fn check_changes(&self, max: usize) -> Vec<ChangeEvent> {
        self.shared.poll_buffer.dequeue_batch(max)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            events_emitted: self.shared.events_emitted.load(Ordering::Relaxed),
            batches_processed: self.shared.batches_processed.load(Ordering::Relaxed),
            callback_panics: self.shared.callback_panics.load(Ordering::Relaxed),
            spill_failures: self.shared.spill_failures.load(Ordering::Relaxed),
            persist_failures: self.shared.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Signals the worker to stop and joins it, waiting at most `deadline`.
    /// A worker that hasn't noticed the stop flag within the deadline is
    /// left detached (its thread exits on its own once the ring drains).
    pub fn stop(&mut self, deadline: Duration) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("event worker did not drain within shutdown deadline");
            }
        }
    }
}

fn run(shared: Arc<WorkerShared>) {
    let mut backoff = Backoff::new();
    loop {
        let mut batch = Vec::with_capacity(shared.batch_size);
        while batch.len() < shared.batch_size {
            match shared.ring.pop() {
                Some(fault) => batch.push(fault),
                None => break,
            }
        }

        if batch.is_empty() {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            backoff.snooze();
            if backoff.should_yield() {
                std::thread::sleep(shared.max_backoff);
            }
            continue;
        }
        backoff.reset();

        let mut touched_pages = Vec::new();
        for fault in &batch {
            let regions = shared.registry.regions_for_page(fault.page_addr);
            let mut sorted = regions;
            sorted.sort_by_key(|r| r.id);

            for region in &sorted {
                let event = build_event(&shared, fault.page_addr, fault.timestamp_ns, fault.thread_id, fault.fault_ip, region);
                emit(&shared, event);
            }
            touched_pages.push(fault.page_addr);
        }

        touched_pages.sort_unstable();
        touched_pages.dedup();
        for page in touched_pages {
            if let Err(err) = shared.registry.rearm_page(page) {
                warn!(page, ?err, "failed to re-arm page after batch");
            }
        }

        shared.batches_processed.fetch_add(1, Ordering::Relaxed);
        if shared.stop.load(Ordering::Acquire) && shared.ring.is_empty() {
            return;
        }
    }
}

fn build_event(
    shared: &WorkerShared,
    _page_addr: usize,
    timestamp_ns: u64,
    thread_id: u64,
    fault_ip: usize,
    region: &Region,
) -> ChangeEvent {
    // A region's old/new values always cover the whole region, not just
    // the page that happened to fault: a region spanning several pages
    // must report one consistent before/after picture even though only
    // one of its pages triggered this particular trap (SPEC_FULL.md §4.6).

    // SAFETY: every page a watched region spans is always either
    // read-only or read-write, never unmapped, so reading the whole
    // region's current bytes is safe regardless of which page faulted.
    let live: &[u8] = unsafe { std::slice::from_raw_parts(region.base as *const u8, region.size) };
    let new_bytes = live;

    let old_bytes = shared.registry.region_shadow(region);

    let seq = shared.seq.fetch_add(1, Ordering::Relaxed);

    let old_preview = ChangeEvent::preview(&old_bytes, shared.preview_len);
    let new_preview = ChangeEvent::preview(new_bytes, shared.preview_len);

    let old = Some(classify(shared, &old_bytes, seq, "old"));
    let new = Some(classify(shared, new_bytes, seq, "new"));

    let event = ChangeEvent {
        seq,
        timestamp_ns,
        adapter_id: region.adapter_id,
        region_id: region.id,
        context: SourceContext {
            variable_name: region.name.clone(),
            file: None,
            function: None,
            line: None,
        },
        fault_ip,
        thread_id,
        thread_name: region.thread_name.clone(),
        language: region.language,
        scope: region.scope,
        old_preview,
        new_preview,
        old,
        new,
        stack_trace: Vec::new(),
        user_data: region.user_data,
    };
    event
}

fn classify(shared: &WorkerShared, bytes: &[u8], seq: u64, side: &str) -> ValueSlot {
    if bytes.len() <= shared.inline_threshold {
        return ValueSlot::Inline(bytes.to_vec());
    }
    let key = format!("v/{seq}/{side}");
    match shared.storage.write(key.as_bytes(), bytes) {
        Ok(()) => ValueSlot::Spilled(key),
        Err(err) => {
            warn!(seq, side, ?err, "failed to spill large value, falling back to inline");
            shared.spill_failures.fetch_add(1, Ordering::Relaxed);
            ValueSlot::Inline(bytes.to_vec())
        }
    }
}

fn emit(shared: &WorkerShared, event: ChangeEvent) {
    if shared.persistence_enabled {
        let record = StoredChangeRecord::from(&event);
        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                let key = format!("log/{}", event.seq);
                if let Err(err) = shared.storage.write(key.as_bytes(), &bytes) {
                    warn!(seq = event.seq, ?err, "failed to persist change record");
                    shared.persist_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                warn!(seq = event.seq, ?err, "failed to serialize change record");
                shared.persist_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    {
        let callback = shared.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            let result = catch_unwind(AssertUnwindSafe(|| cb(&event)));
            if result.is_err() {
                shared.callback_panics.fetch_add(1, Ordering::Relaxed);
                warn!(seq = event.seq, "user callback panicked, suppressing");
            }
        }
    }

    shared.poll_buffer.enqueue(event);
    shared.events_emitted.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{LanguageTag, ScopeTag};
    use crate::watch::registry::WatchRequest;
    use std::sync::atomic::AtomicUsize;

    fn default_request(base: usize, size: usize) -> WatchRequest {
        WatchRequest {
            base,
            size,
            name: Some("counter".into()),
            adapter_id: 0,
            scope: ScopeTag::Local,
            language: LanguageTag::Native,
            creator_thread: 1,
            thread_name: None,
            user_data: 0,
        }
    }

    #[test]
    fn worker_emits_event_with_old_and_new_preview() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FastStorage::open(dir.path().join("s.db"), 1 << 20, 16).unwrap());
        let registry = Arc::new(WatchRegistry::new());
        let ring = Arc::new(EventRing::new(64));

        let buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static mut [u8] = Box::leak(buf);
        let region_id = registry.watch(default_request(base, 8)).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();

        let mut worker = EventWorker::spawn(
            registry.clone(),
            ring.clone(),
            storage.clone(),
            4096,
            256,
            256,
            Duration::from_millis(10),
            true,
        );
        worker.set_callback(Some(Box::new(move |_e| {
            received2.fetch_add(1, Ordering::SeqCst);
        })));

        leaked[0] = 0x42;
        ring.push(crate::watch::ring::RawFault {
            seq: 0,
            timestamp_ns: 1,
            thread_id: 1,
            fault_ip: 0,
            page_addr: crate::watch::region::page_floor(base),
        });

        let start = Instant::now();
        while received.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);

        worker.stop(Duration::from_millis(500));
        registry.unwatch(region_id).unwrap();
    }
}
