// Integration tests driving the crate's public API end to end, the way
// a real embedder would: `memwatch::init`, watch a region, trigger a
// write, observe the callback, read the accumulated events back via
// `check_changes`, then shut down.
//
// Exercises SPEC_FULL.md §8 scenario 1 (simple write), scenario 2
// (cross-page region), scenario 5 (unwatch stops further events), and
// scenario 6 (large-value spill) through the safe Rust surface rather
// than the lower-level module unit tests.
//
// Every test here mutates the same process-wide engine singleton and
// installs a real SIGSEGV handler, so they must not run concurrently
// with each other: `#[serial]` forces the default test harness to run
// them one at a time instead of on separate threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use memwatch::{EngineConfig, LanguageTag, ScopeTag};
use serial_test::serial;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.storage_path = dir.path().join("memwatch.db");
    cfg.ring_capacity = 64;
    cfg
}

fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
#[serial]
fn simple_write_produces_one_event_with_matching_previews() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let _ = memwatch::shutdown();
    memwatch::init(config(&dir)).unwrap();

    let buf = vec![0u8; memwatch::watch::PAGE_SIZE].into_boxed_slice();
    let base = buf.as_ptr() as usize;
    let leaked: &'static mut [u8] = Box::leak(buf);

    let region_id = memwatch::watch_extended(
        base,
        8,
        Some("x".into()),
        0,
        ScopeTag::Local,
        LanguageTag::Native,
        0,
        None,
        0,
    )
    .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();
    memwatch::set_callback(Some(Box::new(move |_e| {
        seen2.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    let before = leaked[0..8].to_vec();
    leaked[0..8].copy_from_slice(&[0x41, 0x42, 0x43, 0x44, 0, 0, 0, 0]);

    assert!(wait_for(|| seen.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)));

    let events = memwatch::check_changes(16).unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.old_preview, before);
    assert_eq!(&event.new_preview[..], &[0x41, 0x42, 0x43, 0x44, 0, 0, 0, 0]);
    assert_eq!(event.region_id, region_id);

    memwatch::unwatch(region_id).unwrap();
    memwatch::shutdown().unwrap();
}

#[test]
#[serial]
fn large_value_is_spilled_and_readable_from_storage() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let _ = memwatch::shutdown();
    let mut cfg = config(&dir);
    cfg.inline_threshold = 64;
    memwatch::init(cfg).unwrap();

    let page_count = 4;
    let buf = vec![0u8; memwatch::watch::PAGE_SIZE * page_count].into_boxed_slice();
    let base = buf.as_ptr() as usize;
    let leaked: &'static mut [u8] = Box::leak(buf);
    let big_region_size = memwatch::watch::PAGE_SIZE * page_count;

    let region_id = memwatch::watch(base, big_region_size, Some("blob".into()), 0).unwrap();

    let captured: Arc<Mutex<Vec<memwatch::ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let captured2 = captured.clone();
    memwatch::set_callback(Some(Box::new(move |e| {
        captured2.lock().unwrap().push(e.clone());
    })))
    .unwrap();

    let payload = vec![0xABu8; 10 * 1024];
    leaked[0..payload.len()].copy_from_slice(&payload);

    assert!(wait_for(
        || !captured.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));

    let events = captured.lock().unwrap().clone();
    let event = events.iter().find(|e| e.region_id == region_id).expect("event for region");
    let storage_key = event
        .new
        .as_ref()
        .and_then(|v| v.storage_key())
        .expect("new value spilled, storage_key_new present");
    assert!(event.new.as_ref().unwrap().inline_value().is_none());

    let stats = memwatch::get_stats().unwrap();
    assert!(stats.storage.entry_count > 0);

    memwatch::unwatch(region_id).unwrap();
    memwatch::shutdown().unwrap();

    // Reopen the store directly to confirm the spilled bytes persisted
    // past this `shutdown()` (which flushes FastStorage). The event's new
    // value covers the whole watched region, not just the page that
    // faulted, so the full payload should be present.
    let storage = memwatch::storage::FastStorage::open(dir.path().join("memwatch.db"), 1 << 20, 16).unwrap();
    let stored = storage.read(storage_key.as_bytes()).unwrap();
    assert_eq!(stored.len(), big_region_size);
    assert_eq!(&stored[0..payload.len()], &payload[..]);
}

#[test]
#[serial]
fn cross_page_write_yields_one_event_covering_the_whole_region() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let _ = memwatch::shutdown();
    let mut cfg = config(&dir);
    cfg.inline_threshold = memwatch::watch::PAGE_SIZE * 4;
    memwatch::init(cfg).unwrap();

    let page_size = memwatch::watch::PAGE_SIZE;
    let buf = vec![0u8; page_size * 2].into_boxed_slice();
    let base = buf.as_ptr() as usize;
    let leaked: &'static mut [u8] = Box::leak(buf);

    let region_id = memwatch::watch(base, page_size * 2, Some("buf".into()), 0).unwrap();

    let captured: Arc<Mutex<Vec<memwatch::ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let captured2 = captured.clone();
    memwatch::set_callback(Some(Box::new(move |e| {
        captured2.lock().unwrap().push(e.clone());
    })))
    .unwrap();

    // A single byte write that lands on the second page.
    let offset = page_size + 4;
    leaked[offset] = 0x7F;

    assert!(wait_for(
        || !captured.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));

    // Give the worker a moment to finish draining this one fault before
    // asserting there was exactly one event for the region.
    std::thread::sleep(Duration::from_millis(20));
    let events = captured.lock().unwrap().clone();
    let region_events: Vec<_> = events.iter().filter(|e| e.region_id == region_id).collect();
    assert_eq!(region_events.len(), 1);

    let event = region_events[0];
    let old = event.old.as_ref().and_then(|v| v.inline_value().map(|b| b.to_vec())).unwrap();
    let new = event.new.as_ref().and_then(|v| v.inline_value().map(|b| b.to_vec())).unwrap();
    assert_eq!(old.len(), page_size * 2);
    assert_eq!(new.len(), page_size * 2);
    for i in 0..old.len() {
        if i == offset {
            assert_eq!(new[i], 0x7F);
        } else {
            assert_eq!(old[i], new[i], "byte {i} should be unchanged");
        }
    }

    memwatch::unwatch(region_id).unwrap();
    memwatch::shutdown().unwrap();
}

#[test]
#[serial]
fn unwatch_stops_further_events_for_that_region() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let _ = memwatch::shutdown();
    memwatch::init(config(&dir)).unwrap();

    let buf = vec![0u8; memwatch::watch::PAGE_SIZE].into_boxed_slice();
    let base = buf.as_ptr() as usize;
    let leaked: &'static mut [u8] = Box::leak(buf);

    let region_id = memwatch::watch(base, 8, Some("y".into()), 0).unwrap();
    assert!(memwatch::unwatch(region_id).unwrap());
    assert!(!memwatch::unwatch(region_id).unwrap());

    // Writing after unwatch must not panic or fault forever; the page is
    // back to normal read-write protection.
    leaked[0] = 0x99;
    assert_eq!(leaked[0], 0x99);

    memwatch::shutdown().unwrap();
}
