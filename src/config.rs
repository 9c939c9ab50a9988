// # Engine Configuration
//
// A single `EngineConfig` struct with a `Default` impl giving the values
// named throughout SPEC_FULL.md §4 and §10, constructed by the embedder
// and passed to `init()`. Mirrors this crate's existing `Config`-struct
// convention rather than a builder or a global mutable config map.

use std::path::PathBuf;
use std::time::Duration;

/// Ring capacity, default `2^14` (SPEC_FULL.md §4.3).
pub const DEFAULT_RING_CAPACITY: usize = 1 << 14;

/// Hash index initial capacity, default `2^17` (SPEC_FULL.md §4.1).
pub const DEFAULT_INDEX_CAPACITY: usize = 1 << 17;

/// Values at or under this many bytes are inlined into a `ChangeEvent`
/// rather than spilled to `FastStorage` (SPEC_FULL.md §3, §4.6).
pub const DEFAULT_INLINE_THRESHOLD: usize = 4096;

/// Length of `old_preview`/`new_preview` in a `ChangeEvent` (SPEC_FULL.md §3).
pub const DEFAULT_PREVIEW_LEN: usize = 256;

/// Default FastStorage capacity when not overridden.
pub const DEFAULT_STORAGE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default shutdown drain deadline (SPEC_FULL.md §5).
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(1);

/// Policy governing repeated faults on a page whose re-arm is already
/// pending (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmPolicy {
    /// Enqueue once per arm cycle; subsequent faults before re-arm are
    /// suppressed (the default).
    CoalesceUntilRearm,
    /// Enqueue every fault as a separate raw fault record.
    EnqueueEveryFault,
}

impl Default for RearmPolicy {
    fn default() -> Self {
        RearmPolicy::CoalesceUntilRearm
    }
}

/// Embedder-supplied configuration for `Engine::init`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the event ring, rounded up to the next power of two.
    pub ring_capacity: usize,

    /// Initial capacity of FastStorage's in-memory hash index.
    pub index_capacity: usize,

    /// Path to the FastStorage log backing both the spill namespace and
    /// the secondary JSONL persistence namespace.
    pub storage_path: PathBuf,

    /// Capacity (bytes) to reserve for the FastStorage log.
    pub storage_capacity: u64,

    /// Values at or under this size are inlined into the emitted event
    /// rather than spilled.
    pub inline_threshold: usize,

    /// Length of the old/new preview slices attached to every event.
    pub preview_len: usize,

    /// Maximum raw faults drained by the event worker per batch.
    pub worker_batch_size: usize,

    /// Cap on the worker's exponential back-off when the ring is empty.
    pub worker_max_backoff: Duration,

    /// Whether the worker persists a canonical JSONL record per event.
    pub persistence_enabled: bool,

    /// Deadline `shutdown()` gives the worker to drain before force-stop.
    pub shutdown_deadline: Duration,

    /// Coalescing policy for repeated faults on one page between re-arms.
    pub rearm_policy: RearmPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            index_capacity: DEFAULT_INDEX_CAPACITY,
            storage_path: PathBuf::from("memwatch.faststorage"),
            storage_capacity: DEFAULT_STORAGE_CAPACITY,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            preview_len: DEFAULT_PREVIEW_LEN,
            worker_batch_size: 256,
            worker_max_backoff: Duration::from_millis(10),
            persistence_enabled: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            rearm_policy: RearmPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ring_capacity, 1 << 14);
        assert_eq!(cfg.index_capacity, 1 << 17);
        assert_eq!(cfg.inline_threshold, 4096);
        assert_eq!(cfg.preview_len, 256);
    }
}
