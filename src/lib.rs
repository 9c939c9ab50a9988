// Memory-change observation engine.
//
// Page-protection based watchpoints (`watch`) over a lock-free event
// pipeline (`concurrent`, `index`), backed by an mmap'd append-log store
// (`storage`) for spilled values and persisted change records. `api` is
// the process-wide singleton facade; `adapter` tracks registered
// language bindings; `config`/`error`/`common` are shared support types.

pub mod adapter;
pub mod api;
pub mod common;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod watch;

pub use api::{
    check_changes, get_stats, init, register_adapter, set_callback, shutdown, unregister_adapter,
    unwatch, watch, watch_auto_scope, watch_extended, EngineStats,
};
pub use common::{AdapterId, LanguageTag, PageAddr, RegionId, ScopeTag, Seq, ThreadId};
pub use config::{EngineConfig, RearmPolicy};
pub use error::{EngineError, Result};
pub use watch::{ChangeCallback, ChangeEvent, SourceContext, StoredChangeRecord, ValueSlot};
