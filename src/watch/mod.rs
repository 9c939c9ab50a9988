// # Watchpoint Engine
//
// Page-protection based change detection (SPEC_FULL.md §1, §2, §4.3-§4.6):
// `region`/`registry` own the armed page set and the lock-free shadow
// lookup the trap handler reads; `ring` carries raw faults from trap
// handler to worker; `trap` installs the `SIGSEGV` handler; `worker`
// turns faults into `ChangeEvent`s; `event` defines those event types.

pub mod event;
pub mod region;
pub mod registry;
pub mod ring;
pub mod trap;
pub mod worker;

pub use event::{ChangeEvent, SourceContext, StoredChangeRecord, ValueSlot};
pub use region::{page_floor, page_range, PageRecord, Region, PAGE_SIZE};
pub use registry::{WatchRegistry, WatchRequest};
pub use ring::{EventRing, RawFault, RingStats};
pub use worker::{ChangeCallback, EventWorker, WorkerStats};
