// # Adapter Registry
//
// Named language/binding identities attached to watched regions and
// change events (SPEC_FULL.md §3, §4 overview). The table is small and
// changes rarely (register/unregister), but is read on every event the
// worker emits, so reads must be lock-free.
//
// Built on `crate::concurrent::epoch`: registration publishes a whole new
// `Vec<AdapterEntry>` behind an `Atomic` pointer (append-only, copy-on-write),
// and the previous version is reclaimed via `Epoch::defer` once no reader
// can still observe it. This is the ordinary, non-signal-path use of the
// epoch reclaimer -- contrast with the watch registry's page lookup table,
// which cannot use it (see `watch::registry` module doc).

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::common::AdapterId;
use crate::concurrent::epoch::{Atomic, Epoch, Owned};

#[derive(Clone)]
struct AdapterEntry {
    id: AdapterId,
    name: String,
}

/// Append-only table of named adapter identities.
pub struct AdapterRegistry {
    table: Atomic<Vec<AdapterEntry>>,
    next_id: AtomicU32,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            table: Atomic::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Registers a new adapter identity, returning its stable id.
    pub fn register(&self, name: &str) -> AdapterId {
        loop {
            let guard = Epoch::pin();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let current = self.table.load(Ordering::Acquire, &guard);
            let mut next: Vec<AdapterEntry> = current
                .as_ref()
                .map(|v| v.clone())
                .unwrap_or_default();
            next.push(AdapterEntry {
                id,
                name: name.to_string(),
            });
            let new_shared = Owned::new(next).into_shared();

            match self.table.compare_exchange(
                current,
                new_shared,
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if !current.is_null() {
                        Epoch::defer(current.as_ptr());
                    }
                    debug!(adapter_id = id, name, "adapter registered");
                    return id;
                }
                Err(_) => {
                    // SAFETY: the CAS failed, so `new_shared` was never
                    // published; we still hold the only reference to it.
                    unsafe {
                        drop(Box::from_raw(new_shared.as_ptr()));
                    }
                }
            }
        }
    }

    /// Removes an adapter identity. Returns whether it was present.
    pub fn unregister(&self, id: AdapterId) -> bool {
        loop {
            let guard = Epoch::pin();
            let current = self.table.load(Ordering::Acquire, &guard);
            let Some(cur_vec) = current.as_ref() else {
                return false;
            };
            if !cur_vec.iter().any(|e| e.id == id) {
                return false;
            }
            let next: Vec<AdapterEntry> = cur_vec.iter().filter(|e| e.id != id).cloned().collect();
            let new_shared = Owned::new(next).into_shared();

            match self.table.compare_exchange(
                current,
                new_shared,
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    Epoch::defer(current.as_ptr());
                    debug!(adapter_id = id, "adapter unregistered");
                    return true;
                }
                Err(_) => unsafe {
                    drop(Box::from_raw(new_shared.as_ptr()));
                },
            }
        }
    }

    /// Looks up an adapter's name without blocking any writer.
    pub fn name_of(&self, id: AdapterId) -> Option<String> {
        let guard = Epoch::pin();
        let current = self.table.load(Ordering::Acquire, &guard);
        current
            .as_ref()
            .and_then(|v| v.iter().find(|e| e.id == id))
            .map(|e| e.name.clone())
    }

    pub fn len(&self) -> usize {
        let guard = Epoch::pin();
        let current = self.table.load(Ordering::Acquire, &guard);
        current.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AdapterRegistry {
    fn drop(&mut self) {
        // `Atomic<T>`'s own `Drop` frees whatever the table currently
        // points at; nothing extra to do here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_increasing_ids() {
        let reg = AdapterRegistry::new();
        let a = reg.register("python");
        let b = reg.register("jvm");
        assert_ne!(a, b);
        assert_eq!(reg.name_of(a).as_deref(), Some("python"));
        assert_eq!(reg.name_of(b).as_deref(), Some("jvm"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unregister_removes_entry() {
        let reg = AdapterRegistry::new();
        let a = reg.register("node");
        assert!(reg.unregister(a));
        assert!(reg.name_of(a).is_none());
        assert!(!reg.unregister(a));
    }

    #[test]
    fn concurrent_registration_assigns_unique_ids() {
        use std::sync::Arc;
        let reg = Arc::new(AdapterRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.register(&format!("adapter-{i}")))
            })
            .collect();
        let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(reg.len(), 8);
    }
}
