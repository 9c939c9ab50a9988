// # Event Ring
//
// A bounded single-consumer, multi-producer lock-free queue of fixed-size
// `RawFault` records (SPEC_FULL.md §4.3). Producers are trap handlers,
// possibly on many threads concurrently; the consumer is the single
// event worker thread.
//
// Structurally modeled on this crate's `io::ring_buffer::IoRingBuffer`
// (power-of-two capacity, `AtomicU64` head/tail cursors, fixed
// pre-allocated backing array), adapted with a Vyukov-style per-slot
// sequence number so a producer's claim-then-write is never observed
// half-written by the consumer, and with drop-on-full instead of
// blocking -- a trap handler must never block.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal fixed-size record the trap handler enqueues (SPEC_FULL.md §4.3).
/// `Copy` and free of heap pointers so it can be written into a
/// pre-allocated slot with no allocation on the signal path.
#[derive(Debug, Clone, Copy)]
pub struct RawFault {
    /// Position in producer-cursor order; assigned by `EventRing::push`.
    pub seq: u64,
    pub timestamp_ns: u64,
    pub thread_id: u64,
    pub fault_ip: usize,
    pub page_addr: usize,
}

impl Default for RawFault {
    fn default() -> Self {
        Self {
            seq: 0,
            timestamp_ns: 0,
            thread_id: 0,
            fault_ip: 0,
            page_addr: 0,
        }
    }
}

struct Slot {
    /// Vyukov sequence: `i` when free for generation 0 at index `i`,
    /// `pos + 1` once the writer at producer-cursor `pos` has published,
    /// `pos + capacity` once the reader has consumed it (free for the
    /// next lap).
    seq: AtomicU64,
    data: UnsafeCell<MaybeUninit<RawFault>>,
}

/// Counters surfaced through `get_stats`.
#[derive(Debug, Clone, Default)]
pub struct RingStats {
    pub len: usize,
    pub capacity: usize,
    pub drop_count: u64,
}

pub struct EventRing {
    head: AtomicU64,
    tail: AtomicU64,
    mask: u64,
    capacity: usize,
    slots: Box<[Slot]>,
    drop_count: AtomicU64,
}

// SAFETY: `Slot::data` is only ever accessed by the single producer that
// atomically claimed its sequence number, or the single consumer after
// observing the matching published sequence -- never both at once.
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Creates a ring with capacity rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            mask: (capacity - 1) as u64,
            capacity,
            slots: slots.into_boxed_slice(),
            drop_count: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `fault`, stamping its `seq` with the claimed producer
    /// cursor position. Never blocks: if the ring is full, increments
    /// `drop_count` and returns `false`. Safe to call from a signal
    /// handler -- no allocation, no locks, just bounded CAS retries.
    pub fn push(&self, mut fault: RawFault) -> bool {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let idx = (pos & self.mask) as usize;
            let slot = &self.slots[idx];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    fault.seq = pos;
                    unsafe {
                        (*slot.data.get()).write(fault);
                    }
                    slot.seq.store(pos + 1, Ordering::Release);
                    return true;
                }
                // Lost the race to another producer; retry.
            } else if diff < 0 {
                // The consumer hasn't freed this slot from its previous
                // lap yet: the ring is full.
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            // diff > 0: another producer already claimed and published
            // this position; reload and retry.
        }
    }

    /// Pops the next fault in producer-cursor order, or `None` if the
    /// ring is currently empty. Only ever called from the single event
    /// worker thread.
    pub fn pop(&self) -> Option<RawFault> {
        let pos = self.head.load(Ordering::Relaxed);
        let idx = (pos & self.mask) as usize;
        let slot = &self.slots[idx];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != pos + 1 {
            return None;
        }
        let val = unsafe { (*slot.data.get()).assume_init_read() };
        slot.seq.store(pos + self.capacity as u64, Ordering::Release);
        self.head.store(pos + 1, Ordering::Relaxed);
        Some(val)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            len: self.len(),
            capacity: self.capacity,
            drop_count: self.drop_count(),
        }
    }
}
