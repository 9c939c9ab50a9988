// Lock-free concurrent data structures module
//
// Provides the two lock-free building blocks the watchpoint and adapter
// subsystems are built on: an epoch-based reclaimer and a Michael-Scott
// queue. Both use atomic operations and careful memory ordering to achieve
// linearizability without locks on their hot paths.

pub mod epoch;
pub mod queue;

// Re-export main types
pub use epoch::{Atomic, Epoch, EpochGuard, Owned, Shared};
pub use queue::{LockFreeQueue, QueueNode};

/// Cache line size for padding to avoid false sharing
pub const CACHE_LINE_SIZE: usize = 64;

/// Backoff strategy for CAS retry loops
pub struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    /// Create a new backoff strategy
    pub fn new() -> Self {
        Self {
            step: 0,
            max_step: 10,
        }
    }

    /// Perform a backoff step
    pub fn spin(&mut self) {
        for _ in 0..(1 << self.step.min(self.max_step)) {
            std::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Reset backoff to initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Check if we should yield to scheduler
    pub fn should_yield(&self) -> bool {
        self.step > 6
    }

    /// Snooze - either spin or yield
    pub fn snooze(&mut self) {
        if self.should_yield() {
            std::thread::yield_now();
        } else {
            self.spin();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
