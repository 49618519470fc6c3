//! Bounded pool of asynchronous inference request slots.
//!
//! Each stage owns one pool of `N` slots (default 4).  Acquiring suspends
//! the dispatcher until a slot is free; releasing happens from whatever
//! context processes the completion.  There is deliberately no timeout:
//! forward progress is the inference backend's contract, and the pool's
//! only job is to bound how many calls are outstanding at once.

use std::sync::Mutex;

use tokio::sync::Semaphore;

use vigil_core::{PipelineError, Result};

/// Default slot count per stage.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Acquired,
}

/// Fixed-capacity set of request slots with Free/Acquired state tracking.
///
/// The semaphore carries the count; the slot table carries identity so a
/// double release is detectable instead of silently corrupting the count.
#[derive(Debug)]
pub struct RequestPool {
    semaphore: Semaphore,
    slots: Mutex<Vec<SlotState>>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "request pool capacity must be non-zero");
        Self {
            semaphore: Semaphore::new(capacity),
            slots: Mutex::new(vec![SlotState::Free; capacity]),
        }
    }

    /// Wait for a free slot, mark it acquired, and return its index.
    pub async fn acquire(&self) -> Result<usize> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;
        permit.forget();

        let mut slots = self.slots.lock().expect("request pool lock poisoned");
        let index = slots
            .iter()
            .position(|slot| *slot == SlotState::Free)
            .ok_or_else(|| {
                PipelineError::InvariantViolation("pool permit granted with no free slot".into())
            })?;
        slots[index] = SlotState::Acquired;
        Ok(index)
    }

    /// Return a slot to the pool, waking one waiter.
    ///
    /// Releasing a slot that is already free is an error — the slot state
    /// guard is what keeps a misbehaving completion path from inflating
    /// the pool.
    pub fn release(&self, index: usize) -> Result<()> {
        let mut slots = self.slots.lock().expect("request pool lock poisoned");
        match slots.get(index) {
            Some(SlotState::Acquired) => {
                slots[index] = SlotState::Free;
                drop(slots);
                self.semaphore.add_permits(1);
                Ok(())
            }
            Some(SlotState::Free) => Err(PipelineError::SlotNotAcquired(index)),
            None => Err(PipelineError::InvariantViolation(format!(
                "slot index {index} out of range"
            ))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().expect("request pool lock poisoned").len()
    }

    /// Slots currently acquired.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .expect("request pool lock poisoned")
            .iter()
            .filter(|slot| **slot == SlotState::Acquired)
            .count()
    }
}
