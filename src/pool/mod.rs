//! Surface pool - bounded set of reusable decoded-image slots
//!
//! Slots move Free -> InUse when a decoded picture is handed to the consumer
//! and back to Free when the consumer releases it. The pool is also the
//! admission gate for the decode engine: a submission first reserves
//! capacity, and the reservation turns into an InUse slot when its completion
//! arrives. All bookkeeping sits behind one mutex, since acquisition happens
//! on the completion thread and release on the consumer's thread.

use crate::decoder::DecodedImage;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InUse,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub free: usize,
    /// Capacity promised to submissions still in flight
    pub reserved: usize,
    /// Slots handed out since creation
    pub acquired_total: u64,
}

/// Outcome of waiting for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    TimedOut,
    /// The pool was closed while waiting
    Closed,
}

struct SlotEntry {
    state: SlotState,
    /// Bumped on every acquisition so stale handles can be detected
    generation: u64,
    /// Backing surface, kept while Free so it can be reused
    surface: Option<DecodedImage>,
}

struct PoolState {
    slots: Vec<SlotEntry>,
    reserved: usize,
    closed: bool,
    acquired_total: u64,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::InUse).count()
    }

    fn has_budget(&self) -> bool {
        self.in_use() + self.reserved < self.slots.len()
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled whenever capacity frees up or the pool closes
    available: Condvar,
}

/// Fixed-capacity pool of decoded-image slots. Cheap to clone.
#[derive(Clone)]
pub struct SurfacePool {
    shared: Arc<PoolShared>,
}

impl SurfacePool {
    /// Create a pool with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| SlotEntry {
                state: SlotState::Free,
                generation: 0,
                surface: None,
            })
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    slots,
                    reserved: 0,
                    closed: false,
                    acquired_total: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Reserve capacity for one in-flight sample, blocking while
    /// `in_use + reserved` has reached capacity.
    ///
    /// `deadline == None` waits indefinitely.
    pub fn reserve(&self, deadline: Option<Instant>) -> Admission {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Admission::Closed;
            }
            if state.has_budget() {
                state.reserved += 1;
                return Admission::Granted;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        // One last look: a release may have raced the timeout
                        if !state.closed && state.has_budget() {
                            state.reserved += 1;
                            return Admission::Granted;
                        }
                        return Admission::TimedOut;
                    }
                }
                None => self.shared.available.wait(&mut state),
            }
        }
    }

    /// Give back a reservation whose sample never turned into a slot
    pub fn cancel_reservation(&self) {
        let mut state = self.shared.state.lock();
        if state.reserved == 0 {
            log::error!("Surface pool: reservation cancelled twice");
            return;
        }
        state.reserved -= 1;
        drop(state);
        self.shared.available.notify_all();
    }

    /// Take a Free slot and mark it InUse.
    ///
    /// Capacity promised to reserved submissions is off limits: returns
    /// `None` when `in_use + reserved` has reached capacity or the pool is
    /// closed.
    pub fn try_acquire(&self) -> Option<SlotHandle> {
        let mut state = self.shared.state.lock();
        if state.closed || !state.has_budget() {
            return None;
        }
        self.take_free(&mut state)
    }

    /// Turn an outstanding reservation into an InUse slot. `None` means no
    /// slot is Free, which admission control rules out, or the pool is
    /// closed. The reservation is kept on failure.
    pub(crate) fn acquire_reserved(&self) -> Option<SlotHandle> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        if state.reserved == 0 {
            log::error!("Surface pool: acquiring against a missing reservation");
        }
        let slot = self.take_free(&mut state)?;
        state.reserved = state.reserved.saturating_sub(1);
        Some(slot)
    }

    /// Grab a Free slot regardless of reservations
    #[cfg(test)]
    pub(crate) fn seize_free_slot(&self) -> Option<SlotHandle> {
        let mut state = self.shared.state.lock();
        self.take_free(&mut state)
    }

    fn take_free(&self, state: &mut PoolState) -> Option<SlotHandle> {
        let index = state.slots.iter().position(|s| s.state == SlotState::Free)?;
        state.acquired_total += 1;

        let slot = &mut state.slots[index];
        slot.state = SlotState::InUse;
        slot.generation += 1;

        Some(SlotHandle {
            pool: self.shared.clone(),
            index,
            generation: slot.generation,
            image: None,
            released: false,
        })
    }

    /// Return a slot to the pool. Callable from any thread.
    pub fn release(&self, handle: SlotHandle) {
        if !Arc::ptr_eq(&self.shared, &handle.pool) {
            log::error!("Surface pool: slot {} released to a foreign pool", handle.index);
        }
        handle.release();
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let in_use = state.in_use();
        PoolStats {
            capacity: state.slots.len(),
            in_use,
            free: state.slots.len() - in_use,
            reserved: state.reserved,
            acquired_total: state.acquired_total,
        }
    }

    /// Stop admitting and acquiring. Wakes every blocked `reserve`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the pool and drop the surfaces of every Free slot.
    ///
    /// Slots still held by the consumer keep their surface until they are
    /// released. Returns the number of such slots.
    pub fn teardown(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.reserved = 0;
        let mut held = 0;
        for slot in state.slots.iter_mut() {
            match slot.state {
                SlotState::Free => slot.surface = None,
                SlotState::InUse => held += 1,
            }
        }
        drop(state);
        self.shared.available.notify_all();
        held
    }
}

impl std::fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SurfacePool")
            .field("capacity", &stats.capacity)
            .field("in_use", &stats.in_use)
            .field("reserved", &stats.reserved)
            .finish()
    }
}

/// Ownership of one InUse slot.
///
/// The slot returns to the pool only through [`SlotHandle::release`] (or
/// [`SurfacePool::release`]). Dropping a handle without releasing it leaks
/// the slot and eventually stalls the decoder.
pub struct SlotHandle {
    pool: Arc<PoolShared>,
    index: usize,
    generation: u64,
    image: Option<DecodedImage>,
    released: bool,
}

impl SlotHandle {
    /// Slot index within the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// The picture bound to this slot
    pub fn image(&self) -> Option<&DecodedImage> {
        self.image.as_ref()
    }

    /// Bind a decoded picture to the slot, replacing its previous surface
    pub fn bind(&mut self, image: DecodedImage) {
        let mut state = self.pool.state.lock();
        if let Some(slot) = state.slots.get_mut(self.index) {
            if slot.generation == self.generation {
                slot.surface = Some(image.clone());
            }
        }
        drop(state);
        self.image = Some(image);
    }

    /// Hand the slot back to the pool
    pub fn release(mut self) {
        self.released = true;
        self.image = None;

        let mut state = self.pool.state.lock();
        let closed = state.closed;
        match state.slots.get_mut(self.index) {
            Some(slot) if slot.generation == self.generation && slot.state == SlotState::InUse => {
                slot.state = SlotState::Free;
                if closed {
                    slot.surface = None;
                }
            }
            _ => {
                log::error!("Surface pool: stale release of slot {}", self.index);
                return;
            }
        }
        drop(state);
        self.pool.available.notify_all();
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "Surface pool: slot {} dropped without release, capacity leaked",
                self.index
            );
        }
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("bound", &self.image.is_some())
            .finish()
    }
}
