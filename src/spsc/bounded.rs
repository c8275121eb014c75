//! Bounded wait-free SPSC queue with look-ahead batching.
//!
//! # Overview
//!
//! - [`Producer`] - write end (exactly one per queue)
//! - [`Consumer`] - read end (exactly one per queue)
//! - Wait-free: every operation completes in a bounded number of steps
//!
//! The hot paths are slot-tag driven: the producer probes slot states
//! instead of reading the consumer's index counter, and vice versa, so the
//! two hot cache lines are almost never shared. The producer amortizes its
//! probes by looking ahead a quarter of the ring: one acquire load proving
//! a far slot free licenses a whole span of plain writes.
//!
//! # Example
//!
//! ```
//! let (mut tx, mut rx) = weft::spsc::bounded::channel::<u64>(16)?;
//!
//! tx.push(7).unwrap();
//! assert_eq!(rx.peek(), Some(&7));
//! assert_eq!(rx.pop(), Some(7));
//! assert_eq!(rx.pop(), None);
//! # Ok::<(), weft::CapacityError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ring::{self, CapacityError, FILL_BATCH, Full};
use crate::slot::{EMPTY, READY, Slot};
use crate::trace;
use crate::wait::{ExitCondition, WaitStrategy};

/// Producer-side hot counter, isolated on its own cache line.
#[repr(align(64))]
struct ProducerState {
    /// Next logical index to write. Owned by the producer, read by size
    /// introspection; published with release ordering after the element.
    index: AtomicU64,
}

/// Consumer-side hot counter, isolated on its own cache line.
#[repr(align(64))]
struct ConsumerState {
    /// Next logical index to read. Owned by the consumer.
    index: AtomicU64,
}

struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    mask: u64,
    look_ahead: u64,
    slots: Box<[Slot<T>]>,
}

// SAFETY: the slot tags mediate all cross-thread access to the value cells
// (see `crate::slot`), and the index counters are atomics. One producer and
// one consumer exist per ring, enforced by the non-Clone handle types.
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    #[inline]
    fn slot(&self, index: u64) -> &Slot<T> {
        &self.slots[ring::offset(index, self.mask)]
    }

    #[inline]
    fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    fn len(&self) -> usize {
        // Producer first: a racing estimate then undercounts rather than
        // overcounts.
        let producer = self.producer.index.load(Ordering::Acquire);
        let consumer = self.consumer.index.load(Ordering::Acquire);
        producer.saturating_sub(consumer) as usize
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.drop_element_in_place();
        }
    }
}

/// Write end of the queue. Not `Clone`: one producer thread per queue.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    /// Producer-local copy of its own index; the atomic is only written.
    index: u64,
    /// Indices below this are known to map to free slots.
    limit: u64,
}

/// Read end of the queue. Not `Clone`: one consumer thread per queue.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    /// Consumer-local copy of its own index; the atomic is only written.
    index: u64,
}

/// Creates a bounded SPSC queue with at least `capacity` slots.
///
/// The capacity is rounded up to the next power of two; [`Producer::capacity`]
/// reports the rounded value.
///
/// # Errors
///
/// Returns [`CapacityError`] if `capacity < 2`.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), CapacityError> {
    let capacity = ring::checked_capacity(capacity)?;
    trace::trace!(capacity, "spsc bounded channel created");

    let ring = Arc::new(Ring {
        producer: ProducerState {
            index: AtomicU64::new(0),
        },
        consumer: ConsumerState {
            index: AtomicU64::new(0),
        },
        mask: (capacity - 1) as u64,
        look_ahead: ring::look_ahead_step(capacity),
        slots: (0..capacity).map(|_| Slot::new()).collect(),
    });

    let producer = Producer {
        ring: Arc::clone(&ring),
        index: 0,
        // Every slot of a fresh ring is free.
        limit: capacity as u64,
    };
    let consumer = Consumer { ring, index: 0 };

    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Attempts to push an element (wait-free).
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the element when the queue is full, and only
    /// then.
    #[inline]
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        let index = self.index;
        if index >= self.limit && !self.grow_limit(index) {
            return Err(Full(item));
        }
        // SAFETY: every index below the limit maps to an EMPTY slot that
        // only this producer may write (see `grow_limit`).
        unsafe { self.ring.slot(index).write(item) };
        self.index = index + 1;
        self.ring.producer.index.store(index + 1, Ordering::Release);
        Ok(())
    }

    /// Re-arms the cached limit by probing slot states.
    ///
    /// A free slot at `index + look_ahead` proves the consumer has drained
    /// past `index + look_ahead - capacity`, so the whole span up to the
    /// probe is free. Falls back to probing the immediate slot, claiming a
    /// single index.
    #[cold]
    fn grow_limit(&mut self, index: u64) -> bool {
        let ring = &*self.ring;
        if ring.slot(index + ring.look_ahead).state(Ordering::Acquire) == EMPTY {
            self.limit = index + ring.look_ahead;
            true
        } else if ring.slot(index).state(Ordering::Acquire) == EMPTY {
            self.limit = index + 1;
            true
        } else {
            false
        }
    }

    /// Pushes up to `batch` supplied elements, publishing the producer
    /// index once for the whole batch. Returns how many were pushed, which
    /// is short only when free capacity (under the look-ahead limit) runs
    /// out.
    pub fn fill(&mut self, mut supplier: impl FnMut() -> T, batch: usize) -> usize {
        let index = self.index;
        if index >= self.limit && !self.grow_limit(index) {
            return 0;
        }
        let claimed = (self.limit - index).min(batch as u64);
        for i in 0..claimed {
            // SAFETY: same ownership argument as `push`; all claimed
            // indices are below the limit.
            unsafe { self.ring.slot(index + i).write(supplier()) };
        }
        self.index = index + claimed;
        self.ring.producer.index.store(self.index, Ordering::Release);
        claimed as usize
    }

    /// Keeps filling from `supplier` until `exit` says stop, idling via
    /// `wait` whenever a whole batch attempt makes no progress. Returns the
    /// total number of elements pushed.
    pub fn fill_blocking(
        &mut self,
        mut supplier: impl FnMut() -> T,
        wait: &impl WaitStrategy,
        exit: &impl ExitCondition,
    ) -> u64 {
        let mut idle = 0;
        let mut total = 0;
        while exit.keep_running() {
            let filled = self.fill(&mut supplier, FILL_BATCH);
            if filled == 0 {
                idle = wait.idle(idle);
            } else {
                idle = 0;
                total += filled as u64;
            }
        }
        total
    }

    /// Number of elements currently queued (best effort under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == self.ring.capacity()
    }

    /// Slot count of the ring (the rounded construction capacity).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to pop the next element (wait-free).
    #[inline]
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        let index = self.index;
        let slot = self.ring.slot(index);
        if slot.state(Ordering::Acquire) != READY {
            return None;
        }
        // SAFETY: READY acquired above makes the element write visible, and
        // this single consumer exclusively owns READY slots.
        let item = unsafe { slot.take() };
        self.index = index + 1;
        self.ring.consumer.index.store(index + 1, Ordering::Release);
        Some(item)
    }

    /// Borrows the next element without removing it.
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        let slot = self.ring.slot(self.index);
        if slot.state(Ordering::Acquire) != READY {
            return None;
        }
        // SAFETY: as in `pop`; the `&mut self` borrow prevents a `pop` from
        // invalidating the reference while it lives.
        Some(unsafe { slot.element() })
    }

    /// Pops up to `limit` elements into `consumer`, stopping at the first
    /// empty read. Returns how many were consumed.
    pub fn drain(&mut self, mut consumer: impl FnMut(T), limit: usize) -> usize {
        for drained in 0..limit {
            match self.pop() {
                Some(item) => consumer(item),
                None => return drained,
            }
        }
        limit
    }

    /// Keeps draining into `consumer` until `exit` says stop, idling via
    /// `wait` whenever a whole batch attempt makes no progress. Returns the
    /// total number of elements consumed.
    pub fn drain_blocking(
        &mut self,
        mut consumer: impl FnMut(T),
        wait: &impl WaitStrategy,
        exit: &impl ExitCondition,
    ) -> u64 {
        let mut idle = 0;
        let mut total = 0;
        while exit.keep_running() {
            let drained = self.drain(&mut consumer, FILL_BATCH);
            if drained == 0 {
                idle = wait.idle(idle);
            } else {
                idle = 0;
                total += drained as u64;
            }
        }
        total
    }

    /// Removes and returns queued elements until the queue reads empty.
    pub fn drain_iter(&mut self) -> Drain<'_, T> {
        Drain { consumer: self }
    }

    /// Number of elements currently queued (best effort under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count of the ring (the rounded construction capacity).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Draining iterator returned by [`Consumer::drain_iter`].
pub struct Drain<'a, T: Send> {
    consumer: &'a mut Consumer<T>,
}

impl<T: Send> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.consumer.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // The producer may add more while we iterate; only the lower bound
        // is meaningful.
        (self.consumer.len(), None)
    }
}
