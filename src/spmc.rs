//! Bounded lock-free SPMC queue with CAS consumer arbitration.
//!
//! # Overview
//!
//! - [`Producer`] - write end (exactly one per queue); wait-free
//! - [`Consumer`] - read end; `Clone`, any number of consumer threads
//!   racing via CAS on the shared consumer index
//!
//! Consumers arbitrate through a single CAS per claim (or per claimed
//! range, for batch drains). To keep the pack of consumers off the
//! producer's hot cache line, they share a cached copy of the producer
//! index and only re-read the live counter when the cache is exhausted.
//!
//! The producer publishes the advanced index only after the element write,
//! so a consumer never claims an index whose slot it could observe empty:
//! a claim strictly below the published producer index always finds an
//! element.
//!
//! # Example
//!
//! ```
//! let (mut tx, rx) = weft::spmc::channel::<u64>(8)?;
//!
//! let workers: Vec<_> = (0..2)
//!     .map(|_| {
//!         let mut rx = rx.clone();
//!         std::thread::spawn(move || {
//!             let mut claimed = Vec::new();
//!             while let Some(v) = rx.pop() {
//!                 claimed.push(v);
//!             }
//!             claimed
//!         })
//!     })
//!     .collect();
//!
//! for i in 0..8 {
//!     tx.push(i).unwrap();
//! }
//!
//! let claimed: usize = workers.into_iter().map(|w| w.join().unwrap().len()).sum();
//! assert!(claimed <= 8);
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
    /// Next logical index to write; published after the element.
    index: AtomicU64,
}

/// Consumer-side hot counter, isolated on its own cache line.
#[repr(align(64))]
struct ConsumerState {
    /// Next logical index to claim; consumers CAS this.
    index: AtomicU64,
}

/// Shared cached copy of the producer index, on its own cache line so
/// refreshing it does not bounce the claim counter between consumers.
#[repr(align(64))]
struct ProducerCache {
    index: AtomicU64,
}

struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    producer_cache: ProducerCache,
    mask: u64,
    slots: Box<[Slot<T>]>,
}

// SAFETY: the slot tags and the claim CAS mediate all cross-thread access
// to the value cells; the counters are atomics.
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

    /// Claims up to `want` contiguous published elements with one CAS.
    /// Returns the starting index and the claimed count.
    fn claim(&self, want: u64) -> Option<(u64, u64)> {
        loop {
            let index = self.consumer.index.load(Ordering::Acquire);
            let mut bound = self.producer_cache.index.load(Ordering::Acquire);
            if index >= bound {
                bound = self.producer.index.load(Ordering::Acquire);
                if index >= bound {
                    return None;
                }
                // Re-arm the shared cache for the other consumers. Stores
                // may race and regress it; that only costs a refresh.
                self.producer_cache.index.store(bound, Ordering::Release);
            }
            let count = want.min(bound - index);
            if self
                .consumer
                .index
                .compare_exchange_weak(index, index + count, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some((index, count));
            }
        }
    }

    /// Takes the element from a claimed slot.
    ///
    /// # Safety
    ///
    /// `index` must have been claimed via [`Ring::claim`] by this caller.
    #[inline]
    unsafe fn take_claimed(&self, index: u64) -> T {
        let slot = self.slot(index);
        debug_assert_eq!(
            slot.state(Ordering::Relaxed),
            READY,
            "claimed index below the published producer bound holds no element"
        );
        // SAFETY: the CAS claim grants exclusive slot ownership, and the
        // claim bound derives from an acquire read of the producer index,
        // which was release-published after the element write.
        unsafe { slot.take() }
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
}

/// Read end of the queue. `Clone` it freely: any number of consumer
/// threads may pop concurrently.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Creates a bounded SPMC queue with at least `capacity` slots (rounded up
/// to the next power of two).
///
/// # Errors
///
/// Returns [`CapacityError`] if `capacity < 2`.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), CapacityError> {
    let capacity = ring::checked_capacity(capacity)?;
    trace::trace!(capacity, "spmc channel created");

    let ring = Arc::new(Ring {
        producer: ProducerState {
            index: AtomicU64::new(0),
        },
        consumer: ConsumerState {
            index: AtomicU64::new(0),
        },
        producer_cache: ProducerCache {
            index: AtomicU64::new(0),
        },
        mask: (capacity - 1) as u64,
        slots: (0..capacity).map(|_| Slot::new()).collect(),
    });

    let producer = Producer {
        ring: Arc::clone(&ring),
        index: 0,
    };
    let consumer = Consumer { ring };

    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Attempts to push an element (wait-free apart from a bounded wait on
    /// a consumer that has claimed the target slot but not yet vacated it).
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the element when the queue is genuinely full
    /// (live size equals capacity), and only then.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        let ring = &*self.ring;
        let index = self.index;
        let slot = ring.slot(index);
        if slot.state(Ordering::Acquire) != EMPTY {
            let consumer = ring.consumer.index.load(Ordering::Acquire);
            if index - consumer >= ring.capacity() as u64 {
                return Err(Full(item));
            }
            // A consumer claimed the previous occupant but has not stored
            // EMPTY yet; it is a handful of instructions away.
            while slot.state(Ordering::Acquire) != EMPTY {
                std::hint::spin_loop();
            }
        }
        // SAFETY: the slot is EMPTY and the single producer owns all
        // writes; consumers cannot claim this index until the store below.
        unsafe { slot.write(item) };
        self.index = index + 1;
        ring.producer.index.store(index + 1, Ordering::Release);
        Ok(())
    }

    /// Pushes up to `batch` supplied elements, publishing the producer
    /// index once for the whole batch. Returns how many were pushed; short
    /// counts mean the queue ran out of free capacity.
    pub fn fill(&mut self, mut supplier: impl FnMut() -> T, batch: usize) -> usize {
        let ring = &*self.ring;
        let index = self.index;
        let consumer = ring.consumer.index.load(Ordering::Acquire);
        let free = ring.capacity() as u64 - (index - consumer);
        let count = free.min(batch as u64);
        for i in 0..count {
            let slot = ring.slot(index + i);
            // The free-count bound guarantees each slot's occupant was
            // claimed; late EMPTY stores may still be in flight.
            while slot.state(Ordering::Acquire) != EMPTY {
                std::hint::spin_loop();
            }
            // SAFETY: as in `push`.
            unsafe { slot.write(supplier()) };
        }
        self.index = index + count;
        ring.producer.index.store(self.index, Ordering::Release);
        count as usize
    }

    /// Keeps filling from `supplier` until `exit` says stop, idling via
    /// `wait` whenever a whole batch attempt makes no progress. Returns the
    /// total number pushed.
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

    /// Number of elements currently queued (best effort; biased toward
    /// undercount under races, with a bounded stabilization retry).
    #[must_use]
    pub fn len(&self) -> usize {
        ring::stabilized_size(&self.ring.producer.index, &self.ring.consumer.index) as usize
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
    /// Attempts to pop one element (lock-free: the claim CAS retries under
    /// contention from other consumers).
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let (index, _) = ring.claim(1)?;
        // SAFETY: claimed just above.
        Some(unsafe { ring.take_claimed(index) })
    }

    /// Pops up to `limit` elements into `consumer`, claiming contiguous
    /// ranges with a single CAS whenever the cached producer bound covers
    /// several ready elements. Returns how many were consumed.
    pub fn drain(&mut self, mut consumer: impl FnMut(T), limit: usize) -> usize {
        let ring = &*self.ring;
        let mut total = 0u64;
        while total < limit as u64 {
            let Some((start, count)) = ring.claim(limit as u64 - total) else {
                break;
            };
            for i in 0..count {
                // SAFETY: the whole range was claimed by the CAS above.
                consumer(unsafe { ring.take_claimed(start + i) });
            }
            total += count;
        }
        total as usize
    }

    /// Keeps draining into `consumer` until `exit` says stop, idling via
    /// `wait` whenever a whole batch attempt makes no progress. Returns the
    /// total number consumed.
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

    /// Number of elements currently queued (best effort; biased toward
    /// undercount under races, with a bounded stabilization retry).
    #[must_use]
    pub fn len(&self) -> usize {
        ring::stabilized_size(&self.ring.producer.index, &self.ring.consumer.index) as usize
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_capacity() {
        assert!(channel::<u64>(1).is_err());
        assert!(channel::<u64>(2).is_ok());
    }

    #[test]
    fn starts_empty() {
        let (tx, rx) = channel::<u64>(8).unwrap();
        assert!(tx.is_empty());
        assert_eq!(rx.len(), 0);
        assert_eq!(rx.capacity(), 8);
    }

    #[test]
    fn single_consumer_fifo() {
        let (mut tx, mut rx) = channel::<u64>(8).unwrap();
        for i in 0..8 {
            tx.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_then_free_one_slot() {
        let (mut tx, mut rx) = channel::<u64>(4).unwrap();
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(99), Err(Full(99)));
        assert!(tx.is_full());

        assert_eq!(rx.pop(), Some(0));
        assert!(tx.push(4).is_ok());
        assert_eq!(tx.push(100), Err(Full(100)));
    }

    #[test]
    fn cloned_consumers_share_the_sequence() {
        let (mut tx, mut rx_a) = channel::<u64>(8).unwrap();
        let mut rx_b = rx_a.clone();
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(rx_a.pop(), Some(0));
        assert_eq!(rx_b.pop(), Some(1));
        assert_eq!(rx_a.pop(), Some(2));
        assert_eq!(rx_b.pop(), Some(3));
        assert_eq!(rx_a.pop(), None);
        assert_eq!(rx_b.pop(), None);
    }

    #[test]
    fn batch_drain_claims_ranges() {
        let (mut tx, mut rx) = channel::<u64>(16).unwrap();
        for i in 0..10 {
            tx.push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.drain(|v| out.push(v), 7), 7);
        assert_eq!(out, (0..7).collect::<Vec<_>>());
        assert_eq!(rx.drain(|v| out.push(v), 7), 3);
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fill_respects_free_capacity() {
        let (mut tx, mut rx) = channel::<u64>(8).unwrap();
        assert_eq!(tx.fill(|| 1, 100), 8);
        assert_eq!(tx.fill(|| 2, 100), 0);
        for _ in 0..3 {
            rx.pop().unwrap();
        }
        assert_eq!(tx.fill(|| 3, 100), 3);
        assert_eq!(tx.len(), 8);
    }

    #[test]
    fn conservation_after_mixed_activity() {
        let (mut tx, mut rx) = channel::<u64>(16).unwrap();
        for i in 0..12 {
            tx.push(i).unwrap();
        }
        for _ in 0..5 {
            rx.pop().unwrap();
        }
        assert_eq!(tx.len(), 7);
        let mut remaining = 0;
        while rx.pop().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 7);
    }

    #[test]
    fn drop_releases_queued_elements() {
        use std::sync::Arc as StdArc;

        let witness = StdArc::new(());
        {
            let (mut tx, mut rx) = channel::<StdArc<()>>(8).unwrap();
            for _ in 0..6 {
                tx.push(StdArc::clone(&witness)).unwrap();
            }
            rx.pop().unwrap();
            assert_eq!(StdArc::strong_count(&witness), 6);
        }
        assert_eq!(StdArc::strong_count(&witness), 1);
    }

    #[test]
    fn racing_consumers_lose_nothing_and_duplicate_nothing() {
        use std::collections::HashSet;
        use std::sync::Arc as StdArc;
        use std::sync::atomic::AtomicBool;

        let (mut tx, rx) = channel::<u64>(64).unwrap();
        let total = 30_000u64;
        let done = StdArc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let mut rx = rx.clone();
                let done = StdArc::clone(&done);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match rx.pop() {
                            Some(v) => seen.push(v),
                            None => {
                                if done.load(Ordering::Acquire) && rx.is_empty() {
                                    break;
                                }
                                std::hint::spin_loop();
                            }
                        }
                    }
                    seen
                })
            })
            .collect();

        for i in 0..total {
            while tx.push(i).is_err() {
                std::thread::yield_now();
            }
        }
        done.store(true, Ordering::Release);

        let mut all = Vec::new();
        for w in workers {
            let seen = w.join().unwrap();
            // Each consumer observes an increasing subsequence.
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        assert_eq!(all.len() as u64, total, "no element lost or duplicated");
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(distinct.len() as u64, total);
    }
}
