//! Growable lock-free MPSC queue over linked chunks.
//!
//! # Overview
//!
//! - [`Producer`] - write end; `Clone`, any number of producer threads
//! - [`Consumer`] - read end (exactly one per queue)
//! - [`GrowthPolicy`] - injected growth rules: [`Growable`] doubles chunks
//!   up to a capacity ceiling, [`Unbounded`] links same-size chunks forever
//! - Producers are lock-free (CAS retry); the consumer is wait-free apart
//!   from bounded spins on in-flight publications
//!
//! # Algorithm
//!
//! The producer index is stored doubled: even values are stable, an odd
//! value means one producer holds the resize right and everyone else spins.
//! The fast path is a single CAS from `n` to `n + 2` followed by a release
//! store of the element into the slot claimed by `n` - the index becomes
//! visible *before* the element, so the consumer spins briefly when it
//! catches a claim mid-publication.
//!
//! Growth never copies: the resize owner allocates a new chunk, publishes
//! the pending element there, links the old chunk to the new one, re-arms
//! the shared producer limit, clears the resize flag, and only then leaves
//! a jump marker in the old chunk. A consumer that sees the marker is
//! therefore guaranteed to find the link and the element already visible.
//!
//! Chunks keep one slot of slack while growth is still possible so the jump
//! marker always lands in an empty cell.
//!
//! # Example
//!
//! ```
//! let (tx, mut rx) = weft::mpsc::unbounded::<u64>(64)?;
//!
//! let handles: Vec<_> = (0..3)
//!     .map(|p| {
//!         let mut tx = tx.clone();
//!         std::thread::spawn(move || {
//!             for i in 0..100 {
//!                 tx.push(p * 1000 + i).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for h in handles {
//!     h.join().unwrap();
//! }
//!
//! let mut total = 0;
//! while rx.pop().is_some() {
//!     total += 1;
//! }
//! assert_eq!(total, 300);
//! # Ok::<(), weft::CapacityError>(())
//! ```

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::chunk::Chunk;
use crate::ring::{self, CapacityError, FILL_BATCH, Full};
use crate::slot::{EMPTY, JUMP, READY};
use crate::trace;
use crate::wait::{ExitCondition, WaitStrategy};

/// Growth rules injected into the queue at construction.
///
/// The hooks decide how big the next chunk is, how much of a chunk is
/// usable before growth must kick in, and how much total headroom is left
/// before enqueues start failing.
pub trait GrowthPolicy: Send + Sync + 'static {
    /// Capacity of the chunk that replaces a full `current`-sized chunk.
    fn next_chunk_capacity(&self, current: usize) -> usize;

    /// Usable element capacity of a chunk of `chunk_capacity` slots.
    /// Policies that may still grow reserve one slot of slack for the jump
    /// marker; a terminal chunk may use every slot.
    fn usable_chunk_capacity(&self, chunk_capacity: usize) -> usize;

    /// Elements that may still be enqueued when `len` are queued.
    fn available(&self, len: usize) -> usize;

    /// Total capacity ceiling; `None` when growth is unbounded.
    fn max_capacity(&self) -> Option<usize>;
}

/// Doubles the chunk capacity on every resize until the ceiling is reached.
#[derive(Debug, Clone, Copy)]
pub struct Growable {
    max_capacity: usize,
}

impl GrowthPolicy for Growable {
    fn next_chunk_capacity(&self, current: usize) -> usize {
        (current * 2).min(self.max_capacity)
    }

    fn usable_chunk_capacity(&self, chunk_capacity: usize) -> usize {
        if chunk_capacity >= self.max_capacity {
            // The terminal chunk never hosts a jump marker.
            chunk_capacity
        } else {
            chunk_capacity - 1
        }
    }

    fn available(&self, len: usize) -> usize {
        self.max_capacity.saturating_sub(len)
    }

    fn max_capacity(&self) -> Option<usize> {
        Some(self.max_capacity)
    }
}

/// Links same-size chunks forever; enqueues never fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl GrowthPolicy for Unbounded {
    fn next_chunk_capacity(&self, current: usize) -> usize {
        current
    }

    fn usable_chunk_capacity(&self, chunk_capacity: usize) -> usize {
        chunk_capacity - 1
    }

    fn available(&self, _len: usize) -> usize {
        usize::MAX
    }

    fn max_capacity(&self) -> Option<usize> {
        None
    }
}

/// The producers' hot counter, isolated on its own cache line.
///
/// Stored doubled: `index / 2` is the logical index, and the low bit is the
/// transient resize flag. An odd value is never a stable index; any reader
/// of one retries instead of using it.
#[repr(align(64))]
struct ProducerIndex {
    index: AtomicU64,
}

/// Producer-shared cold(er) fields, off the index's cache line.
#[repr(align(64))]
struct ProducerFields<T> {
    /// CAS-re-armed upper bound (doubled) below which the fast path may
    /// claim indices without consulting the consumer index.
    limit: AtomicU64,
    /// The chunk currently receiving claims.
    chunk: AtomicPtr<Chunk<T>>,
    /// `capacity - 1` of that chunk. Kept beside the pointer because a
    /// producer must not dereference a chunk before a successful index CAS
    /// validates its snapshot.
    mask: AtomicU64,
}

/// Consumer-side hot state, isolated on its own cache line.
#[repr(align(64))]
struct ConsumerFields<T> {
    /// Next logical index (doubled) to read. Owned by the consumer.
    index: AtomicU64,
    /// The chunk the consumer is currently draining; only the consumer
    /// touches this cursor, teardown walks the chain from it.
    chunk: UnsafeCell<*mut Chunk<T>>,
}

struct Ring<T, P: GrowthPolicy> {
    producer_index: ProducerIndex,
    producer: ProducerFields<T>,
    consumer: ConsumerFields<T>,
    policy: P,
}

// SAFETY: all cross-thread access goes through the atomics and the slot-tag
// protocol; the consumer chunk cursor is only touched by the single
// consumer (and teardown, which is exclusive).
unsafe impl<T: Send, P: GrowthPolicy> Sync for Ring<T, P> {}
unsafe impl<T: Send, P: GrowthPolicy> Send for Ring<T, P> {}

impl<T, P: GrowthPolicy> Drop for Ring<T, P> {
    fn drop(&mut self) {
        // SAFETY: teardown has exclusive access; the chain starting at the
        // consumer's chunk covers every live chunk.
        unsafe { Chunk::retire_chain(*self.consumer.chunk.get_mut()) };
    }
}

/// Outcome of the producer slow path.
enum Extend {
    /// State moved under us; reread everything.
    Retry,
    /// The limit was re-armed; the fast path may claim again.
    Proceed,
    /// The absolute growth ceiling is reached.
    Full,
    /// This producer won the resize right (the index is now odd).
    Resize,
}

impl<T: Send, P: GrowthPolicy> Ring<T, P> {
    /// Slow path once the cached limit is exhausted: re-arm it if the
    /// current chunk still has headroom against the live consumer index,
    /// fail at the ceiling, otherwise contend for the resize right.
    fn try_extend(&self, index: u64, limit: u64, mask: u64) -> Extend {
        let consumer = self.consumer.index.load(Ordering::Acquire);
        let usable2 = (self.policy.usable_chunk_capacity((mask + 1) as usize) as u64) << 1;
        if consumer + usable2 > index {
            // False alarm: the limit was merely stale.
            if self
                .producer
                .limit
                .compare_exchange(limit, consumer + usable2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                Extend::Proceed
            } else {
                Extend::Retry
            }
        } else if self.available(index, consumer) == 0 {
            Extend::Full
        } else if self
            .producer_index
            .index
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            Extend::Resize
        } else {
            Extend::Retry
        }
    }

    fn available(&self, index: u64, consumer: u64) -> u64 {
        let len = (index.saturating_sub(consumer) >> 1) as usize;
        self.policy.available(len) as u64
    }

    /// Grows the queue; runs exactly once per resize, by the producer whose
    /// CAS turned the index odd. The publication order is the protocol:
    /// element into the new chunk, then the link, then the limit, then the
    /// even index (releasing the other producers), and the jump marker
    /// strictly last.
    #[cold]
    fn resize(&self, old: *mut Chunk<T>, old_mask: u64, index: u64, item: T) {
        let old_capacity = (old_mask + 1) as usize;
        let new_capacity = self.policy.next_chunk_capacity(old_capacity);
        let new = Chunk::allocate(new_capacity);
        let new_mask = (new_capacity - 1) as u64;
        trace::debug!(old_capacity, new_capacity, index, "mpsc queue resizing");

        self.producer.chunk.store(new, Ordering::Release);
        self.producer.mask.store(new_mask, Ordering::Release);

        // SAFETY: the fresh chunk is unshared until the link below.
        unsafe {
            (*new)
                .slot(ring::offset_doubled(index, new_mask))
                .write(item)
        };
        // SAFETY: the resize owner exclusively holds the old chunk's link.
        unsafe { (*old).publish_next(new) };

        // Bound the limit by both the new chunk and the remaining headroom,
        // so no producer races ahead of unpublished space.
        let consumer = self.consumer.index.load(Ordering::Acquire);
        let usable2 = (self.policy.usable_chunk_capacity(new_capacity) as u64) << 1;
        let available2 = self.available(index, consumer).saturating_mul(2);
        self.producer
            .limit
            .store(index + usable2.min(available2), Ordering::Release);

        self.producer_index.index.store(index + 2, Ordering::Release);

        // Only now may a reader be told to jump.
        // SAFETY: headroom exhaustion implies this slot's previous occupant
        // was consumed, so the slot is EMPTY and owned by the resize.
        unsafe {
            (*old)
                .slot(ring::offset_doubled(index, old_mask))
                .mark_jump()
        };
    }
}

/// Write end of the queue. `Clone` it freely: any number of producer
/// threads may push concurrently.
pub struct Producer<T: Send, P: GrowthPolicy> {
    ring: Arc<Ring<T, P>>,
}

impl<T: Send, P: GrowthPolicy> Clone for Producer<T, P> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the queue. Not `Clone`: one consumer thread per queue.
pub struct Consumer<T: Send, P: GrowthPolicy> {
    ring: Arc<Ring<T, P>>,
}

/// Creates a growable MPSC queue: chunks double from `initial_chunk` until
/// the total capacity reaches `max_capacity` (both rounded up to powers of
/// two), after which enqueues fail when the queue is full.
///
/// # Errors
///
/// Returns [`CapacityError`] if `initial_chunk < 2` or the rounded
/// `max_capacity` is less than twice the rounded initial chunk.
pub fn growable<T: Send>(
    initial_chunk: usize,
    max_capacity: usize,
) -> Result<(Producer<T, Growable>, Consumer<T, Growable>), CapacityError> {
    let initial = ring::checked_capacity(initial_chunk)?;
    let max = ring::checked_capacity(max_capacity)?;
    if max < initial * 2 {
        return Err(CapacityError::MaxBelowInitial { initial, max });
    }
    Ok(build(initial, Growable { max_capacity: max }))
}

/// Creates an unbounded MPSC queue growing in same-size chunks of
/// `chunk_capacity` slots (rounded up to a power of two); enqueues never
/// fail.
///
/// # Errors
///
/// Returns [`CapacityError`] if `chunk_capacity < 2`.
pub fn unbounded<T: Send>(
    chunk_capacity: usize,
) -> Result<(Producer<T, Unbounded>, Consumer<T, Unbounded>), CapacityError> {
    let capacity = ring::checked_capacity(chunk_capacity)?;
    Ok(build(capacity, Unbounded))
}

fn build<T: Send, P: GrowthPolicy>(
    initial: usize,
    policy: P,
) -> (Producer<T, P>, Consumer<T, P>) {
    trace::trace!(initial, "mpsc channel created");
    let first = Chunk::allocate(initial);
    let limit = (policy.usable_chunk_capacity(initial) as u64) << 1;

    let ring = Arc::new(Ring {
        producer_index: ProducerIndex {
            index: AtomicU64::new(0),
        },
        producer: ProducerFields {
            limit: AtomicU64::new(limit),
            chunk: AtomicPtr::new(first),
            mask: AtomicU64::new((initial - 1) as u64),
        },
        consumer: ConsumerFields {
            index: AtomicU64::new(0),
            chunk: UnsafeCell::new(first),
        },
        policy,
    });

    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

impl<T: Send, P: GrowthPolicy> Producer<T, P> {
    /// Attempts to push an element (lock-free).
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the element only when the absolute growth
    /// ceiling is reached; every other contention resolves by retrying.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        let ring = &*self.ring;
        loop {
            let limit = ring.producer.limit.load(Ordering::Acquire);
            let index = ring.producer_index.index.load(Ordering::Acquire);
            if index & 1 == 1 {
                // Another producer holds the resize flag.
                std::hint::spin_loop();
                continue;
            }
            // Snapshot after the index read: a successful CAS on the index
            // below proves neither was replaced in between, because every
            // resize moves the index first.
            let mask = ring.producer.mask.load(Ordering::Acquire);
            let chunk = ring.producer.chunk.load(Ordering::Acquire);
            if limit <= index {
                match ring.try_extend(index, limit, mask) {
                    Extend::Retry => continue,
                    Extend::Full => return Err(Full(item)),
                    Extend::Resize => {
                        ring.resize(chunk, mask, index, item);
                        return Ok(());
                    }
                    Extend::Proceed => {}
                }
            }
            if ring
                .producer_index
                .index
                .compare_exchange_weak(index, index + 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: the successful CAS claimed this index and proved
                // the chunk snapshot current; the claimed slot is EMPTY and
                // exclusively ours until the release store inside `write`.
                unsafe {
                    (*chunk)
                        .slot(ring::offset_doubled(index, mask))
                        .write(item)
                };
                return Ok(());
            }
        }
    }

    /// Pushes up to `batch` supplied elements, claiming the whole range
    /// with a single index CAS. Returns how many were pushed; the count is
    /// short when the cached limit, a resize, or the capacity ceiling
    /// intervenes (zero only at the ceiling).
    pub fn fill(&mut self, mut supplier: impl FnMut() -> T, batch: usize) -> usize {
        if batch == 0 {
            return 0;
        }
        let ring = &*self.ring;
        loop {
            let limit = ring.producer.limit.load(Ordering::Acquire);
            let index = ring.producer_index.index.load(Ordering::Acquire);
            if index & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let mask = ring.producer.mask.load(Ordering::Acquire);
            let chunk = ring.producer.chunk.load(Ordering::Acquire);
            let claim = (limit.saturating_sub(index) >> 1).min(batch as u64);
            if claim == 0 {
                match ring.try_extend(index, limit, mask) {
                    Extend::Retry | Extend::Proceed => continue,
                    Extend::Full => return 0,
                    Extend::Resize => {
                        ring.resize(chunk, mask, index, supplier());
                        return 1;
                    }
                }
            } else if ring
                .producer_index
                .index
                .compare_exchange_weak(index, index + claim * 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                for i in 0..claim {
                    // SAFETY: the CAS claimed the whole range below the
                    // limit and validated the chunk snapshot.
                    unsafe {
                        (*chunk)
                            .slot(ring::offset_doubled(index + 2 * i, mask))
                            .write(supplier())
                    };
                }
                return claim as usize;
            }
        }
    }

    /// Keeps filling from `supplier` until `exit` says stop, idling via
    /// `wait` whenever a whole batch attempt makes no progress (i.e. the
    /// queue sits at its ceiling). Returns the total number pushed.
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
        (ring::stabilized_size(&self.ring.producer_index.index, &self.ring.consumer.index) >> 1)
            as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let ring = &*self.ring;
        ring.consumer.index.load(Ordering::Acquire)
            == ring.producer_index.index.load(Ordering::Acquire)
    }

    /// The capacity ceiling; `None` when growth is unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.ring.policy.max_capacity()
    }
}

impl<T: Send, P: GrowthPolicy> Consumer<T, P> {
    /// Attempts to pop the next element.
    ///
    /// Wait-free except for a bounded spin when a producer has claimed an
    /// index but not yet landed its element.
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let index = ring.consumer.index.load(Ordering::Relaxed);
        // SAFETY: the single consumer owns the chunk cursor.
        let chunk_ptr = unsafe { *ring.consumer.chunk.get() };
        let chunk = unsafe { &*chunk_ptr };
        let slot = chunk.slot(ring::offset_doubled(index, chunk.mask()));
        let mut state = slot.state(Ordering::Acquire);
        if state == EMPTY {
            if ring.producer_index.index.load(Ordering::Acquire) == index {
                return None;
            }
            // The index has passed this position: a producer claimed it and
            // its element (or jump marker) is a handful of instructions
            // away.
            state = self.spin_for_publication(slot);
        }
        if state == JUMP {
            return Some(self.follow_jump(chunk_ptr, index));
        }
        // SAFETY: READY acquired above publishes the element; the single
        // consumer exclusively owns READY slots.
        let item = unsafe { slot.take() };
        ring.consumer.index.store(index + 2, Ordering::Release);
        Some(item)
    }

    /// Borrows the next element without removing it, following a jump
    /// marker if one is pending.
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        let ring = &*self.ring;
        let index = ring.consumer.index.load(Ordering::Relaxed);
        // SAFETY: the single consumer owns the chunk cursor.
        let chunk_ptr = unsafe { *ring.consumer.chunk.get() };
        let chunk = unsafe { &*chunk_ptr };
        let slot = chunk.slot(ring::offset_doubled(index, chunk.mask()));
        let mut state = slot.state(Ordering::Acquire);
        if state == EMPTY {
            if ring.producer_index.index.load(Ordering::Acquire) == index {
                return None;
            }
            state = self.spin_for_publication(slot);
        }
        if state == JUMP {
            let next = self.switch_chunk(chunk_ptr);
            let slot = next.slot(ring::offset_doubled(index, next.mask()));
            assert_eq!(
                slot.state(Ordering::Acquire),
                READY,
                "chunk link published without its pending element"
            );
            // SAFETY: as in `pop`; `&mut self` keeps the borrow exclusive.
            return Some(unsafe { slot.element() });
        }
        // SAFETY: as in `pop`.
        Some(unsafe { slot.element() })
    }

    #[inline]
    fn spin_for_publication(&self, slot: &crate::slot::Slot<T>) -> u8 {
        loop {
            let state = slot.state(Ordering::Acquire);
            if state != EMPTY {
                return state;
            }
            std::hint::spin_loop();
        }
    }

    #[cold]
    fn follow_jump(&mut self, old: *mut Chunk<T>, index: u64) -> T {
        let next = self.switch_chunk(old);
        let slot = next.slot(ring::offset_doubled(index, next.mask()));
        assert_eq!(
            slot.state(Ordering::Acquire),
            READY,
            "chunk link published without its pending element"
        );
        // SAFETY: READY checked above; the single consumer owns the slot.
        let item = unsafe { slot.take() };
        self.ring.consumer.index.store(index + 2, Ordering::Release);
        item
    }

    /// Follows the link out of `old`, retires it, and returns the successor.
    fn switch_chunk(&mut self, old: *mut Chunk<T>) -> &Chunk<T> {
        // SAFETY: `old` is the consumer's current chunk; the jump marker
        // was acquire-loaded, so the link published before it is visible.
        let next = unsafe { (*old).load_next() };
        assert!(
            !next.is_null(),
            "jump marker published without a linked chunk"
        );
        // SAFETY: the single consumer owns the chunk cursor.
        unsafe { *self.ring.consumer.chunk.get() = next };
        // SAFETY: every index of the old chunk below the jump was consumed,
        // and producers whose snapshots could reference it can no longer
        // pass their validating CAS; the chunk is unreachable.
        unsafe { Chunk::retire(old) };
        // SAFETY: the successor is live until this consumer retires it.
        unsafe { &*next }
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

    /// Removes and returns queued elements until the queue reads empty.
    pub fn drain_iter(&mut self) -> Drain<'_, T, P> {
        Drain { consumer: self }
    }

    /// Number of elements currently queued (best effort; biased toward
    /// undercount under races, with a bounded stabilization retry).
    #[must_use]
    pub fn len(&self) -> usize {
        (ring::stabilized_size(&self.ring.producer_index.index, &self.ring.consumer.index) >> 1)
            as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let ring = &*self.ring;
        ring.consumer.index.load(Ordering::Acquire)
            == ring.producer_index.index.load(Ordering::Acquire)
    }

    /// The capacity ceiling; `None` when growth is unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.ring.policy.max_capacity()
    }
}

/// Draining iterator returned by [`Consumer::drain_iter`].
pub struct Drain<'a, T: Send, P: GrowthPolicy> {
    consumer: &'a mut Consumer<T, P>,
}

impl<T: Send, P: GrowthPolicy> Iterator for Drain<'_, T, P> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.consumer.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.consumer.len(), None)
    }
}
