//! Unbounded wait-free SPSC queue over linked chunks.
//!
//! # Overview
//!
//! - [`Producer`] - write end (exactly one per queue); `push` never fails
//! - [`Consumer`] - read end (exactly one per queue)
//! - Wait-free: no CAS anywhere, growth is a plain allocate-and-link
//!
//! The queue starts with one chunk and reuses it as a ring while the
//! consumer keeps up. When the producer catches the consumer's tail within
//! the current chunk, it allocates a fresh same-size chunk, publishes the
//! element there, links it, and leaves a jump marker behind for the
//! consumer. The look-ahead probe (a quarter chunk) keeps the common case
//! on the no-growth fast path.
//!
//! One slot of slack is maintained per chunk so a jump marker always has an
//! empty cell to land in; a chunk therefore never holds more than
//! `capacity - 1` elements at once.
//!
//! # Example
//!
//! ```
//! let (mut tx, mut rx) = weft::spsc::unbounded::channel::<u64>(8)?;
//!
//! for i in 0..100 {
//!     tx.push(i); // never fails, the queue grows
//! }
//! for i in 0..100 {
//!     assert_eq!(rx.pop(), Some(i));
//! }
//! assert_eq!(rx.pop(), None);
//! # Ok::<(), weft::CapacityError>(())
//! ```

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::chunk::Chunk;
use crate::ring::{self, CapacityError, FILL_BATCH};
use crate::slot::{EMPTY, READY};
use crate::trace;
use crate::wait::{ExitCondition, WaitStrategy};

/// Producer-side hot counter, isolated on its own cache line.
#[repr(align(64))]
struct ProducerState {
    /// Next logical index to write; published after the element.
    index: AtomicU64,
}

/// Consumer-side hot state, isolated on its own cache line.
#[repr(align(64))]
struct ConsumerState<T> {
    /// Next logical index to read. Owned by the consumer.
    index: AtomicU64,
    /// The chunk the consumer is currently draining. Only the consumer
    /// touches this cursor; it lives in the shared state so teardown can
    /// walk the chain.
    chunk: UnsafeCell<*mut Chunk<T>>,
}

struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState<T>,
    chunk_capacity: usize,
    look_ahead: u64,
}

// SAFETY: the slot tags and the chunk-link protocol mediate all
// cross-thread access; the consumer chunk cursor is only touched by the
// single consumer (and by teardown, which has exclusive access).
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: teardown has exclusive access; the chain starting at the
        // consumer's chunk covers every live chunk.
        unsafe { Chunk::retire_chain(*self.consumer.chunk.get_mut()) };
    }
}

/// Write end of the queue. Not `Clone`: one producer thread per queue.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    /// The chunk the producer is currently filling.
    chunk: *mut Chunk<T>,
    /// Producer-local copy of its own index; the atomic is only written.
    index: u64,
    /// Indices below this are known to map to free slots in the current
    /// chunk (with the jump-marker slack already subtracted).
    limit: u64,
}

// SAFETY: the chunk pointer is owned queue storage kept alive by the ring
// (the consumer only retires chunks the producer has already left).
unsafe impl<T: Send> Send for Producer<T> {}

/// Read end of the queue. Not `Clone`: one consumer thread per queue.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    /// Consumer-local copy of its own index; the atomic is only written.
    index: u64,
}

/// Creates an unbounded SPSC queue growing in chunks of at least
/// `chunk_capacity` slots (rounded up to a power of two).
///
/// # Errors
///
/// Returns [`CapacityError`] if `chunk_capacity < 2`.
pub fn channel<T: Send>(
    chunk_capacity: usize,
) -> Result<(Producer<T>, Consumer<T>), CapacityError> {
    let chunk_capacity = ring::checked_capacity(chunk_capacity)?;
    trace::trace!(chunk_capacity, "spsc unbounded channel created");

    let first = Chunk::allocate(chunk_capacity);
    let ring = Arc::new(Ring {
        producer: ProducerState {
            index: AtomicU64::new(0),
        },
        consumer: ConsumerState {
            index: AtomicU64::new(0),
            chunk: UnsafeCell::new(first),
        },
        chunk_capacity,
        look_ahead: ring::look_ahead_step(chunk_capacity),
    });

    let producer = Producer {
        ring: Arc::clone(&ring),
        chunk: first,
        index: 0,
        limit: chunk_capacity as u64 - 1,
    };
    let consumer = Consumer { ring, index: 0 };

    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Pushes an element; never fails, the queue grows instead (wait-free).
    #[inline]
    pub fn push(&mut self, item: T) {
        self.write_unpublished(item);
        self.ring.producer.index.store(self.index, Ordering::Release);
    }

    /// Pushes `batch` supplied elements, publishing the producer index once
    /// for the whole batch. Always claims the full batch.
    pub fn fill(&mut self, mut supplier: impl FnMut() -> T, batch: usize) -> usize {
        for _ in 0..batch {
            self.write_unpublished(supplier());
        }
        self.ring.producer.index.store(self.index, Ordering::Release);
        batch
    }

    /// Keeps filling from `supplier` until `exit` says stop. The queue is
    /// unbounded, so `wait` is only consulted if the supplier itself is the
    /// pacing mechanism; every batch attempt makes progress.
    pub fn fill_blocking(
        &mut self,
        mut supplier: impl FnMut() -> T,
        _wait: &impl WaitStrategy,
        exit: &impl ExitCondition,
    ) -> u64 {
        let mut total = 0;
        while exit.keep_running() {
            total += self.fill(&mut supplier, FILL_BATCH) as u64;
        }
        total
    }

    fn write_unpublished(&mut self, item: T) {
        let index = self.index;
        // SAFETY: the producer's chunk stays alive until the consumer
        // follows a jump marker out of it, which requires consuming the
        // element this call is about to write.
        let chunk = unsafe { &*self.chunk };
        let mask = chunk.mask();
        if index < self.limit {
            // SAFETY: every index below the limit maps to an EMPTY slot in
            // the current chunk, owned by this producer.
            unsafe { chunk.slot(ring::offset(index, mask)).write(item) };
        } else {
            self.write_slow(chunk, index, mask, item);
        }
        self.index = index + 1;
    }

    /// Probes slot states to either re-arm the limit or grow the queue.
    #[cold]
    fn write_slow(&mut self, chunk: &Chunk<T>, index: u64, mask: u64, item: T) {
        let step = self.ring.look_ahead;
        if chunk
            .slot(ring::offset(index + step, mask))
            .state(Ordering::Acquire)
            == EMPTY
        {
            // Plenty of room; the -1 keeps the one-slot jump-marker slack.
            self.limit = index + step - 1;
            // SAFETY: the free probe slot proves the consumer has drained
            // past every occupant of the spanned slots.
            unsafe { chunk.slot(ring::offset(index, mask)).write(item) };
        } else if chunk
            .slot(ring::offset(index + 1, mask))
            .state(Ordering::Acquire)
            == EMPTY
        {
            // Room for exactly this element without eating the slack slot.
            // SAFETY: the next slot free implies this slot's previous
            // occupant was consumed first (FIFO).
            unsafe { chunk.slot(ring::offset(index, mask)).write(item) };
        } else {
            self.link_new_chunk(chunk, index, mask, item);
        }
    }

    /// Grows the queue: the element goes into a fresh chunk, the link is
    /// published, and only then does the jump marker go live in the old
    /// chunk. That order is what lets the consumer treat a jump as a
    /// guarantee that the next chunk and its first element are visible.
    #[cold]
    fn link_new_chunk(&mut self, old: &Chunk<T>, index: u64, mask: u64, item: T) {
        let capacity = self.ring.chunk_capacity;
        let new = Chunk::allocate(capacity);
        trace::debug!(capacity, index, "spsc unbounded queue linked a new chunk");

        // SAFETY: the fresh chunk is unshared until the link below.
        unsafe { (*new).slot(ring::offset(index, mask)).write(item) };
        old.publish_next(new);
        // SAFETY: the slack discipline keeps this slot EMPTY; the release
        // store orders it after the link and element publications above.
        unsafe { old.slot(ring::offset(index, mask)).mark_jump() };

        self.chunk = new;
        self.limit = index + capacity as u64 - 1;
    }

    /// Number of elements currently queued (best effort under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        // Producer first: a racing estimate then undercounts rather than
        // overcounts.
        let producer = self.ring.producer.index.load(Ordering::Acquire);
        let consumer = self.ring.consumer.index.load(Ordering::Acquire);
        producer.saturating_sub(consumer) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Always `None`: the queue has no capacity bound.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        None
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to pop the next element (wait-free).
    #[inline]
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        let index = self.index;
        // SAFETY: the single consumer owns the chunk cursor.
        let chunk_ptr = unsafe { *self.ring.consumer.chunk.get() };
        let chunk = unsafe { &*chunk_ptr };
        let slot = chunk.slot(ring::offset(index, chunk.mask()));
        match slot.state(Ordering::Acquire) {
            EMPTY => None,
            READY => {
                // SAFETY: READY acquired above publishes the element write;
                // the single consumer exclusively owns READY slots.
                let item = unsafe { slot.take() };
                self.advance(index);
                Some(item)
            }
            _ => Some(self.follow_jump(chunk_ptr, index)),
        }
    }

    /// Borrows the next element without removing it, following a jump
    /// marker if one is pending.
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        let index = self.index;
        // SAFETY: the single consumer owns the chunk cursor.
        let chunk_ptr = unsafe { *self.ring.consumer.chunk.get() };
        let chunk = unsafe { &*chunk_ptr };
        let slot = chunk.slot(ring::offset(index, chunk.mask()));
        match slot.state(Ordering::Acquire) {
            EMPTY => None,
            // SAFETY: as in `pop`; `&mut self` keeps the borrow exclusive.
            READY => Some(unsafe { slot.element() }),
            _ => {
                let next = self.switch_chunk(chunk_ptr);
                let slot = next.slot(ring::offset(index, next.mask()));
                assert_eq!(
                    slot.state(Ordering::Acquire),
                    READY,
                    "chunk link published without its first element"
                );
                // SAFETY: as in `pop`.
                Some(unsafe { slot.element() })
            }
        }
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

    #[cold]
    fn follow_jump(&mut self, old: *mut Chunk<T>, index: u64) -> T {
        let next = self.switch_chunk(old);
        let slot = next.slot(ring::offset(index, next.mask()));
        assert_eq!(
            slot.state(Ordering::Acquire),
            READY,
            "chunk link published without its first element"
        );
        // SAFETY: READY checked above; the single consumer owns the slot.
        let item = unsafe { slot.take() };
        self.advance(index);
        item
    }

    /// Follows the link out of `old`, retires it, and returns the successor.
    fn switch_chunk(&mut self, old: *mut Chunk<T>) -> &Chunk<T> {
        // SAFETY: `old` is the consumer's current chunk; the jump marker was
        // acquire-loaded, so the link published before it is visible.
        let next = unsafe { (*old).load_next() };
        assert!(
            !next.is_null(),
            "jump marker published without a linked chunk"
        );
        // SAFETY: the single consumer owns the chunk cursor.
        unsafe { *self.ring.consumer.chunk.get() = next };
        // SAFETY: every slot below the jump index was taken and the producer
        // left the chunk when it published the link; nobody can touch it.
        unsafe { Chunk::retire(old) };
        // SAFETY: the successor is live until this consumer retires it.
        unsafe { &*next }
    }

    #[inline]
    fn advance(&mut self, index: u64) {
        self.index = index + 1;
        self.ring.consumer.index.store(index + 1, Ordering::Release);
    }

    /// Removes and returns queued elements until the queue reads empty.
    pub fn drain_iter(&mut self) -> Drain<'_, T> {
        Drain { consumer: self }
    }

    /// Number of elements currently queued (best effort under concurrency).
    #[must_use]
    pub fn len(&self) -> usize {
        // Producer first: a racing estimate then undercounts rather than
        // overcounts.
        let producer = self.ring.producer.index.load(Ordering::Acquire);
        let consumer = self.ring.consumer.index.load(Ordering::Acquire);
        producer.saturating_sub(consumer) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Always `None`: the queue has no capacity bound.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        None
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
        (self.consumer.len(), None)
    }
}
