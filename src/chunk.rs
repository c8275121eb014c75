//! Linked backing chunks for the growable queue variants.
//!
//! A growable queue starts with one chunk and grows by linking fresh chunks,
//! never copying elements. The link lives in the chunk header as an atomic
//! pointer; publication order is the load-bearing invariant: the next chunk
//! and the pending element inside it are release-published *before* the
//! [`JUMP`](crate::slot::JUMP) tag that tells the consumer to follow the
//! link. Chunks are heap-allocated behind raw pointers because ownership
//! migrates: producers publish them, the single consumer retires them once
//! it has drained past.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::slot::Slot;

/// One fixed-size segment of a growable queue's backing storage.
pub(crate) struct Chunk<T> {
    next: AtomicPtr<Chunk<T>>,
    slots: Box<[Slot<T>]>,
}

impl<T> Chunk<T> {
    /// Heap-allocates a chunk with `capacity` empty slots (a power of two)
    /// and leaks it to a raw pointer for shared publication.
    pub(crate) fn allocate(capacity: usize) -> *mut Chunk<T> {
        debug_assert!(capacity.is_power_of_two());
        let chunk = Chunk {
            next: AtomicPtr::new(ptr::null_mut()),
            slots: (0..capacity).map(|_| Slot::new()).collect(),
        };
        Box::into_raw(Box::new(chunk))
    }

    /// `capacity - 1`, for the shared masking math.
    #[inline]
    pub(crate) fn mask(&self) -> u64 {
        (self.slots.len() - 1) as u64
    }

    #[inline]
    pub(crate) fn slot(&self, offset: usize) -> &Slot<T> {
        &self.slots[offset]
    }

    /// Release-publishes the link to the successor chunk. Must happen before
    /// the `JUMP` tag that makes a reader follow it.
    #[inline]
    pub(crate) fn publish_next(&self, next: *mut Chunk<T>) {
        self.next.store(next, Ordering::Release);
    }

    /// Acquire-loads the successor link; pairs with [`Chunk::publish_next`].
    #[inline]
    pub(crate) fn load_next(&self) -> *mut Chunk<T> {
        self.next.load(Ordering::Acquire)
    }

    /// Frees a fully drained chunk.
    ///
    /// # Safety
    ///
    /// `chunk` must have come from [`Chunk::allocate`], every slot must have
    /// been taken (no element left to drop), and no other thread may still
    /// dereference it. The single consumer satisfies this after it has
    /// followed the chunk's jump marker.
    pub(crate) unsafe fn retire(chunk: *mut Chunk<T>) {
        // SAFETY: exclusive ownership per the contract; slots hold no
        // initialized values, so dropping the box drops no elements.
        drop(unsafe { Box::from_raw(chunk) });
    }

    /// Frees an entire chunk chain starting at `chunk`, dropping any
    /// elements still in place. Teardown only: requires exclusive access to
    /// the whole queue.
    pub(crate) unsafe fn retire_chain(chunk: *mut Chunk<T>) {
        let mut current = chunk;
        while !current.is_null() {
            // SAFETY: teardown holds exclusive access; each pointer in the
            // chain came from `allocate` and is freed exactly once.
            let mut boxed = unsafe { Box::from_raw(current) };
            current = *boxed.next.get_mut();
            for slot in boxed.slots.iter_mut() {
                slot.drop_element_in_place();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn chain_teardown_drops_straggler_elements() {
        let witness = Arc::new(());

        let first = Chunk::allocate(4);
        let second = Chunk::allocate(4);
        unsafe {
            (*first).slot(1).write(Arc::clone(&witness));
            (*second).slot(0).write(Arc::clone(&witness));
            (*first).publish_next(second);
        }
        assert_eq!(Arc::strong_count(&witness), 3);

        unsafe { Chunk::retire_chain(first) };
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn link_round_trip() {
        let first: *mut Chunk<()> = Chunk::allocate(2);
        let second = Chunk::allocate(2);
        unsafe {
            assert!((*first).load_next().is_null());
            (*first).publish_next(second);
            assert_eq!((*first).load_next(), second);
            Chunk::retire_chain(first);
        }
    }
}
