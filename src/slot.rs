//! Tagged slot cells shared by every queue variant.
//!
//! A slot pairs an atomic state tag with an unsynchronized value cell. The
//! tag carries the cross-thread protocol: an element write is a plain value
//! store followed by a release store of [`READY`]; taking an element is a
//! plain value read followed by a release store of [`EMPTY`], which hands
//! the slot back to the producer side. Growable queues additionally use
//! [`JUMP`] to redirect the consumer to the next linked chunk.
//!
//! The tag ordering discipline is fixed: acquire on the state loads that
//! gate element reads, release on the state stores that publish element
//! writes.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};

/// No element; the slot is writable by the producer side.
pub(crate) const EMPTY: u8 = 0;

/// An element is present and visible.
pub(crate) const READY: u8 = 1;

/// The consumer must follow the chunk link and re-read at the same logical
/// index in the next chunk. Only growable variants ever store this.
pub(crate) const JUMP: u8 = 2;

/// One element cell with its protocol tag.
pub(crate) struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: Slot is shared across threads, but the value cell is only touched
// by the thread that the state protocol says owns it: EMPTY slots belong to
// the producer side, READY slots to the (single) claimant on the consumer
// side. The acquire/release pairing on `state` is the synchronization edge.
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for Slot<T> {}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub(crate) fn state(&self, order: Ordering) -> u8 {
        self.state.load(order)
    }

    /// Publishes an element: plain value write, then a release store of
    /// [`READY`] so the write is visible to whoever observes the tag.
    ///
    /// # Safety
    ///
    /// The slot must be [`EMPTY`] and owned by the caller (no concurrent
    /// writer for this slot).
    #[inline]
    pub(crate) unsafe fn write(&self, item: T) {
        // SAFETY: per the contract, no other thread reads or writes the
        // value cell until READY is published below.
        unsafe { (*self.value.get()).write(item) };
        self.state.store(READY, Ordering::Release);
    }

    /// Takes the element out and releases the slot with an [`EMPTY`] store.
    ///
    /// # Safety
    ///
    /// The slot must be [`READY`] and exclusively claimed by the caller,
    /// with the element write ordered-visible (acquire on the tag or on an
    /// index publication that followed it).
    #[inline]
    pub(crate) unsafe fn take(&self) -> T {
        // SAFETY: the claimant owns the slot; the producer will not touch
        // the value cell again until EMPTY is published below.
        let item = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(EMPTY, Ordering::Release);
        item
    }

    /// Borrows the element without removing it.
    ///
    /// # Safety
    ///
    /// Same visibility requirements as [`Slot::take`], and the slot must not
    /// be taken or overwritten while the borrow lives (single-consumer
    /// variants enforce this through `&mut` on the consumer handle).
    #[inline]
    pub(crate) unsafe fn element(&self) -> &T {
        // SAFETY: READY guarantees the value is initialized.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Flags the slot as a chunk redirect (release, so the link and the
    /// pending element published before it are visible first).
    ///
    /// # Safety
    ///
    /// The slot must be [`EMPTY`] and owned by the caller.
    #[inline]
    pub(crate) unsafe fn mark_jump(&self) {
        self.state.store(JUMP, Ordering::Release);
    }

    /// Drops the contained element if one is present. Exclusive access only
    /// (used on teardown paths).
    pub(crate) fn drop_element_in_place(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means the value is initialized, and `&mut self`
            // means nobody else can observe the slot.
            unsafe { self.value.get_mut().assume_init_drop() };
            *self.state.get_mut() = EMPTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_take_round_trip() {
        let slot: Slot<String> = Slot::new();
        assert_eq!(slot.state(Ordering::Relaxed), EMPTY);

        unsafe { slot.write("hello".to_string()) };
        assert_eq!(slot.state(Ordering::Relaxed), READY);
        assert_eq!(unsafe { slot.element() }, "hello");

        assert_eq!(unsafe { slot.take() }, "hello");
        assert_eq!(slot.state(Ordering::Relaxed), EMPTY);
    }

    #[test]
    fn teardown_drops_pending_elements() {
        use std::sync::Arc;

        let witness = Arc::new(());
        let mut slot: Slot<Arc<()>> = Slot::new();
        unsafe { slot.write(Arc::clone(&witness)) };
        assert_eq!(Arc::strong_count(&witness), 2);

        slot.drop_element_in_place();
        assert_eq!(Arc::strong_count(&witness), 1);

        // Idempotent on an already-empty slot.
        slot.drop_element_in_place();
    }
}
