use crate::invariants::{debug_assert_slot_ticket, debug_assert_unpublished};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// A frame is one 64-slot chunk of an append-only stream. Writers reserve a
// slot with a fetch-add ticket, fill it, then publish it by OR-ing the
// slot's bit into the occupancy mask:
//
// **Writer (publish path):**
// 1. `count.fetch_add(1)` with Relaxed - the ticket alone assigns slot
//    ownership; no data is transferred through it
// 2. Write the value into `slots[ticket]` (exclusive by ticket ownership)
// 3. `mask.fetch_or(1 << ticket)` with Release - publishes the slot write
//
// **Reader (consume path):**
// 1. Load `mask` with Acquire (synchronizes with the writer's Release)
// 2. If the slot's bit is set, read `slots[i]` (immutable from now on)
//
// **Rollover:**
// The single writer whose ticket equals the slot count creates the
// successor frame with its value already published in slot 0, then
// installs it via `next`. `OnceLock` gives the store/load pair
// Release/Acquire ordering, so observing `next` implies slot 0 of the
// successor is readable. Writers with larger tickets spin until `next`
// appears and retry there; rollover is wait-free for everyone else.
//
// **Slot invariants:**
// - A slot is written exactly once, by the ticket owner, before its mask
//   bit is set; from then on it is immutable for the frame's lifetime.
// - `count` is monotone; `next`, once set, never changes.
//
// =============================================================================

/// Number of value slots per frame. The occupancy mask is a `u64`, one
/// bit per slot.
pub(crate) const SLOTS: usize = 64;

/// Park/wake pad shared by a stream and all of its frames.
///
/// The mutex protects nothing but the condition variable handshake: the
/// data path is atomics only. Publishers take the lock around the
/// broadcast so a consumer between its predicate check and its wait
/// cannot miss the wakeup.
pub(crate) struct Notify {
    pub(crate) mu: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl Notify {
    pub(crate) fn new() -> Self {
        Self {
            mu: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake every parked consumer. Consumers cannot tell which slot was
    /// just published, so every publish broadcasts.
    pub(crate) fn broadcast(&self) {
        let _guard = self.mu.lock().unwrap();
        self.cond.notify_all();
    }
}

/// One 64-slot chunk of the stream.
///
/// Frames own their successor, so a cursor holding any frame keeps the
/// rest of the stream reachable. The stream owns the chain root and
/// never frees frames while it lives; dropping it reclaims the prefix
/// up to the earliest frame a live cursor still holds.
pub(crate) struct Frame<T> {
    slots: [UnsafeCell<MaybeUninit<T>>; SLOTS],
    /// Bit i set (Release) only after `slots[i]` is fully written.
    mask: AtomicU64,
    /// Reservation ticket; the fetch-add result names the owned slot.
    count: AtomicU32,
    /// Successor frame; empty until the rollover owner installs it.
    next: OnceLock<Arc<Frame<T>>>,
    /// Park/wake pad of the owning stream. A relation, not ownership.
    notify: Arc<Notify>,
}

// SAFETY: slots are written exactly once by their ticket owner before
// publication and read-only afterwards; all cross-thread handoff goes
// through the mask/next Release-Acquire pairs. `T: Sync` because many
// readers share `&T` to the same slot.
unsafe impl<T: Send + Sync> Send for Frame<T> {}
unsafe impl<T: Send + Sync> Sync for Frame<T> {}

impl<T> Frame<T> {
    /// Creates a frame with `value` already published in slot 0.
    ///
    /// Both the stream's first frame and every rollover frame start this
    /// way, so a visible frame always has at least one readable slot.
    pub(crate) fn with_first(value: T, notify: Arc<Notify>) -> Self {
        let mut frame = Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            mask: AtomicU64::new(1),
            count: AtomicU32::new(1),
            next: OnceLock::new(),
            notify,
        };
        *frame.slots[0].get_mut() = MaybeUninit::new(value);
        frame
    }

    /// Reserve the next slot ticket.
    #[inline]
    pub(crate) fn claim(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed)
    }

    /// Write `value` into the slot named by `ticket` and publish it.
    ///
    /// # Safety
    ///
    /// `ticket` must have been returned by `claim` on this frame and be
    /// `< SLOTS`; the ticket discipline makes the slot exclusively ours.
    pub(crate) unsafe fn publish(&self, ticket: u32, value: T) {
        debug_assert_slot_ticket!(ticket, SLOTS);
        // SAFETY: caller contract - the slot belongs to this ticket and
        // has never been written.
        unsafe { (*self.slots[ticket as usize].get()).write(value) };
        let mask = self.mask.fetch_or(1 << ticket, Ordering::Release);
        debug_assert_unpublished!(mask, ticket);
    }

    /// Whether slot `index` has been published.
    #[inline]
    pub(crate) fn is_published(&self, index: u32) -> bool {
        self.mask.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Borrow the value in slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must have observed `is_published(index)`; the Acquire
    /// load there pairs with the publisher's Release.
    pub(crate) unsafe fn value(&self, index: u32) -> &T {
        // SAFETY: published slots are initialized and immutable.
        unsafe { (*self.slots[index as usize].get()).assume_init_ref() }
    }

    /// Number of slots up to and including the highest published one.
    ///
    /// A straggling writer may leave a lower bit briefly unset; counting
    /// from the top keeps the fill monotone, which is what cursor length
    /// arithmetic needs.
    #[inline]
    pub(crate) fn fill(&self) -> usize {
        (u64::BITS - self.mask.load(Ordering::Acquire).leading_zeros()) as usize
    }

    #[inline]
    pub(crate) fn successor(&self) -> Option<&Arc<Frame<T>>> {
        self.next.get()
    }

    /// Install the successor frame. Called only by the rollover owner.
    pub(crate) fn install_successor(&self, next: Arc<Frame<T>>) {
        let installed = self.next.set(next).is_ok();
        debug_assert!(installed, "successor installed twice");
    }

    #[inline]
    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }
}

impl<T> Drop for Frame<T> {
    fn drop(&mut self) {
        // Drop exactly the published slots. Claimed-but-unpublished
        // tickets never reached a slot write.
        let mask = *self.mask.get_mut();
        for i in 0..SLOTS {
            if mask & (1 << i) != 0 {
                // SAFETY: the bit proves the slot was initialized, and
                // `&mut self` proves no reader remains.
                unsafe { self.slots[i].get_mut().assume_init_drop() };
            }
        }
        // Unlink the chain iteratively so dropping a long stream does
        // not recurse once per frame.
        let mut next = self.next.take();
        while let Some(frame) = next.take() {
            match Arc::try_unwrap(frame) {
                Ok(mut frame) => next = frame.next.take(),
                // A live cursor still owns the rest of the chain.
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_first_publishes_slot_zero() {
        let frame = Frame::with_first(7u64, Arc::new(Notify::new()));

        assert!(frame.is_published(0));
        assert!(!frame.is_published(1));
        assert_eq!(unsafe { *frame.value(0) }, 7);
        assert_eq!(frame.fill(), 1);
    }

    #[test]
    fn test_tickets_are_dense() {
        let frame = Frame::with_first(0u64, Arc::new(Notify::new()));

        for expected in 1..SLOTS as u32 + 4 {
            assert_eq!(frame.claim(), expected);
        }
    }

    #[test]
    fn test_fill_tracks_highest_bit() {
        let frame = Frame::with_first(0u64, Arc::new(Notify::new()));

        for i in 1..10 {
            let ticket = frame.claim();
            unsafe { frame.publish(ticket, i) };
        }
        assert_eq!(frame.fill(), 10);
    }

    #[test]
    fn test_drop_frees_published_slots_only() {
        use std::sync::atomic::AtomicUsize;

        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPPED.store(0, Ordering::SeqCst);
        let frame = Frame::with_first(Tracked, Arc::new(Notify::new()));
        let ticket = frame.claim();
        unsafe { frame.publish(ticket, Tracked) };
        // A claimed ticket with no publish must not be dropped.
        frame.claim();
        drop(frame);

        assert_eq!(DROPPED.load(Ordering::SeqCst), 2);
    }
}
