use crate::frame::Notify;
use crate::invariants::{debug_assert_slot_ticket, debug_assert_unpublished};
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Error returned by [`Channel::try_dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryDequeueError {
    /// No value is currently available.
    #[error("channel is empty")]
    Empty,
    /// The channel is closed and drained.
    #[error("channel is closed")]
    Closed,
}

const SLOTS: usize = 64;

/// One 64-slot chunk of the channel.
///
/// Same slot/mask publication protocol as a stream frame, plus an
/// independent consumption ticket: producers reserve through `tail`,
/// consumers claim through `head`, and a consumed slot is marked in
/// `taken` so it is not dropped twice.
struct Segment<T> {
    slots: [UnsafeCell<MaybeUninit<T>>; SLOTS],
    /// Bit i set (Release) after `slots[i]` is written.
    mask: AtomicU64,
    /// Bit i set once the value in `slots[i]` has been moved out.
    taken: AtomicU64,
    /// Producer reservation ticket.
    tail: AtomicU32,
    /// Consumer claim ticket.
    head: AtomicU32,
    next: OnceLock<Arc<Segment<T>>>,
}

// SAFETY: slot handoff follows the same single-writer ticket discipline
// as `Frame`, and each value moves out exactly once under its consume
// claim, so `T: Send` suffices.
unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Send> Sync for Segment<T> {}

impl<T> Segment<T> {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            mask: AtomicU64::new(0),
            taken: AtomicU64::new(0),
            tail: AtomicU32::new(0),
            head: AtomicU32::new(0),
            next: OnceLock::new(),
        }
    }

    fn with_first(value: T) -> Self {
        let mut segment = Self::new();
        *segment.slots[0].get_mut() = MaybeUninit::new(value);
        *segment.mask.get_mut() = 1;
        *segment.tail.get_mut() = 1;
        segment
    }

    /// # Safety
    ///
    /// `ticket` must be a produce ticket `< SLOTS` drawn from `tail`.
    unsafe fn publish(&self, ticket: u32, value: T) {
        debug_assert_slot_ticket!(ticket, SLOTS);
        // SAFETY: caller contract - the ticket owns the slot.
        unsafe { (*self.slots[ticket as usize].get()).write(value) };
        let mask = self.mask.fetch_or(1 << ticket, Ordering::Release);
        debug_assert_unpublished!(mask, ticket);
    }

    #[inline]
    fn is_published(&self, index: u32) -> bool {
        self.mask.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Move the value out of slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the consume claim for `index` and have
    /// observed `is_published(index)`.
    unsafe fn take(&self, index: u32) -> T {
        let taken = self.taken.fetch_or(1 << index, Ordering::Relaxed);
        debug_assert!(taken & (1 << index) == 0, "slot {} taken twice", index);
        // SAFETY: published and exclusively claimed.
        unsafe { (*self.slots[index as usize].get()).assume_init_read() }
    }

    #[inline]
    fn fill(&self) -> usize {
        (u64::BITS - self.mask.load(Ordering::Acquire).leading_zeros()) as usize
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        // Drop the published values nobody consumed.
        let pending = *self.mask.get_mut() & !*self.taken.get_mut();
        for i in 0..SLOTS {
            if pending & (1 << i) != 0 {
                // SAFETY: published, never taken, and we hold `&mut`.
                unsafe { self.slots[i].get_mut().assume_init_drop() };
            }
        }
        // Iterative unlink, as for stream frames.
        let mut next = self.next.take();
        while let Some(segment) = next.take() {
            match Arc::try_unwrap(segment) {
                Ok(mut segment) => next = segment.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Unbounded MPMC queue over chained 64-slot segments.
///
/// [`enqueue`](Channel::enqueue) only ever waits on a segment rollover,
/// never on queue length; [`dequeue`](Channel::dequeue) parks until a
/// value arrives or the channel closes. Every value enqueued before
/// [`close`](Channel::close) is delivered before a dequeuer sees the
/// closed result.
///
/// ```
/// use framecast::Channel;
///
/// let channel = Channel::new();
/// channel.enqueue("job");
/// channel.close();
///
/// assert_eq!(channel.dequeue(), Some("job"));
/// assert_eq!(channel.dequeue(), None);
/// ```
pub struct Channel<T> {
    notify: Notify,
    /// Chain root; owns every segment while the channel lives.
    first: OnceLock<Arc<Segment<T>>>,
    /// Consume-side segment hint; advanced as consumers cross segments.
    head: AtomicPtr<Segment<T>>,
    /// Produce-side segment hint.
    tail: AtomicPtr<Segment<T>>,
    closed: AtomicBool,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            first: OnceLock::new(),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            closed: AtomicBool::new(false),
        }
    }

    /// Append `value`.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed: enqueueing after close is a
    /// logic bug, not a recoverable condition.
    pub fn enqueue(&self, value: T) {
        assert!(!self.is_closed(), "enqueue on closed channel");

        let mut value = value;
        let mut segment_ptr = self.tail.load(Ordering::Acquire);
        if segment_ptr.is_null() {
            match self.install_first(value) {
                Ok(()) => return,
                // Lost the init race; the tail is live now.
                Err(returned) => {
                    value = returned;
                    segment_ptr = self.tail.load(Ordering::Acquire);
                }
            }
        }

        loop {
            // SAFETY: every segment reachable from the hints is owned by
            // the chain rooted at `first` for the life of `&self`.
            let segment = unsafe { &*segment_ptr };
            let ticket = segment.tail.fetch_add(1, Ordering::Relaxed);

            if ticket < SLOTS as u32 {
                // SAFETY: the ticket owns the slot.
                unsafe { segment.publish(ticket, value) };
                self.notify.broadcast();
                return;
            }

            if ticket == SLOTS as u32 {
                let next = Arc::new(Segment::with_first(value));
                let next_ptr = Arc::as_ptr(&next).cast_mut();
                let installed = segment.next.set(next).is_ok();
                debug_assert!(installed, "segment successor installed twice");
                self.tail.store(next_ptr, Ordering::Release);
                self.notify.broadcast();
                return;
            }

            // Overshot ticket: wait for the rollover owner, then draw a
            // fresh ticket on the successor.
            let backoff = Backoff::new();
            let next = loop {
                if let Some(next) = segment.next.get() {
                    break next;
                }
                backoff.snooze();
            };
            segment_ptr = Arc::as_ptr(next).cast_mut();
        }
    }

    /// Remove the oldest unclaimed value, parking until one arrives.
    /// Returns `None` once the channel is closed and this consumer's
    /// claim is past everything enqueued before the close.
    pub fn dequeue(&self) -> Option<T> {
        let mut segment_ptr = self.head.load(Ordering::Acquire);
        if segment_ptr.is_null() {
            segment_ptr = self.wait_for_first()?;
        }

        loop {
            // SAFETY: chain-owned, see `enqueue`.
            let segment = unsafe { &*segment_ptr };
            let ticket = segment.head.fetch_add(1, Ordering::Relaxed);

            if ticket < SLOTS as u32 {
                if segment.is_published(ticket) {
                    // SAFETY: we hold the claim and observed the bit.
                    return Some(unsafe { segment.take(ticket) });
                }
                let mut guard = self.notify.mu.lock().unwrap();
                loop {
                    // Bit before closed: a value published before the
                    // close must be delivered, not dropped.
                    if segment.is_published(ticket) {
                        drop(guard);
                        // SAFETY: claim held, bit observed.
                        return Some(unsafe { segment.take(ticket) });
                    }
                    if self.closed.load(Ordering::Acquire) {
                        return None;
                    }
                    guard = self.notify.cond.wait(guard).unwrap();
                }
            }

            // Claims exhausted this segment: move to the successor,
            // parking until the rollover producer installs it.
            let next_ptr = match segment.next.get() {
                Some(next) => Arc::as_ptr(next).cast_mut(),
                None => {
                    let mut guard = self.notify.mu.lock().unwrap();
                    loop {
                        if let Some(next) = segment.next.get() {
                            break Arc::as_ptr(next).cast_mut();
                        }
                        if self.closed.load(Ordering::Acquire) {
                            return None;
                        }
                        guard = self.notify.cond.wait(guard).unwrap();
                    }
                }
            };
            // Best-effort hint advance; a stale store only costs later
            // consumers an extra hop.
            self.head.store(next_ptr, Ordering::Release);
            segment_ptr = next_ptr;
        }
    }

    /// Non-blocking dequeue.
    ///
    /// Claims a slot with a compare-and-swap only after observing it
    /// published, so an empty result never strands a claim the way a
    /// parked consumer's ticket would.
    pub fn try_dequeue(&self) -> Result<T, TryDequeueError> {
        let mut segment_ptr = self.head.load(Ordering::Acquire);
        if segment_ptr.is_null() {
            return Err(self.empty_or_closed());
        }

        loop {
            // SAFETY: chain-owned, see `enqueue`.
            let segment = unsafe { &*segment_ptr };
            let claim = segment.head.load(Ordering::Acquire);

            if claim >= SLOTS as u32 {
                match segment.next.get() {
                    Some(next) => {
                        segment_ptr = Arc::as_ptr(next).cast_mut();
                        self.head.store(segment_ptr, Ordering::Release);
                        continue;
                    }
                    None => return Err(self.empty_or_closed()),
                }
            }

            if !segment.is_published(claim) {
                return Err(self.empty_or_closed());
            }
            if segment
                .head
                .compare_exchange(claim, claim + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: the CAS won the claim after the bit was seen.
                return Ok(unsafe { segment.take(claim) });
            }
            // Lost the claim race; retry from the top.
        }
    }

    /// Close the channel and wake every parked consumer. Idempotent.
    pub fn close(&self) {
        let _guard = self.notify.mu.lock().unwrap();
        self.closed.store(true, Ordering::Release);
        self.notify.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Best-effort count of undelivered values.
    pub fn len(&self) -> usize {
        let segment_ptr = self.head.load(Ordering::Acquire);
        if segment_ptr.is_null() {
            return 0;
        }
        // SAFETY: chain-owned, see `enqueue`.
        let mut segment = unsafe { &*segment_ptr };
        let consumed = segment.head.load(Ordering::Relaxed).min(SLOTS as u32);
        let mut pending = -i64::from(consumed);
        loop {
            let fill = segment.fill();
            pending += fill as i64;
            if fill == SLOTS {
                if let Some(next) = segment.next.get() {
                    segment = next;
                    continue;
                }
            }
            break;
        }
        pending.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install_first(&self, value: T) -> Result<(), T> {
        let _guard = self.notify.mu.lock().unwrap();
        if !self.tail.load(Ordering::Acquire).is_null() {
            return Err(value);
        }

        let segment = Arc::new(Segment::with_first(value));
        let segment_ptr = Arc::as_ptr(&segment).cast_mut();
        let installed = self.first.set(segment).is_ok();
        debug_assert!(installed, "channel chain root installed twice");
        self.head.store(segment_ptr, Ordering::Release);
        self.tail.store(segment_ptr, Ordering::Release);
        self.notify.cond.notify_all();
        Ok(())
    }

    /// Park until the first enqueue installs the chain, or the channel
    /// closes while still empty.
    fn wait_for_first(&self) -> Option<*mut Segment<T>> {
        let mut guard = self.notify.mu.lock().unwrap();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if !head.is_null() {
                return Some(head);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            guard = self.notify.cond.wait(guard).unwrap();
        }
    }

    fn empty_or_closed(&self) -> TryDequeueError {
        if self.is_closed() {
            TryDequeueError::Closed
        } else {
            TryDequeueError::Empty
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
