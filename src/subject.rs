use crate::frame::{Frame, Notify, SLOTS};
use crossbeam_utils::Backoff;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Write end of an unbounded append-only broadcast stream.
///
/// Any number of producers publish with [`set`](Subject::set); any
/// number of consumers traverse the stream independently through
/// [`View`] cursors, parking when they catch up to the producers.
/// Values are stored in chained 64-slot frames; publication is a single
/// atomic OR, so producers never block each other for correctness (the
/// one writer that rolls a frame over briefly makes its peers spin).
///
/// ```
/// use framecast::Subject;
///
/// let subject = Subject::new();
/// let first = subject.set(1);
/// subject.set(2);
///
/// assert_eq!(*first.value(), 1);
/// assert_eq!(*first.next().value(), 2);
/// ```
pub struct Subject<T> {
    notify: Arc<Notify>,
    /// Root of the frame chain; owns every frame transitively, which is
    /// what keeps the raw `head` hint dereferenceable.
    first: std::sync::OnceLock<Arc<Frame<T>>>,
    /// Latest frame accepting writes. Null until the first publish.
    head: AtomicPtr<Frame<T>>,
}

impl<T> Subject<T> {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            first: std::sync::OnceLock::new(),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publishes `value` as the next element of the stream and wakes
    /// every parked consumer. Returns the cursor for exactly the slot
    /// that received `value`.
    pub fn set(&self, value: T) -> View<T> {
        let mut value = value;
        let mut frame_ptr = self.head.load(Ordering::Acquire);
        if frame_ptr.is_null() {
            match self.install_first(value) {
                Ok(view) => return view,
                // Lost the init race; the head is live now.
                Err(returned) => {
                    value = returned;
                    frame_ptr = self.head.load(Ordering::Acquire);
                }
            }
        }

        loop {
            // SAFETY: `frame_ptr` came from `head` (or a successor walk),
            // and every such frame is owned by the chain rooted at
            // `first` for at least as long as `&self` lives.
            let frame = unsafe { &*frame_ptr };
            let ticket = frame.claim();

            if ticket < SLOTS as u32 {
                // SAFETY: the ticket names an unwritten slot we own.
                unsafe { frame.publish(ticket, value) };
                self.notify.broadcast();
                // SAFETY: the chain keeps `frame_ptr`'s strong count
                // above zero, see above.
                let frame = unsafe { clone_from_chain(frame_ptr) };
                return View { frame, index: ticket };
            }

            if ticket == SLOTS as u32 {
                // Rollover owner: the successor starts life with our
                // value already published in slot 0.
                let next = Arc::new(Frame::with_first(value, Arc::clone(&self.notify)));
                let next_ptr = Arc::as_ptr(&next).cast_mut();
                frame.install_successor(next);
                self.head.store(next_ptr, Ordering::Release);
                self.notify.broadcast();
                // SAFETY: the predecessor now owns the successor.
                let frame = unsafe { clone_from_chain(next_ptr) };
                return View { frame, index: 0 };
            }

            // Ticket overshot the frame: wait for the rollover owner to
            // install the successor, then retry with a fresh ticket
            // there. The old ticket is meaningless on the new frame.
            let backoff = Backoff::new();
            let next = loop {
                if let Some(next) = frame.successor() {
                    break next;
                }
                backoff.snooze();
            };
            frame_ptr = Arc::as_ptr(next).cast_mut();
        }
    }

    /// Returns a cursor at the latest published value, parking until
    /// the first publish if the stream is still empty.
    pub fn view(&self) -> View<T> {
        let head = self.head.load(Ordering::Acquire);
        if !head.is_null() {
            // SAFETY: chain-owned, see `set`.
            return unsafe { self.latest(head) };
        }

        let mut guard = self.notify.mu.lock().unwrap();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if !head.is_null() {
                drop(guard);
                // SAFETY: chain-owned, see `set`.
                return unsafe { self.latest(head) };
            }
            guard = self.notify.cond.wait(guard).unwrap();
        }
    }

    /// Slow-path first publish: double-checked under the park lock so
    /// exactly one writer installs the chain root.
    fn install_first(&self, value: T) -> Result<View<T>, T> {
        let _guard = self.notify.mu.lock().unwrap();
        if !self.head.load(Ordering::Acquire).is_null() {
            return Err(value);
        }

        let frame = Arc::new(Frame::with_first(value, Arc::clone(&self.notify)));
        let frame_ptr = Arc::as_ptr(&frame).cast_mut();
        let view = View {
            frame: Arc::clone(&frame),
            index: 0,
        };
        let installed = self.first.set(frame).is_ok();
        debug_assert!(installed, "chain root installed twice");
        self.head.store(frame_ptr, Ordering::Release);
        self.notify.cond.notify_all();
        Ok(view)
    }

    /// # Safety
    ///
    /// `head` must be a chain-owned frame pointer (see `set`).
    unsafe fn latest(&self, head: *mut Frame<T>) -> View<T> {
        // SAFETY: caller contract.
        let frame = unsafe { &*head };
        // A visible frame always has slot 0 published, so fill >= 1.
        let index = (frame.fill() - 1) as u32;
        // SAFETY: caller contract.
        let frame = unsafe { clone_from_chain(head) };
        View { frame, index }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("published", &!self.head.load(Ordering::Acquire).is_null())
            .finish()
    }
}

/// Recover an owned handle to a frame that the chain is known to keep
/// alive.
///
/// # Safety
///
/// `ptr` must point at a frame holding at least one other strong
/// reference (the chain link or the subject root) for the duration of
/// the call.
unsafe fn clone_from_chain<T>(ptr: *const Frame<T>) -> Arc<Frame<T>> {
    // SAFETY: caller contract; the count cannot hit zero concurrently.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Immutable cursor into a broadcast stream: one slot of one frame.
///
/// Advancing never mutates; [`next`](View::next) returns a fresh cursor
/// for the successor slot, parking until a producer publishes it. A
/// cursor keeps its frame and everything after it alive, so a consumer
/// can fall arbitrarily far behind without losing values.
pub struct View<T> {
    frame: Arc<Frame<T>>,
    index: u32,
}

impl<T> View<T> {
    /// Borrow the value this cursor refers to. Infallible: a cursor is
    /// only ever constructed for a published slot.
    #[inline]
    pub fn value(&self) -> &T {
        // SAFETY: construction sites guarantee the slot is published.
        unsafe { self.frame.value(self.index) }
    }

    /// The lock-free half of [`next`](View::next): the successor cursor
    /// if its slot is already published, `None` otherwise.
    pub fn try_next(&self) -> Option<View<T>> {
        let index = self.index + 1;
        if index < SLOTS as u32 {
            if self.frame.is_published(index) {
                return Some(View {
                    frame: Arc::clone(&self.frame),
                    index,
                });
            }
            None
        } else {
            // Observing the successor implies its slot 0 is published.
            self.frame.successor().map(|next| View {
                frame: Arc::clone(next),
                index: 0,
            })
        }
    }

    /// Returns the cursor for the successor slot, parking until a
    /// producer publishes it.
    pub fn next(&self) -> View<T> {
        if let Some(view) = self.try_next() {
            return view;
        }

        let notify = self.frame.notify();
        let mut guard = notify.mu.lock().unwrap();
        loop {
            if let Some(view) = self.try_next() {
                drop(guard);
                return view;
            }
            guard = notify.cond.wait(guard).unwrap();
        }
    }

    /// Number of published values from this cursor (inclusive) to the
    /// current tail of the stream.
    pub fn len(&self) -> usize {
        let mut frame = &self.frame;
        let mut published = 0;
        loop {
            let fill = frame.fill();
            published += fill;
            if fill == SLOTS {
                if let Some(next) = frame.successor() {
                    frame = next;
                    continue;
                }
            }
            break;
        }
        published - self.index as usize
    }

    /// Walk forward from this cursor, applying `f` to each published
    /// value. Stops when `f` returns `false` or when the next value is
    /// not yet published; returns the last cursor visited. Never parks.
    pub fn range<F>(&self, mut f: F) -> View<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut view = self.clone();
        loop {
            if !f(view.value()) {
                return view;
            }
            match view.try_next() {
                Some(next) => view = next,
                None => return view,
            }
        }
    }
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
            index: self.index,
        }
    }
}

/// Cursor identity: same frame, same slot.
impl<T> PartialEq for View<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame) && self.index == other.index
    }
}

impl<T> Eq for View<T> {}

impl<T: fmt::Debug> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("index", &self.index)
            .field("value", self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_returns_view_of_value() {
        let subject = Subject::new();

        let view = subject.set(1);
        assert_eq!(*view.value(), 1);

        let two = subject.set(2);
        assert_eq!(view.next(), two);
        assert_eq!(*two.value(), 2);
    }

    #[test]
    fn test_view_returns_latest() {
        let subject = Subject::new();
        for i in 0..5 {
            subject.set(i);
        }

        assert_eq!(*subject.view().value(), 4);
    }

    #[test]
    fn test_rollover_preserves_order_and_len() {
        let subject = Subject::new();
        let first = subject.set(0);
        for i in 1..66 {
            subject.set(i);
        }

        assert_eq!(first.len(), 66);
        assert_eq!(*subject.view().value(), 65);

        let mut view = first.clone();
        for expected in 1..66 {
            view = view.next();
            assert_eq!(*view.value(), expected);
        }
        assert!(view.try_next().is_none());
    }

    #[test]
    fn test_len_counts_from_cursor() {
        let subject = Subject::new();
        let first = subject.set(0);
        for i in 1..10 {
            subject.set(i);
        }

        assert_eq!(first.len(), 10);
        assert_eq!(first.next().len(), 9);
        assert_eq!(subject.view().len(), 1);
    }

    #[test]
    fn test_range_stops_at_tail() {
        let subject = Subject::new();
        let first = subject.set(1);
        subject.set(2);
        subject.set(3);

        let mut seen = vec![];
        let last = first.range(|v| {
            seen.push(*v);
            true
        });

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(*last.value(), 3);
    }

    #[test]
    fn test_range_honors_predicate() {
        let subject = Subject::new();
        let first = subject.set(1);
        subject.set(2);
        subject.set(3);

        let mut seen = vec![];
        let last = first.range(|v| {
            seen.push(*v);
            *v < 2
        });

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(*last.value(), 2);
    }

    #[test]
    fn test_drop_reclaims_whole_stream() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Tracked(u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPPED.store(0, Ordering::SeqCst);
        let subject = Subject::new();
        for i in 0..200 {
            subject.set(Tracked(i));
        }
        drop(subject);

        assert_eq!(DROPPED.load(Ordering::SeqCst), 200);
    }
}
