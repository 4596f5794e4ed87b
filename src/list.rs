use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Mutex;

/// Node of a [`List`]. Handed out by [`List::push_front`] and used to
/// walk neighbors or as the argument to [`List::remove`].
pub struct Element<T> {
    next: AtomicPtr<Element<T>>,
    prev: AtomicPtr<Element<T>>,
    removed: AtomicBool,
    /// Root sentinel of the owning list, for end-of-list checks.
    root: *const Element<T>,
    /// `None` only for the root sentinel, which is never handed out.
    value: Option<T>,
}

// SAFETY: link words are atomics; values are written once at insertion
// and only shared immutably afterwards.
unsafe impl<T: Send + Sync> Send for Element<T> {}
unsafe impl<T: Send + Sync> Sync for Element<T> {}

impl<T> Element<T> {
    fn sentinel() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            removed: AtomicBool::new(false),
            root: ptr::null(),
            value: None,
        }
    }

    pub fn value(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("sentinel element exposed"),
        }
    }

    /// Successor element, or `None` at the back of the list.
    pub fn next(&self) -> Option<&Element<T>> {
        let next = self.next.load(Ordering::Acquire);
        if next.is_null() || ptr::eq(next, self.root) {
            None
        } else {
            // SAFETY: all elements live until the list drops, and the
            // borrow cannot outlive the list.
            Some(unsafe { &*next })
        }
    }

    /// Predecessor element, or `None` at the front of the list.
    pub fn prev(&self) -> Option<&Element<T>> {
        let prev = self.prev.load(Ordering::Acquire);
        if prev.is_null() || ptr::eq(prev, self.root) {
            None
        } else {
            // SAFETY: as in `next`.
            Some(unsafe { &*prev })
        }
    }
}

/// Concurrent doubly-linked list updated with compare-and-swap.
///
/// Insertions race through a CAS on the predecessor's forward link;
/// removals unlink the same way. Removed elements are retired, not
/// freed: every element lives until the list itself drops, so element
/// handles never dangle.
///
/// Best-effort under contention: simultaneous removals of adjacent
/// elements can leave a stale backward link, as in any doubly-linked
/// list without per-node locking. Forward traversal stays consistent.
pub struct List<T> {
    /// Sentinel; its links close the circle. Freed on drop.
    root: *mut Element<T>,
    len: AtomicIsize,
    /// Owns every element ever pushed; freed on drop.
    arena: Mutex<Vec<*mut Element<T>>>,
}

// SAFETY: elements are only reached through the list, and all mutation
// of shared state goes through atomics or the arena mutex.
unsafe impl<T: Send + Sync> Send for List<T> {}
unsafe impl<T: Send + Sync> Sync for List<T> {}

impl<T> List<T> {
    pub fn new() -> Self {
        let root = Box::into_raw(Box::new(Element::sentinel()));
        // SAFETY: freshly allocated, not yet shared.
        unsafe { (*root).root = root };
        Self {
            root,
            len: AtomicIsize::new(0),
            arena: Mutex::new(Vec::new()),
        }
    }

    fn root(&self) -> &Element<T> {
        // SAFETY: the sentinel lives until the list drops.
        unsafe { &*self.root }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `value` at the front and return its element handle.
    pub fn push_front(&self, value: T) -> &Element<T> {
        let element_ptr = Box::into_raw(Box::new(Element {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(self.root),
            removed: AtomicBool::new(false),
            root: self.root,
            value: Some(value),
        }));
        self.arena.lock().unwrap().push(element_ptr);

        loop {
            let front = self.root().next.load(Ordering::Acquire);
            // Lazy circularity: an empty list links back to the root.
            let after = if front.is_null() { self.root } else { front };
            // SAFETY: unpublished until the CAS below succeeds.
            unsafe {
                (*element_ptr).next.store(after, Ordering::Relaxed);
            }

            if self
                .root()
                .next
                .compare_exchange(front, element_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: `after` is the root or an arena-owned element.
                unsafe {
                    (*after).prev.swap(element_ptr, Ordering::AcqRel);
                }
                break;
            }
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        // SAFETY: arena-owned; the borrow is tied to `&self`.
        unsafe { &*element_ptr }
    }

    /// Unlink `element`. A second remove of the same element is a no-op.
    pub fn remove(&self, element: &Element<T>) {
        if element.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let element_ptr = (element as *const Element<T>).cast_mut();

        loop {
            let before = match element.prev() {
                Some(prev) => (prev as *const Element<T>).cast_mut(),
                None => self.root,
            };
            let after = match element.next() {
                Some(next) => (next as *const Element<T>).cast_mut(),
                None => self.root,
            };
            let forward = element.next.load(Ordering::Acquire);

            // SAFETY: `before`/`after` are the root or arena-owned
            // elements, all alive until the list drops.
            unsafe {
                if (*before)
                    .next
                    .compare_exchange(element_ptr, forward, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    (*after).prev.swap(before, Ordering::AcqRel);
                    break;
                }
            }
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    /// First element, or `None` when empty.
    pub fn front(&self) -> Option<&Element<T>> {
        if self.is_empty() {
            return None;
        }
        self.root().next()
    }

    /// Last element, or `None` when empty.
    pub fn back(&self) -> Option<&Element<T>> {
        if self.is_empty() {
            return None;
        }
        self.root().prev()
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        // `&mut self` proves no element handle survives; free the lot.
        let arena = std::mem::take(self.arena.get_mut().unwrap());
        for element in arena {
            // SAFETY: arena pointers come from `Box::into_raw` and are
            // freed exactly once, here.
            drop(unsafe { Box::from_raw(element) });
        }
        // SAFETY: as above, for the sentinel.
        drop(unsafe { Box::from_raw(self.root) });
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("len", &self.len()).finish()
    }
}
