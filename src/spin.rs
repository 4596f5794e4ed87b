use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spin lock with yielding backoff.
///
/// Guards the map's writer path. Contended acquirers spin with PAUSE
/// hints, then yield to the OS; the hold times are short (one flush).
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempt a single acquisition without waiting.
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire, spinning until the current holder releases.
    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.snooze();
        }
    }
}

/// Releases the lock on drop.
pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_excludes() {
        let lock = SpinLock::new();

        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_lock_serializes_increments() {
        struct Shared {
            lock: SpinLock,
            counter: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let mut handles = vec![];
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let _guard = shared.lock.lock();
                    // SAFETY: the lock is held.
                    unsafe { *shared.counter.get() += 1 };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 4_000);
    }
}
