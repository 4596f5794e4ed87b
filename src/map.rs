use crate::invariants::debug_assert_reader_barrier;
use crate::spin::SpinLock;
use crate::subject::{Subject, View};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use twox_hash::XxHash64;

// =============================================================================
// DOUBLE-BUFFERED SNAPSHOT PROTOCOL
// =============================================================================
//
// All writes are appended to a broadcast stream (the pending-write log).
// Two snapshot maps, A and B, alternate between two roles:
//
// - the *read* snapshot, selected by the high bit of `counter`, served
//   to readers with no locking at all;
// - the *write* snapshot, drained toward the log tail by whichever
//   writer holds the spin flag.
//
// `counter` is the single coordination word. A reader entering the map
// increments it (its entry ticket, which also tells it which snapshot to
// read) and increments the chosen snapshot's exit counter on the way
// out. The writer waits until the write snapshot's exit counter equals
// the number of readers that picked it before the last flip - from then
// on the snapshot provably has no readers and can be mutated in place.
//
// The flip itself is one atomic add of `(1 << 63) - write_count`: it
// toggles the role bit and simultaneously retires the `write_count`
// reader entries accounted to the snapshot that was just drained, so
// the low bits always count the readers the *next* flip must wait for.
//
// Readers that observe log entries past their snapshot's baseline walk
// the log tail directly (last entry per key wins), so a write is
// visible to every subsequent `get` as soon as `set` returns, flushed
// or not.
//
// =============================================================================

const FLAG_A_OR_B: u64 = 1 << 63;
const COUNT_MASK: u64 = !FLAG_A_OR_B;

type Xxh64Builder = BuildHasherDefault<XxHash64>;

/// One pending write: a tombstone when `value` is `None`.
struct Entry<K, V> {
    key: K,
    value: Option<V>,
}

/// One snapshot: committed values plus the log position they reflect.
struct Store<K, V> {
    /// Exit counter for readers that entered on this snapshot.
    count: CachePadded<AtomicU64>,
    /// Writer-exclusive between the reader barrier and the next flip.
    state: UnsafeCell<StoreState<K, V>>,
}

struct StoreState<K, V> {
    values: HashMap<K, V, Xxh64Builder>,
    /// Baseline: the last log entry applied to `values`.
    view: Option<View<Entry<K, V>>>,
}

impl<K, V> Store<K, V> {
    fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicU64::new(0)),
            state: UnsafeCell::new(StoreState {
                values: HashMap::default(),
                view: None,
            }),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> StoreState<K, V> {
    /// Apply pending log entries to `values`, advancing the baseline.
    ///
    /// Bounded by the log length observed on entry: entries published
    /// while the flush runs wait for the next one, so a producer burst
    /// cannot extend an in-progress flush.
    fn flush(&mut self) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        let pending = view.len();
        // The baseline entry itself is already applied.
        for _ in 1..pending {
            let next = view.next();
            {
                let entry = next.value();
                match entry.value.as_ref() {
                    Some(value) => {
                        self.values.insert(entry.key.clone(), value.clone());
                    }
                    None => {
                        self.values.remove(&entry.key);
                    }
                }
            }
            *view = next;
        }
    }
}

/// Read-mostly concurrent map.
///
/// Reads are wait-free: a reader picks the published snapshot with one
/// atomic increment, looks its key up in a plain hash map, and leaves
/// with another. Writes are appended to an internal broadcast stream
/// and drained into the off-duty snapshot by whichever writer holds the
/// write flag; a single atomic add then swaps the snapshots' roles.
/// A write is visible to every subsequent [`get`](Map::get) as soon as
/// the writing call returns.
///
/// The pending-write log is unbounded: if writers consistently outrun
/// flushes the log grows without limit. Keys are hashed with xxhash-64.
///
/// ```
/// use framecast::Map;
///
/// let map = Map::new();
/// map.set("hello", "world");
/// assert_eq!(map.get(&"hello"), Some("world"));
/// map.del("hello");
/// assert_eq!(map.get(&"hello"), None);
/// ```
pub struct Map<K, V> {
    /// Coordination word: high bit picks the read snapshot, low bits
    /// count reader entries since the last flip.
    counter: CachePadded<AtomicU64>,
    a: Store<K, V>,
    b: Store<K, V>,
    /// Pending-write log; snapshots record their position in it.
    queue: Subject<Entry<K, V>>,
    /// Serializes the drain-and-flip writer path.
    write_flag: SpinLock,
    /// Reader entries the next flush must wait out. Guarded by
    /// `write_flag`.
    write_count: UnsafeCell<u64>,
    /// Latch set once the snapshots have a log baseline.
    init: AtomicU32,
}

// SAFETY: snapshot states are only mutated by the writer that holds
// `write_flag`, after the reader barrier has proven the snapshot
// reader-free; `write_count` is only touched under the same flag.
// Readers share `&K`/`&V` across threads, hence the `Sync` bounds.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Map<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Map<K, V> {}

/// Bumps a snapshot's exit counter on drop, so a reader's ticket is
/// returned on every path out of `get`.
struct ExitTicket<'a>(&'a AtomicU64);

impl Drop for ExitTicket<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

impl<K, V> Map<K, V> {
    pub fn new() -> Self {
        Self {
            counter: CachePadded::new(AtomicU64::new(0)),
            a: Store::new(),
            b: Store::new(),
            queue: Subject::new(),
            write_flag: SpinLock::new(),
            write_count: UnsafeCell::new(0),
            init: AtomicU32::new(0),
        }
    }

    /// The snapshot readers holding ticket `x` look up.
    fn read_store(&self, x: u64) -> &Store<K, V> {
        if x & FLAG_A_OR_B != 0 {
            &self.a
        } else {
            &self.b
        }
    }

    /// The snapshot the flag-holding writer may drain.
    fn write_store(&self, x: u64) -> &Store<K, V> {
        if x & FLAG_A_OR_B != 0 {
            &self.b
        } else {
            &self.a
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Map<K, V> {
    /// Returns the most recent value written for `key`, or `None` if
    /// the key is absent (or the map has never been written).
    ///
    /// Wait-free with respect to writers: a reader never takes the
    /// write flag and never waits on a flush.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.init.load(Ordering::Acquire) == 0 {
            return None;
        }

        // Entry ticket: bumps the reader count and picks the snapshot.
        let x = self.counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let store = self.read_store(x);
        let _ticket = ExitTicket(&store.count);

        // SAFETY: this snapshot stays read-only until every ticket on it
        // is returned; ours is returned when `_ticket` drops.
        let state = unsafe { &*store.state.get() };
        let mut found = state.values.get(key).cloned();

        let Some(view) = state.view.as_ref() else {
            return found;
        };
        let pending = view.len();
        if pending > 1 {
            // Unflushed writes sit past the baseline; the last entry
            // for our key wins.
            let mut cursor = view.clone();
            for _ in 1..pending {
                cursor = cursor.next();
                let entry = cursor.value();
                if entry.key == *key {
                    found = entry.value.clone();
                }
            }
        }
        found
    }

    /// Writes `key -> value`, visible to every subsequent `get`.
    pub fn set(&self, key: K, value: V) {
        self.write(Entry {
            key,
            value: Some(value),
        });
    }

    /// Removes `key`. A tombstone entry, processed like any insert.
    pub fn del(&self, key: K) {
        self.write(Entry { key, value: None });
    }

    /// Atomically read `key`, apply `f`, and store the result;
    /// `None` from `f` deletes the key. Returns what was stored.
    ///
    /// Serializes against every other flag-holding writer. A plain
    /// `set` racing the transaction is ordered before it: the
    /// transaction's entry lands later in the log, so it wins.
    pub fn tx<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let _guard = self.write_flag.lock();

        if self.init.load(Ordering::Acquire) == 0 {
            let result = f(None);
            let view = self.queue.set(Entry {
                key,
                value: result.clone(),
            });
            self.init_stores(&view);
            return result;
        }

        // Bring the write snapshot current, flip it in, and read the
        // key from what is now the freshest snapshot.
        self.drain_and_flip();
        let x = self.counter.load(Ordering::Acquire);
        // SAFETY: the flag is held, so no flush can run; the read
        // snapshot is never mutated outside a flush.
        let current = unsafe { (*self.read_store(x).state.get()).values.get(&key).cloned() };

        let result = f(current);
        self.queue.set(Entry {
            key,
            value: result.clone(),
        });
        self.drain_and_flip();
        result
    }

    /// Append one entry to the log and, if we can take the write flag,
    /// drain and flip. Otherwise the entry stays pending: the current
    /// flag holder (or the next one) picks it up, and readers see it in
    /// the log tail meanwhile.
    fn write(&self, entry: Entry<K, V>) {
        let Some(_guard) = self.write_flag.try_lock() else {
            // The first-ever write must establish the baseline under
            // the flag before anything else is appended.
            let backoff = Backoff::new();
            while self.init.load(Ordering::Acquire) == 0 {
                backoff.snooze();
            }
            self.queue.set(entry);
            return;
        };

        let view = self.queue.set(entry);
        if self.init.load(Ordering::Acquire) == 0 {
            self.init_stores(&view);
            return;
        }
        self.drain_and_flip();
    }

    /// First write: both snapshots adopt this log entry as their
    /// baseline. Caller holds the write flag.
    fn init_stores(&self, view: &View<Entry<K, V>>) {
        let entry = view.value();
        for store in [&self.a, &self.b] {
            // SAFETY: the flag is held and no reader has ever entered
            // (`get` bails while `init` is 0), so both snapshots are
            // exclusively ours.
            let state = unsafe { &mut *store.state.get() };
            state.view = Some(view.clone());
            if let Some(value) = entry.value.as_ref() {
                state.values.insert(entry.key.clone(), value.clone());
            }
        }
        self.init.store(1, Ordering::Release);
    }

    /// Wait out the write snapshot's stale readers, drain the log into
    /// it, and flip it in as the new read snapshot. Caller holds the
    /// write flag.
    fn drain_and_flip(&self) {
        let x = self.counter.load(Ordering::Acquire);
        let write = self.write_store(x);
        // SAFETY: `write_count` is only touched under the flag.
        let write_count = unsafe { *self.write_count.get() };

        // Reader barrier: every reader that picked this snapshot before
        // the last flip must leave before we touch it.
        let backoff = Backoff::new();
        loop {
            let exits = write.count.load(Ordering::Acquire);
            debug_assert_reader_barrier!(exits, write_count);
            if exits >= write_count {
                break;
            }
            backoff.snooze();
        }

        // SAFETY: barrier passed, and the flag keeps other writers out;
        // the snapshot is exclusively ours until the flip below.
        let state = unsafe { &mut *write.state.get() };
        state.flush();
        write.count.store(0, Ordering::Relaxed);

        // Flip: toggle the snapshot roles and retire the reader entries
        // accounted to the snapshot we just drained. What remains in
        // the low bits is the reader population of the outgoing read
        // snapshot - exactly what the next flush must wait for.
        let x = self
            .counter
            .fetch_add(FLAG_A_OR_B.wrapping_sub(write_count), Ordering::AcqRel)
            .wrapping_add(FLAG_A_OR_B.wrapping_sub(write_count));
        // SAFETY: flag held, see above.
        unsafe { *self.write_count.get() = x & COUNT_MASK };
    }
}

impl<K, V> Default for Map<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Map<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("initialized", &(self.init.load(Ordering::Acquire) != 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_before_first_write() {
        let map = Map::<&str, u32>::new();
        assert_eq!(map.get(&"missing"), None);
    }

    #[test]
    fn test_set_get_overwrite_del() {
        let map = Map::new();

        map.set("hello", "world");
        assert_eq!(map.get(&"hello"), Some("world"));

        map.set("hello", "map");
        assert_eq!(map.get(&"hello"), Some("map"));

        map.del("hello");
        assert_eq!(map.get(&"hello"), None);
    }

    #[test]
    fn test_del_before_set_is_absent() {
        let map = Map::new();
        map.del("ghost");
        assert_eq!(map.get(&"ghost"), None);

        map.set("ghost", 1);
        assert_eq!(map.get(&"ghost"), Some(1));
    }

    #[test]
    fn test_many_keys_survive_flips() {
        let map = Map::new();
        for i in 0..500u64 {
            map.set(i, i * 2);
        }
        for i in 0..500u64 {
            assert_eq!(map.get(&i), Some(i * 2), "key {}", i);
        }
    }

    #[test]
    fn test_tx_increments_counter() {
        let map = Map::new();
        map.set("counter", 2);

        let stored = map.tx("counter", |n| n.map(|n| n + 1));
        assert_eq!(stored, Some(3));
        assert_eq!(map.get(&"counter"), Some(3));
    }

    #[test]
    fn test_tx_identity_is_noop() {
        let map = Map::new();
        map.set("k", 7);

        assert_eq!(map.tx("k", |old| old), Some(7));
        assert_eq!(map.get(&"k"), Some(7));

        // Identity on an absent key stays absent.
        assert_eq!(map.tx("absent", |old| old), None);
        assert_eq!(map.get(&"absent"), None);
    }

    #[test]
    fn test_tx_on_empty_map_initializes() {
        let map = Map::new();
        assert_eq!(map.tx("first", |_| Some(1)), Some(1));
        assert_eq!(map.get(&"first"), Some(1));
    }

    #[test]
    fn test_tx_can_delete() {
        let map = Map::new();
        map.set("k", 1);
        assert_eq!(map.tx("k", |_| None), None);
        assert_eq!(map.get(&"k"), None);
    }
}
