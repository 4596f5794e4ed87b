//! Property-based tests for the stream, map, and channel contracts.
//!
//! Each property drives the concurrent structure through an arbitrary
//! operation sequence and checks it against a trivially-correct model.

use framecast::{Channel, Map, Subject, TryDequeueError};
use proptest::prelude::*;
use std::collections::HashMap;

/// One scripted map operation.
#[derive(Debug, Clone)]
enum MapOp {
    Set(u8, u16),
    Del(u8),
    Get(u8),
    Tx(u8, u16),
}

fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        (any::<u8>(), any::<u16>()).prop_map(|(k, v)| MapOp::Set(k, v)),
        any::<u8>().prop_map(MapOp::Del),
        any::<u8>().prop_map(MapOp::Get),
        (any::<u8>(), any::<u16>()).prop_map(|(k, v)| MapOp::Tx(k, v)),
    ]
}

proptest! {
    /// A traversal from the first cursor returns exactly the published
    /// sequence: nothing lost, nothing reordered, nothing invented.
    #[test]
    fn prop_stream_traversal_equals_input(values in prop::collection::vec(any::<u16>(), 1..300)) {
        let subject = Subject::new();
        let first = subject.set(values[0]);
        for value in &values[1..] {
            subject.set(*value);
        }

        let mut walked = vec![*first.value()];
        let mut view = first.clone();
        while let Some(next) = view.try_next() {
            walked.push(*next.value());
            view = next;
        }

        prop_assert_eq!(walked, values);
    }

    /// Cursor length equals the number of values at or past it.
    #[test]
    fn prop_stream_len_matches_position(extra in 0usize..200) {
        let subject = Subject::new();
        let first = subject.set(0u32);
        for i in 0..extra {
            subject.set(i as u32 + 1);
        }

        prop_assert_eq!(first.len(), extra + 1);
        prop_assert_eq!(subject.view().len(), 1);
    }

    /// `range` visits the same prefix a manual walk does.
    #[test]
    fn prop_range_equals_manual_walk(
        values in prop::collection::vec(any::<u16>(), 1..150),
        stop_after in 1usize..200,
    ) {
        let subject = Subject::new();
        let first = subject.set(values[0]);
        for value in &values[1..] {
            subject.set(*value);
        }

        let mut visited = vec![];
        let last = first.range(|v| {
            visited.push(*v);
            visited.len() < stop_after
        });

        let expected: Vec<u16> = values.iter().copied().take(stop_after.min(values.len())).collect();
        prop_assert_eq!(&visited, &expected);
        prop_assert_eq!(*last.value(), *expected.last().unwrap());
    }

    /// The map agrees with a sequential `HashMap` model under any
    /// single-threaded script of set/del/get/tx.
    #[test]
    fn prop_map_matches_model(ops in prop::collection::vec(map_op(), 1..200)) {
        let map = Map::new();
        let mut model: HashMap<u8, u16> = HashMap::new();

        for op in ops {
            match op {
                MapOp::Set(k, v) => {
                    map.set(k, v);
                    model.insert(k, v);
                }
                MapOp::Del(k) => {
                    map.del(k);
                    model.remove(&k);
                }
                MapOp::Get(k) => {
                    prop_assert_eq!(map.get(&k), model.get(&k).copied());
                }
                MapOp::Tx(k, v) => {
                    // Read-modify-write: add `v` to the current value,
                    // or seed it when absent.
                    let stored = map.tx(k, |old| Some(old.unwrap_or(0).wrapping_add(v)));
                    let entry = model.entry(k).or_insert(0);
                    *entry = entry.wrapping_add(v);
                    prop_assert_eq!(stored, Some(*entry));
                }
            }
        }

        for (k, v) in &model {
            prop_assert_eq!(map.get(k), Some(*v));
        }
    }

    /// Deleting a key always reads back as absent, whatever came before.
    #[test]
    fn prop_map_del_then_get_absent(
        seed in prop::collection::vec((any::<u8>(), any::<u16>()), 0..50),
        victim in any::<u8>(),
    ) {
        let map = Map::new();
        for (k, v) in seed {
            map.set(k, v);
        }
        map.del(victim);
        prop_assert_eq!(map.get(&victim), None);
    }

    /// Single producer, single consumer: FIFO and drained-on-close.
    #[test]
    fn prop_channel_fifo(values in prop::collection::vec(any::<u16>(), 0..300)) {
        let channel = Channel::new();
        for value in &values {
            channel.enqueue(*value);
        }
        channel.close();

        let mut drained = vec![];
        while let Some(value) = channel.dequeue() {
            drained.push(value);
        }

        prop_assert_eq!(drained, values);
        prop_assert_eq!(channel.try_dequeue(), Err(TryDequeueError::Closed));
    }

    /// `try_dequeue` agrees with `dequeue` on a quiet channel.
    #[test]
    fn prop_channel_try_dequeue_matches(values in prop::collection::vec(any::<u16>(), 1..150)) {
        let channel = Channel::new();
        for value in &values {
            channel.enqueue(*value);
        }

        let mut drained = vec![];
        while let Ok(value) = channel.try_dequeue() {
            drained.push(value);
        }

        prop_assert_eq!(drained, values);
        prop_assert_eq!(channel.try_dequeue(), Err(TryDequeueError::Empty));
    }

    /// `len` is exact while no thread is mid-operation.
    #[test]
    fn prop_channel_len_quiescent(
        enqueued in 0usize..300,
        dequeued in 0usize..300,
    ) {
        let channel = Channel::new();
        for i in 0..enqueued {
            channel.enqueue(i);
        }
        let dequeued = dequeued.min(enqueued);
        for _ in 0..dequeued {
            channel.dequeue();
        }
        prop_assert_eq!(channel.len(), enqueued - dequeued);
    }
}
