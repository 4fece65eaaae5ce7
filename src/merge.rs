// SPDX-License-Identifier: MPL-2.0

//! Timestamp-ordered draining over N per-CPU rings (§4.B).
//!
//! The dispatcher needs to observe the union of every per-CPU staging
//! ring (§4.C) as a single stream ordered by the monotonic timestamp
//! each entry was tagged with, so that no CPU is starved and packets
//! leave in roughly the order they were submitted. [`Merger`] keeps one
//! "front" slot per ring in a binary heap keyed by timestamp; popping
//! the heap's minimum and refilling that ring's slot from its next
//! front is the entire algorithm.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::ring::SpscRing;

/// An entry that can be ordered by a monotonic timestamp, as produced by
/// a per-CPU staging ring (§3 `tx_buff_desc`).
pub trait Timestamped {
    fn timestamp(&self) -> u64;
}

struct HeapEntry<T> {
    ts: u64,
    ring_idx: usize,
    value: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.ring_idx == other.ring_idx
    }
}
impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    /// Reversed so that `BinaryHeap` (a max-heap) pops the *smallest*
    /// timestamp first. Ties are broken by ring index, which makes the
    /// ordering deterministic and stable per stream, as required by
    /// §4.B ("tie-break is implementation-defined but stable per
    /// stream").
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ts
            .cmp(&self.ts)
            .then_with(|| other.ring_idx.cmp(&self.ring_idx))
    }
}

/// Drains `N` SPSC rings of `T: Timestamped` in non-decreasing
/// timestamp order.
pub struct Merger<T: Timestamped> {
    rings: Vec<Arc<SpscRing<T>>>,
    heap: BinaryHeap<HeapEntry<T>>,
    in_heap: Vec<bool>,
    idle_predicate: Box<dyn Fn() -> bool + Send>,
}

impl<T: Timestamped> Merger<T> {
    /// `idle_predicate` is consulted only by [`Merger::is_idle`]; the
    /// merger's own draining logic never calls it. It exists so a
    /// caller like the TX dispatcher (§4.D) can ask "is there reason to
    /// believe more work might still show up" after a `pop` returns
    /// `None`, typically backed by the `PENDING` flag.
    pub fn new(rings: Vec<Arc<SpscRing<T>>>, idle_predicate: impl Fn() -> bool + Send + 'static) -> Self {
        let in_heap = alloc::vec![false; rings.len()];
        let mut merger = Self {
            rings,
            heap: BinaryHeap::new(),
            in_heap,
            idle_predicate: Box::new(idle_predicate),
        };
        merger.refill_all();
        merger
    }

    /// Tries to pull a fresh front from every ring that doesn't
    /// currently have one resident in the heap.
    fn refill_all(&mut self) {
        for idx in 0..self.rings.len() {
            if self.in_heap[idx] {
                continue;
            }
            if let Some(value) = self.rings[idx].pop() {
                let ts = value.timestamp();
                self.heap.push(HeapEntry {
                    ts,
                    ring_idx: idx,
                    value,
                });
                self.in_heap[idx] = true;
            }
        }
    }

    /// Pops the entry with the smallest timestamp across all rings'
    /// current fronts, refilling the ring it came from before
    /// returning. Returns `None` only when every ring was observed
    /// empty at the moment of the call.
    pub fn pop(&mut self) -> Option<T> {
        self.refill_all();
        let top = self.heap.pop()?;
        self.in_heap[top.ring_idx] = false;
        // Eagerly try to refill the ring we just drained from so a
        // burst on one CPU doesn't need a second `pop` call to surface.
        if let Some(next) = self.rings[top.ring_idx].pop() {
            let ts = next.timestamp();
            self.heap.push(HeapEntry {
                ts,
                ring_idx: top.ring_idx,
                value: next,
            });
            self.in_heap[top.ring_idx] = true;
        }
        Some(top.value)
    }

    /// True once all rings are empty and the caller-supplied predicate
    /// also agrees there is no more work incoming.
    pub fn is_idle(&self) -> bool {
        self.heap.is_empty() && (self.idle_predicate)()
    }
}

impl<T: Timestamped> Iterator for Merger<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    struct Entry {
        ts: u64,
        cpu: u32,
        seq: u32,
    }

    impl Timestamped for Entry {
        fn timestamp(&self) -> u64 {
            self.ts
        }
    }

    #[test]
    fn drains_in_timestamp_order_across_two_rings() {
        let ring_a: Arc<SpscRing<Entry>> = Arc::new(SpscRing::new(16));
        let ring_b: Arc<SpscRing<Entry>> = Arc::new(SpscRing::new(16));

        for (i, ts) in [1u64, 3, 5, 7].into_iter().enumerate() {
            ring_a.push(Entry { ts, cpu: 0, seq: i as u32 }).unwrap();
        }
        for (i, ts) in [2u64, 4, 6, 8].into_iter().enumerate() {
            ring_b.push(Entry { ts, cpu: 1, seq: i as u32 }).unwrap();
        }

        let mut merger = Merger::new(vec![ring_a, ring_b], || false);
        let mut observed = Vec::new();
        while let Some(e) = merger.pop() {
            observed.push(e.ts);
        }
        assert_eq!(observed, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn reports_empty_and_honors_idle_predicate() {
        let ring: Arc<SpscRing<Entry>> = Arc::new(SpscRing::new(4));
        let idle = Arc::new(AtomicBool::new(false));
        let idle_clone = idle.clone();
        let mut merger = Merger::new(vec![ring], move || idle_clone.load(AtomicOrdering::Relaxed));
        assert!(merger.pop().is_none());
        assert!(!merger.is_idle());
        idle.store(true, AtomicOrdering::Relaxed);
        assert!(merger.is_idle());
    }

    #[test]
    fn each_producer_stream_is_internally_ordered_under_concurrency() {
        const PER_CPU: u64 = 20_000;
        let ring_a: Arc<SpscRing<Entry>> = Arc::new(SpscRing::new(4096));
        let ring_b: Arc<SpscRing<Entry>> = Arc::new(SpscRing::new(4096));

        let producer = |ring: Arc<SpscRing<Entry>>, cpu: u32| {
            thread::spawn(move || {
                for seq in 0..PER_CPU {
                    let entry = Entry { ts: seq, cpu, seq: seq as u32 };
                    loop {
                        if ring.push(entry).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        };
        let t0 = producer(ring_a.clone(), 0);
        let t1 = producer(ring_b.clone(), 1);

        let mut merger = Merger::new(vec![ring_a, ring_b], || false);
        let mut last_seen = [None::<u64>, None::<u64>];
        let mut total = 0u64;
        while total < PER_CPU * 2 {
            if let Some(e) = merger.pop() {
                let slot = e.cpu as usize;
                if let Some(prev) = last_seen[slot] {
                    assert!(e.ts >= prev, "per-CPU stream went backwards");
                }
                last_seen[slot] = Some(e.ts);
                total += 1;
            } else {
                thread::yield_now();
            }
        }
        t0.join().unwrap();
        t1.join().unwrap();
    }
}
