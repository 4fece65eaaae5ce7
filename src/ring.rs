// SPDX-License-Identifier: MPL-2.0

//! A bounded, single-producer/single-consumer, lock-free ring buffer of
//! plain values (§4.A).
//!
//! Capacity is fixed at construction time and must be a power of two so
//! that the producer and consumer counters can be masked into slot
//! indices instead of taken modulo. `head` and `tail` are each placed on
//! their own cache line: under concurrent push/pop the producer only
//! ever writes `head` and the consumer only ever writes `tail`, so
//! sharing a line between them would force every push to invalidate the
//! consumer's cache line and vice versa.
//!
//! Both `push` and `pop` are wait-free and perform no allocation; on
//! failure (full / empty) they return immediately instead of retrying.
//! Retrying on contention, if a caller wants it, is the caller's
//! responsibility (see [`crate::percpu`]).

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

#[repr(align(64))]
struct CachePadded<T>(T);

/// A bounded SPSC queue of `T`.
///
/// # Safety invariant
///
/// At most one thread ever calls [`push`](Self::push) concurrently with
/// itself (the producer), and at most one other thread ever calls
/// [`pop`](Self::pop) concurrently with itself (the consumer). Given
/// that, `head` (only advanced by the producer) and `tail` (only
/// advanced by the consumer) partition the slot array into "owned by
/// producer" and "owned by consumer" ranges with no overlap, which is
/// what makes the per-slot `UnsafeCell` accesses below race-free without
/// a lock.
pub struct SpscRing<T> {
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Creates a ring able to hold `capacity` entries. `capacity` must be
    /// a non-zero power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity.is_power_of_two());
        assert!(capacity <= u32::MAX as usize / 2);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<alloc::vec::Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: (capacity - 1) as u32,
            slots,
            head: CachePadded(AtomicU32::new(0)),
            tail: CachePadded(AtomicU32::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Current occupancy. Racy with respect to a concurrent push/pop;
    /// meant for statistics and the full-threshold check in §4.C, not
    /// for correctness decisions.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Attempts to push `value`. Returns `Err(value)` if the ring is
    /// full. Wait-free, no internal retry.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.capacity() as u32 {
            return Err(value);
        }
        let idx = (head & self.mask) as usize;
        // SAFETY: slot `idx` is within the producer's exclusive range
        // (between `tail` and `head`), per the struct-level invariant.
        unsafe { (*self.slots[idx].get()).write(value) };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to pop the oldest entry. Returns `None` if the ring is
    /// empty. Wait-free, no internal retry.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = (tail & self.mask) as usize;
        // SAFETY: slot `idx` was published by the producer (visible via
        // the Acquire load of `head` above) and has not yet been
        // consumed, per the struct-level invariant.
        let value = unsafe { (*self.slots[idx].get()).assume_init_read() };
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        // Drain any entries left between tail and head so their
        // destructors run.
        while self.pop().is_some() {}
    }
}
