// SPDX-License-Identifier: MPL-2.0

//! The abstract hardware-ring transport (§6.1).
//!
//! The split-I/O ring itself — available/used index pair, notification
//! doorbell, interrupt masking — is an external collaborator: a
//! host-facing ring transport primitive treated as a black-box
//! `queue`. [`Queue`] is that black box's interface,
//! modeled directly on the operation list in §6.1 and on the shape of
//! `aster_virtio::queue::VirtQueue` (`add_dma_buf`, `pop_used`,
//! `should_notify`, `can_pop`), generalized to a trait so the rest of
//! the crate never depends on a concrete transport.
//!
//! Buffers are passed as raw pointer/length pairs rather than borrowed
//! slices because a real transport's "add" calls return before the
//! device has consumed the descriptor — the memory must stay valid
//! across an arbitrary delay, which a borrow cannot express. This
//! mirrors how `VirtQueue::add_dma_buf` ultimately stores a physical
//! address rather than a Rust reference.

use crate::error::{QueueError, QueueResult};

/// A descriptor-ring transport, binding a guest driver to one direction
/// (send or receive) of a paravirtualized device.
///
/// Only the `RUNNING`-flag holder (§5) may call `try_add_buf`,
/// `get_buf_elem`, `get_buf_finalize`, or `kick`; the predicates are
/// safe to call from any thread.
pub trait Queue: Send {
    /// Descriptor-ring capacity (number of slots).
    fn size(&self) -> usize;

    /// Opts into indirect descriptors, amortizing ring-slot usage for
    /// multi-fragment packets (§4.F, GLOSSARY "Indirect descriptors").
    fn set_indirect(&mut self, enable: bool);

    /// Begins building a new scatter-gather descriptor chain.
    fn init_sg(&mut self);

    /// Appends a guest-to-host fragment to the chain under construction.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes until the chain this
    /// fragment ends up in is returned through [`Queue::get_buf_elem`].
    unsafe fn add_out(&mut self, ptr: *const u8, len: usize);

    /// Appends a host-to-guest fragment to the chain under construction.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes until the chain
    /// this fragment ends up in is returned through
    /// [`Queue::get_buf_elem`].
    unsafe fn add_in(&mut self, ptr: *mut u8, len: usize);

    /// Publishes the scatter-gather chain accumulated since the last
    /// `init_sg` as one descriptor chain tagged `cookie`. Non-blocking:
    /// fails with [`QueueError::NoSpace`] if the available ring has no
    /// room, without side effects.
    fn try_add_buf(&mut self, cookie: u16) -> QueueResult<()>;

    /// Dequeues one completion from the used ring, if any, as
    /// `(cookie, bytes written by the device)`.
    fn get_buf_elem(&mut self) -> Option<(u16, u32)>;

    /// Finalizes the last `n` completions returned by `get_buf_elem`,
    /// freeing their descriptor slots for reuse.
    fn get_buf_finalize(&mut self, n: usize);

    /// Whether the used ring currently holds at least one completion.
    fn used_ring_not_empty(&self) -> bool;

    /// Whether the available ring has room for `n` more descriptor
    /// chains.
    fn avail_ring_has_room(&self, n: usize) -> bool;

    /// Whether the receive side has consumed enough posted buffers that
    /// a refill burst should run (§4.E step 9).
    fn refill_needed(&self) -> bool;

    /// Rings the doorbell. Returns whether the host actually needed the
    /// notification (for the doorbell-acceptance statistic, §4.G).
    fn kick(&mut self) -> bool;

    /// Masks this queue's completion interrupt.
    fn disable_interrupts(&mut self);

    /// Blocks the calling thread until `used_ring_not_empty()` would
    /// return `true`.
    fn wait_for_used(&self);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::thread;
    use std::time::{Duration, Instant};

    enum PendingFrag {
        Out(Vec<u8>),
        In { ptr: usize, len: usize },
    }

    /// A software stand-in for a real descriptor ring, used by unit
    /// tests to drive the TX/RX engines without real hardware.
    pub struct MockQueue {
        capacity: usize,
        indirect: bool,
        building: Vec<PendingFrag>,
        outstanding: usize,
        used: VecDeque<(u16, u32)>,
        /// TX submissions not yet acknowledged, oldest first: (cookie, total out bytes).
        pending_tx: VecDeque<(u16, usize)>,
        /// Copy of every TX submission's guest->host bytes, for assertions.
        pub submitted: Vec<(u16, Vec<u8>)>,
        /// Frames waiting to be delivered into the next posted RX buffer(s).
        incoming: VecDeque<Vec<u8>>,
        /// RX buffers posted but not yet matched with an incoming frame.
        posted_rx: VecDeque<(u16, usize, usize)>, // cookie, ptr, len
        auto_complete_tx: bool,
        kicks: usize,
        host_needs_kick: bool,
    }

    impl MockQueue {
        pub fn new(capacity: usize) -> Self {
            Self {
                capacity,
                indirect: false,
                building: Vec::new(),
                outstanding: 0,
                used: VecDeque::new(),
                pending_tx: VecDeque::new(),
                submitted: Vec::new(),
                incoming: VecDeque::new(),
                posted_rx: VecDeque::new(),
                auto_complete_tx: true,
                kicks: 0,
                host_needs_kick: true,
            }
        }

        pub fn set_auto_complete_tx(&mut self, v: bool) {
            self.auto_complete_tx = v;
        }

        pub fn kicks(&self) -> usize {
            self.kicks
        }

        pub fn indirect(&self) -> bool {
            self.indirect
        }

        /// Simulates the host finishing the oldest outstanding TX
        /// submission.
        pub fn complete_one_tx(&mut self) -> bool {
            if let Some((cookie, len)) = self.pending_tx.pop_front() {
                self.used.push_back((cookie, len as u32));
                true
            } else {
                false
            }
        }

        pub fn complete_all_tx(&mut self) {
            while self.complete_one_tx() {}
        }

        /// Queues a frame to be written into the next posted RX
        /// descriptor(s), one descriptor per chunk, matching real
        /// merged-RX-buffer delivery where each posted buffer receives
        /// a portion of one incoming frame.
        pub fn push_incoming_frame(&mut self, chunks: Vec<Vec<u8>>) {
            for chunk in chunks {
                self.incoming.push_back(chunk);
                self.try_deliver();
            }
        }

        fn try_deliver(&mut self) {
            while let Some(bytes) = self.incoming.front() {
                let Some((cookie, ptr, len)) = self.posted_rx.front().copied() else {
                    break;
                };
                let n = bytes.len().min(len);
                // SAFETY: `ptr`/`len` came from an `add_in` call whose
                // caller promised the memory stays valid until
                // completion, which is now.
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, n);
                }
                self.posted_rx.pop_front();
                self.used.push_back((cookie, n as u32));
                self.incoming.pop_front();
            }
        }
    }

    impl Queue for MockQueue {
        fn size(&self) -> usize {
            self.capacity
        }

        fn set_indirect(&mut self, enable: bool) {
            self.indirect = enable;
        }

        fn init_sg(&mut self) {
            self.building.clear();
        }

        unsafe fn add_out(&mut self, ptr: *const u8, len: usize) {
            let bytes = unsafe { core::slice::from_raw_parts(ptr, len) }.to_vec();
            self.building.push(PendingFrag::Out(bytes));
        }

        unsafe fn add_in(&mut self, ptr: *mut u8, len: usize) {
            self.building.push(PendingFrag::In {
                ptr: ptr as usize,
                len,
            });
        }

        fn try_add_buf(&mut self, cookie: u16) -> QueueResult<()> {
            if self.outstanding >= self.capacity {
                return Err(QueueError::NoSpace);
            }
            let frags = core::mem::take(&mut self.building);
            if frags.is_empty() {
                return Err(QueueError::InvalidArgs);
            }
            self.outstanding += 1;

            let mut out_bytes = Vec::new();
            let mut in_frag = None;
            for frag in frags {
                match frag {
                    PendingFrag::Out(bytes) => out_bytes.extend_from_slice(&bytes),
                    PendingFrag::In { ptr, len } => in_frag = Some((ptr, len)),
                }
            }

            if let Some((ptr, len)) = in_frag {
                self.posted_rx.push_back((cookie, ptr, len));
                self.try_deliver();
            } else {
                self.submitted.push((cookie, out_bytes.clone()));
                let len = out_bytes.len();
                if self.auto_complete_tx {
                    self.used.push_back((cookie, len as u32));
                } else {
                    self.pending_tx.push_back((cookie, len));
                }
            }
            Ok(())
        }

        fn get_buf_elem(&mut self) -> Option<(u16, u32)> {
            self.used.pop_front()
        }

        fn get_buf_finalize(&mut self, n: usize) {
            self.outstanding = self.outstanding.saturating_sub(n);
        }

        fn used_ring_not_empty(&self) -> bool {
            !self.used.is_empty()
        }

        fn avail_ring_has_room(&self, n: usize) -> bool {
            self.capacity - self.outstanding >= n
        }

        fn refill_needed(&self) -> bool {
            self.capacity - self.posted_rx.len() >= self.capacity / 2
        }

        fn kick(&mut self) -> bool {
            self.kicks += 1;
            self.host_needs_kick
        }

        fn disable_interrupts(&mut self) {}

        fn wait_for_used(&self) {
            let start = Instant::now();
            while !self.used_ring_not_empty() {
                if start.elapsed() > Duration::from_secs(5) {
                    panic!("MockQueue::wait_for_used timed out; host never completed");
                }
                thread::yield_now();
            }
        }
    }
}
