// SPDX-License-Identifier: MPL-2.0

//! The TX engine (§4.D): fast path, per-CPU enqueue, dispatcher thread,
//! single-locked send, offload, and garbage collection, all built
//! around the `RUNNING`/`PENDING` flag pair described in §9.
//!
//! Grounded on `device/network/device.rs`'s `send`/`free_processed_tx_buffers`
//! for the shape of "submit, and if the ring is full reclaim completions
//! and retry once", generalized to the fast-path/per-CPU-staging split
//! and the dedicated dispatcher thread §4.D calls for.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use pod::Pod;

use crate::error::OffloadError;
use crate::offload;
use crate::pbuf::PBuf;
use crate::percpu::{PerCpuRings, TxBuffDesc};
use crate::merge::Merger;
use crate::queue::Queue;
use crate::sched::{Scheduler, WaitQueue};
use crate::stats::Stats;

/// The exclusive-use token over the hardware TX ring (§9 "RUNNING").
///
/// Not a standard mutex: it is acquired both by interrupt-free fast
/// paths and by the dispatcher thread, which holds it across a blocking
/// wait for ring space inside [`TxEngine::xmit_one_locked`]. Built on
/// the same `WaitQueue` primitive as the per-CPU ring waiter lists,
/// just with the predicate being the acquire attempt itself.
struct RunningFlag<S: Scheduler> {
    taken: AtomicBool,
    waiters: WaitQueue<S>,
}

impl<S: Scheduler> RunningFlag<S> {
    fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
            waiters: WaitQueue::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self, sched: &S) {
        self.waiters.wait_until(sched, || self.try_acquire());
    }

    fn release(&self, sched: &S) {
        self.taken.store(false, Ordering::Release);
        self.waiters.wake_all(sched);
    }
}

/// A driver-owned record bound 1:1 with an in-flight transmit (§3
/// `tx_req`). The serialized header bytes must outlive the descriptor
/// chain the queue holds a raw pointer into, hence they live here next
/// to the `PBuf` rather than on the stack of whichever call built them.
struct TxReq {
    header: Vec<u8>,
    pbuf: PBuf,
}

/// Resources only ever touched while [`RunningFlag`] is held.
struct TxShared<Q: Queue> {
    queue: Q,
    free_cookies: Vec<u16>,
    slab: Vec<Option<TxReq>>,
    pkts_since_kick: usize,
}

enum Submit {
    Sent,
    Malformed(OffloadError),
    NoRoom(PBuf),
}

/// The transmit half of the driver (§4.D).
pub struct TxEngine<S: Scheduler, Q: Queue> {
    sched: Arc<S>,
    running: RunningFlag<S>,
    pending: AtomicBool,
    // SAFETY: only ever dereferenced while `running` is held by the
    // calling thread (enforced by every access going through
    // `with_shared`/`with_shared_mut` helpers below after a successful
    // acquire).
    shared: UnsafeCell<TxShared<Q>>,
    percpu: PerCpuRings<S>,
    stats: Arc<Stats>,
    ecn_negotiated: bool,
    /// Wire length of the net header prepended to every frame: 10 bytes,
    /// or 12 when merged RX buffers was negotiated (§6.3).
    header_len: usize,
    stopped: AtomicBool,
}

unsafe impl<S: Scheduler, Q: Queue> Sync for TxEngine<S, Q> {}

impl<S: Scheduler, Q: Queue> TxEngine<S, Q> {
    pub fn new(
        sched: Arc<S>,
        queue: Q,
        ecn_negotiated: bool,
        header_len: usize,
        stats: Arc<Stats>,
    ) -> Self {
        let capacity = queue.size();
        let percpu = PerCpuRings::new(&sched);
        Self {
            sched,
            running: RunningFlag::new(),
            pending: AtomicBool::new(false),
            shared: UnsafeCell::new(TxShared {
                queue,
                free_cookies: (0..capacity as u16).rev().collect(),
                slab: (0..capacity).map(|_| None).collect(),
                pkts_since_kick: 0,
            }),
            percpu,
            stats,
            ecn_negotiated,
            header_len,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// # Safety
    /// Caller must hold `self.running`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn shared_mut(&self) -> &mut TxShared<Q> {
        unsafe { &mut *self.shared.get() }
    }

    /// Non-blocking entry point (§4.D "Public operations: xmit").
    pub fn xmit(&self, pbuf: PBuf) -> Result<(), OffloadError> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.pending.load(Ordering::Acquire) || !self.running.try_acquire() {
            self.push_cpu(pbuf);
            self.wake_dispatcher_if_pending();
            return Ok(());
        }
        let result = self.xmit_fast_locked(pbuf);
        self.wake_dispatcher_if_pending();
        result
    }

    fn wake_dispatcher_if_pending(&self) {
        if self.pending.load(Ordering::Acquire) {
            self.wake_dispatcher();
        }
    }

    /// Called with `RUNNING` held (from `xmit`'s fast path).
    fn xmit_fast_locked(&self, pbuf: PBuf) -> Result<(), OffloadError> {
        // SAFETY: `self.running` is held by the calling thread.
        let shared = unsafe { self.shared_mut() };
        match Self::try_submit_with_gc(shared, pbuf, self.ecn_negotiated, self.header_len) {
            Submit::Sent => {
                self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                shared.pkts_since_kick += 1;
                let should_kick = shared.pkts_since_kick >= 1;
                if should_kick {
                    self.kick_locked(shared);
                }
                self.running.release(&self.sched);
                Ok(())
            }
            Submit::Malformed(e) => {
                self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
                self.running.release(&self.sched);
                Err(e)
            }
            Submit::NoRoom(pbuf) => {
                self.running.release(&self.sched);
                self.push_cpu(pbuf);
                Ok(())
            }
        }
    }

    fn kick_locked(&self, shared: &mut TxShared<Q>) {
        shared.pkts_since_kick = 0;
        self.stats.doorbells_issued.fetch_add(1, Ordering::Relaxed);
        if shared.queue.kick() {
            self.stats
                .doorbells_accepted
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Applies offload, then tries to submit once; on `NoSpace`, runs GC
    /// and retries exactly once (§4.D fast path step 2).
    fn try_submit_with_gc(
        shared: &mut TxShared<Q>,
        mut pbuf: PBuf,
        ecn_ok: bool,
        header_len: usize,
    ) -> Submit {
        let hdr = match offload::prepare(&mut pbuf, ecn_ok) {
            Ok(hdr) => hdr,
            Err(e) => return Submit::Malformed(e),
        };
        let header_bytes = hdr.as_bytes()[..header_len].to_vec();
        match Self::try_add(shared, header_bytes.clone(), pbuf) {
            Ok(()) => Submit::Sent,
            Err(pbuf) => {
                Self::gc_locked(shared, usize::MAX);
                match Self::try_add(shared, header_bytes, pbuf) {
                    Ok(()) => Submit::Sent,
                    Err(pbuf) => Submit::NoRoom(pbuf),
                }
            }
        }
    }

    /// Attempts one `try_add_buf`. On failure, gives the caller its
    /// `PBuf` back untouched.
    ///
    /// `header_bytes` is moved into the slab slot *before* the ring is
    /// told about it: `add_out` is handed a pointer into that
    /// slab-resident copy, not the caller's now-about-to-be-dropped
    /// local, so the pointer stays valid for as long as the descriptor
    /// is live in the ring.
    fn try_add(shared: &mut TxShared<Q>, header_bytes: Vec<u8>, pbuf: PBuf) -> Result<(), PBuf> {
        let Some(cookie) = shared.free_cookies.pop() else {
            return Err(pbuf);
        };
        shared.slab[cookie as usize] = Some(TxReq {
            header: header_bytes,
            pbuf: PBuf::default(),
        });
        let slot = shared.slab[cookie as usize].as_ref().unwrap();
        let header_ptr = slot.header.as_ptr();
        let header_len = slot.header.len();

        shared.queue.init_sg();
        // SAFETY: `header_ptr` points into `shared.slab[cookie]`'s own
        // `Vec<u8>`, and every `pbuf` segment's backing buffer is kept
        // alive by `pbuf` itself below; both are kept alive in
        // `shared.slab[cookie]` until the matching completion is
        // observed in `gc_locked`, which is the only place a slot is
        // freed.
        unsafe {
            shared.queue.add_out(header_ptr, header_len);
            for seg in pbuf.segments() {
                shared.queue.add_out(seg.as_ptr(), seg.len());
            }
        }
        match shared.queue.try_add_buf(cookie) {
            Ok(()) => {
                shared.slab[cookie as usize].as_mut().unwrap().pbuf = pbuf;
                Ok(())
            }
            Err(_) => {
                shared.slab[cookie as usize] = None;
                shared.free_cookies.push(cookie);
                Err(pbuf)
            }
        }
    }

    /// Drains used descriptors, freeing their `tx_req`s, finalizing in
    /// batches of `capacity/4` (§4.D "Garbage collection"). `max` bounds
    /// how many completions to reclaim; pass `usize::MAX` for "all
    /// available".
    fn gc_locked(shared: &mut TxShared<Q>, max: usize) -> usize {
        let batch = (shared.queue.size() / 4).max(1);
        let mut reclaimed = 0;
        let mut since_finalize = 0;
        while reclaimed < max {
            let Some((cookie, _len)) = shared.queue.get_buf_elem() else {
                break;
            };
            shared.slab[cookie as usize] = None;
            shared.free_cookies.push(cookie);
            reclaimed += 1;
            since_finalize += 1;
            if since_finalize >= batch {
                shared.queue.get_buf_finalize(since_finalize);
                since_finalize = 0;
            }
        }
        if since_finalize > 0 {
            shared.queue.get_buf_finalize(since_finalize);
        }
        reclaimed
    }

    /// Per-CPU enqueue (§4.D "push_cpu"). Preemption is disabled only for
    /// the brief span of each push attempt, never while blocked: a
    /// blocked producer may legitimately migrate, so every retry
    /// (including the ones that happen after waking up) re-pins to
    /// whatever CPU the thread is on at that moment and draws a fresh
    /// timestamp (§4.D step 4).
    fn push_cpu(&self, pbuf: PBuf) {
        let mut pbuf = pbuf;
        let mut cpu_used = 0u32;
        let mut pushed = false;
        self.sched.with_current_cpu_pinned(&mut |cpu| {
            cpu_used = cpu;
            let ts = self.sched.now_ticks();
            let entry = TxBuffDesc {
                pbuf: core::mem::replace(&mut pbuf, PBuf::default()),
                ts,
            };
            match self.percpu.ring(cpu).push(entry) {
                Ok(()) => pushed = true,
                Err(entry) => pbuf = entry.pbuf,
            }
        });
        if pushed {
            self.set_pending_and_maybe_wake();
            return;
        }

        // The ring on `cpu_used` was full. Block on its waiter list; the
        // predicate itself performs every retry (the one required
        // before parking, and every one after a wake-up), each
        // re-pinning to the current CPU, so `wait_until` returning at
        // all means the push has already succeeded.
        let waiters = self.percpu.waiters(cpu_used);
        waiters.wait_until(&self.sched, || {
            let mut ok = false;
            self.sched.with_current_cpu_pinned(&mut |cpu| {
                let ts = self.sched.now_ticks();
                let entry = TxBuffDesc {
                    pbuf: core::mem::replace(&mut pbuf, PBuf::default()),
                    ts,
                };
                match self.percpu.ring(cpu).push(entry) {
                    Ok(()) => ok = true,
                    Err(entry) => pbuf = entry.pbuf,
                }
            });
            ok
        });
        self.set_pending_and_maybe_wake();
    }

    fn set_pending_and_maybe_wake(&self) {
        let was_pending = self.pending.swap(true, Ordering::AcqRel);
        if !was_pending {
            self.wake_dispatcher();
        }
    }

    fn wake_dispatcher(&self) {
        self.stats
            .dispatcher_wakeups
            .fetch_add(1, Ordering::Relaxed);
        self.running.waiters.wake_all(&self.sched);
    }

    /// Called by the dispatcher with `RUNNING` held; blocks until the
    /// packet is actually accepted by the hardware ring (§4.D
    /// "xmit_one_locked").
    fn xmit_one_locked(&self, desc: TxBuffDesc) {
        // SAFETY: caller holds `self.running`.
        let shared = unsafe { self.shared_mut() };
        let mut pbuf = desc.pbuf;
        loop {
            let hdr = match offload::prepare(&mut pbuf, self.ecn_negotiated) {
                Ok(hdr) => hdr,
                Err(_) => {
                    self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let header_bytes = hdr.as_bytes()[..self.header_len].to_vec();
            match Self::try_add(shared, header_bytes, pbuf) {
                Ok(()) => {
                    self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                    shared.pkts_since_kick += 1;
                    if shared.pkts_since_kick >= shared.queue.size() {
                        self.kick_locked(shared);
                    }
                    return;
                }
                Err(given_back) => {
                    pbuf = given_back;
                    self.kick_locked(shared);
                    shared.queue.wait_for_used();
                    Self::gc_locked(shared, usize::MAX);
                }
            }
        }
    }

    /// The single dispatcher thread's body (§4.D "Dispatcher loop").
    /// Runs until [`TxEngine::request_stop`] is observed.
    pub fn run_dispatcher(&self) {
        let rings = self.percpu.all_rings();
        let pending = &self.pending;
        let mut merger = Merger::new(rings, move || pending.load(Ordering::Acquire));
        self.running.acquire(&self.sched);
        loop {
            self.pending.store(false, Ordering::Release);
            let mut sent_any = false;
            loop {
                let Some(desc) = merger.pop() else { break };
                self.xmit_one_locked(desc);
                self.stats.dispatcher_sent.fetch_add(1, Ordering::Relaxed);
                sent_any = true;
            }
            // SAFETY: `self.running` held for the duration of this call.
            let shared = unsafe { self.shared_mut() };
            if sent_any && shared.pkts_since_kick > 0 {
                self.kick_locked(shared);
            }
            if self.stopped.load(Ordering::Acquire) && self.percpu.all_empty() {
                self.running.release(&self.sched);
                return;
            }
            for cpu in 0..self.percpu.len() as u32 {
                self.percpu.waiters(cpu).wake_all(&self.sched);
            }
            self.running.release(&self.sched);
            self.running
                .waiters
                .wait_until(&self.sched, || self.pending.load(Ordering::Acquire));
            self.running.acquire(&self.sched);
        }
    }

    /// Spawns the dispatcher thread (§4.F "allocate and register the
    /// ... TX thread").
    pub fn spawn_dispatcher(self: &Arc<Self>) {
        let engine = self.clone();
        self.sched.spawn(
            "tx-dispatcher",
            Box::new(move || engine.run_dispatcher()),
        );
    }

    /// Invalidates all staged packets (§4.D "flush"). Used on MTU
    /// change: drops whatever is sitting in the per-CPU staging rings
    /// and wakes anyone blocked pushing to them, but leaves the
    /// dispatcher running — only [`TxEngine::shutdown`] makes the
    /// `STOPPED` transition terminal (§4.D "State machine").
    pub fn flush(&self) {
        for cpu in 0..self.percpu.len() as u32 {
            while self.percpu.ring(cpu).pop().is_some() {}
            self.percpu.waiters(cpu).wake_all(&self.sched);
        }
        self.pending.store(true, Ordering::Release);
        self.running.waiters.wake_all(&self.sched);
    }

    /// Flushes staged packets and marks the engine permanently stopped
    /// (§4.D "Terminal: `STOPPED` on flush at teardown"). Used only at
    /// device teardown; the dispatcher exits once the hardware ring and
    /// every staging ring are empty.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.flush();
    }

    /// Blocks until every in-flight transmit has been returned by the
    /// device (§4.F "On detach: ... wait for all in-flight TX requests
    /// to be returned"). Callers call [`TxEngine::shutdown`] first so no
    /// new work can start while this drains the hardware ring.
    pub fn wait_idle(&self) {
        self.running.acquire(&self.sched);
        let shared = unsafe { self.shared_mut() };
        while shared.free_cookies.len() < shared.queue.size() {
            Self::gc_locked(shared, usize::MAX);
            if shared.free_cookies.len() < shared.queue.size() {
                shared.queue.wait_for_used();
            }
        }
        self.running.release(&self.sched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::mock::MockQueue;
    use crate::sched::test_support::ThreadScheduler;

    #[test]
    fn fast_path_accepts_and_counts_packet() {
        let sched = Arc::new(ThreadScheduler::new(2));
        let queue = MockQueue::new(64);
        let engine = TxEngine::new(sched, queue, false, 10, Arc::new(Stats::default()));
        engine.xmit(PBuf::new(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(engine.stats().snapshot().tx_packets, 1);
    }

    #[test]
    fn malformed_tso_request_is_reported_as_einval_on_fast_path() {
        let sched = Arc::new(ThreadScheduler::new(2));
        let queue = MockQueue::new(64);
        let engine = TxEngine::new(sched, queue, false, 10, Arc::new(Stats::default()));
        let mut pbuf = PBuf::new(vec![0u8; 4]);
        pbuf.offload.checksum = true;
        // Too short even for an Ethernet header: HeaderTooShort, not a
        // drop-silently case, since this goes through the fast path.
        assert!(engine.xmit(pbuf).is_err());
        assert_eq!(engine.stats().snapshot().tx_err, 1);
    }

    #[test]
    fn dispatcher_drains_staged_packets_from_two_cpus() {
        let sched = Arc::new(ThreadScheduler::new(3));
        let queue = MockQueue::new(256);
        let engine = Arc::new(TxEngine::new(
            sched.clone(),
            queue,
            false,
            10,
            Arc::new(Stats::default()),
        ));
        engine.spawn_dispatcher();

        let producer = |engine: Arc<TxEngine<ThreadScheduler, MockQueue>>, n: usize| {
            std::thread::spawn(move || {
                for i in 0..n {
                    engine.xmit(PBuf::new(vec![i as u8; 8])).unwrap();
                }
            })
        };
        let t0 = producer(engine.clone(), 500);
        let t1 = producer(engine.clone(), 500);
        t0.join().unwrap();
        t1.join().unwrap();

        let start = std::time::Instant::now();
        while engine.stats().snapshot().tx_packets < 1000 {
            if start.elapsed() > std::time::Duration::from_secs(10) {
                panic!("dispatcher never drained all staged packets");
            }
            std::thread::yield_now();
        }
        assert_eq!(engine.stats().snapshot().tx_err, 0);
    }
}
