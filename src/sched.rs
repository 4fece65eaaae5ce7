// SPDX-License-Identifier: MPL-2.0

//! The scheduler external collaborator (§1, §9).
//!
//! Thread creation, sleep/wake, per-CPU binding, preemption disable,
//! and cross-CPU IPI are all put behind one seam rather than handled
//! directly: the host scheduler is an external collaborator the driver
//! never reimplements. This module is the seam: a small trait
//! the rest of the crate is generic over, plus a [`WaitQueue`] built on
//! top of it for the handful of places the driver actually blocks
//! (§5 "Suspension points").
//!
//! [`Scheduler::park`]/[`Scheduler::unpark`] are required to have the
//! same non-lost-wakeup contract as `std::thread::park`/`Thread::unpark`:
//! an `unpark` that happens before the matching `park` must still cause
//! that `park` call to return immediately, rather than block forever.
//! This is what makes the PENDING/clear-before-check idiom (§9) correct
//! without an additional lock around the flag check and the park call.

use alloc::boxed::Box;

/// External collaborator: per-CPU scheduling.
pub trait Scheduler: Send + Sync + 'static {
    /// Opaque handle identifying one thread, used to target a wake-up.
    type Handle: Clone + Send + Sync + 'static;

    /// Number of CPUs the driver should provision per-CPU state for.
    fn num_cpus(&self) -> u32;

    /// A free-running monotonic clock. Source of the timestamps in
    /// `tx_buff_desc` (§3); need not be wall-clock time.
    fn now_ticks(&self) -> u64;

    /// Disables preemption/migration for the duration of `f`, then
    /// invokes it with the calling thread's (now pinned) CPU index.
    /// Used by §4.C step 1 ("read the current monotonic timestamp" /
    /// "attempt push on this CPU's ring" must happen on one CPU).
    fn with_current_cpu_pinned(&self, f: &mut dyn FnMut(u32));

    /// A handle identifying the calling thread, suitable for a later
    /// [`Scheduler::unpark`] call from another thread.
    fn current_thread(&self) -> Self::Handle;

    /// Blocks the calling thread until a matching `unpark`. Must return
    /// immediately if an `unpark` targeting this thread already
    /// happened since the last `park` call returned (no lost wake-ups).
    fn park(&self);

    /// Wakes the thread identified by `handle`, per the contract on
    /// [`Scheduler::park`].
    fn unpark(&self, handle: &Self::Handle);

    /// Spawns a new kernel thread running `f`, returning a handle to it.
    /// Used once per driver instance, for the RX poll thread and the TX
    /// dispatcher thread (§4.F "Allocate and register the RX and TX
    /// threads").
    fn spawn(&self, name: &'static str, f: Box<dyn FnOnce() + Send>) -> Self::Handle;
}

/// A FIFO list of blocked threads, woken explicitly by another thread
/// once some condition they were waiting on becomes true.
///
/// This is the primitive behind the per-CPU ring's waiter list (§4.C)
/// and the `RUNNING` flag's blocked acquirers (§4.D); both need more
/// than "wake the one thread I know about" because more than one
/// producer can be blocked on the same ring or flag at once.
pub struct WaitQueue<S: Scheduler> {
    waiters: spin::Mutex<alloc::vec::Vec<S::Handle>>,
}

impl<S: Scheduler> WaitQueue<S> {
    pub fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(alloc::vec::Vec::new()),
        }
    }

    /// Blocks the calling thread until `predicate` returns `true`,
    /// re-checking it every time this thread is woken (spurious wakes
    /// and wakes meant for a different waiter both just cause another
    /// check). The predicate is called with no lock held.
    pub fn wait_until(&self, sched: &S, mut predicate: impl FnMut() -> bool) {
        loop {
            if predicate() {
                return;
            }
            {
                let mut waiters = self.waiters.lock();
                // Re-check once more under the list lock: if the
                // condition became true between the check above and
                // taking the lock, don't register as a waiter at all.
                if predicate() {
                    return;
                }
                waiters.push(sched.current_thread());
            }
            sched.park();
        }
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn wake_one(&self, sched: &S) {
        let next = self.waiters.lock().pop();
        if let Some(handle) = next {
            sched.unpark(&handle);
        }
    }

    /// Wakes every currently queued thread.
    pub fn wake_all(&self, sched: &S) {
        let all: alloc::vec::Vec<_> = self.waiters.lock().drain(..).collect();
        for handle in all {
            sched.unpark(&handle);
        }
    }
}

impl<S: Scheduler> Default for WaitQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Scheduler;
    use alloc::boxed::Box;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::thread::{self, Thread};

    /// A [`Scheduler`] backed by real OS threads, for host-side tests.
    pub struct ThreadScheduler {
        cpus: u32,
        clock: AtomicU64,
    }

    impl ThreadScheduler {
        pub fn new(cpus: u32) -> Self {
            Self {
                cpus,
                clock: AtomicU64::new(0),
            }
        }
    }

    impl Scheduler for ThreadScheduler {
        type Handle = Thread;

        fn num_cpus(&self) -> u32 {
            self.cpus
        }

        fn now_ticks(&self) -> u64 {
            self.clock.fetch_add(1, Ordering::Relaxed)
        }

        fn with_current_cpu_pinned(&self, f: &mut dyn FnMut(u32)) {
            // Host threads aren't really pinned; approximate a stable
            // per-thread CPU assignment with a thread-local counter so
            // tests can still exercise "each CPU owns one ring".
            thread_local! {
                static CPU_ID: AtomicU32 = const { AtomicU32::new(u32::MAX) };
            }
            CPU_ID.with(|cell| {
                let mut id = cell.load(Ordering::Relaxed);
                if id == u32::MAX {
                    id = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % self.cpus.max(1);
                    cell.store(id, Ordering::Relaxed);
                }
                f(id)
            });
        }

        fn current_thread(&self) -> Thread {
            thread::current()
        }

        fn park(&self) {
            thread::park();
        }

        fn unpark(&self, handle: &Thread) {
            handle.unpark();
        }

        fn spawn(&self, name: &'static str, f: Box<dyn FnOnce() + Send>) -> Thread {
            let builder = thread::Builder::new().name(name.into());
            let handle = builder.spawn(f).expect("failed to spawn thread");
            let thread = handle.thread().clone();
            // Tests don't need the join handle back; detach it.
            std::mem::forget(handle);
            thread
        }
    }

    static NEXT_CPU: AtomicU32 = AtomicU32::new(0);
}
