// SPDX-License-Identifier: MPL-2.0

//! Per-CPU TX staging rings (§3 `tx_buff_desc`/"per-CPU staging ring",
//! §4.C).
//!
//! One bounded ring per CPU, each with its own waiter list for
//! producers that find their ring full. The enqueue/dequeue protocol
//! that couples these rings to the `PENDING` flag and the dispatcher
//! lives in [`crate::tx`]; this module only owns the rings themselves,
//! matching the component split in the system overview (C is "one SPSC
//! ring per CPU ... with waiter list", D is the engine built on top).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::merge::Timestamped;
use crate::pbuf::PBuf;
use crate::ring::SpscRing;
use crate::sched::{Scheduler, WaitQueue};

/// Default capacity of each per-CPU staging ring (§3).
pub const STAGING_RING_CAPACITY: usize = 4096;

/// `(pbuf, monotonic timestamp)`, as staged on a per-CPU ring (§3).
pub struct TxBuffDesc {
    pub pbuf: PBuf,
    pub ts: u64,
}

impl Timestamped for TxBuffDesc {
    fn timestamp(&self) -> u64 {
        self.ts
    }
}

/// All per-CPU staging rings for one driver instance, created at driver
/// init and drained at teardown (§3 "Per-CPU staging ring").
pub struct PerCpuRings<S: Scheduler> {
    rings: Vec<Arc<SpscRing<TxBuffDesc>>>,
    waiters: Vec<WaitQueue<S>>,
}

impl<S: Scheduler> PerCpuRings<S> {
    /// Allocates one ring (and waiter list) per CPU the scheduler
    /// reports, each of [`STAGING_RING_CAPACITY`].
    pub fn new(sched: &S) -> Self {
        Self::with_capacity(sched, STAGING_RING_CAPACITY)
    }

    pub fn with_capacity(sched: &S, capacity: usize) -> Self {
        let n = sched.num_cpus().max(1) as usize;
        let rings = (0..n).map(|_| Arc::new(SpscRing::new(capacity))).collect();
        let waiters = (0..n).map(|_| WaitQueue::new()).collect();
        Self { rings, waiters }
    }

    pub fn ring(&self, cpu: u32) -> &Arc<SpscRing<TxBuffDesc>> {
        &self.rings[cpu as usize % self.rings.len()]
    }

    pub fn waiters(&self, cpu: u32) -> &WaitQueue<S> {
        &self.waiters[cpu as usize % self.waiters.len()]
    }

    /// Every ring, for handing to the [`crate::merge::Merger`] that
    /// drains them in timestamp order.
    pub fn all_rings(&self) -> Vec<Arc<SpscRing<TxBuffDesc>>> {
        self.rings.clone()
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    /// True once every ring has been drained; used during teardown
    /// (§4.F "drain per-CPU staging rings" before freeing them).
    pub fn all_empty(&self) -> bool {
        self.rings.iter().all(|r| r.is_empty())
    }
}
