// SPDX-License-Identifier: MPL-2.0

//! Per-queue counters (§4.G, §6.4).

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the owning thread (RX poll thread or whichever
/// thread currently holds `RUNNING` on TX) and read as a racy snapshot
/// by [`Stats::snapshot`] — §5 explicitly allows torn reads across
/// fields here.
#[derive(Default)]
pub struct Stats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_err: AtomicU64,
    pub tx_csum_offloaded: AtomicU64,
    pub tx_tso: AtomicU64,
    pub doorbells_issued: AtomicU64,
    pub doorbells_accepted: AtomicU64,
    pub dispatcher_wakeups: AtomicU64,
    pub dispatcher_sent: AtomicU64,

    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_drops: AtomicU64,
    pub rx_csum: AtomicU64,
    pub rx_csum_err: AtomicU64,
}

/// A plain-value copy of [`Stats`] for handing to a caller (§6.4: "input
/// packets, input bytes, input drops, input errors; output packets,
/// output bytes, output errors" at minimum, extended with the
/// driver-internal counters §4.G also names).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_err: u64,
    pub tx_csum_offloaded: u64,
    pub tx_tso: u64,
    pub doorbells_issued: u64,
    pub doorbells_accepted: u64,
    pub dispatcher_wakeups: u64,
    pub dispatcher_sent: u64,

    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_drops: u64,
    pub rx_csum: u64,
    pub rx_csum_err: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_err: self.tx_err.load(Ordering::Relaxed),
            tx_csum_offloaded: self.tx_csum_offloaded.load(Ordering::Relaxed),
            tx_tso: self.tx_tso.load(Ordering::Relaxed),
            doorbells_issued: self.doorbells_issued.load(Ordering::Relaxed),
            doorbells_accepted: self.doorbells_accepted.load(Ordering::Relaxed),
            dispatcher_wakeups: self.dispatcher_wakeups.load(Ordering::Relaxed),
            dispatcher_sent: self.dispatcher_sent.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_drops: self.rx_drops.load(Ordering::Relaxed),
            rx_csum: self.rx_csum.load(Ordering::Relaxed),
            rx_csum_err: self.rx_csum_err.load(Ordering::Relaxed),
        }
    }
}
