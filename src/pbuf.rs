// SPDX-License-Identifier: MPL-2.0

//! The packet buffer and upper-layer collaborator (§3 `pbuf`, §6.2).
//!
//! The packet buffer's storage and the network stack above the driver
//! are external collaborators the driver borrows from and hands
//! control back to. [`PBuf`] is a concrete, minimal stand-in
//! for "an externally owned chain of linked buffer segments" good
//! enough to drive and test the TX/RX engines against; a real
//! integration would replace it with whatever buffer type the upper
//! layer already uses, the way a virtio-net driver works against
//! `aster_network`'s `RxBuffer`/`TxBuffer` rather than a crate-local
//! type.

use alloc::vec::Vec;

use crate::stats::StatsSnapshot;

/// Checksum/segmentation hints the upper layer attaches to an outgoing
/// packet, consumed by [`crate::offload`] (§4.D "offload").
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOffloadRequest {
    pub checksum: bool,
    pub tso: bool,
    /// Segmentation size for TSO, meaningful only when `tso` is set.
    pub gso_size: u16,
}

/// An externally owned chain of linked buffer segments (§3 `pbuf`).
///
/// Segments are stored as owned byte vectors rather than borrowed
/// slices because ownership genuinely moves across the borrow the
/// driver and the hardware ring share: the upper layer hands a `PBuf`
/// to `xmit`, and it is not safe to touch again until the driver hands
/// it back (on drop) or the device returns it.
#[derive(Debug, Clone, Default)]
pub struct PBuf {
    segments: Vec<Vec<u8>>,
    pub offload: TxOffloadRequest,
    /// On a received chain, whether the net header's checksum was
    /// validated (§4.E "Checksum validation policy"); `None` when the
    /// host didn't ask for validation at all. §7: a failed validation
    /// still delivers the packet but leaves this `Some(false)` rather
    /// than setting the DATA_VALID hint.
    pub rx_checksum_valid: Option<bool>,
}

impl PBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            segments: alloc::vec![bytes],
            offload: TxOffloadRequest::default(),
            rx_checksum_valid: None,
        }
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        Self {
            segments,
            offload: TxOffloadRequest::default(),
            rx_checksum_valid: None,
        }
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Ensures the first `n` bytes of the chain live contiguously in the
    /// first segment, merging subsequent segments into it as needed
    /// (§4.D "ensuring contiguous headers by pulling up fragments").
    /// Fails if the whole chain is shorter than `n`.
    pub fn pullup(&mut self, n: usize) -> bool {
        if self.total_len() < n {
            return false;
        }
        while self.segments.first().map(Vec::len).unwrap_or(0) < n && self.segments.len() > 1 {
            let next = self.segments.remove(1);
            self.segments[0].extend_from_slice(&next);
        }
        true
    }

    /// A contiguous copy of the whole chain, used where a single slice
    /// is genuinely required (header parsing, checksum validation).
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Inserts a new leading segment, used to prepend the per-packet net
    /// header ahead of the payload without copying the payload.
    pub fn prepend(&mut self, header: Vec<u8>) {
        self.segments.insert(0, header);
    }

    /// Removes the first `n` bytes of the chain (§4.E step 6, "strip
    /// the leading header bytes from the chain"). Panics if `n` exceeds
    /// the first segment's length; callers always `pullup` first.
    pub fn strip_prefix(&mut self, n: usize) {
        assert!(n <= self.segments[0].len());
        self.segments[0].drain(0..n);
        if self.segments[0].is_empty() && self.segments.len() > 1 {
            self.segments.remove(0);
        }
    }

    /// Every segment as a guest->host fragment, in order, for submission
    /// to [`crate::queue::Queue::add_out`].
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Vec::as_slice)
    }

    /// The first segment's bytes. After `pullup(n)` succeeds, this slice
    /// is at least `n` bytes long, which lets header-parsing code read
    /// without copying the whole chain.
    pub fn first_segment(&self) -> &[u8] {
        &self.segments[0]
    }
}

/// External collaborator: the network stack above the driver (§6.2).
pub trait UpperLayer: Send + Sync {
    /// Delivers one reassembled receive chain. Called exactly once per
    /// frame (§6.2).
    fn input(&self, pbuf: PBuf);

    /// Copies the current counters out to the caller.
    fn fill_stats(&self, out: &mut StatsSnapshot);

    /// Whether the upper layer still considers the interface `RUNNING`
    /// (§4.E step 10).
    fn is_running(&self) -> bool;
}
