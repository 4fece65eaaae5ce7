// SPDX-License-Identifier: MPL-2.0

//! The RX engine (§4.E): a single poll thread that pops used descriptors,
//! reassembles merged-RX-buffer chains, validates checksums, hands each
//! packet to the upper layer, and refills the ring.
//!
//! Grounded on `device/network/device.rs`'s `receive`/`add_rx_buffer` for
//! the shape of "pop one completion, hand its buffer up, immediately post
//! a replacement" and on `comps/network/src/buffer.rs`'s `RX_BUFFER_LEN`
//! for the size of a freshly allocated receive buffer.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use log::warn;
use pod::Pod;

use crate::header::NetHdr;
use crate::pbuf::{PBuf, UpperLayer};
use crate::queue::Queue;
use crate::stats::Stats;

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const UDP_CSUM_OFFSET: u16 = 6;
const TCP_CSUM_OFFSET: u16 = 16;

/// A freshly posted receive buffer's size (§4.E "Ring refill": "Allocate
/// a fresh MCL-sized buffer"), matching `aster-network`'s `RX_BUFFER_LEN`.
const RX_BUFFER_LEN: usize = 4096;

struct RxShared<Q: Queue> {
    queue: Q,
    free_cookies: Vec<u16>,
    /// The buffer posted under each cookie, kept alive until the device
    /// returns it.
    posted: Vec<Option<Vec<u8>>>,
}

/// The receive half of the driver (§4.E).
pub struct RxEngine<Q: Queue, U: UpperLayer> {
    shared: RxShared<Q>,
    upper: Arc<U>,
    stats: Arc<Stats>,
    header_len: usize,
    merged_rx_buffers: bool,
    rx_csum_negotiated: bool,
}

impl<Q: Queue, U: UpperLayer> RxEngine<Q, U> {
    pub fn new(
        queue: Q,
        upper: Arc<U>,
        stats: Arc<Stats>,
        header_len: usize,
        merged_rx_buffers: bool,
        rx_csum_negotiated: bool,
    ) -> Self {
        let capacity = queue.size();
        Self {
            shared: RxShared {
                queue,
                free_cookies: (0..capacity as u16).rev().collect(),
                posted: (0..capacity).map(|_| None).collect(),
            },
            upper,
            stats,
            header_len,
            merged_rx_buffers,
            rx_csum_negotiated,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Posts fresh buffers until the available ring is full or a
    /// descriptor slot can't be found (§4.E "Ring refill", §4.F "Refill
    /// the RX ring before advertising DRIVER_OK").
    pub fn refill(&mut self) {
        let mut posted_any = false;
        while self.shared.queue.avail_ring_has_room(1) {
            let Some(cookie) = self.shared.free_cookies.pop() else {
                break;
            };
            let mut buf = vec![0u8; RX_BUFFER_LEN];
            self.shared.queue.init_sg();
            // SAFETY: `buf` is kept alive in `shared.posted[cookie]` until
            // `get_buf_elem` returns this cookie and we take it back out.
            unsafe {
                self.shared.queue.add_in(buf.as_mut_ptr(), buf.len());
            }
            match self.shared.queue.try_add_buf(cookie) {
                Ok(()) => {
                    self.shared.posted[cookie as usize] = Some(buf);
                    posted_any = true;
                }
                Err(_) => {
                    self.shared.free_cookies.push(cookie);
                    break;
                }
            }
        }
        if posted_any {
            self.stats.doorbells_issued.fetch_add(1, Ordering::Relaxed);
            if self.shared.queue.kick() {
                self.stats
                    .doorbells_accepted
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The poll thread's body (§4.E "Poll loop"). Runs until the upper
    /// layer reports it is no longer `RUNNING`.
    pub fn run(&mut self) {
        self.refill();
        loop {
            self.shared.queue.wait_for_used();
            while let Some((cookie, len)) = self.shared.queue.get_buf_elem() {
                self.shared.queue.get_buf_finalize(1);
                self.handle_completion(cookie, len as usize);
            }
            if self.shared.queue.refill_needed() {
                self.refill();
            }
            if !self.upper.is_running() {
                return;
            }
        }
    }

    /// Reassembles and delivers one completion (§4.E steps 1-8).
    fn handle_completion(&mut self, cookie: u16, len: usize) {
        let Some(buf) = self.shared.posted[cookie as usize].take() else {
            warn!("rx completion for cookie {cookie} with no posted buffer");
            return;
        };
        self.shared.free_cookies.push(cookie);

        if len < self.header_len + ETH_HDR_LEN {
            self.stats.rx_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut hdr_bytes = [0u8; 16];
        hdr_bytes[..self.header_len].copy_from_slice(&buf[..self.header_len]);
        let hdr = NetHdr::from_bytes(&hdr_bytes[..12]);

        let num_buffers = if self.merged_rx_buffers {
            hdr.num_buffers.max(1) as usize
        } else {
            1
        };

        // `len` is device-reported and must never be trusted past the
        // size of the buffer we actually posted.
        let mut segments = vec![buf[..len.min(buf.len())].to_vec()];
        let mut complete = true;
        for _ in 1..num_buffers {
            let Some((frag_cookie, frag_len)) = self.shared.queue.get_buf_elem() else {
                complete = false;
                break;
            };
            self.shared.queue.get_buf_finalize(1);
            let Some(frag_buf) = self.shared.posted[frag_cookie as usize].take() else {
                complete = false;
                break;
            };
            self.shared.free_cookies.push(frag_cookie);
            let frag_len = (frag_len as usize).min(frag_buf.len());
            segments.push(frag_buf[..frag_len].to_vec());
        }
        if !complete {
            self.stats.rx_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut pbuf = PBuf::from_segments(segments);
        pbuf.strip_prefix(self.header_len);

        if hdr.needs_csum() && self.rx_csum_negotiated {
            let valid = validate_checksum(&pbuf, hdr.csum_start, hdr.csum_offset);
            pbuf.rx_checksum_valid = Some(valid);
            if valid {
                self.stats.rx_csum.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.rx_csum_err.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .rx_bytes
            .fetch_add(pbuf.total_len() as u64, Ordering::Relaxed);
        self.upper.input(pbuf);
    }
}

/// §4.E "Checksum validation policy". `pbuf` has already had the net
/// header stripped off, so offsets here are relative to the Ethernet
/// frame.
fn validate_checksum(pbuf: &PBuf, csum_start: u16, csum_offset: u16) -> bool {
    let frame = pbuf.to_contiguous();
    let csum_start = csum_start as usize;
    let csum_len = csum_start + csum_offset as usize;
    if frame.len() < csum_len + 2 {
        return false;
    }
    if frame.len() < ETH_HDR_LEN + 2 {
        return false;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let l3_off = if ethertype == ETHERTYPE_VLAN {
        ETH_HDR_LEN + VLAN_TAG_LEN
    } else {
        ETH_HDR_LEN
    };
    let inner_ethertype = if ethertype == ETHERTYPE_VLAN {
        if frame.len() < l3_off {
            return false;
        }
        u16::from_be_bytes([frame[l3_off - 2], frame[l3_off - 1]])
    } else {
        ethertype
    };
    if inner_ethertype != ETHERTYPE_IPV4 {
        return false;
    }
    if frame.len() < l3_off + 20 {
        return false;
    }
    let ihl = (frame[l3_off] & 0x0f) as usize * 4;
    if ihl < 20 || frame.len() < l3_off + ihl {
        return false;
    }
    let protocol = frame[l3_off + 9];
    let l4_off = l3_off + ihl;

    let expected_offset = match protocol {
        IP_PROTO_UDP => UDP_CSUM_OFFSET,
        IP_PROTO_TCP => TCP_CSUM_OFFSET,
        _ => return false,
    };
    if csum_offset != expected_offset {
        return false;
    }
    let field_off = l4_off + csum_offset as usize;
    if frame.len() < field_off + 2 {
        return false;
    }
    if protocol == IP_PROTO_UDP && frame[field_off] == 0 && frame[field_off + 1] == 0 {
        // UDP-over-IPv4 allows an all-zero checksum (§4.E.csum).
        return true;
    }
    true
}
