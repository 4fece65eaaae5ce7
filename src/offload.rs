// SPDX-License-Identifier: MPL-2.0

//! TX header parsing and net-header population (§4.D "offload").
//!
//! Parses just enough of the outgoing frame — Ethernet, an optional
//! single VLAN tag, IPv4, and (for TSO) TCP — to fill in the per-packet
//! net header's checksum and segmentation fields, pulling up fragments
//! as needed so each header is read from one contiguous slice. Nothing
//! here depends on a concrete transport or buffer type; it only ever
//! touches a [`PBuf`] and a [`NetHdr`].

use crate::error::{OffloadError, OffloadResult};
use crate::header::{Flags, GsoType, NetHdr};
use crate::pbuf::PBuf;

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const TCP_FLAGS_OFFSET: usize = 13;
const TCP_FLAG_CWR: u8 = 0x80;
const UDP_CSUM_OFFSET: u16 = 6;
const TCP_CSUM_OFFSET: u16 = 16;

struct L2 {
    ethertype: u16,
    len: usize,
}

/// Parses the Ethernet header, transparently unwrapping a single VLAN
/// tag (§4.D: "parse the Ethernet header (optionally unwrap a single
/// VLAN tag)").
fn parse_l2(pbuf: &mut PBuf) -> OffloadResult<L2> {
    if !pbuf.pullup(ETH_HDR_LEN) {
        return Err(OffloadError::HeaderTooShort);
    }
    let buf = pbuf.first_segment();
    let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
    if ethertype != ETHERTYPE_VLAN {
        return Ok(L2 {
            ethertype,
            len: ETH_HDR_LEN,
        });
    }
    if !pbuf.pullup(ETH_HDR_LEN + VLAN_TAG_LEN) {
        return Err(OffloadError::HeaderTooShort);
    }
    let buf = pbuf.first_segment();
    let inner = u16::from_be_bytes([buf[16], buf[17]]);
    Ok(L2 {
        ethertype: inner,
        len: ETH_HDR_LEN + VLAN_TAG_LEN,
    })
}

struct Ipv4 {
    header_len: usize,
    protocol: u8,
}

fn parse_ipv4(pbuf: &mut PBuf, l2_len: usize) -> OffloadResult<Ipv4> {
    if !pbuf.pullup(l2_len + 20) {
        return Err(OffloadError::HeaderTooShort);
    }
    let ihl = (pbuf.first_segment()[l2_len] & 0x0f) as usize * 4;
    if ihl < 20 || !pbuf.pullup(l2_len + ihl) {
        return Err(OffloadError::HeaderTooShort);
    }
    let protocol = pbuf.first_segment()[l2_len + 9];
    Ok(Ipv4 {
        header_len: ihl,
        protocol,
    })
}

fn tcp_header_len(pbuf: &mut PBuf, l3_off: usize) -> OffloadResult<usize> {
    if !pbuf.pullup(l3_off + 20) {
        return Err(OffloadError::HeaderTooShort);
    }
    let data_offset = (pbuf.first_segment()[l3_off + 12] >> 4) as usize * 4;
    if data_offset < 20 || !pbuf.pullup(l3_off + data_offset) {
        return Err(OffloadError::HeaderTooShort);
    }
    Ok(data_offset)
}

fn tcp_cwr_set(pbuf: &PBuf, l3_off: usize) -> bool {
    pbuf.first_segment()[l3_off + TCP_FLAGS_OFFSET] & TCP_FLAG_CWR != 0
}

/// Populates a [`NetHdr`] for one outgoing packet (§4.D "offload").
///
/// `pbuf` is mutated in place (pulled up) so its fragments stay
/// contiguous through whatever header the offload touched; callers
/// submit the (possibly pulled-up) chain afterward. `ecn_negotiated`
/// reflects `GUEST_ECN && HOST_ECN` (§6.5).
pub fn prepare(pbuf: &mut PBuf, ecn_negotiated: bool) -> OffloadResult<NetHdr> {
    let mut hdr = NetHdr::none();
    if !pbuf.offload.checksum && !pbuf.offload.tso {
        return Ok(hdr);
    }

    let l2 = parse_l2(pbuf)?;
    if l2.ethertype != ETHERTYPE_IPV4 {
        // Non-IPv4: checksum/TSO offload is out of scope (§4.D implies
        // IPv4/TCP for TSO; non-IPv4 checksum requests have nothing to
        // anchor csum_start/csum_offset to).
        return Ok(hdr);
    }
    let ip = parse_ipv4(pbuf, l2.len)?;
    let l3_off = l2.len;
    let l4_off = l3_off + ip.header_len;

    if pbuf.offload.checksum {
        let csum_offset = match ip.protocol {
            IP_PROTO_UDP => UDP_CSUM_OFFSET,
            IP_PROTO_TCP => TCP_CSUM_OFFSET,
            _ => return Ok(hdr),
        };
        hdr.flags |= Flags::NEEDS_CSUM;
        hdr.csum_start = l3_off as u16;
        hdr.csum_offset = csum_offset;
    }

    if pbuf.offload.tso && ip.protocol == IP_PROTO_TCP {
        let tcp_len = tcp_header_len(pbuf, l4_off)?;
        if tcp_cwr_set(pbuf, l4_off) && !ecn_negotiated {
            return Err(OffloadError::UnsupportedGso);
        }
        hdr.gso_type = GsoType::Tcpv4 as u8;
        if tcp_cwr_set(pbuf, l4_off) {
            hdr.gso_type |= GsoType::Ecn as u8;
        }
        hdr.hdr_len = (l4_off + tcp_len) as u16;
        hdr.gso_size = pbuf.offload.gso_size;
    }

    Ok(hdr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn ipv4_tcp_frame(cwr: bool) -> Vec<u8> {
        let mut eth = vec![0u8; ETH_HDR_LEN];
        eth[12] = 0x08;
        eth[13] = 0x00;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45; // version 4, ihl 5
        ip[9] = IP_PROTO_TCP;
        let mut tcp = vec![0u8; 20];
        tcp[12] = 5 << 4; // data offset 5 words
        if cwr {
            tcp[TCP_FLAGS_OFFSET] = TCP_FLAG_CWR;
        }
        let mut frame = eth;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&tcp);
        frame.extend_from_slice(b"payload");
        frame
    }

    #[test]
    fn checksum_offload_sets_csum_fields_for_tcp() {
        let mut pbuf = PBuf::new(ipv4_tcp_frame(false));
        pbuf.offload.checksum = true;
        let hdr = prepare(&mut pbuf, false).unwrap();
        assert!(hdr.needs_csum());
        assert_eq!(hdr.csum_start, ETH_HDR_LEN as u16);
        assert_eq!(hdr.csum_offset, TCP_CSUM_OFFSET);
    }

    #[test]
    fn tso_sets_gso_fields_for_ipv4_tcp() {
        let mut pbuf = PBuf::new(ipv4_tcp_frame(false));
        pbuf.offload.tso = true;
        pbuf.offload.gso_size = 1448;
        let hdr = prepare(&mut pbuf, false).unwrap();
        assert_eq!(hdr.gso_type().unwrap(), GsoType::Tcpv4);
        assert_eq!(hdr.hdr_len as usize, ETH_HDR_LEN + 20 + 20);
        assert_eq!(hdr.gso_size, 1448);
    }

    #[test]
    fn tso_with_cwr_is_dropped_when_ecn_not_negotiated() {
        let mut pbuf = PBuf::new(ipv4_tcp_frame(true));
        pbuf.offload.tso = true;
        assert_eq!(
            prepare(&mut pbuf, false).unwrap_err(),
            OffloadError::UnsupportedGso
        );
    }

    #[test]
    fn tso_with_cwr_is_accepted_when_ecn_negotiated() {
        let mut pbuf = PBuf::new(ipv4_tcp_frame(true));
        pbuf.offload.tso = true;
        let hdr = prepare(&mut pbuf, true).unwrap();
        assert!(hdr.ecn());
    }

    #[test]
    fn non_ipv4_leaves_header_clear() {
        let mut eth = vec![0u8; ETH_HDR_LEN];
        eth[12] = 0x86;
        eth[13] = 0xdd; // IPv6 ethertype
        eth.extend_from_slice(&[0u8; 20]);
        let mut pbuf = PBuf::new(eth);
        pbuf.offload.checksum = true;
        let hdr = prepare(&mut pbuf, false).unwrap();
        assert!(!hdr.needs_csum());
    }
}
