// SPDX-License-Identifier: MPL-2.0

//! The per-packet wire header prepended to every TX/RX buffer (§6.3).
//!
//! Laid out exactly as `VirtioNetHdr` in a virtio-net `device/network`
//! driver: a `#[repr(C)]`, `Pod` struct the driver
//! reads and writes at a fixed byte offset, never through a bitfield
//! accessor. `num_buffers` is always present here since §3/§4.E model
//! merged RX buffers as the baseline, not a negotiable extra.

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;
use pod::Pod;

pub const NET_HDR_LEN: usize = core::mem::size_of::<NetHdr>();

#[repr(C)]
#[derive(Default, Debug, Clone, Copy, Pod)]
pub struct NetHdr {
    pub flags: Flags,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

bitflags! {
    #[repr(C)]
    #[derive(Default, Pod)]
    pub struct Flags: u8 {
        const NEEDS_CSUM = 1;
        const DATA_VALID = 2;
        const RSC_INFO = 4;
    }
}

#[repr(u8)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
pub enum GsoType {
    #[default]
    None = 0,
    Tcpv4 = 1,
    Udp = 3,
    Tcpv6 = 4,
    Ecn = 0x80,
}

impl NetHdr {
    /// A header requesting no offloads at all: the common case for
    /// traffic that doesn't need checksum or segmentation help from the
    /// device.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn needs_csum(&self) -> bool {
        self.flags.contains(Flags::NEEDS_CSUM)
    }

    pub fn gso_type(&self) -> Option<GsoType> {
        GsoType::try_from(self.gso_type & !(GsoType::Ecn as u8)).ok()
    }

    pub fn ecn(&self) -> bool {
        self.gso_type & (GsoType::Ecn as u8) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_wire_layout() {
        // flags(1) + gso_type(1) + hdr_len(2) + gso_size(2) + csum_start(2)
        // + csum_offset(2) + num_buffers(2)
        assert_eq!(NET_HDR_LEN, 12);
    }

    #[test]
    fn gso_type_roundtrips_through_ecn_bit() {
        let mut hdr = NetHdr::none();
        hdr.gso_type = GsoType::Tcpv4 as u8 | GsoType::Ecn as u8;
        assert_eq!(hdr.gso_type(), Some(GsoType::Tcpv4));
        assert!(hdr.ecn());
    }

    #[test]
    fn needs_csum_reflects_flag_bit() {
        let mut hdr = NetHdr::none();
        assert!(!hdr.needs_csum());
        hdr.flags |= Flags::NEEDS_CSUM;
        assert!(hdr.needs_csum());
    }
}
