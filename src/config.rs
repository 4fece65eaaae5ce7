// SPDX-License-Identifier: MPL-2.0

//! Feature bits and negotiated device configuration (§4.F, §6.5).
//!
//! Grounded on `device/network/config.rs`'s `NetworkFeatures` bitflags
//! and `VirtioNetConfig`, trimmed to the bits this driver actually
//! negotiates (§6.5's explicit list) — RSS, hash reporting, and the
//! other modern-only bits upstream virtio-net carries are out of scope here
//! (Non-goals: "control-virtqueue operations", "multi-queue
//! negotiation").

use bitflags::bitflags;

use crate::error::{ProbeError, ProbeResult};

bitflags! {
    /// Feature bits relevant to this driver, numbered exactly as the
    /// virtio-net device spec's "Feature bits used" (§6.5).
    #[derive(Default)]
    pub struct Features: u64 {
        const CSUM        = 1 << 0;
        const GUEST_CSUM  = 1 << 1;
        const MAC         = 1 << 5;
        const GUEST_TSO4  = 1 << 7;
        const GUEST_ECN   = 1 << 9;
        const GUEST_UFO   = 1 << 10;
        const HOST_TSO4   = 1 << 11;
        const HOST_ECN    = 1 << 13;
        const MRG_RXBUF   = 1 << 15;
        const STATUS      = 1 << 16;
    }
}

impl Features {
    /// The set this driver asks for during negotiation (§4.F "negotiate
    /// the intersection of what the driver requests ... with what the
    /// device offers").
    pub fn requested() -> Self {
        Features::MAC
            | Features::MRG_RXBUF
            | Features::STATUS
            | Features::CSUM
            | Features::GUEST_CSUM
            | Features::GUEST_TSO4
            | Features::HOST_TSO4
            | Features::HOST_ECN
            | Features::GUEST_ECN
            | Features::GUEST_UFO
    }
}

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    fn is_usable(&self) -> bool {
        self.0 != [0; 6] && self.0 != [0xff; 6]
    }
}

/// The subset of the device's config space this driver reads at probe
/// time, mirroring `VirtioNetConfig` (§4.F).
#[derive(Debug, Clone, Copy)]
pub struct DeviceParams {
    pub mac: MacAddr,
    pub device_features: Features,
    pub max_virtqueue_pairs: u16,
    pub mtu: u16,
}

/// The outcome of intersecting [`Features::requested`] with the
/// device's advertised bits, plus the header-size decision it implies.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFeatures {
    pub bits: Features,
}

impl NegotiatedFeatures {
    /// Negotiates with the device's advertised bits and validates the
    /// result against what this driver is unwilling to run without
    /// (§4.F, §7 "feature negotiation failure is fatal at probe time").
    pub fn negotiate(device: &DeviceParams) -> ProbeResult<Self> {
        let bits = Features::requested() & device.device_features;
        if !bits.contains(Features::MAC) {
            return Err(ProbeError::MissingRequiredFeature);
        }
        if !device.mac.is_usable() {
            return Err(ProbeError::InvalidMacAddress);
        }
        if device.max_virtqueue_pairs == 0 {
            return Err(ProbeError::BadQueuePairCount);
        }
        Ok(Self { bits })
    }

    pub fn merged_rx_buffers(&self) -> bool {
        self.bits.contains(Features::MRG_RXBUF)
    }

    /// 12 bytes (net header + `num_buffers`) when merged RX buffers was
    /// negotiated, else 10 (net-header only) (§4.F, §6.3).
    pub fn net_header_len(&self) -> usize {
        if self.merged_rx_buffers() {
            12
        } else {
            10
        }
    }

    pub fn tx_csum(&self) -> bool {
        self.bits.contains(Features::CSUM)
    }

    pub fn rx_csum(&self) -> bool {
        self.bits.contains(Features::GUEST_CSUM)
    }

    pub fn tso4(&self) -> bool {
        self.bits.contains(Features::GUEST_TSO4) && self.bits.contains(Features::HOST_TSO4)
    }

    pub fn ecn(&self) -> bool {
        self.bits.contains(Features::GUEST_ECN) && self.bits.contains(Features::HOST_ECN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(features: Features) -> DeviceParams {
        DeviceParams {
            mac: MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
            device_features: features,
            max_virtqueue_pairs: 1,
            mtu: 1500,
        }
    }

    #[test]
    fn negotiation_intersects_and_picks_ten_byte_header_without_mrg_rxbuf() {
        let offered = Features::MAC | Features::STATUS | Features::CSUM;
        let negotiated = NegotiatedFeatures::negotiate(&params(offered)).unwrap();
        assert!(!negotiated.merged_rx_buffers());
        assert_eq!(negotiated.net_header_len(), 10);
        assert!(negotiated.tx_csum());
    }

    #[test]
    fn negotiation_picks_twelve_byte_header_with_mrg_rxbuf() {
        let offered = Features::MAC | Features::MRG_RXBUF;
        let negotiated = NegotiatedFeatures::negotiate(&params(offered)).unwrap();
        assert!(negotiated.merged_rx_buffers());
        assert_eq!(negotiated.net_header_len(), 12);
    }

    #[test]
    fn negotiation_fails_without_mac_feature() {
        let offered = Features::STATUS;
        assert_eq!(
            NegotiatedFeatures::negotiate(&params(offered)).unwrap_err(),
            ProbeError::MissingRequiredFeature
        );
    }

    #[test]
    fn negotiation_fails_on_zero_mac_address() {
        let mut p = params(Features::MAC);
        p.mac = MacAddr([0; 6]);
        assert_eq!(
            NegotiatedFeatures::negotiate(&p).unwrap_err(),
            ProbeError::InvalidMacAddress
        );
    }

    #[test]
    fn tso4_requires_both_guest_and_host_bits() {
        let offered = Features::MAC | Features::GUEST_TSO4;
        let negotiated = NegotiatedFeatures::negotiate(&params(offered)).unwrap();
        assert!(!negotiated.tso4());
    }
}
