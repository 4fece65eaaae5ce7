// SPDX-License-Identifier: MPL-2.0

//! Error types for the driver's external-facing operations. Plain enums
//! with `Display`/`core::error::Error` impls, in the style of
//! `VirtioNetError`/`QueueError` in upstream virtio device and queue
//! modules, rather than a `thiserror`-derived hierarchy — this
//! crate has no use for `anyhow`-style error chaining since every
//! caller is expected to match on the variant.

use core::fmt;

/// Failures from the abstract hardware-ring transport (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The available ring has no free descriptor slots right now.
    NoSpace,
    /// The scatter-gather chain being submitted was empty or otherwise
    /// malformed.
    InvalidArgs,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::NoSpace => write!(f, "descriptor ring has no free slots"),
            QueueError::InvalidArgs => write!(f, "invalid descriptor chain"),
        }
    }
}

impl core::error::Error for QueueError {}

pub type QueueResult<T> = Result<T, QueueError>;

/// Failures from TX offload negotiation/header parsing (§4.D, §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadError {
    /// A checksum or segmentation offload was requested for a frame too
    /// short to contain the headers it claims to have.
    HeaderTooShort,
    /// The frame requests a GSO type the negotiated features don't
    /// support.
    UnsupportedGso,
    /// `csum_offset` would place the checksum field outside the frame.
    ChecksumOffsetOutOfRange,
}

impl fmt::Display for OffloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffloadError::HeaderTooShort => write!(f, "frame too short for its declared headers"),
            OffloadError::UnsupportedGso => write!(f, "GSO type not negotiated with the device"),
            OffloadError::ChecksumOffsetOutOfRange => {
                write!(f, "checksum offset falls outside the frame")
            }
        }
    }
}

impl core::error::Error for OffloadError {}

pub type OffloadResult<T> = Result<T, OffloadError>;

/// Failures during device probe/feature negotiation (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The device did not advertise a feature bit this driver requires.
    MissingRequiredFeature,
    /// `max_virtqueue_pairs` was zero or exceeded the scheduler's CPU
    /// count in a way the driver can't reconcile.
    BadQueuePairCount,
    /// The config space read back a MAC address of all zeroes or all
    /// ones, both of which virtio-net treats as "no MAC provided".
    InvalidMacAddress,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::MissingRequiredFeature => {
                write!(f, "device did not advertise a required feature")
            }
            ProbeError::BadQueuePairCount => write!(f, "unusable virtqueue pair count"),
            ProbeError::InvalidMacAddress => write!(f, "device reported no usable MAC address"),
        }
    }
}

impl core::error::Error for ProbeError {}

pub type ProbeResult<T> = Result<T, ProbeError>;
