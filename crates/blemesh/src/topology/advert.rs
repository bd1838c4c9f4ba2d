// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-info advertising and parent selection.
//!
//! Every device broadcasts two bytes of manufacturer data, `role ‖
//! hop_count`, so scanners can pick a parent without connecting. The hop
//! byte uses 255 as the "unknown / Sink" sentinel, which caps legitimate
//! hop counts at 254; trees anywhere near that depth are out of scope.
//!
//! The advertisement is unauthenticated by design: it only biases which
//! parent a scanner *tries*; authentication decides whether the attachment
//! actually happens.

use std::time::{Duration, Instant};

use crate::nid::{Nid, Role, NID_LEN};

/// Sentinel hop byte: advertised by the Sink, and by Nodes with no uplink.
pub const HOP_UNKNOWN: u8 = 255;

/// Largest representable real hop count.
pub const HOP_MAX: u8 = 254;

/// Advertisement decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdvertError {
    #[error("advertisement must be 2 bytes, got {0}")]
    BadLength(usize),

    #[error("unknown role byte 0x{0:02x}")]
    BadRole(u8),

    #[error("device info must be {} bytes, got {0}", DeviceInfo::WIRE_LEN)]
    BadDeviceInfoLength(usize),

    #[error("neighbor table truncated")]
    Truncated,
}

/// The 2-byte manufacturer-data advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAdvert {
    pub role: Role,
    /// Real hop count, or [`HOP_UNKNOWN`].
    pub hop_count: u8,
}

impl DeviceAdvert {
    pub fn encode(&self) -> [u8; 2] {
        [self.role.to_byte(), self.hop_count]
    }

    pub fn decode(data: &[u8]) -> Result<Self, AdvertError> {
        if data.len() != 2 {
            return Err(AdvertError::BadLength(data.len()));
        }
        let role = Role::from_byte(data[0]).ok_or(AdvertError::BadRole(data[0]))?;
        Ok(Self {
            role,
            hop_count: data[1],
        })
    }
}

/// Payload of the Device Info characteristic: `nid ‖ hop_count ‖ role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub nid: Nid,
    pub hop_count: u8,
    pub role: Role,
}

impl DeviceInfo {
    pub const WIRE_LEN: usize = NID_LEN + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(self.nid.as_bytes());
        buf.push(self.hop_count);
        buf.push(self.role.to_byte());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, AdvertError> {
        if data.len() != Self::WIRE_LEN {
            return Err(AdvertError::BadDeviceInfoLength(data.len()));
        }
        let mut nid = [0u8; NID_LEN];
        nid.copy_from_slice(&data[..NID_LEN]);
        let role = Role::from_byte(data[NID_LEN + 1]).ok_or(AdvertError::BadRole(data[NID_LEN + 1]))?;
        Ok(Self {
            nid: Nid::from_bytes(nid),
            hop_count: data[NID_LEN],
            role,
        })
    }
}

/// Neighbor Table characteristic payload: `count ‖ count x (nid ‖ hop)`.
pub fn encode_neighbor_table(entries: &[(Nid, u8)]) -> Vec<u8> {
    let count = entries.len().min(u8::MAX as usize);
    let mut buf = Vec::with_capacity(1 + count * (NID_LEN + 1));
    buf.push(count as u8);
    for (nid, hop) in entries.iter().take(count) {
        buf.extend_from_slice(nid.as_bytes());
        buf.push(*hop);
    }
    buf
}

pub fn decode_neighbor_table(data: &[u8]) -> Result<Vec<(Nid, u8)>, AdvertError> {
    let Some((&count, mut rest)) = data.split_first() else {
        return Err(AdvertError::Truncated);
    };
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < NID_LEN + 1 {
            return Err(AdvertError::Truncated);
        }
        let mut nid = [0u8; NID_LEN];
        nid.copy_from_slice(&rest[..NID_LEN]);
        entries.push((Nid::from_bytes(nid), rest[NID_LEN]));
        rest = &rest[NID_LEN + 1..];
    }
    Ok(entries)
}

/// One scanned neighbor, as seen by the uplink chooser.
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    /// BLE address of the advertiser.
    pub addr: String,
    pub advert: DeviceAdvert,
    /// Signal strength in dBm (tie-breaker).
    pub rssi: i16,
    pub last_seen: Instant,
}

impl NeighborInfo {
    pub fn new(addr: impl Into<String>, advert: DeviceAdvert, rssi: i16) -> Self {
        Self {
            addr: addr.into(),
            advert,
            rssi,
            last_seen: Instant::now(),
        }
    }

    /// Whether this neighbor can serve as a parent at all: the Sink always
    /// can, a Node only while it is attached itself.
    pub fn eligible_parent(&self) -> bool {
        self.advert.role.is_sink() || self.advert.hop_count != HOP_UNKNOWN
    }

    /// Hop count used for parent comparison: the Sink counts as 0 even
    /// though it advertises the 255 sentinel.
    pub fn comparison_hop(&self) -> u8 {
        if self.advert.role.is_sink() {
            0
        } else {
            self.advert.hop_count
        }
    }

    /// Hop count this device would advertise after attaching here.
    pub fn child_hop(&self) -> u8 {
        if self.advert.role.is_sink() {
            0
        } else {
            self.advert.hop_count.saturating_add(1).min(HOP_MAX)
        }
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.last_seen.elapsed() > max_age
    }
}

/// Pick the preferred parent: smallest hop count (Sink counts as 0), ties
/// broken by the strongest signal.
pub fn choose_parent(candidates: &[NeighborInfo]) -> Option<&NeighborInfo> {
    candidates
        .iter()
        .filter(|n| n.eligible_parent())
        .min_by_key(|n| (n.comparison_hop(), -n.rssi))
}
