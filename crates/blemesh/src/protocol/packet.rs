// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network packet codec.
//!
//! Fixed 70-byte header followed by an opaque payload:
//!
//! ```text
//! 0        16       32     33    34       38       70
//! +--------+--------+------+-----+--------+--------+---------+
//! | source | dest   | type | ttl | seq    | mac    | payload |
//! | 16 B   | 16 B   | 1 B  | 1 B | 4 B BE | 32 B   | N B     |
//! +--------+--------+------+-----+--------+--------+---------+
//! ```
//!
//! The MAC is HMAC-SHA256 over the 38 pre-MAC header bytes concatenated with
//! the payload, keyed per outbound link. `source` and `sequence` are never
//! rewritten in transit; `ttl` strictly decreases on every forward, which is
//! why the MAC must be recomputed hop by hop.

use crate::nid::{Nid, NID_LEN};
use crate::security::crypto::{hmac_sha256, verify_hmac};

/// Length of the MAC field.
pub const MAC_LEN: usize = 32;

/// Header bytes covered by the MAC (everything before the MAC field).
const PRE_MAC_LEN: usize = 2 * NID_LEN + 1 + 1 + 4;

/// Total fixed header length.
pub const PACKET_HEADER_LEN: usize = PRE_MAC_LEN + MAC_LEN;

/// Packet message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Data = 0x01,
    Heartbeat = 0x02,
    Control = 0x03,
    AuthRequest = 0x04,
}

impl MessageType {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Heartbeat),
            0x03 => Some(Self::Control),
            0x04 => Some(Self::AuthRequest),
            _ => None,
        }
    }

    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Packet decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("header too short: need {PACKET_HEADER_LEN} bytes, got {0}")]
    MalformedHeader(usize),

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

/// A parsed network packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: Nid,
    pub destination: Nid,
    pub msg_type: MessageType,
    pub ttl: u8,
    pub sequence: u32,
    pub mac: [u8; MAC_LEN],
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with a zeroed MAC placeholder. The MAC is applied by
    /// the router once the outbound link (and therefore the key) is known.
    pub fn new(
        source: Nid,
        destination: Nid,
        msg_type: MessageType,
        ttl: u8,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source,
            destination,
            msg_type,
            ttl,
            sequence,
            mac: [0u8; MAC_LEN],
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(self.source.as_bytes());
        buf.extend_from_slice(self.destination.as_bytes());
        buf.push(self.msg_type.to_byte());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.mac);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse wire bytes. The TTL byte is plain unsigned here; the 255
    /// "unknown" sentinel used in advertisements does not apply to packets.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(PacketError::MalformedHeader(data.len()));
        }

        let mut src = [0u8; NID_LEN];
        src.copy_from_slice(&data[0..NID_LEN]);
        let mut dst = [0u8; NID_LEN];
        dst.copy_from_slice(&data[NID_LEN..2 * NID_LEN]);
        let source = Nid::from_bytes(src);
        let destination = Nid::from_bytes(dst);
        let type_byte = data[32];
        let msg_type = MessageType::from_byte(type_byte).ok_or(PacketError::UnknownType(type_byte))?;
        let ttl = data[33];
        let sequence = u32::from_be_bytes([data[34], data[35], data[36], data[37]]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&data[PRE_MAC_LEN..PACKET_HEADER_LEN]);
        let payload = data[PACKET_HEADER_LEN..].to_vec();

        Ok(Self {
            source,
            destination,
            msg_type,
            ttl,
            sequence,
            mac,
            payload,
        })
    }

    /// Bytes covered by the MAC: the 38 pre-MAC header bytes plus payload.
    pub fn mac_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PRE_MAC_LEN + self.payload.len());
        buf.extend_from_slice(self.source.as_bytes());
        buf.extend_from_slice(self.destination.as_bytes());
        buf.push(self.msg_type.to_byte());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Compute and set the MAC under `key`.
    pub fn apply_mac(&mut self, key: &[u8; 32]) {
        self.mac = hmac_sha256(key, &self.mac_input());
    }

    /// Constant-time MAC verification under `key`.
    pub fn verify_mac(&self, key: &[u8; 32]) -> bool {
        verify_hmac(key, &self.mac_input(), &self.mac)
    }

    /// Total wire size.
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }
}
