// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat payload codec.
//!
//! The Sink proves its liveness by broadcasting a signed heartbeat:
//!
//! ```text
//! +-----------+-------------+------------------+
//! | sink NID  | timestamp   | ECDSA signature  |
//! | 16 B      | 8 B f64 BE  | 132 B (r ‖ s)    |
//! +-----------+-------------+------------------+
//! ```
//!
//! The timestamp is IEEE-754 seconds since the UNIX epoch. The signature
//! covers `sink_nid ‖ timestamp` under the Sink's certificate key, in the
//! fixed-width P-521 form so the payload layout stays constant. Freshness
//! is *not* checked against the receiver's clock; replay is handled by the
//! packet-level sequence window.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::nid::{Nid, NID_LEN};
use crate::security::crypto::{
    ecdsa_sign_fixed, ecdsa_verify_fixed, SigningKey, VerifyingKey, SIGNATURE_FIXED_LEN,
};
use crate::security::SecurityError;

pub const HEARTBEAT_TIMESTAMP_LEN: usize = 8;
pub const HEARTBEAT_SIGNATURE_LEN: usize = SIGNATURE_FIXED_LEN;
pub const HEARTBEAT_PAYLOAD_LEN: usize =
    NID_LEN + HEARTBEAT_TIMESTAMP_LEN + HEARTBEAT_SIGNATURE_LEN;

/// Heartbeat decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat payload must be {HEARTBEAT_PAYLOAD_LEN} bytes, got {0}")]
    BadLength(usize),
}

/// One signed heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatPayload {
    pub sink_nid: Nid,
    pub timestamp: f64,
    pub signature: [u8; HEARTBEAT_SIGNATURE_LEN],
}

impl HeartbeatPayload {
    /// Build and sign a heartbeat for `timestamp`.
    pub fn sign(
        sink_nid: Nid,
        timestamp: f64,
        key: &SigningKey,
    ) -> Result<Self, SecurityError> {
        let signature = ecdsa_sign_fixed(key, &signed_bytes(&sink_nid, timestamp))?;
        Ok(Self {
            sink_nid,
            timestamp,
            signature,
        })
    }

    /// Verify the signature against the Sink's certificate key.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        ecdsa_verify_fixed(key, &signed_bytes(&self.sink_nid, self.timestamp), &self.signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEARTBEAT_PAYLOAD_LEN);
        buf.extend_from_slice(self.sink_nid.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, HeartbeatError> {
        if data.len() != HEARTBEAT_PAYLOAD_LEN {
            return Err(HeartbeatError::BadLength(data.len()));
        }
        let mut nid = [0u8; NID_LEN];
        nid.copy_from_slice(&data[..NID_LEN]);
        let mut ts = [0u8; HEARTBEAT_TIMESTAMP_LEN];
        ts.copy_from_slice(&data[NID_LEN..NID_LEN + HEARTBEAT_TIMESTAMP_LEN]);
        let mut signature = [0u8; HEARTBEAT_SIGNATURE_LEN];
        signature.copy_from_slice(&data[NID_LEN + HEARTBEAT_TIMESTAMP_LEN..]);

        Ok(Self {
            sink_nid: Nid::from_bytes(nid),
            timestamp: f64::from_be_bytes(ts),
            signature,
        })
    }

    /// Seconds elapsed since this heartbeat was stamped (diagnostic only).
    pub fn age(&self) -> f64 {
        now_epoch() - self.timestamp
    }
}

/// The bytes the Sink signs: NID followed by the big-endian timestamp.
fn signed_bytes(sink_nid: &Nid, timestamp: f64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(NID_LEN + HEARTBEAT_TIMESTAMP_LEN);
    buf.extend_from_slice(sink_nid.as_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Current epoch time as f64 seconds.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
