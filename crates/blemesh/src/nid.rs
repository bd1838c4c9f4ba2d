// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network Identifiers (NIDs) and device roles.
//!
//! A NID is a 128-bit identifier unique per device, embedded as the `CN`
//! of the device's X.509 certificate. On the wire it is 16 raw bytes; for
//! diagnostics it formats as a hyphenated UUID string.

use std::fmt;
use std::str::FromStr;

use subtle::ConstantTimeEq;

/// Length of a NID in bytes.
pub const NID_LEN: usize = 16;

/// 128-bit network identifier.
///
/// Equality is byte-wise and constant-time: NIDs appear in authentication
/// decisions (certificate CN matching, heartbeat origin checks), so the
/// comparison must not leak how many leading bytes matched.
#[derive(Debug, Clone, Copy, Eq, Hash)]
pub struct Nid([u8; NID_LEN]);

impl Nid {
    /// Create a NID from raw bytes.
    pub const fn from_bytes(bytes: [u8; NID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a NID from a 16-byte slice.
    pub fn from_slice(data: &[u8]) -> Result<Self, NidError> {
        let bytes: [u8; NID_LEN] = data
            .try_into()
            .map_err(|_| NidError::BadLength(data.len()))?;
        Ok(Self(bytes))
    }

    /// Raw 16-byte representation.
    pub const fn as_bytes(&self) -> &[u8; NID_LEN] {
        &self.0
    }

    /// Short hex prefix for log lines (first 4 bytes).
    pub fn short(&self) -> String {
        let mut s = String::with_capacity(8);
        for b in &self.0[..4] {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl PartialEq for Nid {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Display for Nid {
    /// Hyphenated UUID form, e.g. `2b1f9a0d-4e3c-5d6f-a021-7b8c9d0e1f20`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl FromStr for Nid {
    type Err = NidError;

    /// Parse a UUID string, with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; NID_LEN];
        let mut idx = 0;
        let mut hi: Option<u8> = None;

        for ch in s.chars() {
            if ch == '-' {
                continue;
            }
            let digit = ch.to_digit(16).ok_or(NidError::BadUuid)? as u8;
            match hi.take() {
                None => hi = Some(digit),
                Some(h) => {
                    if idx >= NID_LEN {
                        return Err(NidError::BadUuid);
                    }
                    bytes[idx] = (h << 4) | digit;
                    idx += 1;
                }
            }
        }

        if idx != NID_LEN || hi.is_some() {
            return Err(NidError::BadUuid);
        }
        Ok(Self(bytes))
    }
}

/// NID parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NidError {
    #[error("NID must be {NID_LEN} bytes, got {0}")]
    BadLength(usize),

    #[error("not a valid UUID string")]
    BadUuid,
}

/// Device role, taken from the `OU` attribute of the certificate subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Root/gateway device; unique per network, peripheral-only.
    Sink,
    /// Any non-Sink device.
    Node,
}

impl Role {
    /// Advertisement wire byte: 0 = Sink, 1 = Node.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Sink => 0,
            Self::Node => 1,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Sink),
            1 => Some(Self::Node),
            _ => None,
        }
    }

    pub const fn is_sink(self) -> bool {
        matches!(self, Self::Sink)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink => write!(f, "Sink"),
            Self::Node => write!(f, "Node"),
        }
    }
}
