// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security layer: crypto primitives, certificate handling, replay
//! protection and the mutual-authentication state machine.
//!
//! ```text
//! CertStore   -- local cert/key + CA cert, peer certificate validation
//! crypto      -- HMAC-SHA256, ECDSA P-521 (SHA-256), ECDH + HKDF-SHA256
//! ReplayWindow-- per-source sliding-window duplicate detection
//! AuthFsm     -- CERT_OFFER / CHALLENGE / RESPONSE handshake
//! ```

pub mod certs;
pub mod crypto;
pub mod handshake;
pub mod replay;

pub use certs::{CertStore, PeerIdentity};
pub use crypto::SessionKey;
pub use handshake::{AuthFsm, AuthOutcome, AuthState};
pub use replay::{ReplayReject, ReplayWindow};

use crate::protocol::auth::AuthFrameError;

/// Security-related errors.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// Peer certificate failed validation (CA signature, validity window,
    /// basic constraints, or NID extraction).
    #[error("certificate invalid: {0}")]
    CertInvalid(String),

    /// A challenge response did not verify against the peer certificate.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// A cryptographic primitive failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Handshake message arrived in a state that does not expect it, or the
    /// peer reported failure.
    #[error("auth protocol violation: {0}")]
    Protocol(String),

    /// The handshake exceeded its deadline.
    #[error("authentication timed out")]
    TimedOut,

    /// Malformed AUTH framing.
    #[error(transparent)]
    BadFrame(#[from] AuthFrameError),

    /// Certificate or key file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
