// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cryptographic primitives.
//!
//! Three narrow interfaces back the whole mesh:
//!
//! - HMAC-SHA256 for the per-hop packet MAC (constant-time verify)
//! - ECDSA P-521 sign/verify for certificates, challenge responses and
//!   heartbeats. The hash is SHA-256, not the textbook SHA-512 pairing:
//!   the CA toolchain signs everything `ecdsa-with-SHA256`, uniformly on
//!   both sides, so the core matches it.
//! - ECDH over the static certificate keys, with HKDF-SHA256 turning the
//!   shared secret into the 32-byte per-link session key.
//!
//! All random material comes from the OS CSPRNG.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::SecurityError;

pub use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};

use p521::NistP521;

pub type Signature = ecdsa::Signature<NistP521>;
pub type SigningKey = ecdsa::SigningKey<NistP521>;
pub type VerifyingKey = ecdsa::VerifyingKey<NistP521>;

/// HKDF info string for session key derivation.
pub const SESSION_KEY_INFO: &[u8] = b"IoT Network Session Key";

/// Fixed-width P-521 signature length: r and s, 66 bytes each.
pub const SIGNATURE_FIXED_LEN: usize = 132;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over `data`.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC verification.
pub fn verify_hmac(key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Sign `data` with ECDSA P-521 over SHA-256, DER-encoded output.
///
/// Used for challenge responses, where the variable-length DER form is
/// carried inside a length-framed AUTH message.
pub fn ecdsa_sign_der(key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let signature: Signature = key
        .sign_prehash(&Sha256::digest(data))
        .map_err(|e| SecurityError::Crypto(format!("ECDSA signing failed: {e}")))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Verify a DER-encoded ECDSA P-521 signature over SHA-256.
pub fn ecdsa_verify_der(key: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_der(signature) else {
        return false;
    };
    key.verify_prehash(&Sha256::digest(data), &signature).is_ok()
}

/// Sign `data`, returning the fixed-width 132-byte `r ‖ s` form.
///
/// Used for heartbeats, whose payload has a fixed layout.
pub fn ecdsa_sign_fixed(
    key: &SigningKey,
    data: &[u8],
) -> Result<[u8; SIGNATURE_FIXED_LEN], SecurityError> {
    let signature: Signature = key
        .sign_prehash(&Sha256::digest(data))
        .map_err(|e| SecurityError::Crypto(format!("ECDSA signing failed: {e}")))?;
    let bytes = signature.to_bytes();
    let mut out = [0u8; SIGNATURE_FIXED_LEN];
    out.copy_from_slice(bytes.as_slice());
    Ok(out)
}

/// Verify a fixed-width 132-byte ECDSA P-521 signature over SHA-256.
pub fn ecdsa_verify_fixed(key: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_prehash(&Sha256::digest(data), &signature).is_ok()
}

/// 32-byte per-link session key, zeroized on drop.
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Clone for SessionKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    /// Never prints key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

/// Derive the per-link session key from the static certificate keys:
/// ECDH(local secret, peer public), then HKDF-SHA256 with no salt and the
/// fixed info string, expanded to 32 bytes.
pub fn ecdh_session_key(local: &SecretKey, peer: &PublicKey) -> SessionKey {
    let shared = p521::ecdh::diffie_hellman(local.to_nonzero_scalar(), peer.as_affine());
    let hkdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut okm = [0u8; 32];
    hkdf.expand(SESSION_KEY_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SessionKey(okm)
}

/// 32 random bytes from the OS CSPRNG, used as handshake challenges.
pub fn random_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    challenge
}
