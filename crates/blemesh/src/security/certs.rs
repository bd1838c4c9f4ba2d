// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Certificate store.
//!
//! Loads the device certificate, its private key and the CA certificate
//! from disk at boot (and never writes them), and validates certificates
//! offered by peers during authentication:
//!
//! 1. CA signature over the TBS bytes verifies against the stored CA
//! 2. the current time is inside `[notBefore, notAfter]`
//! 3. BasicConstraints is present with `CA=false`
//!
//! The device NID is the certificate CN; the role comes from the `OU`
//! attribute (`OU=Sink` marks the Sink, anything else is a Node).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use p521::pkcs8::{DecodePrivateKey, DecodePublicKey};
use p521::{PublicKey, SecretKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::prelude::*;

use crate::nid::{Nid, Role};
use crate::security::crypto::{PrehashVerifier, Signature, SigningKey, VerifyingKey};
use crate::security::SecurityError;

// Signature algorithm OIDs the CA toolchain may emit (RFC 5758).
const OID_ECDSA_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_SHA384: &str = "1.2.840.10045.4.3.3";
const OID_ECDSA_SHA512: &str = "1.2.840.10045.4.3.4";

/// Identity extracted from a successfully validated peer certificate.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub nid: Nid,
    pub role: Role,
    /// The peer's P-521 public key, used for the ECDH session key and for
    /// verifying challenge responses and (for the Sink) heartbeats.
    pub public_key: PublicKey,
}

impl PeerIdentity {
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(self.public_key)
    }
}

/// On-disk certificate material for one device.
pub struct CertStore {
    local_nid: Nid,
    local_role: Role,
    local_cert_pem: Vec<u8>,
    secret_key: SecretKey,
    ca_subject: String,
    ca_public_key: VerifyingKey,
}

impl CertStore {
    /// Load `certificate.pem`, `private_key.pem` and `ca_certificate.pem`.
    ///
    /// The private key may be PKCS#8 (`BEGIN PRIVATE KEY`) or SEC1
    /// (`BEGIN EC PRIVATE KEY`).
    pub fn open(
        cert_path: &Path,
        key_path: &Path,
        ca_cert_path: &Path,
    ) -> Result<Self, SecurityError> {
        let local_cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let ca_pem = std::fs::read(ca_cert_path)?;

        let ca_der = pem_to_der(&ca_pem)?;
        let (_, ca_cert) = X509Certificate::from_der(&ca_der)
            .map_err(|e| SecurityError::CertInvalid(format!("CA certificate parse: {e}")))?;
        let ca_subject = ca_cert.subject().to_string();
        let ca_public_key = public_key_of(&ca_cert).map(VerifyingKey::from)?;

        let cert_der = pem_to_der(&local_cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| SecurityError::CertInvalid(format!("device certificate parse: {e}")))?;
        let local_nid = nid_of(&cert)?;
        let local_role = role_of(&cert);

        let secret_key = SecretKey::from_pkcs8_pem(&key_pem)
            .or_else(|_| SecretKey::from_sec1_pem(&key_pem))
            .map_err(|e| SecurityError::CertInvalid(format!("private key parse: {e}")))?;

        // The key on disk must belong to the certificate, otherwise every
        // later handshake would fail at the challenge step.
        let cert_public = public_key_of(&cert)?;
        if cert_public != secret_key.public_key() {
            return Err(SecurityError::CertInvalid(
                "private key does not match the device certificate".into(),
            ));
        }

        log::info!(
            "[CERTS] loaded identity nid={} role={} (CA: {})",
            local_nid,
            local_role,
            ca_subject
        );

        Ok(Self {
            local_nid,
            local_role,
            local_cert_pem,
            secret_key,
            ca_subject,
            ca_public_key,
        })
    }

    pub fn local_nid(&self) -> Nid {
        self.local_nid
    }

    pub fn local_role(&self) -> Role {
        self.local_role
    }

    /// PEM bytes offered to peers in CERT_OFFER.
    pub fn local_cert_pem(&self) -> &[u8] {
        &self.local_cert_pem
    }

    /// The device's long-term P-521 key, for signing challenge responses
    /// and heartbeats.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret_key)
    }

    /// The device's long-term key in ECDH form, for session key derivation.
    pub fn ecdh_secret(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Validate a peer certificate offered during authentication.
    pub fn validate_peer(&self, cert_pem: &[u8]) -> Result<PeerIdentity, SecurityError> {
        let der = pem_to_der(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| SecurityError::CertInvalid(format!("peer certificate parse: {e}")))?;

        // The issuer must be our CA; a certificate minted by any other
        // authority is rejected before touching the signature.
        let issuer = cert.issuer().to_string();
        if issuer != self.ca_subject {
            return Err(SecurityError::CertInvalid(format!(
                "issuer '{issuer}' is not the trusted CA"
            )));
        }

        self.verify_ca_signature(&cert)?;
        check_validity_window(&cert)?;
        check_basic_constraints(&cert)?;

        let nid = nid_of(&cert)?;
        let role = role_of(&cert);
        let public_key = public_key_of(&cert)?;

        log::debug!("[CERTS] peer certificate valid: nid={nid} role={role}");

        Ok(PeerIdentity {
            nid,
            role,
            public_key,
        })
    }

    /// Verify the CA's ECDSA signature over the TBS certificate bytes,
    /// dispatching on the signature algorithm OID.
    fn verify_ca_signature(&self, cert: &X509Certificate<'_>) -> Result<(), SecurityError> {
        let tbs = cert.tbs_certificate.as_ref();
        let signature = Signature::from_der(cert.signature_value.as_ref())
            .map_err(|e| SecurityError::CertInvalid(format!("malformed signature: {e}")))?;

        let oid = cert.signature_algorithm.algorithm.to_id_string();
        let verified = match oid.as_str() {
            OID_ECDSA_SHA256 => self
                .ca_public_key
                .verify_prehash(&Sha256::digest(tbs), &signature),
            OID_ECDSA_SHA384 => self
                .ca_public_key
                .verify_prehash(&Sha384::digest(tbs), &signature),
            OID_ECDSA_SHA512 => self
                .ca_public_key
                .verify_prehash(&Sha512::digest(tbs), &signature),
            _ => {
                return Err(SecurityError::CertInvalid(format!(
                    "unsupported signature algorithm {oid}"
                )))
            }
        };

        verified.map_err(|_| SecurityError::CertInvalid("CA signature does not verify".into()))
    }
}

/// Extract the DER body of the first PEM block.
fn pem_to_der(pem_bytes: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let parsed = ::pem::parse(pem_bytes)
        .map_err(|e| SecurityError::CertInvalid(format!("PEM parse: {e}")))?;
    Ok(parsed.into_contents())
}

fn nid_of(cert: &X509Certificate<'_>) -> Result<Nid, SecurityError> {
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| SecurityError::CertInvalid("certificate has no CN".into()))?;
    cn.parse()
        .map_err(|_| SecurityError::CertInvalid(format!("CN '{cn}' is not a NID")))
}

fn role_of(cert: &X509Certificate<'_>) -> Role {
    let is_sink = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .is_some_and(|ou| ou == "Sink");
    if is_sink {
        Role::Sink
    } else {
        Role::Node
    }
}

fn public_key_of(cert: &X509Certificate<'_>) -> Result<PublicKey, SecurityError> {
    PublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| SecurityError::CertInvalid(format!("unsupported public key: {e}")))
}

fn check_validity_window(cert: &X509Certificate<'_>) -> Result<(), SecurityError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SecurityError::CertInvalid("system clock before UNIX epoch".into()))?
        .as_secs() as i64;

    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(SecurityError::CertInvalid(format!(
            "not yet valid (notBefore {})",
            validity.not_before
        )));
    }
    if now > validity.not_after.timestamp() {
        return Err(SecurityError::CertInvalid(format!(
            "expired (notAfter {})",
            validity.not_after
        )));
    }
    Ok(())
}

fn check_basic_constraints(cert: &X509Certificate<'_>) -> Result<(), SecurityError> {
    match cert.basic_constraints() {
        Ok(Some(bc)) => {
            if bc.value.ca {
                Err(SecurityError::CertInvalid(
                    "certificate is a CA, not a device identity".into(),
                ))
            } else {
                Ok(())
            }
        }
        Ok(None) => Err(SecurityError::CertInvalid(
            "BasicConstraints extension missing".into(),
        )),
        Err(e) => Err(SecurityError::CertInvalid(format!(
            "BasicConstraints unreadable: {e}"
        ))),
    }
}
