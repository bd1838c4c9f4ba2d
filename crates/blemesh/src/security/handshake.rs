// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mutual authentication state machine.
//!
//! One `AuthFsm` per peer link. The protocol is symmetric; either side may
//! initiate. Happy path on a FIFO link:
//!
//! ```text
//! A                                         B
//! |-------- CERT_OFFER(cert_A) ------------>|  (A: Idle -> CertSent)
//! |<------- CERT_OFFER(cert_B) -------------|  (B validates cert_A,
//! |<------- CHALLENGE(32 rand) -------------|   B: CertReceived -> ChallengeSent)
//! |-------- CHALLENGE(32 rand) ------------>|  (A validates cert_B)
//! |-------- RESPONSE(sig_A) --------------->|  (A: ChallengeReceived)
//! |<------- RESPONSE(sig_B) ----------------|
//! |<------- AUTH_SUCCESS -------------------|  (B verified sig_A -> Authenticated)
//! |-------- AUTH_SUCCESS ------------------>|  (A verified sig_B -> Authenticated)
//! ```
//!
//! The session key is derived by ECDH over the two certificate keys plus
//! HKDF, but it is not released to the router until the state machine
//! reaches `Authenticated`. Any validation failure emits `AUTH_FAILED` with
//! a reason and parks the machine in `Failed`; authentication is never
//! retried within the same session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::auth::{AuthMessage, AuthMessageType, CHALLENGE_LEN};
use crate::security::certs::{CertStore, PeerIdentity};
use crate::security::crypto::{
    ecdh_session_key, ecdsa_sign_der, ecdsa_verify_der, random_challenge, SessionKey,
};
use crate::security::SecurityError;

/// Default hard deadline for a whole handshake.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    CertSent,
    CertReceived,
    ChallengeSent,
    ChallengeReceived,
    Authenticated,
    Failed,
}

/// What a completed handshake yields.
pub struct AuthOutcome {
    pub peer: PeerIdentity,
    pub session_key: SessionKey,
}

/// Per-peer mutual authentication machine.
pub struct AuthFsm {
    store: Arc<CertStore>,
    state: AuthState,
    sent_cert: bool,
    peer: Option<PeerIdentity>,
    outgoing_challenge: Option<[u8; CHALLENGE_LEN]>,
    failure: Option<String>,
    deadline: Instant,
}

impl AuthFsm {
    pub fn new(store: Arc<CertStore>, timeout: Duration) -> Self {
        Self {
            store,
            state: AuthState::Idle,
            sent_cert: false,
            peer: None,
            outgoing_challenge: None,
            failure: None,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Reason recorded when the machine entered `Failed`.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Whether the hard deadline has passed without completion.
    pub fn expired(&self) -> bool {
        !matches!(self.state, AuthState::Authenticated | AuthState::Failed)
            && Instant::now() > self.deadline
    }

    /// Move to `Failed` because the deadline passed. Returns the frame to
    /// send so the peer learns why the link is going down.
    pub fn expire(&mut self) -> Vec<Vec<u8>> {
        self.fail("authentication timeout")
    }

    /// Initiate the handshake. Emits our CERT_OFFER.
    pub fn start(&mut self) -> Result<Vec<Vec<u8>>, SecurityError> {
        if self.state != AuthState::Idle {
            return Err(SecurityError::Protocol(format!(
                "start() in state {:?}",
                self.state
            )));
        }
        let offer = AuthMessage::new(
            AuthMessageType::CertOffer,
            self.store.local_cert_pem().to_vec(),
        )?;
        self.sent_cert = true;
        self.state = AuthState::CertSent;
        log::debug!("[AUTH] -> CERT_OFFER ({} bytes)", offer.body.len());
        Ok(vec![offer.encode()])
    }

    /// Feed one complete (reassembled) AUTH message.
    ///
    /// Returns the frames to send back, possibly several: a responder
    /// answers a CERT_OFFER with its own certificate plus a challenge in one
    /// flush. After every call the caller must inspect [`state()`]: a peer
    /// that failed validation leaves frames to deliver (AUTH_FAILED) *and*
    /// the machine in `Failed`.
    ///
    /// [`state()`]: Self::state
    pub fn process(&mut self, frame: &[u8]) -> Result<Vec<Vec<u8>>, SecurityError> {
        if matches!(self.state, AuthState::Failed) {
            return Err(SecurityError::Protocol("machine already failed".into()));
        }
        if Instant::now() > self.deadline {
            self.state = AuthState::Failed;
            self.failure = Some("authentication timeout".into());
            return Err(SecurityError::TimedOut);
        }

        let message = match AuthMessage::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                self.state = AuthState::Failed;
                self.failure = Some(e.to_string());
                return Err(e.into());
            }
        };

        match message.msg_type {
            AuthMessageType::CertOffer => self.on_cert_offer(&message.body),
            AuthMessageType::Challenge => self.on_challenge(&message.body),
            AuthMessageType::Response => self.on_response(&message.body),
            AuthMessageType::AuthSuccess => self.on_success(),
            AuthMessageType::AuthFailed => {
                let reason = String::from_utf8_lossy(&message.body).into_owned();
                log::warn!("[AUTH] peer rejected authentication: {reason}");
                self.state = AuthState::Failed;
                self.failure = Some(format!("peer: {reason}"));
                Ok(Vec::new())
            }
        }
    }

    /// Once `Authenticated`, hand over the peer identity and the derived
    /// session key. The key exists only from this point on.
    pub fn take_outcome(&mut self) -> Option<AuthOutcome> {
        if self.state != AuthState::Authenticated {
            return None;
        }
        let peer = self.peer.take()?;
        let session_key = ecdh_session_key(self.store.ecdh_secret(), &peer.public_key);
        Some(AuthOutcome { peer, session_key })
    }

    fn on_cert_offer(&mut self, cert_pem: &[u8]) -> Result<Vec<Vec<u8>>, SecurityError> {
        if self.peer.is_some() {
            return Ok(self.fail("unexpected second CERT_OFFER"));
        }

        let peer = match self.store.validate_peer(cert_pem) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("[AUTH] peer certificate rejected: {e}");
                return Ok(self.fail(&format!("invalid certificate: {e}")));
            }
        };
        log::info!("[AUTH] peer certificate valid: nid={} role={}", peer.nid, peer.role);
        self.peer = Some(peer);
        self.state = AuthState::CertReceived;

        let mut frames = Vec::new();

        // Responder side: we have not offered our own certificate yet.
        if !self.sent_cert {
            let offer = AuthMessage::new(
                AuthMessageType::CertOffer,
                self.store.local_cert_pem().to_vec(),
            )?;
            frames.push(offer.encode());
            self.sent_cert = true;
        }

        let challenge = random_challenge();
        self.outgoing_challenge = Some(challenge);
        let msg = AuthMessage::new(AuthMessageType::Challenge, challenge.to_vec())?;
        frames.push(msg.encode());
        self.state = AuthState::ChallengeSent;
        log::debug!("[AUTH] -> CHALLENGE");

        Ok(frames)
    }

    fn on_challenge(&mut self, challenge: &[u8]) -> Result<Vec<Vec<u8>>, SecurityError> {
        if !self.sent_cert {
            return Ok(self.fail("CHALLENGE before certificate exchange"));
        }
        if challenge.len() != CHALLENGE_LEN {
            return Ok(self.fail(&format!("challenge of {} bytes", challenge.len())));
        }

        let signature = ecdsa_sign_der(&self.store.signing_key(), challenge)?;
        let msg = AuthMessage::new(AuthMessageType::Response, signature)?;
        self.state = AuthState::ChallengeReceived;
        log::debug!("[AUTH] -> RESPONSE");
        Ok(vec![msg.encode()])
    }

    fn on_response(&mut self, signature: &[u8]) -> Result<Vec<Vec<u8>>, SecurityError> {
        let Some(challenge) = self.outgoing_challenge else {
            return Ok(self.fail("RESPONSE without outstanding challenge"));
        };
        let Some(peer) = &self.peer else {
            return Ok(self.fail("RESPONSE before certificate exchange"));
        };

        if !ecdsa_verify_der(&peer.verifying_key(), &challenge, signature) {
            log::warn!("[AUTH] challenge response from {} does not verify", peer.nid);
            return Ok(self.fail("invalid signature"));
        }

        log::info!("[AUTH] peer {} proved key possession", peer.nid);
        self.state = AuthState::Authenticated;
        let msg = AuthMessage::new(AuthMessageType::AuthSuccess, Vec::new())?;
        Ok(vec![msg.encode()])
    }

    fn on_success(&mut self) -> Result<Vec<Vec<u8>>, SecurityError> {
        // Each side only confirms after verifying our RESPONSE, which we
        // sent after verifying theirs; a premature AUTH_SUCCESS therefore
        // means the peer skipped a step.
        if self.state == AuthState::Authenticated {
            log::debug!("[AUTH] peer confirmed authentication");
            Ok(Vec::new())
        } else {
            Ok(self.fail("premature AUTH_SUCCESS"))
        }
    }

    /// Park the machine in `Failed` and build the AUTH_FAILED notification.
    fn fail(&mut self, reason: &str) -> Vec<Vec<u8>> {
        self.state = AuthState::Failed;
        self.failure = Some(reason.to_string());
        match AuthMessage::new(AuthMessageType::AuthFailed, reason.as_bytes().to_vec()) {
            Ok(msg) => vec![msg.encode()],
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn store(cert: &str, key: &str) -> Arc<CertStore> {
        Arc::new(
            CertStore::open(
                &fixture(cert),
                &fixture(key),
                &fixture("ca_certificate.pem"),
            )
            .unwrap(),
        )
    }

    fn node_a() -> Arc<CertStore> {
        store("node_a_cert.pem", "node_a_key.pem")
    }

    fn node_b() -> Arc<CertStore> {
        store("node_b_cert.pem", "node_b_key.pem")
    }

    /// Pump frames between two machines until both settle.
    fn run_to_completion(a: &mut AuthFsm, b: &mut AuthFsm) {
        let mut to_b = a.start().unwrap();
        let mut to_a: Vec<Vec<u8>> = Vec::new();

        for _ in 0..16 {
            if to_b.is_empty() && to_a.is_empty() {
                break;
            }
            let mut next_to_a = Vec::new();
            for frame in to_b.drain(..) {
                if let Ok(frames) = b.process(&frame) {
                    next_to_a.extend(frames);
                }
            }
            let mut next_to_b = Vec::new();
            for frame in to_a.drain(..) {
                if let Ok(frames) = a.process(&frame) {
                    next_to_b.extend(frames);
                }
            }
            to_a = next_to_a;
            to_b = next_to_b;
        }
    }

    #[test]
    fn test_happy_path_mutual_auth() {
        let mut a = AuthFsm::new(node_a(), DEFAULT_AUTH_TIMEOUT);
        let mut b = AuthFsm::new(node_b(), DEFAULT_AUTH_TIMEOUT);

        run_to_completion(&mut a, &mut b);

        assert_eq!(a.state(), AuthState::Authenticated);
        assert_eq!(b.state(), AuthState::Authenticated);

        let out_a = a.take_outcome().unwrap();
        let out_b = b.take_outcome().unwrap();

        assert_eq!(
            out_a.peer.nid.to_string(),
            "3c2a0b1e-5f4d-6e70-b132-8c9d0e1f2031"
        );
        assert_eq!(
            out_b.peer.nid.to_string(),
            "2b1f9a0d-4e3c-5d6f-a021-7b8c9d0e1f20"
        );
        // Both ends derived the same 32-byte session key.
        assert_eq!(out_a.session_key, out_b.session_key);
    }

    #[test]
    fn test_sink_role_surfaces_in_outcome() {
        let mut node = AuthFsm::new(node_a(), DEFAULT_AUTH_TIMEOUT);
        let mut sink = AuthFsm::new(store("sink_cert.pem", "sink_key.pem"), DEFAULT_AUTH_TIMEOUT);

        run_to_completion(&mut node, &mut sink);
        assert!(node.is_authenticated());
        assert!(sink.is_authenticated());

        let outcome = node.take_outcome().unwrap();
        assert!(outcome.peer.role.is_sink());
    }

    #[test]
    fn test_rogue_certificate_rejected() {
        let mut b = AuthFsm::new(node_b(), DEFAULT_AUTH_TIMEOUT);

        let rogue_pem = std::fs::read(fixture("rogue_node_cert.pem")).unwrap();
        let offer = AuthMessage::new(AuthMessageType::CertOffer, rogue_pem).unwrap();

        let frames = b.process(&offer.encode()).unwrap();
        assert_eq!(b.state(), AuthState::Failed);

        // The peer is told why.
        assert_eq!(frames.len(), 1);
        let reply = AuthMessage::decode(&frames[0]).unwrap();
        assert_eq!(reply.msg_type, AuthMessageType::AuthFailed);
    }

    #[test]
    fn test_tampered_response_fails_auth() {
        let mut a = AuthFsm::new(node_a(), DEFAULT_AUTH_TIMEOUT);
        let mut b = AuthFsm::new(node_b(), DEFAULT_AUTH_TIMEOUT);

        // A initiates; B answers with CERT_OFFER + CHALLENGE.
        let offer_a = a.start().unwrap().remove(0);
        let mut from_b = b.process(&offer_a).unwrap();
        assert_eq!(from_b.len(), 2);
        let challenge_for_a = from_b.remove(1);
        let offer_b = from_b.remove(0);

        // A validates B's cert and challenges it; A then answers B's challenge.
        let mut from_a = a.process(&offer_b).unwrap();
        let challenge_for_b = from_a.remove(0);
        let mut response_a = a.process(&challenge_for_a).unwrap().remove(0);

        // Corrupt A's signature on its way to B.
        let last = response_a.len() - 1;
        response_a[last] ^= 0xFF;

        let frames = b.process(&challenge_for_b).unwrap();
        assert_eq!(AuthMessage::decode(&frames[0]).unwrap().msg_type, AuthMessageType::Response);

        let failed = b.process(&response_a).unwrap();
        assert_eq!(b.state(), AuthState::Failed);
        assert_eq!(
            AuthMessage::decode(&failed[0]).unwrap().msg_type,
            AuthMessageType::AuthFailed
        );
        assert!(b.take_outcome().is_none());
    }

    #[test]
    fn test_premature_success_rejected() {
        let mut b = AuthFsm::new(node_b(), DEFAULT_AUTH_TIMEOUT);
        let msg = AuthMessage::new(AuthMessageType::AuthSuccess, Vec::new()).unwrap();
        b.process(&msg.encode()).unwrap();
        assert_eq!(b.state(), AuthState::Failed);
    }

    #[test]
    fn test_deadline_enforced() {
        let mut a = AuthFsm::new(node_a(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(a.expired());

        let offer = AuthMessage::new(
            AuthMessageType::CertOffer,
            std::fs::read(fixture("node_b_cert.pem")).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            a.process(&offer.encode()),
            Err(SecurityError::TimedOut)
        ));
        assert_eq!(a.state(), AuthState::Failed);
    }

    #[test]
    fn test_no_key_before_authenticated() {
        let mut a = AuthFsm::new(node_a(), DEFAULT_AUTH_TIMEOUT);
        a.start().unwrap();
        assert!(a.take_outcome().is_none());
    }

    #[test]
    fn test_second_cert_offer_rejected() {
        let mut b = AuthFsm::new(node_b(), DEFAULT_AUTH_TIMEOUT);
        let pem = std::fs::read(fixture("node_a_cert.pem")).unwrap();
        let offer = AuthMessage::new(AuthMessageType::CertOffer, pem).unwrap();

        b.process(&offer.encode()).unwrap();
        assert_eq!(b.state(), AuthState::ChallengeSent);

        b.process(&offer.encode()).unwrap();
        assert_eq!(b.state(), AuthState::Failed);
    }
}
