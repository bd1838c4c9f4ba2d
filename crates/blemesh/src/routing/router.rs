// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router daemon.
//!
//! Single ingress point [`Router::receive`], single egress callback. Every
//! inbound packet runs the same pipeline:
//!
//! 1. decode
//! 2. replay check
//! 3. MAC verification (session key of the ingress port; heartbeats use
//!    the fixed default key)
//! 4. route learning from the source address
//! 5. local delivery or forward with `ttl - 1` and the MAC rewritten for
//!    the egress port
//!
//! The router is internally synchronised and callable from any link task.
//! Its shared state is the forwarding table, the per-port session keys and
//! the replay windows; none of their locks is held across the send
//! callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::metrics::MeshMetrics;
use crate::nid::Nid;
use crate::protocol::packet::{MessageType, Packet};
use crate::protocol::DEFAULT_HMAC_KEY;
use crate::routing::forwarding::ForwardingTable;
use crate::security::crypto::SessionKey;
use crate::security::replay::ReplayWindow;
use crate::transport::PortId;

/// Errors surfaced by the outbound origin path.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no route to {0}")]
    UnknownRoute(Nid),

    #[error("no session key for port {0}")]
    NoSessionKey(PortId),

    #[error("local sequence space exhausted, device must re-key")]
    SequenceExhausted,

    #[error("send callback not configured")]
    NotWired,

    #[error("transport refused packet on port {0}")]
    SendFailed(PortId),
}

type Handler = Box<dyn Fn(&Packet) + Send + Sync>;
type SendFn = Box<dyn Fn(&PortId, &[u8]) -> bool + Send + Sync>;

/// Per-port session keys, written by the supervisor when authentication
/// completes and destroyed on disconnect.
#[derive(Default)]
pub struct SessionKeyMap {
    keys: DashMap<PortId, SessionKey>,
}

impl SessionKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, port: PortId, key: SessionKey) {
        log::debug!("[ROUTER] session key installed for port {port}");
        self.keys.insert(port, key);
    }

    pub fn remove(&self, port: &PortId) {
        if self.keys.remove(port).is_some() {
            log::debug!("[ROUTER] session key destroyed for port {port}");
        }
    }

    pub fn get(&self, port: &PortId) -> Option<SessionKey> {
        self.keys.get(port).map(|k| k.clone())
    }

    /// Ports that currently hold a key, i.e. attached, authenticated links.
    pub fn ports(&self) -> Vec<PortId> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The per-device routing daemon.
pub struct Router {
    my_nid: Nid,
    default_ttl: u8,
    table: Arc<ForwardingTable>,
    replay: Arc<ReplayWindow>,
    keys: Arc<SessionKeyMap>,
    metrics: Arc<MeshMetrics>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    send: ArcSwapOption<SendFn>,
    sequence: AtomicU32,
}

impl Router {
    pub fn new(
        my_nid: Nid,
        default_ttl: u8,
        table: Arc<ForwardingTable>,
        replay: Arc<ReplayWindow>,
        keys: Arc<SessionKeyMap>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        log::info!("[ROUTER] daemon ready for nid={}", my_nid.short());
        Self {
            my_nid,
            default_ttl,
            table,
            replay,
            keys,
            metrics,
            handlers: RwLock::new(HashMap::new()),
            send: ArcSwapOption::empty(),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn my_nid(&self) -> Nid {
        self.my_nid
    }

    /// Install the egress callback. The callback receives complete packet
    /// bytes; fragmentation for the BLE MTU happens behind it.
    pub fn set_send_callback(
        &self,
        callback: impl Fn(&PortId, &[u8]) -> bool + Send + Sync + 'static,
    ) {
        let callback: SendFn = Box::new(callback);
        self.send.store(Some(Arc::new(callback)));
    }

    /// Register the local delivery handler for one message type.
    pub fn register_handler(
        &self,
        msg_type: MessageType,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) {
        self.handlers.write().insert(msg_type, Box::new(handler));
    }

    /// Restore the outbound sequence counter, e.g. from persisted state
    /// after a restart, so peers' replay windows keep accepting us.
    pub fn seed_sequence(&self, sequence: u32) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    /// Ingress entry point: one complete, reassembled packet from `port`.
    pub fn receive(&self, port: &PortId, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[ROUTER] drop malformed packet from {port}: {e}");
                MeshMetrics::incr(&self.metrics.dropped_malformed);
                return;
            }
        };

        if let Err(reject) = self.replay.check_and_update(packet.source, packet.sequence) {
            log::warn!(
                "[ROUTER] replay from {} seq={} ({reject})",
                packet.source.short(),
                packet.sequence
            );
            MeshMetrics::incr(&self.metrics.dropped_replay);
            return;
        }

        if !self.verify_ingress_mac(&packet, port) {
            return;
        }

        // Learning switch: the source is reachable through the port the
        // packet came in on.
        self.table.learn(packet.source, port);

        if packet.msg_type == MessageType::Heartbeat {
            // Heartbeats are the one broadcast: always delivered locally,
            // and pushed on down the tree while their TTL lasts.
            self.deliver_locally(&packet);
            if packet.ttl > 1 {
                self.rebroadcast_heartbeat(&packet, port);
            }
        } else if packet.destination == self.my_nid {
            self.deliver_locally(&packet);
        } else {
            self.forward(packet, port);
        }
    }

    /// Originate a packet from this device.
    pub fn send_local(
        &self,
        destination: Nid,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<(), RouterError> {
        let sequence = self.next_sequence()?;
        let mut packet = Packet::new(
            self.my_nid,
            destination,
            msg_type,
            self.default_ttl,
            sequence,
            payload,
        );

        let port = self
            .table
            .lookup(&destination)
            .ok_or(RouterError::UnknownRoute(destination))?;
        let key = self
            .keys
            .get(&port)
            .ok_or_else(|| RouterError::NoSessionKey(port.clone()))?;
        packet.apply_mac(key.as_bytes());

        self.emit(&port, &packet)?;
        MeshMetrics::incr(&self.metrics.sent);
        log::info!(
            "[ROUTER] sent {:?} to {} via {port} (seq={sequence})",
            msg_type,
            destination.short()
        );
        Ok(())
    }

    /// Emit an already-MACed packet on a specific port, bypassing the
    /// forwarding table. Used by the heartbeat emitter, whose fan-out is
    /// not routed.
    pub fn emit_on_port(&self, port: &PortId, packet: &Packet) -> Result<(), RouterError> {
        self.emit(port, packet)
    }

    fn next_sequence(&self) -> Result<u32, RouterError> {
        // Sticks at the ceiling instead of wrapping: a wrapped counter
        // would walk straight into the peers' replay windows.
        self.sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s != u32::MAX).then(|| s + 1)
            })
            .map_err(|_| RouterError::SequenceExhausted)
    }

    fn verify_ingress_mac(&self, packet: &Packet, port: &PortId) -> bool {
        if packet.msg_type == MessageType::Heartbeat {
            if packet.verify_mac(DEFAULT_HMAC_KEY) {
                return true;
            }
            log::warn!(
                "[ROUTER] bad heartbeat MAC from {} on {port}",
                packet.source.short()
            );
            MeshMetrics::incr(&self.metrics.dropped_bad_mac);
            return false;
        }

        let Some(key) = self.keys.get(port) else {
            log::debug!("[ROUTER] no session key for ingress port {port}");
            MeshMetrics::incr(&self.metrics.dropped_no_session_key);
            return false;
        };
        if packet.verify_mac(key.as_bytes()) {
            return true;
        }
        log::warn!(
            "[ROUTER] MAC verification failed: src={} dst={} seq={} port={port}",
            packet.source.short(),
            packet.destination.short(),
            packet.sequence
        );
        MeshMetrics::incr(&self.metrics.dropped_bad_mac);
        false
    }

    fn deliver_locally(&self, packet: &Packet) {
        let handlers = self.handlers.read();
        match handlers.get(&packet.msg_type) {
            Some(handler) => {
                handler(packet);
                MeshMetrics::incr(&self.metrics.delivered);
                log::debug!(
                    "[ROUTER] delivered {:?} from {} ({} bytes)",
                    packet.msg_type,
                    packet.source.short(),
                    packet.payload.len()
                );
            }
            None => {
                log::warn!("[ROUTER] no local handler for {:?}", packet.msg_type);
            }
        }
    }

    fn forward(&self, mut packet: Packet, ingress: &PortId) {
        if packet.ttl <= 1 {
            log::debug!("[ROUTER] TTL expired for {}", packet.destination.short());
            MeshMetrics::incr(&self.metrics.dropped_ttl_expired);
            return;
        }
        packet.ttl -= 1;

        let Some(next_port) = self.table.lookup(&packet.destination) else {
            log::debug!("[ROUTER] no route to {}", packet.destination.short());
            MeshMetrics::incr(&self.metrics.dropped_unknown_route);
            return;
        };

        if next_port == *ingress {
            log::warn!("[ROUTER] reflection blocked on {next_port}");
            MeshMetrics::incr(&self.metrics.dropped_reflection);
            return;
        }

        if packet.msg_type == MessageType::Heartbeat {
            packet.apply_mac(DEFAULT_HMAC_KEY);
        } else {
            let Some(key) = self.keys.get(&next_port) else {
                log::debug!("[ROUTER] no session key for egress port {next_port}");
                MeshMetrics::incr(&self.metrics.dropped_no_session_key);
                return;
            };
            packet.apply_mac(key.as_bytes());
        }

        if self.emit(&next_port, &packet).is_ok() {
            MeshMetrics::incr(&self.metrics.routed);
            log::info!(
                "[ROUTER] forwarded {} -> {} via {next_port} (ttl={})",
                packet.source.short(),
                packet.destination.short(),
                packet.ttl
            );
        }
    }

    /// Push a heartbeat on toward the leaves: every attached port except
    /// the uplink and the port it arrived on, TTL decremented, MAC redone
    /// under the fixed heartbeat key.
    fn rebroadcast_heartbeat(&self, packet: &Packet, ingress: &PortId) {
        let mut copy = packet.clone();
        copy.ttl -= 1;
        copy.apply_mac(DEFAULT_HMAC_KEY);
        let bytes = copy.encode();

        for port in self.keys.ports() {
            if port.is_uplink() || port == *ingress {
                continue;
            }
            if let Some(send) = self.send.load_full() {
                if (send.as_ref())(&port, &bytes) {
                    MeshMetrics::incr(&self.metrics.routed);
                    log::debug!("[ROUTER] heartbeat rebroadcast on {port} (ttl={})", copy.ttl);
                } else {
                    log::error!("[ROUTER] heartbeat rebroadcast refused on {port}");
                }
            }
        }
    }

    fn emit(&self, port: &PortId, packet: &Packet) -> Result<(), RouterError> {
        let send = self.send.load_full().ok_or(RouterError::NotWired)?;
        if (send.as_ref())(port, &packet.encode()) {
            Ok(())
        } else {
            log::error!("[ROUTER] transport refused packet on {port}");
            Err(RouterError::SendFailed(port.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::forwarding::DEFAULT_ROUTE_TTL;
    use parking_lot::Mutex;

    fn nid(b: u8) -> Nid {
        Nid::from_bytes([b; 16])
    }

    fn key(b: u8) -> SessionKey {
        SessionKey::from_bytes([b; 32])
    }

    struct Harness {
        router: Arc<Router>,
        keys: Arc<SessionKeyMap>,
        table: Arc<ForwardingTable>,
        metrics: Arc<MeshMetrics>,
        sent: Arc<Mutex<Vec<(PortId, Vec<u8>)>>>,
    }

    fn harness(my: Nid) -> Harness {
        let table = Arc::new(ForwardingTable::new(DEFAULT_ROUTE_TTL));
        let replay = Arc::new(ReplayWindow::default());
        let keys = Arc::new(SessionKeyMap::new());
        let metrics = Arc::new(MeshMetrics::new());
        let router = Arc::new(Router::new(
            my,
            8,
            table.clone(),
            replay,
            keys.clone(),
            metrics.clone(),
        ));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let capture = sent.clone();
        router.set_send_callback(move |port, bytes| {
            capture.lock().push((port.clone(), bytes.to_vec()));
            true
        });

        Harness {
            router,
            keys,
            table,
            metrics,
            sent,
        }
    }

    fn data_packet(src: Nid, dst: Nid, ttl: u8, seq: u32, key: &SessionKey) -> Vec<u8> {
        let mut p = Packet::new(src, dst, MessageType::Data, ttl, seq, b"hello".to_vec());
        p.apply_mac(key.as_bytes());
        p.encode()
    }

    #[test]
    fn test_forward_decrements_ttl_and_rewrites_mac() {
        // Node A in the middle: B is behind a downlink, the Sink behind the
        // uplink (scenario: two-hop delivery).
        let a = harness(nid(0xA0));
        let down = PortId::downlink("BB:00:00:00:00:01");
        let up = PortId::uplink();
        let k_ab = key(1);
        let k_sa = key(2);
        a.keys.set(down.clone(), k_ab.clone());
        a.keys.set(up.clone(), k_sa.clone());
        a.table.learn(nid(0x50), &up); // Sink learned via uplink

        let wire = data_packet(nid(0xB0), nid(0x50), 8, 7, &k_ab);
        a.router.receive(&down, &wire);

        let sent = a.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, up);

        let out = Packet::decode(&sent[0].1).unwrap();
        assert_eq!(out.source, nid(0xB0)); // never rewritten
        assert_eq!(out.destination, nid(0x50));
        assert_eq!(out.sequence, 7); // never rewritten
        assert_eq!(out.ttl, 7); // decremented once
        assert_eq!(out.payload, b"hello");
        assert!(out.verify_mac(k_sa.as_bytes())); // re-keyed for egress
        assert!(!out.verify_mac(k_ab.as_bytes()));

        // And the ingress taught us where B lives.
        assert_eq!(a.table.lookup(&nid(0xB0)), Some(down));
        assert_eq!(a.metrics.snapshot().routed, 1);
    }

    #[test]
    fn test_local_delivery_invokes_handler() {
        let h = harness(nid(0x11));
        let port = PortId::uplink();
        let k = key(9);
        h.keys.set(port.clone(), k.clone());

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        h.router.register_handler(MessageType::Data, move |p| {
            sink.lock().push(p.payload.clone());
        });

        h.router.receive(&port, &data_packet(nid(0x22), nid(0x11), 8, 1, &k));
        assert_eq!(&*got.lock(), &[b"hello".to_vec()]);
        assert_eq!(h.metrics.snapshot().delivered, 1);
        assert!(h.sent.lock().is_empty());
    }

    #[test]
    fn test_replay_is_dropped() {
        let h = harness(nid(0x11));
        let port = PortId::uplink();
        let k = key(9);
        h.keys.set(port.clone(), k.clone());
        h.router.register_handler(MessageType::Data, |_| {});

        let wire = data_packet(nid(0x22), nid(0x11), 8, 100, &k);
        h.router.receive(&port, &wire);
        h.router.receive(&port, &wire);

        let snap = h.metrics.snapshot();
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.dropped_replay, 1);
    }

    #[test]
    fn test_bad_mac_dropped_before_learning() {
        let h = harness(nid(0x11));
        let port = PortId::uplink();
        h.keys.set(port.clone(), key(9));

        // MACed under the wrong key.
        let wire = data_packet(nid(0x22), nid(0x11), 8, 1, &key(7));
        h.router.receive(&port, &wire);

        assert_eq!(h.metrics.snapshot().dropped_bad_mac, 1);
        // Nothing learned from an unauthenticated packet.
        assert_eq!(h.table.lookup(&nid(0x22)), None);
    }

    #[test]
    fn test_no_session_key_drops() {
        let h = harness(nid(0x11));
        let port = PortId::downlink("CC:00:00:00:00:02");
        let wire = data_packet(nid(0x22), nid(0x11), 8, 1, &key(7));
        h.router.receive(&port, &wire);
        assert_eq!(h.metrics.snapshot().dropped_no_session_key, 1);
    }

    #[test]
    fn test_malformed_packet_counted() {
        let h = harness(nid(0x11));
        h.router.receive(&PortId::uplink(), &[0u8; 10]);
        assert_eq!(h.metrics.snapshot().dropped_malformed, 1);
    }

    #[test]
    fn test_ttl_expiry_blocks_forward() {
        let h = harness(nid(0x11));
        let down = PortId::downlink("BB:00:00:00:00:01");
        let k = key(1);
        h.keys.set(down.clone(), k.clone());
        h.table.learn(nid(0x50), &PortId::uplink());
        h.keys.set(PortId::uplink(), key(2));

        // ttl=1 for a non-local destination: dropped, not forwarded.
        let wire = data_packet(nid(0xB0), nid(0x50), 1, 3, &k);
        h.router.receive(&down, &wire);

        assert!(h.sent.lock().is_empty());
        assert_eq!(h.metrics.snapshot().dropped_ttl_expired, 1);
    }

    #[test]
    fn test_unknown_route_counted() {
        let h = harness(nid(0x11));
        let down = PortId::downlink("BB:00:00:00:00:01");
        let k = key(1);
        h.keys.set(down.clone(), k.clone());

        h.router.receive(&down, &data_packet(nid(0xB0), nid(0x50), 8, 3, &k));
        assert_eq!(h.metrics.snapshot().dropped_unknown_route, 1);
    }

    #[test]
    fn test_reflection_blocked() {
        let h = harness(nid(0x11));
        let down = PortId::downlink("BB:00:00:00:00:01");
        let k = key(1);
        h.keys.set(down.clone(), k.clone());
        // Destination (mis)learned behind the same port the packet came in on.
        h.table.learn(nid(0x50), &down);

        h.router.receive(&down, &data_packet(nid(0xB0), nid(0x50), 8, 3, &k));
        assert!(h.sent.lock().is_empty());
        assert_eq!(h.metrics.snapshot().dropped_reflection, 1);
    }

    #[test]
    fn test_send_local_requires_route_and_key() {
        let h = harness(nid(0x11));
        assert!(matches!(
            h.router.send_local(nid(0x50), MessageType::Data, b"x".to_vec()),
            Err(RouterError::UnknownRoute(_))
        ));

        h.table.learn(nid(0x50), &PortId::uplink());
        assert!(matches!(
            h.router.send_local(nid(0x50), MessageType::Data, b"x".to_vec()),
            Err(RouterError::NoSessionKey(_))
        ));

        let k = key(3);
        h.keys.set(PortId::uplink(), k.clone());
        h.router.send_local(nid(0x50), MessageType::Data, b"x".to_vec()).unwrap();

        let sent = h.sent.lock();
        let out = Packet::decode(&sent[0].1).unwrap();
        assert_eq!(out.source, nid(0x11));
        assert_eq!(out.ttl, 8);
        assert_eq!(out.sequence, 0);
        assert!(out.verify_mac(k.as_bytes()));
    }

    #[test]
    fn test_send_local_sequences_are_monotonic() {
        let h = harness(nid(0x11));
        h.table.learn(nid(0x50), &PortId::uplink());
        h.keys.set(PortId::uplink(), key(3));

        for _ in 0..3 {
            h.router.send_local(nid(0x50), MessageType::Data, vec![]).unwrap();
        }
        let sent = h.sent.lock();
        let seqs: Vec<u32> = sent
            .iter()
            .map(|(_, b)| Packet::decode(b).unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_sequence_exhaustion_is_terminal() {
        let h = harness(nid(0x11));
        h.table.learn(nid(0x50), &PortId::uplink());
        h.keys.set(PortId::uplink(), key(3));

        h.router.seed_sequence(u32::MAX);
        assert!(matches!(
            h.router.send_local(nid(0x50), MessageType::Data, vec![]),
            Err(RouterError::SequenceExhausted)
        ));
        // Still exhausted on the next attempt, no silent wrap.
        assert!(matches!(
            h.router.send_local(nid(0x50), MessageType::Data, vec![]),
            Err(RouterError::SequenceExhausted)
        ));
    }

    #[test]
    fn test_heartbeat_delivered_and_not_forwarded_at_ttl_1() {
        let h = harness(nid(0x11));
        let up = PortId::uplink();
        let seen = Arc::new(Mutex::new(0u32));
        let counter = seen.clone();
        h.router.register_handler(MessageType::Heartbeat, move |_| {
            *counter.lock() += 1;
        });
        // A downlink exists, but ttl=1 stops the broadcast here.
        h.keys.set(PortId::downlink("BB:00:00:00:00:01"), key(1));

        let mut hb = Packet::new(nid(0x50), nid(0x50), MessageType::Heartbeat, 1, 9, vec![0; 8]);
        hb.apply_mac(DEFAULT_HMAC_KEY);
        h.router.receive(&up, &hb.encode());

        assert_eq!(*seen.lock(), 1);
        assert!(h.sent.lock().is_empty());
    }

    #[test]
    fn test_heartbeat_rebroadcast_skips_uplink_and_ingress() {
        let h = harness(nid(0x11));
        let up = PortId::uplink();
        let down_a = PortId::downlink("BB:00:00:00:00:01");
        let down_b = PortId::downlink("BB:00:00:00:00:02");
        h.keys.set(up.clone(), key(1));
        h.keys.set(down_a.clone(), key(2));
        h.keys.set(down_b.clone(), key(3));
        h.router.register_handler(MessageType::Heartbeat, |_| {});

        let mut hb = Packet::new(nid(0x50), nid(0x50), MessageType::Heartbeat, 3, 9, vec![0; 8]);
        hb.apply_mac(DEFAULT_HMAC_KEY);
        h.router.receive(&up, &hb.encode());

        let sent = h.sent.lock();
        let mut ports: Vec<String> = sent.iter().map(|(p, _)| p.to_string()).collect();
        ports.sort();
        assert_eq!(ports, vec!["BB:00:00:00:00:01", "BB:00:00:00:00:02"]);

        for (_, bytes) in sent.iter() {
            let out = Packet::decode(bytes).unwrap();
            assert_eq!(out.ttl, 2);
            assert!(out.verify_mac(DEFAULT_HMAC_KEY));
            assert_eq!(out.sequence, 9);
        }
    }

    #[test]
    fn test_heartbeat_uses_default_key_even_with_session_key() {
        let h = harness(nid(0x11));
        let up = PortId::uplink();
        h.keys.set(up.clone(), key(1));
        let seen = Arc::new(Mutex::new(0u32));
        let counter = seen.clone();
        h.router.register_handler(MessageType::Heartbeat, move |_| {
            *counter.lock() += 1;
        });

        // MACed under the session key instead of the fixed key: rejected.
        let mut hb = Packet::new(nid(0x50), nid(0x50), MessageType::Heartbeat, 1, 9, vec![0; 8]);
        hb.apply_mac(key(1).as_bytes());
        h.router.receive(&up, &hb.encode());
        assert_eq!(*seen.lock(), 0);
        assert_eq!(h.metrics.snapshot().dropped_bad_mac, 1);
    }
}
