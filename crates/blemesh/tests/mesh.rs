// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end mesh scenarios over an in-process loopback transport.
//!
//! Three real devices (Sink, Node A, Node B) run against fixture
//! certificates minted by a real CA. The loopback bus delivers chunks
//! synchronously, so the whole six-message handshake and multi-hop
//! forwarding complete within a single call chain unless a test opts into
//! the background tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use blemesh::protocol::packet::{MessageType, Packet};
use blemesh::topology::advert::{DeviceAdvert, NeighborInfo, HOP_UNKNOWN};
use blemesh::transport::{LinkEvent, PortId, Transport, TransportError};
use blemesh::{HeartbeatConfig, MeshConfig, MeshCore, Nid, Role, UplinkState};

const SINK_NID: &str = "1a0e8f9c-3d2b-4c5e-9f10-6a7b8c9d0e1f";
const NODE_A_NID: &str = "2b1f9a0d-4e3c-5d6f-a021-7b8c9d0e1f20";
const NODE_B_NID: &str = "3c2a0b1e-5f4d-6e70-b132-8c9d0e1f2031";

const ADDR_A: &str = "AA:00:00:00:00:0A";
const ADDR_B: &str = "AA:00:00:00:00:0B";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn config(cert: &str, key: &str, heartbeat: HeartbeatConfig) -> MeshConfig {
    MeshConfig {
        cert_path: fixture(cert),
        key_path: fixture(key),
        ca_cert_path: fixture("ca_certificate.pem"),
        adapter_id: "test0".into(),
        heartbeat,
        ..MeshConfig::default()
    }
}

/// One queued chunk: destination device, ingress port, characteristic.
enum Delivery {
    Packet(usize, PortId, Vec<u8>),
    Auth(usize, PortId, Vec<u8>),
}

/// In-process transport: each registered core is one device, links map
/// `(device, port)` to the peer's `(device, port)`. Chunks are delivered
/// through a FIFO queue (like the real per-link GATT writes), not by
/// direct recursion, so handshake messages keep their wire order.
#[derive(Default)]
struct Bus {
    cores: Mutex<HashMap<usize, Arc<MeshCore>>>,
    links: Mutex<HashMap<(usize, PortId), (usize, PortId)>>,
    /// Every packet chunk ever sent: (sender, egress port, chunk).
    packet_log: Mutex<Vec<(usize, PortId, Vec<u8>)>>,
    queue: Mutex<std::collections::VecDeque<Delivery>>,
    pumping: std::sync::atomic::AtomicBool,
}

impl Bus {
    fn register(&self, id: usize, core: Arc<MeshCore>) {
        self.cores.lock().insert(id, core);
    }

    fn connect(&self, a: (usize, PortId), b: (usize, PortId)) {
        let mut links = self.links.lock();
        links.insert(a.clone(), b.clone());
        links.insert(b, a);
    }

    fn peer_of(&self, id: usize, port: &PortId) -> Option<(usize, PortId)> {
        self.links.lock().get(&(id, port.clone())).cloned()
    }

    fn core(&self, id: usize) -> Option<Arc<MeshCore>> {
        self.cores.lock().get(&id).cloned()
    }

    /// Enqueue a delivery and drain the queue unless a pump is already
    /// running further up the stack (or on another thread).
    fn post(&self, delivery: Delivery) {
        use std::sync::atomic::Ordering;

        self.queue.lock().push_back(delivery);
        loop {
            if self.pumping.swap(true, Ordering::SeqCst) {
                return; // an active pump will pick our chunk up
            }
            while let Some(next) = { self.queue.lock().pop_front() } {
                match next {
                    Delivery::Packet(id, port, chunk) => {
                        if let Some(core) = self.core(id) {
                            core.supervisor().on_packet_chunk(&port, &chunk);
                        }
                    }
                    Delivery::Auth(id, port, chunk) => {
                        if let Some(core) = self.core(id) {
                            core.supervisor().on_auth_chunk(&port, &chunk);
                        }
                    }
                }
            }
            self.pumping.store(false, Ordering::SeqCst);
            if self.queue.lock().is_empty() {
                return;
            }
            // Someone enqueued while we were releasing; try to pump again.
        }
    }
}

struct BusPort {
    id: usize,
    bus: Arc<Bus>,
}

impl Transport for BusPort {
    fn send_packet(&self, port: &PortId, chunk: &[u8]) -> Result<(), TransportError> {
        self.bus
            .packet_log
            .lock()
            .push((self.id, port.clone(), chunk.to_vec()));
        let (peer_id, peer_port) = self
            .bus
            .peer_of(self.id, port)
            .ok_or_else(|| TransportError::PortDown(port.clone()))?;
        self.bus
            .post(Delivery::Packet(peer_id, peer_port, chunk.to_vec()));
        Ok(())
    }

    fn send_auth(&self, port: &PortId, chunk: &[u8]) -> Result<(), TransportError> {
        let (peer_id, peer_port) = self
            .bus
            .peer_of(self.id, port)
            .ok_or_else(|| TransportError::PortDown(port.clone()))?;
        self.bus
            .post(Delivery::Auth(peer_id, peer_port, chunk.to_vec()));
        Ok(())
    }

    fn disconnect(&self, port: &PortId) {
        let removed = self.bus.links.lock().remove(&(self.id, port.clone()));
        if let Some((peer_id, peer_port)) = removed {
            self.bus.links.lock().remove(&(peer_id, peer_port.clone()));
            if let Some(core) = self.bus.core(peer_id) {
                core.supervisor()
                    .handle_event_now(LinkEvent::Down(peer_port));
            }
        }
    }
}

fn sink_neighbor() -> NeighborInfo {
    NeighborInfo::new(
        "AA:00:00:00:00:05",
        DeviceAdvert {
            role: Role::Sink,
            hop_count: HOP_UNKNOWN,
        },
        -50,
    )
}

fn node_neighbor(addr: &str, hop: u8) -> NeighborInfo {
    NeighborInfo::new(
        addr,
        DeviceAdvert {
            role: Role::Node,
            hop_count: hop,
        },
        -60,
    )
}

/// Build the Sink - A - B chain and complete both handshakes synchronously.
fn build_chain(sink_heartbeat: HeartbeatConfig, node_heartbeat: HeartbeatConfig) -> (Arc<Bus>, Arc<MeshCore>, Arc<MeshCore>, Arc<MeshCore>) {
    let bus = Arc::new(Bus::default());

    let sink = Arc::new(
        MeshCore::new(
            config("sink_cert.pem", "sink_key.pem", sink_heartbeat),
            Arc::new(BusPort { id: 0, bus: bus.clone() }),
        )
        .unwrap(),
    );
    let a = Arc::new(
        MeshCore::new(
            config("node_a_cert.pem", "node_a_key.pem", node_heartbeat.clone()),
            Arc::new(BusPort { id: 1, bus: bus.clone() }),
        )
        .unwrap(),
    );
    let b = Arc::new(
        MeshCore::new(
            config("node_b_cert.pem", "node_b_key.pem", node_heartbeat),
            Arc::new(BusPort { id: 2, bus: bus.clone() }),
        )
        .unwrap(),
    );

    bus.register(0, sink.clone());
    bus.register(1, a.clone());
    bus.register(2, b.clone());

    (bus, sink, a, b)
}

fn attach(
    bus: &Bus,
    child: &MeshCore,
    child_id: usize,
    parent: &MeshCore,
    parent_id: usize,
    parent_addr_of_child: &str,
    neighbor: &NeighborInfo,
) {
    let child_port = PortId::uplink();
    let parent_port = PortId::downlink(parent_addr_of_child);
    bus.connect((child_id, child_port.clone()), (parent_id, parent_port.clone()));

    child.supervisor().connect_uplink(neighbor).unwrap();
    parent
        .supervisor()
        .handle_event_now(LinkEvent::Up(parent_port));
    // The whole handshake runs inside this call on the loopback bus.
    child
        .supervisor()
        .handle_event_now(LinkEvent::Up(child_port));
}

#[test]
fn test_two_hop_delivery() {
    // Sink heartbeats get ttl=2 so A rebroadcasts them to B and B learns
    // the route back to the Sink.
    let sink_hb = HeartbeatConfig {
        ttl: 2,
        ..HeartbeatConfig::default()
    };
    let (bus, sink, a, b) = build_chain(sink_hb, HeartbeatConfig::default());

    attach(&bus, &a, 1, &sink, 0, ADDR_A, &sink_neighbor());
    assert_eq!(a.device().uplink_state(), UplinkState::Attached);
    assert_eq!(a.device().hop_count(), 0);

    attach(&bus, &b, 2, &a, 1, ADDR_B, &node_neighbor("AA:00:00:00:00:0A", 0));
    assert_eq!(b.device().uplink_state(), UplinkState::Attached);
    assert_eq!(b.device().hop_count(), 1);

    // One beat teaches A and (via rebroadcast) B where the Sink lives.
    sink.beat_now();
    assert_eq!(a.metrics().heartbeats_accepted, 1);
    assert_eq!(b.metrics().heartbeats_accepted, 1);

    // Sink-side delivery capture.
    let received = Arc::new(Mutex::new(Vec::<Packet>::new()));
    let capture = received.clone();
    sink.router()
        .register_handler(MessageType::Data, move |p| capture.lock().push(p.clone()));

    // B originates with local sequence 7.
    b.router().seed_sequence(7);
    let sink_nid: Nid = SINK_NID.parse().unwrap();
    b.router()
        .send_local(sink_nid, MessageType::Data, b"hello".to_vec())
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    let p = &received[0];
    assert_eq!(p.source.to_string(), NODE_B_NID);
    assert_eq!(p.destination.to_string(), SINK_NID);
    assert_eq!(p.sequence, 7);
    assert_eq!(p.payload, b"hello");
    // ttl 8 at B, decremented once by A.
    assert_eq!(p.ttl, 7);

    // B emitted ttl=8 on its uplink; A forwarded with ttl=7.
    let log = bus.packet_log.lock();
    let from_b: Vec<&(usize, PortId, Vec<u8>)> = log
        .iter()
        .filter(|(id, port, _)| *id == 2 && port.is_uplink())
        .collect();
    let wire = Packet::decode(&from_b.last().unwrap().2).unwrap();
    assert_eq!(wire.ttl, 8);
    assert_eq!(wire.sequence, 7);

    assert_eq!(a.metrics().routed, 1 + 1); // data forward + heartbeat rebroadcast
}

#[test]
fn test_replayed_packet_rejected() {
    let sink_hb = HeartbeatConfig {
        ttl: 2,
        ..HeartbeatConfig::default()
    };
    let (bus, sink, a, b) = build_chain(sink_hb, HeartbeatConfig::default());
    attach(&bus, &a, 1, &sink, 0, ADDR_A, &sink_neighbor());
    attach(&bus, &b, 2, &a, 1, ADDR_B, &node_neighbor("AA:00:00:00:00:0A", 0));
    sink.beat_now();

    sink.router().register_handler(MessageType::Data, |_| {});
    let sink_nid: Nid = SINK_NID.parse().unwrap();
    b.router()
        .send_local(sink_nid, MessageType::Data, b"hello".to_vec())
        .unwrap();

    let before = a.metrics().dropped_replay;

    // Replay B's uplink emission verbatim into A's downlink for B.
    let replayed: Vec<Vec<u8>> = bus
        .packet_log
        .lock()
        .iter()
        .filter(|(id, port, _)| *id == 2 && port.is_uplink())
        .map(|(_, _, chunk)| chunk.clone())
        .collect();
    for chunk in replayed {
        a.supervisor()
            .on_packet_chunk(&PortId::downlink(ADDR_B), &chunk);
    }

    assert_eq!(a.metrics().dropped_replay, before + 1);
}

#[test]
fn test_unknown_route_fails_send() {
    let (bus, sink, a, _b) = build_chain(HeartbeatConfig::default(), HeartbeatConfig::default());
    attach(&bus, &a, 1, &sink, 0, ADDR_A, &sink_neighbor());

    // The Sink has never seen traffic from this NID.
    let stranger = Nid::from_bytes([9; 16]);
    let err = sink
        .router()
        .send_local(stranger, MessageType::Data, b"x".to_vec())
        .unwrap_err();
    assert!(matches!(err, blemesh::RouterError::UnknownRoute(_)));
}

#[test]
fn test_handshake_installs_matching_keys() {
    let (bus, sink, a, _b) = build_chain(HeartbeatConfig::default(), HeartbeatConfig::default());
    attach(&bus, &a, 1, &sink, 0, ADDR_A, &sink_neighbor());

    let a_key = a.session_keys().get(&PortId::uplink()).unwrap();
    let sink_key = sink.session_keys().get(&PortId::downlink(ADDR_A)).unwrap();
    assert_eq!(a_key, sink_key);

    assert_eq!(a.metrics().auth_succeeded, 1);
    assert_eq!(sink.metrics().auth_succeeded, 1);

    // One beat teaches A the route back to the Sink; a data packet MACed
    // with the shared key then verifies on the peer.
    sink.beat_now();
    sink.router().register_handler(MessageType::Data, |_| {});
    a.router()
        .send_local(SINK_NID.parse().unwrap(), MessageType::Data, b"ping".to_vec())
        .unwrap();
    assert_eq!(sink.metrics().delivered, 1);
    assert_eq!(sink.metrics().dropped_bad_mac, 0);
}

#[test]
fn test_foreign_ca_peer_is_rejected_and_disconnected() {
    let (bus, sink, _a, _b) = build_chain(HeartbeatConfig::default(), HeartbeatConfig::default());

    let rogue = Arc::new(
        MeshCore::new(
            config("rogue_node_cert.pem", "rogue_node_key.pem", HeartbeatConfig::default()),
            Arc::new(BusPort { id: 7, bus: bus.clone() }),
        )
        .unwrap(),
    );
    bus.register(7, rogue.clone());

    let rogue_port = PortId::uplink();
    let sink_port = PortId::downlink("AA:00:00:00:00:07");
    bus.connect((7, rogue_port.clone()), (0, sink_port.clone()));

    rogue
        .supervisor()
        .connect_uplink(&sink_neighbor())
        .unwrap();
    sink.supervisor()
        .handle_event_now(LinkEvent::Up(sink_port.clone()));
    rogue
        .supervisor()
        .handle_event_now(LinkEvent::Up(rogue_port.clone()));

    // The Sink refused the certificate and dropped the link.
    assert!(sink.metrics().auth_failed >= 1);
    assert_eq!(sink.supervisor().slot_state(&sink_port), None);
    assert_eq!(sink.session_keys().get(&sink_port), None);
    assert_ne!(rogue.device().uplink_state(), UplinkState::Attached);
}

#[test]
fn test_cascading_disconnect_on_heartbeat_loss() {
    // Fast clocks so the 3-missed-beats window fits in a test run.
    let fast = HeartbeatConfig {
        interval: Duration::from_millis(25),
        miss_limit: 3,
        ttl: 2,
    };
    let (bus, sink, a, b) = build_chain(fast.clone(), fast);

    sink.start().unwrap();
    a.start().unwrap();
    b.start().unwrap();

    attach(&bus, &a, 1, &sink, 0, ADDR_A, &sink_neighbor());
    attach(&bus, &b, 2, &a, 1, ADDR_B, &node_neighbor("AA:00:00:00:00:0A", 0));
    // With the event tasks running, the attach verdicts land asynchronously.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(a.device().uplink_state(), UplinkState::Attached);
    assert_eq!(b.device().uplink_state(), UplinkState::Attached);

    // Let a few beats flow so both monitors are warm.
    std::thread::sleep(Duration::from_millis(100));
    assert!(a.metrics().heartbeats_accepted >= 1);
    assert!(b.metrics().heartbeats_accepted >= 1);

    // Failure injection: the Sink stops beating toward A.
    let a_nid: Nid = NODE_A_NID.parse().unwrap();
    sink.block_heartbeats_to(a_nid);

    // 3 x 25ms without a beat fires the timeout; the supervisor then drops
    // the uplink and cascades into B's link.
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(a.device().uplink_state(), UplinkState::Idle);
    assert_eq!(a.device().hop_count(), HOP_UNKNOWN);
    assert!(a.metrics().heartbeat_timeouts >= 1);

    assert_eq!(b.device().uplink_state(), UplinkState::Idle);
    assert_eq!(b.device().hop_count(), HOP_UNKNOWN);

    // The Sink saw A's side of the disconnect.
    assert_eq!(sink.supervisor().slot_state(&PortId::downlink(ADDR_A)), None);

    sink.stop();
    a.stop();
    b.stop();
}
