// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link supervisor.
//!
//! Owns every link slot (the single uplink plus N downlinks), drives the
//! per-link authentication machines, and turns link lifecycle events into
//! state transitions. All slot mutation happens on one dedicated event
//! task consuming a queue, so the transitions themselves never race; the
//! ingress paths only feed frames in and post events.
//!
//! The supervisor is also where the tree-rooted liveness rule lives: when
//! the uplink dies (transport down or heartbeat timeout), every downlink
//! is disconnected in cascade. A subtree cut off from the Sink tears
//! itself down rather than serve stale routes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::liveness::monitor::HeartbeatMonitor;
use crate::metrics::MeshMetrics;
use crate::nid::{Nid, Role};
use crate::protocol::fragment::fragment_message;
use crate::routing::forwarding::ForwardingTable;
use crate::routing::router::{Router, SessionKeyMap};
use crate::security::certs::CertStore;
use crate::security::handshake::{AuthFsm, AuthOutcome, AuthState};
use crate::security::replay::ReplayWindow;
use crate::topology::advert::{encode_neighbor_table, NeighborInfo, HOP_UNKNOWN};
use crate::topology::device::{DeviceStateMachine, UplinkState};
use crate::transport::{AttachedPeer, IngressReassembly, LinkEvent, PortId, Transport};

/// A link slot mirrors the uplink state names; downlinks skip `Connecting`
/// because the remote central connects to us.
type SlotState = UplinkState;

struct Slot {
    state: SlotState,
    fsm: Option<AuthFsm>,
    outcome: Option<AuthOutcome>,
    peer: Option<(Nid, Role)>,
}

impl Slot {
    fn authenticating() -> Self {
        Self {
            state: SlotState::Authenticating,
            fsm: None,
            outcome: None,
            peer: None,
        }
    }
}

struct Inner {
    store: Arc<CertStore>,
    auth_timeout: Duration,
    device: Arc<DeviceStateMachine>,
    router: Arc<Router>,
    table: Arc<ForwardingTable>,
    replay: Arc<ReplayWindow>,
    keys: Arc<SessionKeyMap>,
    transport: Arc<dyn Transport>,
    monitor: Arc<HeartbeatMonitor>,
    metrics: Arc<MeshMetrics>,
    slots: Mutex<HashMap<PortId, Slot>>,
    /// Hop count this device will own if the pending uplink attach
    /// succeeds, taken from the chosen parent's advertisement.
    pending_hop: Mutex<Option<u8>>,
    events_tx: Sender<LinkEvent>,
    ingress_packets: IngressReassembly,
    ingress_auth: IngressReassembly,
    running: AtomicBool,
}

/// Supervisor of every link endpoint on this device.
pub struct LinkSupervisor {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<Receiver<LinkEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LinkSupervisor {
    /// Poll period of the event task; bounds how late an authentication
    /// timeout sweep can run.
    const TICK: Duration = Duration::from_millis(500);

    /// Wire the supervisor over a pre-built event queue so collaborators
    /// (the transport, the heartbeat monitor) can hold the sender before
    /// the supervisor exists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CertStore>,
        auth_timeout: Duration,
        device: Arc<DeviceStateMachine>,
        router: Arc<Router>,
        table: Arc<ForwardingTable>,
        replay: Arc<ReplayWindow>,
        keys: Arc<SessionKeyMap>,
        transport: Arc<dyn Transport>,
        monitor: Arc<HeartbeatMonitor>,
        metrics: Arc<MeshMetrics>,
        events: (Sender<LinkEvent>, Receiver<LinkEvent>),
    ) -> Self {
        let (events_tx, events_rx) = events;

        // Egress wiring: the router emits whole packets, the transport
        // takes MTU-sized chunks.
        let egress = transport.clone();
        router.set_send_callback(move |port, bytes| match fragment_message(bytes) {
            Ok(chunks) => chunks
                .iter()
                .all(|chunk| egress.send_packet(port, chunk).is_ok()),
            Err(e) => {
                log::error!("[SUPERVISOR] cannot fragment packet for {port}: {e}");
                false
            }
        });

        let inner = Arc::new(Inner {
            store,
            auth_timeout,
            device,
            router,
            table,
            replay,
            keys,
            transport,
            monitor,
            metrics,
            slots: Mutex::new(HashMap::new()),
            pending_hop: Mutex::new(None),
            events_tx,
            ingress_packets: IngressReassembly::new(),
            ingress_auth: IngressReassembly::new(),
            running: AtomicBool::new(false),
        });

        Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
            handle: Mutex::new(None),
        }
    }

    /// Queue handle for the transport's link callbacks (and the liveness
    /// monitor).
    pub fn events(&self) -> Sender<LinkEvent> {
        self.inner.events_tx.clone()
    }

    /// Record the parent chosen from scan results; the collaborator then
    /// makes the BLE connection and reports `LinkEvent::Up("uplink")`.
    pub fn connect_uplink(&self, parent: &NeighborInfo) -> Result<(), crate::topology::device::TransitionError> {
        self.inner.device.begin_connect(&parent.addr)?;
        *self.inner.pending_hop.lock() = Some(parent.child_hop());
        Ok(())
    }

    /// Inbound chunk on the Network Packet characteristic.
    pub fn on_packet_chunk(&self, port: &PortId, chunk: &[u8]) {
        match self.inner.ingress_packets.push(port, chunk) {
            Ok(Some(packet_bytes)) => self.inner.router.receive(port, &packet_bytes),
            Ok(None) => {}
            Err(e) => {
                log::warn!("[SUPERVISOR] fragmentation aborted on {port}: {e}");
                MeshMetrics::incr(&self.inner.metrics.fragments_aborted);
            }
        }
    }

    /// Inbound chunk on the Authentication characteristic.
    pub fn on_auth_chunk(&self, port: &PortId, chunk: &[u8]) {
        let frame = match self.inner.ingress_auth.push(port, chunk) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::warn!("[SUPERVISOR] auth fragmentation aborted on {port}: {e}");
                MeshMetrics::incr(&self.inner.metrics.fragments_aborted);
                return;
            }
        };
        self.inner.drive_auth(port, &frame);
    }

    /// Attached, authenticated downlinks (heartbeat fan-out set).
    pub fn attached_downlinks(&self) -> Vec<AttachedPeer> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|(port, slot)| !port.is_uplink() && slot.state == SlotState::Attached)
            .filter_map(|(port, slot)| {
                slot.peer.map(|(nid, _)| AttachedPeer {
                    port: port.clone(),
                    nid,
                })
            })
            .collect()
    }

    /// Payload for the Neighbor Table characteristic: every attached peer
    /// with its hop count relative to this device.
    pub fn neighbor_table_payload(&self) -> Vec<u8> {
        let my_hop = self.inner.device.hop_count();
        let child_hop = if my_hop == HOP_UNKNOWN {
            HOP_UNKNOWN
        } else {
            my_hop.saturating_add(1)
        };

        let entries: Vec<(Nid, u8)> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Attached)
            .filter_map(|(port, slot)| {
                slot.peer.map(|(nid, role)| {
                    let hop = if port.is_uplink() {
                        if role.is_sink() {
                            0
                        } else {
                            my_hop.saturating_sub(1)
                        }
                    } else {
                        child_hop
                    };
                    (nid, hop)
                })
            })
            .collect();
        encode_neighbor_table(&entries)
    }

    /// Start the event task.
    pub fn start(&self) -> std::io::Result<()> {
        let Some(events_rx) = self.events_rx.lock().take() else {
            log::warn!("[SUPERVISOR] already started");
            return Ok(());
        };

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("link-supervisor".into())
            .spawn(move || {
                log::info!("[SUPERVISOR] event task started");
                while inner.running.load(Ordering::SeqCst) {
                    match events_rx.recv_timeout(Self::TICK) {
                        Ok(event) => inner.handle_event(event),
                        Err(RecvTimeoutError::Timeout) => inner.sweep_auth_timeouts(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::info!("[SUPERVISOR] event task stopped");
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Process one event synchronously (tests drive the supervisor without
    /// the background task).
    pub fn handle_event_now(&self, event: LinkEvent) {
        self.inner.handle_event(event);
    }

    /// Run one authentication timeout sweep synchronously (tests).
    pub fn sweep_now(&self) {
        self.inner.sweep_auth_timeouts();
    }

    pub fn slot_state(&self, port: &PortId) -> Option<UplinkState> {
        self.inner.slots.lock().get(port).map(|s| s.state)
    }
}

impl Inner {
    fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Up(port) => self.on_link_up(port),
            LinkEvent::Down(port) => {
                log::warn!("[SUPERVISOR] link down: {port}");
                self.teardown(&port);
            }
            LinkEvent::AuthSucceeded(port) => self.finalize_attach(&port),
            LinkEvent::AuthFailed(port, reason) => self.on_auth_failed(&port, &reason),
            LinkEvent::HeartbeatTimeout => {
                let uplink = PortId::uplink();
                log::error!("[SUPERVISOR] heartbeat timeout, dropping uplink");
                self.transport.disconnect(&uplink);
                self.teardown(&uplink);
            }
        }
    }

    fn on_link_up(&self, port: PortId) {
        log::info!("[SUPERVISOR] link up: {port}");
        let frames = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(port.clone()).or_insert_with(Slot::authenticating);
            slot.state = SlotState::Authenticating;
            let fsm = slot
                .fsm
                .get_or_insert_with(|| AuthFsm::new(self.store.clone(), self.auth_timeout));

            if port.is_uplink() {
                if let Err(e) = self.device.transport_up() {
                    log::warn!("[SUPERVISOR] unsolicited uplink transport: {e}");
                }
                // Central side initiates the handshake.
                match fsm.start() {
                    Ok(frames) => frames,
                    Err(e) => {
                        log::error!("[SUPERVISOR] cannot start handshake: {e}");
                        Vec::new()
                    }
                }
            } else {
                // Peripheral side waits for the peer's CERT_OFFER.
                Vec::new()
            }
        };
        self.send_auth_frames(&port, &frames);
    }

    /// Feed one reassembled AUTH frame into the port's machine.
    fn drive_auth(&self, port: &PortId, frame: &[u8]) {
        let (frames, verdict) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(port.clone())
                .or_insert_with(Slot::authenticating);
            if slot.state == SlotState::Attached {
                // Trailing confirmations after attach are harmless; a fresh
                // handshake needs a fresh link.
                log::debug!("[SUPERVISOR] auth frame on attached port {port}, ignoring");
                return;
            }
            let fsm = slot
                .fsm
                .get_or_insert_with(|| AuthFsm::new(self.store.clone(), self.auth_timeout));

            match fsm.process(frame) {
                Ok(frames) => match fsm.state() {
                    AuthState::Authenticated => {
                        // Only the frame that completed the handshake
                        // yields an outcome; confirmations that trail it
                        // must not disturb the pending attach.
                        match fsm.take_outcome() {
                            Some(outcome) => {
                                slot.outcome = Some(outcome);
                                (frames, Some(Ok(())))
                            }
                            None => (frames, None),
                        }
                    }
                    AuthState::Failed => {
                        let reason = fsm
                            .failure_reason()
                            .unwrap_or("authentication failed")
                            .to_string();
                        (frames, Some(Err(reason)))
                    }
                    _ => (frames, None),
                },
                Err(e) => (Vec::new(), Some(Err(e.to_string()))),
            }
        };

        self.send_auth_frames(port, &frames);

        match verdict {
            Some(Ok(())) => self.post(LinkEvent::AuthSucceeded(port.clone())),
            Some(Err(reason)) => self.post(LinkEvent::AuthFailed(port.clone(), reason)),
            None => {}
        }
    }

    fn finalize_attach(&self, port: &PortId) {
        let outcome = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(port) else {
                log::error!("[SUPERVISOR] attach for unknown port {port}");
                return;
            };
            let Some(outcome) = slot.outcome.take() else {
                log::error!("[SUPERVISOR] attach without auth outcome on {port}");
                return;
            };
            slot.state = SlotState::Attached;
            slot.peer = Some((outcome.peer.nid, outcome.peer.role));
            slot.fsm = None;
            outcome
        };

        MeshMetrics::incr(&self.metrics.auth_succeeded);
        log::info!(
            "[SUPERVISOR] {port} attached: peer {} ({})",
            outcome.peer.nid,
            outcome.peer.role
        );

        if port.is_uplink() {
            let hop = self.pending_hop.lock().take().unwrap_or_else(|| {
                if outcome.peer.role.is_sink() {
                    0
                } else {
                    HOP_UNKNOWN
                }
            });
            if let Err(e) = self.device.attached(hop) {
                log::warn!("[SUPERVISOR] device attach transition: {e}");
            }

            if outcome.peer.role.is_sink() {
                self.monitor
                    .arm(outcome.peer.nid, outcome.peer.verifying_key());
            } else {
                self.monitor.arm_relayed();
            }
            if let Err(e) = self.monitor.start() {
                log::error!("[SUPERVISOR] cannot start heartbeat monitor: {e}");
            }
        }

        // Keys go live only after the slot is attached.
        self.keys.set(port.clone(), outcome.session_key);
    }

    fn on_auth_failed(&self, port: &PortId, reason: &str) {
        MeshMetrics::incr(&self.metrics.auth_failed);
        log::warn!("[SUPERVISOR] authentication failed on {port}: {reason}");
        self.transport.disconnect(port);
        self.teardown_slot(port);
        if port.is_uplink() {
            self.device.auth_failed();
            *self.pending_hop.lock() = None;
        }
    }

    /// Tear one slot down; an uplink teardown cascades into every downlink.
    fn teardown(&self, port: &PortId) {
        self.teardown_slot(port);

        if port.is_uplink() {
            self.monitor.disarm();
            self.device.uplink_lost();
            *self.pending_hop.lock() = None;

            let downlinks: Vec<PortId> = self
                .slots
                .lock()
                .keys()
                .filter(|p| !p.is_uplink())
                .cloned()
                .collect();
            if !downlinks.is_empty() {
                log::warn!(
                    "[SUPERVISOR] uplink gone, cascading disconnect of {} downlinks",
                    downlinks.len()
                );
            }
            for downlink in downlinks {
                self.transport.disconnect(&downlink);
                self.teardown_slot(&downlink);
            }
        }
    }

    /// Per-slot teardown: session key, routes, replay state, partial
    /// fragments, the slot itself.
    fn teardown_slot(&self, port: &PortId) {
        self.keys.remove(port);
        for source in self.table.remove_by_port(port) {
            self.replay.reset(&source);
        }
        self.ingress_packets.forget(port);
        self.ingress_auth.forget(port);
        self.slots.lock().remove(port);
    }

    fn sweep_auth_timeouts(&self) {
        let expired: Vec<(PortId, Vec<Vec<u8>>)> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|(port, slot)| {
                    let fsm = slot.fsm.as_mut()?;
                    if fsm.expired() {
                        Some((port.clone(), fsm.expire()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (port, frames) in expired {
            log::warn!("[SUPERVISOR] authentication timed out on {port}");
            self.send_auth_frames(&port, &frames);
            self.post(LinkEvent::AuthFailed(port, "authentication timeout".into()));
        }
    }

    fn send_auth_frames(&self, port: &PortId, frames: &[Vec<u8>]) {
        for frame in frames {
            let chunks = match fragment_message(frame) {
                Ok(chunks) => chunks,
                Err(e) => {
                    log::error!("[SUPERVISOR] auth frame too large for {port}: {e}");
                    continue;
                }
            };
            for chunk in chunks {
                if let Err(e) = self.transport.send_auth(port, &chunk) {
                    log::error!("[SUPERVISOR] auth write to {port} failed: {e}");
                    break;
                }
            }
        }
    }

    /// Post an event to our own queue; falls back to inline handling when
    /// the event task is not running (tests, shutdown).
    fn post(&self, event: LinkEvent) {
        if self.running.load(Ordering::SeqCst) {
            if self.events_tx.send(event).is_err() {
                log::error!("[SUPERVISOR] event queue closed");
            }
        } else {
            self.handle_event(event);
        }
    }
}

impl Drop for LinkSupervisor {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
