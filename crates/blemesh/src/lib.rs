// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # blemesh - Secure multi-hop BLE IoT mesh core
//!
//! A small, secure mesh over Bluetooth Low Energy. One **Sink** device is
//! the root/gateway; any number of **Node** devices form a tree below it.
//! Each Node holds at most one uplink (toward the Sink) and any number of
//! downlinks (children). Devices authenticate mutually with CA-issued
//! X.509 / ECDSA P-521 certificates, derive a per-link session key via
//! ECDH + HKDF, and route packets as a learning switch with a per-hop
//! HMAC, replay windows and TTLs.
//!
//! The BLE stack itself is a collaborator, not part of this crate: the
//! core consumes complete byte chunks per link and surfaces three
//! callbacks (deliver locally, send on link, link state changed) through
//! [`transport::Transport`] and [`transport::LinkEvent`].
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |  MeshCore                                                        |
//! |    DeviceStateMachine (uplink lifecycle, hop-count advertising)  |
//! |    LinkSupervisor     (slots, AuthFsm per link, cascade)         |
//! +------------------------------------------------------------------+
//! |  Router (learning switch)    | Liveness                          |
//! |    ForwardingTable           |   HeartbeatEmitter (Sink)         |
//! |    ReplayWindow              |   HeartbeatMonitor (Node)         |
//! |    per-port session keys     |                                   |
//! +------------------------------------------------------------------+
//! |  Security                    | Protocol                          |
//! |    CertStore, AuthFsm        |   PacketCodec, Fragmenter,        |
//! |    HMAC / ECDSA / ECDH       |   heartbeat + AUTH framing        |
//! +------------------------------------------------------------------+
//! |  Transport boundary (GATT server/client live outside the core)   |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blemesh::{MeshConfig, MeshCore};
//! # struct MyBleStack;
//! # impl blemesh::transport::Transport for MyBleStack {
//! #     fn send_packet(&self, _: &blemesh::transport::PortId, _: &[u8]) -> Result<(), blemesh::transport::TransportError> { Ok(()) }
//! #     fn send_auth(&self, _: &blemesh::transport::PortId, _: &[u8]) -> Result<(), blemesh::transport::TransportError> { Ok(()) }
//! #     fn disconnect(&self, _: &blemesh::transport::PortId) {}
//! # }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::from_cert_dir("/etc/mesh/certs/device-1", "hci0");
//!     let transport = Arc::new(MyBleStack);
//!     let core = MeshCore::new(config, transport)?;
//!     core.start()?;
//!
//!     // Transport callbacks feed the core:
//!     //   core.supervisor().events()      <- link up/down
//!     //   core.supervisor().on_packet_chunk(port, chunk)
//!     //   core.supervisor().on_auth_chunk(port, chunk)
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod liveness;
pub mod metrics;
pub mod nid;
pub mod protocol;
pub mod routing;
pub mod security;
pub mod topology;
pub mod transport;

pub use config::{HeartbeatConfig, MeshConfig};
pub use metrics::{MeshMetrics, MetricsSnapshot};
pub use nid::{Nid, Role};
pub use protocol::packet::{MessageType, Packet};
pub use routing::{ForwardingTable, Router, RouterError, SessionKeyMap};
pub use security::{AuthFsm, CertStore, ReplayWindow, SecurityError, SessionKey};
pub use topology::{DeviceStateMachine, LinkSupervisor, UplinkState};

use std::sync::Arc;

use liveness::{HeartbeatEmitter, HeartbeatMonitor};
use protocol::packet::MessageType as Mt;
use transport::Transport;

/// Top-level assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("task spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One fully wired mesh device: certificate store, router, supervisor and
/// the role-appropriate liveness service.
pub struct MeshCore {
    config: MeshConfig,
    store: Arc<CertStore>,
    device: Arc<DeviceStateMachine>,
    router: Arc<Router>,
    table: Arc<ForwardingTable>,
    keys: Arc<SessionKeyMap>,
    metrics: Arc<MeshMetrics>,
    supervisor: Arc<LinkSupervisor>,
    monitor: Arc<HeartbeatMonitor>,
    emitter: Option<HeartbeatEmitter>,
}

impl MeshCore {
    /// Load certificates and wire every subsystem together. The device
    /// role (and NID) comes from the certificate on disk.
    pub fn new(config: MeshConfig, transport: Arc<dyn Transport>) -> Result<Self, CoreError> {
        let store = Arc::new(CertStore::open(
            &config.cert_path,
            &config.key_path,
            &config.ca_cert_path,
        )?);
        let nid = store.local_nid();
        let role = store.local_role();
        log::info!("[CORE] starting as {role} nid={nid} adapter={}", config.adapter_id);

        let metrics = Arc::new(MeshMetrics::new());
        let table = Arc::new(ForwardingTable::new(config.route_ttl));
        let replay = Arc::new(ReplayWindow::new(config.replay_window));
        let keys = Arc::new(SessionKeyMap::new());
        let device = Arc::new(DeviceStateMachine::new(nid, role));
        let router = Arc::new(Router::new(
            nid,
            config.default_ttl,
            table.clone(),
            replay.clone(),
            keys.clone(),
            metrics.clone(),
        ));

        // One queue feeds the supervisor's event task; the transport and
        // the heartbeat monitor both hold senders into it.
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let monitor = Arc::new(HeartbeatMonitor::new(
            config.heartbeat.clone(),
            events_tx.clone(),
            metrics.clone(),
        ));

        let supervisor = Arc::new(LinkSupervisor::new(
            store.clone(),
            config.auth_timeout,
            device.clone(),
            router.clone(),
            table.clone(),
            replay,
            keys.clone(),
            transport,
            monitor.clone(),
            metrics.clone(),
            (events_tx, events_rx),
        ));

        // Node side: heartbeats delivered locally feed the watchdog.
        if !role.is_sink() {
            let watchdog = monitor.clone();
            router.register_handler(Mt::Heartbeat, move |packet| watchdog.observe(packet));
        }

        // Sink side: periodic signed broadcast over the attached downlinks.
        let emitter = if role.is_sink() {
            let peers_from = supervisor.clone();
            Some(HeartbeatEmitter::new(
                nid,
                store.signing_key(),
                config.heartbeat.clone(),
                router.clone(),
                Arc::new(move || peers_from.attached_downlinks()),
                metrics.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            device,
            router,
            table,
            keys,
            metrics,
            supervisor,
            monitor,
            emitter,
        })
    }

    /// Start the background tasks appropriate for this device's role.
    pub fn start(&self) -> Result<(), CoreError> {
        self.supervisor.start()?;
        if let Some(emitter) = &self.emitter {
            emitter.start()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(emitter) = &self.emitter {
            emitter.stop();
        }
        self.monitor.stop();
        self.supervisor.stop();
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn nid(&self) -> Nid {
        self.store.local_nid()
    }

    pub fn role(&self) -> Role {
        self.store.local_role()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<LinkSupervisor> {
        &self.supervisor
    }

    pub fn device(&self) -> &Arc<DeviceStateMachine> {
        &self.device
    }

    pub fn forwarding_table(&self) -> &Arc<ForwardingTable> {
        &self.table
    }

    pub fn session_keys(&self) -> &Arc<SessionKeyMap> {
        &self.keys
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Emit one heartbeat immediately, outside the timer (Sink only).
    /// Operator tooling uses this to probe a quiet tree.
    pub fn beat_now(&self) {
        if let Some(emitter) = &self.emitter {
            emitter.beat_once();
        }
    }

    /// Sink-side failure injection / recovery (no-ops on Nodes).
    pub fn block_heartbeats_to(&self, nid: Nid) {
        if let Some(emitter) = &self.emitter {
            emitter.block(nid);
        }
    }

    pub fn unblock_heartbeats_to(&self, nid: &Nid) {
        if let Some(emitter) = &self.emitter {
            emitter.unblock(nid);
        }
    }
}
