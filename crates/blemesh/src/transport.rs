// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Boundary to the BLE transport.
//!
//! The GATT stack itself (advertising, scanning, connections, characteristic
//! plumbing) lives outside the core. The core sees each peer link as a pair
//! of byte channels named by a [`PortId`]: the data channel (Network Packet
//! characteristic) and the control channel (Authentication characteristic).
//! Everything the core hands to [`Transport`] is already fragmented; every
//! inbound chunk goes through [`IngressReassembly`] before it reaches the
//! router or an auth machine.
//!
//! Link lifecycle changes arrive as [`LinkEvent`]s on the supervisor's
//! queue.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::nid::Nid;
use crate::protocol::fragment::{FragmentError, Reassembler};

/// Name of a link endpoint: the single `"uplink"`, or the peer's BLE
/// address for a downlink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortId(Arc<str>);

impl PortId {
    const UPLINK: &'static str = "uplink";

    /// The device's single upward port.
    pub fn uplink() -> Self {
        Self(Arc::from(Self::UPLINK))
    }

    /// A downlink port named by the child's BLE address.
    pub fn downlink(peer_addr: &str) -> Self {
        Self(Arc::from(peer_addr))
    }

    pub fn is_uplink(&self) -> bool {
        &*self.0 == Self::UPLINK
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-side failures surfaced to the core.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("port {0} is not connected")]
    PortDown(PortId),

    #[error("transport write failed: {0}")]
    WriteFailed(String),
}

/// Outbound half of the transport contract.
///
/// `send_packet` maps to Write-Without-Response on the Network Packet
/// characteristic (or a notification when the link is a downlink),
/// `send_auth` to Write/Indicate on the Authentication characteristic.
/// Implementations serialise writes per link; the core never calls them
/// while holding a lock.
pub trait Transport: Send + Sync {
    fn send_packet(&self, port: &PortId, chunk: &[u8]) -> Result<(), TransportError>;
    fn send_auth(&self, port: &PortId, chunk: &[u8]) -> Result<(), TransportError>;
    /// Tear the underlying connection down (cascading disconnect, auth
    /// failure, operator action).
    fn disconnect(&self, port: &PortId);
}

/// Link lifecycle events, produced by the transport (and by the liveness
/// monitor) and consumed by the supervisor's event task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transport established a connection on `port`.
    Up(PortId),
    /// Connection on `port` is gone.
    Down(PortId),
    /// Authentication on `port` completed; the slot may attach.
    AuthSucceeded(PortId),
    /// Authentication on `port` failed terminally.
    AuthFailed(PortId, String),
    /// No valid heartbeat on the uplink for the configured window.
    HeartbeatTimeout,
}

/// Per-link reassembly of inbound chunks, one [`Reassembler`] per port and
/// channel. Created by the supervisor, fed by the transport's receive
/// callbacks, destroyed with the link.
#[derive(Default)]
pub struct IngressReassembly {
    links: DashMap<PortId, Mutex<Reassembler>>,
}

impl IngressReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk from `port`. Returns a complete message when the
    /// final fragment lands.
    pub fn push(&self, port: &PortId, chunk: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let entry = self
            .links
            .entry(port.clone())
            .or_insert_with(|| Mutex::new(Reassembler::new()));
        let mut reassembler = entry.lock();
        reassembler.push(chunk)
    }

    /// Drop any partial state for a link that went away.
    pub fn forget(&self, port: &PortId) {
        self.links.remove(port);
    }
}

/// Per-peer heartbeat NID bookkeeping used when notifying downlinks; kept
/// here so both the emitter and the supervisor share one registry type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPeer {
    pub port: PortId,
    pub nid: Nid,
}
