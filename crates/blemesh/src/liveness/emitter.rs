// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sink-side heartbeat broadcast.
//!
//! A single timer task signs and emits one heartbeat per interval to every
//! attached downlink. Individual peers can be blocked from receiving
//! heartbeats, which test rigs use to inject uplink failures without
//! touching the transport.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::HeartbeatConfig;
use crate::metrics::MeshMetrics;
use crate::nid::Nid;
use crate::protocol::heartbeat::{now_epoch, HeartbeatPayload};
use crate::protocol::packet::{MessageType, Packet};
use crate::protocol::DEFAULT_HMAC_KEY;
use crate::routing::router::Router;
use crate::security::crypto::SigningKey;
use crate::transport::AttachedPeer;

/// Provider of the currently attached downlinks, supplied by the link
/// supervisor.
pub type PeerProvider = Arc<dyn Fn() -> Vec<AttachedPeer> + Send + Sync>;

struct Inner {
    sink_nid: Nid,
    signing_key: SigningKey,
    config: HeartbeatConfig,
    router: Arc<Router>,
    peers: PeerProvider,
    blocked: Mutex<HashSet<Nid>>,
    sequence: AtomicU32,
    metrics: Arc<MeshMetrics>,
}

/// Periodic signed heartbeat broadcaster. Runs on the Sink only.
pub struct HeartbeatEmitter {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatEmitter {
    pub fn new(
        sink_nid: Nid,
        signing_key: SigningKey,
        config: HeartbeatConfig,
        router: Arc<Router>,
        peers: PeerProvider,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink_nid,
                signing_key,
                config,
                router,
                peers,
                blocked: Mutex::new(HashSet::new()),
                sequence: AtomicU32::new(0),
                metrics,
            }),
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the timer task. The first heartbeat goes out immediately.
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle_slot = self.handle.lock();
        if handle_slot.is_some() {
            log::warn!("[HEARTBEAT] emitter already running");
            return Ok(());
        }

        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("heartbeat-emitter".into())
            .spawn(move || {
                log::info!(
                    "[HEARTBEAT] emitter started, interval {:?}",
                    inner.config.interval
                );
                loop {
                    inner.beat();
                    match stop_rx.recv_timeout(inner.config.interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                log::info!("[HEARTBEAT] emitter stopped");
            })?;

        *self.stop.lock() = Some(stop_tx);
        *handle_slot = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        // Dropping the sender unblocks the timer wait.
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stop delivering heartbeats to `nid` (failure injection).
    pub fn block(&self, nid: Nid) {
        self.inner.blocked.lock().insert(nid);
        log::warn!("[HEARTBEAT] heartbeats to {} blocked", nid.short());
    }

    pub fn unblock(&self, nid: &Nid) {
        if self.inner.blocked.lock().remove(nid) {
            log::info!("[HEARTBEAT] heartbeats to {} unblocked", nid.short());
        }
    }

    /// Emit one heartbeat now, outside the timer. Exposed so tests can beat
    /// deterministically.
    pub fn beat_once(&self) {
        self.inner.beat();
    }
}

impl Inner {
    fn beat(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = now_epoch();

        let payload = match HeartbeatPayload::sign(self.sink_nid, timestamp, &self.signing_key) {
            Ok(p) => p,
            Err(e) => {
                log::error!("[HEARTBEAT] signing failed: {e}");
                return;
            }
        };

        // Broadcast convention: destination equals the Sink's own NID.
        let mut packet = Packet::new(
            self.sink_nid,
            self.sink_nid,
            MessageType::Heartbeat,
            self.config.ttl,
            sequence,
            payload.encode(),
        );
        packet.apply_mac(DEFAULT_HMAC_KEY);

        let blocked = self.blocked.lock().clone();
        let mut notified = 0usize;
        let mut skipped = 0usize;
        for peer in (self.peers.as_ref())() {
            if blocked.contains(&peer.nid) {
                skipped += 1;
                continue;
            }
            match self.router.emit_on_port(&peer.port, &packet) {
                Ok(()) => notified += 1,
                Err(e) => log::error!("[HEARTBEAT] notify {} failed: {e}", peer.port),
            }
        }

        MeshMetrics::incr(&self.metrics.heartbeats_sent);
        if skipped > 0 {
            log::debug!(
                "[HEARTBEAT] seq={sequence} notified {notified} downlinks ({skipped} blocked)"
            );
        } else {
            log::debug!("[HEARTBEAT] seq={sequence} notified {notified} downlinks");
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
