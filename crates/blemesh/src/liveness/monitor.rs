// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-side heartbeat monitor.
//!
//! Armed when the uplink attaches, with the Sink identity learned during
//! authentication. The router delivers validated HEARTBEAT packets to
//! [`HeartbeatMonitor::observe`], which checks the ECDSA signature against
//! that identity and refreshes the freshness clock. A checker task fires a
//! single [`LinkEvent::HeartbeatTimeout`] into the supervisor queue when the
//! uplink has been silent for `miss_limit x interval`.
//!
//! Freshness of the *timestamp* is deliberately not judged against the
//! local clock; replay is the packet sequence window's job.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::HeartbeatConfig;
use crate::metrics::MeshMetrics;
use crate::nid::Nid;
use crate::protocol::heartbeat::HeartbeatPayload;
use crate::protocol::packet::Packet;
use crate::security::crypto::VerifyingKey;
use crate::transport::LinkEvent;

struct SinkIdentity {
    nid: Nid,
    key: VerifyingKey,
}

enum Expectation {
    /// Attached directly to the Sink: every beat must verify under its
    /// certificate key.
    Signed(SinkIdentity),
    /// Attached to an intermediate Node: the Sink certificate is not in
    /// hand, so beats refresh the clock without signature verification.
    Relayed,
}

struct Inner {
    config: HeartbeatConfig,
    sink: RwLock<Option<Expectation>>,
    last_beat: Mutex<Option<Instant>>,
    missed: AtomicU32,
    fired: AtomicBool,
    events: Sender<LinkEvent>,
    metrics: Arc<MeshMetrics>,
}

/// Uplink liveness watchdog.
pub struct HeartbeatMonitor {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        config: HeartbeatConfig,
        events: Sender<LinkEvent>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink: RwLock::new(None),
                last_beat: Mutex::new(None),
                missed: AtomicU32::new(0),
                fired: AtomicBool::new(false),
                events,
                metrics,
            }),
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Arm the watchdog for a fresh attachment directly below the Sink:
    /// remember which Sink signed our session and start the clock from now.
    pub fn arm(&self, sink_nid: Nid, sink_key: VerifyingKey) {
        *self.inner.sink.write() = Some(Expectation::Signed(SinkIdentity {
            nid: sink_nid,
            key: sink_key,
        }));
        self.reset_clock();
        log::info!("[HEARTBEAT] monitor armed for sink {}", sink_nid.short());
    }

    /// Arm the watchdog behind an intermediate Node. Relayed beats cannot
    /// be signature-checked without the Sink certificate; the timeout still
    /// applies.
    pub fn arm_relayed(&self) {
        *self.inner.sink.write() = Some(Expectation::Relayed);
        self.reset_clock();
        log::info!("[HEARTBEAT] monitor armed (relayed, signature unverified)");
    }

    fn reset_clock(&self) {
        *self.inner.last_beat.lock() = Some(Instant::now());
        self.inner.missed.store(0, Ordering::SeqCst);
        self.inner.fired.store(false, Ordering::SeqCst);
    }

    /// Disarm on detach; observations are ignored until the next [`arm`].
    ///
    /// [`arm`]: Self::arm
    pub fn disarm(&self) {
        *self.inner.sink.write() = None;
        *self.inner.last_beat.lock() = None;
        log::debug!("[HEARTBEAT] monitor disarmed");
    }

    /// Router delivery handler for HEARTBEAT packets (replay and MAC are
    /// already checked by the router).
    pub fn observe(&self, packet: &Packet) {
        let payload = match HeartbeatPayload::decode(&packet.payload) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[HEARTBEAT] malformed payload: {e}");
                return;
            }
        };

        let sink = self.inner.sink.read();
        let Some(expectation) = sink.as_ref() else {
            log::debug!("[HEARTBEAT] beat observed while disarmed, ignoring");
            return;
        };

        match expectation {
            Expectation::Signed(identity) => {
                if payload.sink_nid != identity.nid {
                    log::warn!(
                        "[HEARTBEAT] beat claims sink {} but we attached to {}",
                        payload.sink_nid.short(),
                        identity.nid.short()
                    );
                    return;
                }
                if !payload.verify(&identity.key) {
                    log::warn!(
                        "[HEARTBEAT] signature verification failed (seq={})",
                        packet.sequence
                    );
                    return;
                }
            }
            Expectation::Relayed => {
                log::debug!("[HEARTBEAT] relayed beat accepted without signature check");
            }
        }

        let previously_missed = self.inner.missed.swap(0, Ordering::SeqCst);
        if previously_missed > 0 {
            log::info!(
                "[HEARTBEAT] beat seq={} after {} missed intervals",
                packet.sequence,
                previously_missed
            );
        } else {
            log::debug!(
                "[HEARTBEAT] beat seq={} age={:.2}s",
                packet.sequence,
                payload.age()
            );
        }
        *self.inner.last_beat.lock() = Some(Instant::now());
        MeshMetrics::incr(&self.inner.metrics.heartbeats_accepted);
    }

    /// Start the checker task.
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle_slot = self.handle.lock();
        if handle_slot.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("heartbeat-monitor".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(inner.config.interval) {
                    Err(RecvTimeoutError::Timeout) => inner.check(),
                    _ => break,
                }
            })?;

        *self.stop.lock() = Some(stop_tx);
        *handle_slot = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Run one freshness check immediately (tests).
    pub fn check_now(&self) {
        self.inner.check();
    }

    /// Consecutive intervals without a beat.
    pub fn missed_count(&self) -> u32 {
        self.inner.missed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn check(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        let Some(last) = *self.last_beat.lock() else {
            // Disarmed, nothing to watch.
            return;
        };

        let elapsed = last.elapsed();
        if elapsed < self.config.interval {
            return;
        }

        let missed = self.missed.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "[HEARTBEAT] beat missed ({missed}/{}) last {:.1}s ago",
            self.config.miss_limit,
            elapsed.as_secs_f64()
        );

        if elapsed >= self.config.timeout() && !self.fired.swap(true, Ordering::SeqCst) {
            log::error!(
                "[HEARTBEAT] uplink timeout after {:.1}s of silence",
                elapsed.as_secs_f64()
            );
            MeshMetrics::incr(&self.metrics.heartbeat_timeouts);
            if self.events.send(LinkEvent::HeartbeatTimeout).is_err() {
                log::error!("[HEARTBEAT] supervisor queue closed, timeout lost");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
