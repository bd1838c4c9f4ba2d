// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh-wide diagnostic counters.
//!
//! All fields use relaxed atomics; consumers only need monotonic snapshots
//! for operator CLIs, never synchronisation.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MeshMetrics {
    /// Packets forwarded to another port.
    pub routed: AtomicU64,
    /// Packets delivered to a local handler.
    pub delivered: AtomicU64,
    /// Packets originated locally and handed to the transport.
    pub sent: AtomicU64,

    pub dropped_malformed: AtomicU64,
    pub dropped_replay: AtomicU64,
    pub dropped_bad_mac: AtomicU64,
    pub dropped_no_session_key: AtomicU64,
    pub dropped_unknown_route: AtomicU64,
    pub dropped_ttl_expired: AtomicU64,
    pub dropped_reflection: AtomicU64,

    pub auth_succeeded: AtomicU64,
    pub auth_failed: AtomicU64,

    pub heartbeats_sent: AtomicU64,
    pub heartbeats_accepted: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub fragments_aborted: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub routed: u64,
    pub delivered: u64,
    pub sent: u64,
    pub dropped_malformed: u64,
    pub dropped_replay: u64,
    pub dropped_bad_mac: u64,
    pub dropped_no_session_key: u64,
    pub dropped_unknown_route: u64,
    pub dropped_ttl_expired: u64,
    pub dropped_reflection: u64,
    pub auth_succeeded: u64,
    pub auth_failed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_accepted: u64,
    pub heartbeat_timeouts: u64,
    pub fragments_aborted: u64,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_replay: self.dropped_replay.load(Ordering::Relaxed),
            dropped_bad_mac: self.dropped_bad_mac.load(Ordering::Relaxed),
            dropped_no_session_key: self.dropped_no_session_key.load(Ordering::Relaxed),
            dropped_unknown_route: self.dropped_unknown_route.load(Ordering::Relaxed),
            dropped_ttl_expired: self.dropped_ttl_expired.load(Ordering::Relaxed),
            dropped_reflection: self.dropped_reflection.load(Ordering::Relaxed),
            auth_succeeded: self.auth_succeeded.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_accepted: self.heartbeats_accepted.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            fragments_aborted: self.fragments_aborted.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Sum of every drop counter.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_replay
            + self.dropped_bad_mac
            + self.dropped_no_session_key
            + self.dropped_unknown_route
            + self.dropped_ttl_expired
            + self.dropped_reflection
    }
}
