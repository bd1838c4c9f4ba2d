// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Learning-switch forwarding table.
//!
//! A packet from NID `X` observed on port `Y` teaches the table that `X` is
//! reachable via `Y`. This observation is the *only* route-learning
//! mechanism in the mesh; there is no routing protocol. The most recent
//! observation wins, entries expire after a TTL, and a link going down
//! purges every route behind it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::nid::Nid;
use crate::transport::PortId;

/// Default lifetime of an unrefreshed entry.
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Entry {
    port: PortId,
    refreshed_at: Instant,
    hits: u64,
}

/// Route snapshot row for diagnostics.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub nid: Nid,
    pub port: PortId,
    pub age: Duration,
    pub hits: u64,
}

/// Thread-safe `Nid -> PortId` map with per-entry TTL.
pub struct ForwardingTable {
    entries: Mutex<HashMap<Nid, Entry>>,
    route_ttl: Duration,
}

impl ForwardingTable {
    pub fn new(route_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            route_ttl,
        }
    }

    /// Learn or refresh: `nid` is reachable via `port`.
    pub fn learn(&self, nid: Nid, port: &PortId) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&nid) {
            Some(entry) => {
                if entry.port != *port {
                    log::debug!("[FWD] route {} moved {} -> {}", nid.short(), entry.port, port);
                    entry.port = port.clone();
                }
                entry.refreshed_at = Instant::now();
            }
            None => {
                log::debug!("[FWD] learned {} -> {}", nid.short(), port);
                entries.insert(
                    nid,
                    Entry {
                        port: port.clone(),
                        refreshed_at: Instant::now(),
                        hits: 0,
                    },
                );
            }
        }
    }

    /// Resolve the egress port for `nid`. A hit refreshes the usage counter;
    /// an expired entry is dropped and reported as absent.
    pub fn lookup(&self, nid: &Nid) -> Option<PortId> {
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(nid) {
            Some(entry) => {
                if entry.refreshed_at.elapsed() <= self.route_ttl {
                    entry.hits += 1;
                    return Some(entry.port.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            log::debug!("[FWD] route {} expired", nid.short());
            entries.remove(nid);
        }
        None
    }

    pub fn remove(&self, nid: &Nid) -> bool {
        self.entries.lock().remove(nid).is_some()
    }

    /// Drop every route behind `port` (link went down). Returns the NIDs
    /// removed so callers can also reset their replay state.
    pub fn remove_by_port(&self, port: &PortId) -> Vec<Nid> {
        let mut entries = self.entries.lock();
        let victims: Vec<Nid> = entries
            .iter()
            .filter(|(_, e)| e.port == *port)
            .map(|(nid, _)| *nid)
            .collect();
        for nid in &victims {
            entries.remove(nid);
        }
        if !victims.is_empty() {
            log::info!("[FWD] purged {} routes behind {}", victims.len(), port);
        }
        victims
    }

    /// Drop entries past their TTL. Returns the NIDs removed.
    pub fn purge_expired(&self) -> Vec<Nid> {
        let mut entries = self.entries.lock();
        let victims: Vec<Nid> = entries
            .iter()
            .filter(|(_, e)| e.refreshed_at.elapsed() > self.route_ttl)
            .map(|(nid, _)| *nid)
            .collect();
        for nid in &victims {
            entries.remove(nid);
        }
        victims
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current table for diagnostics.
    pub fn snapshot(&self) -> Vec<RouteInfo> {
        self.entries
            .lock()
            .iter()
            .map(|(nid, e)| RouteInfo {
                nid: *nid,
                port: e.port.clone(),
                age: e.refreshed_at.elapsed(),
                hits: e.hits,
            })
            .collect()
    }
}

impl Default for ForwardingTable {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_TTL)
    }
}
