// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration records.
//!
//! The surrounding process constructs these once and passes them in; the
//! core keeps no process-wide configuration state.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_TTL;
use crate::security::handshake::DEFAULT_AUTH_TIMEOUT;
use crate::security::replay::DEFAULT_WINDOW_SIZE;

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Sink emission period.
    pub interval: Duration,
    /// Consecutive missed beats before the uplink is declared dead.
    pub miss_limit: u32,
    /// TTL stamped on emitted heartbeats. With the default of 1 a heartbeat
    /// reaches direct children only; raising it makes intermediate nodes
    /// rebroadcast downward.
    pub ttl: u8,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            miss_limit: 3,
            ttl: 1,
        }
    }
}

impl HeartbeatConfig {
    /// `miss_limit x interval`: how long the uplink may stay silent.
    pub fn timeout(&self) -> Duration {
        self.interval * self.miss_limit
    }
}

/// Top-level core configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// PEM device certificate (`certificate.pem`).
    pub cert_path: PathBuf,
    /// PEM private key (`private_key.pem`).
    pub key_path: PathBuf,
    /// PEM CA certificate shared by the whole deployment.
    pub ca_cert_path: PathBuf,
    /// BLE adapter identifier, opaque to the core, handed to the transport.
    pub adapter_id: String,

    /// TTL for locally originated packets.
    pub default_ttl: u8,
    /// Forwarding table entry lifetime.
    pub route_ttl: Duration,
    /// Replay window size per source.
    pub replay_window: u32,
    /// Hard deadline for a whole authentication handshake.
    pub auth_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl MeshConfig {
    /// Configuration rooted at a certificate directory laid out as
    /// `<dir>/certificate.pem`, `<dir>/private_key.pem` and a sibling
    /// `ca_certificate.pem`.
    pub fn from_cert_dir(device_dir: impl Into<PathBuf>, adapter_id: impl Into<String>) -> Self {
        let dir = device_dir.into();
        let ca = dir
            .parent()
            .map(|p| p.join("ca_certificate.pem"))
            .unwrap_or_else(|| PathBuf::from("ca_certificate.pem"));
        Self {
            cert_path: dir.join("certificate.pem"),
            key_path: dir.join("private_key.pem"),
            ca_cert_path: ca,
            adapter_id: adapter_id.into(),
            ..Self::default()
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("certificate.pem"),
            key_path: PathBuf::from("private_key.pem"),
            ca_cert_path: PathBuf::from("ca_certificate.pem"),
            adapter_id: String::from("hci0"),
            default_ttl: DEFAULT_TTL,
            route_ttl: Duration::from_secs(300),
            replay_window: DEFAULT_WINDOW_SIZE,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}
