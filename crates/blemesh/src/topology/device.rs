// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Top-level device state machine.
//!
//! Tracks the uplink lifecycle of a Node:
//!
//! ```text
//! Idle --scan+choose--> Connecting --transport up--> Authenticating
//!      <----auth failed / timeout (retry with backoff)----|
//! Authenticating --AuthFsm authenticated--> Attached
//! Attached --heartbeat timeout / transport down--> Idle
//! ```
//!
//! While `Attached`, the device advertises `parent_hop + 1`; in every other
//! state it advertises the 255 sentinel. The Sink never leaves `Idle` (it
//! has no uplink) and always advertises the sentinel.

use std::time::Duration;

use parking_lot::Mutex;

use crate::nid::{Nid, Role};
use crate::topology::advert::{DeviceAdvert, DeviceInfo, HOP_UNKNOWN};

/// Uplink slot states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Idle,
    Connecting,
    Authenticating,
    Attached,
}

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid uplink transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: UplinkState,
    pub to: UplinkState,
}

#[derive(Debug)]
struct UplinkPhase {
    state: UplinkState,
    /// BLE address of the parent being pursued or held.
    target: Option<String>,
    /// Hop count this device owns while attached.
    hop_count: u8,
    /// Consecutive failed attach attempts, for backoff.
    failures: u32,
}

/// Per-device topology state.
pub struct DeviceStateMachine {
    nid: Nid,
    role: Role,
    uplink: Mutex<UplinkPhase>,
}

impl DeviceStateMachine {
    const BACKOFF_BASE: Duration = Duration::from_secs(1);
    const BACKOFF_CAP: Duration = Duration::from_secs(60);

    pub fn new(nid: Nid, role: Role) -> Self {
        Self {
            nid,
            role,
            uplink: Mutex::new(UplinkPhase {
                state: UplinkState::Idle,
                target: None,
                hop_count: HOP_UNKNOWN,
                failures: 0,
            }),
        }
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn uplink_state(&self) -> UplinkState {
        self.uplink.lock().state
    }

    /// Current hop count ([`HOP_UNKNOWN`] while detached, and always for
    /// the Sink).
    pub fn hop_count(&self) -> u8 {
        self.uplink.lock().hop_count
    }

    /// BLE address of the current / pending parent.
    pub fn uplink_target(&self) -> Option<String> {
        self.uplink.lock().target.clone()
    }

    /// Manufacturer-data advertisement for the current state.
    pub fn advert(&self) -> DeviceAdvert {
        DeviceAdvert {
            role: self.role,
            hop_count: self.hop_count(),
        }
    }

    /// Device Info characteristic payload.
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            nid: self.nid,
            hop_count: self.hop_count(),
            role: self.role,
        }
    }

    /// A parent was chosen from scan results; the transport is connecting.
    pub fn begin_connect(&self, parent_addr: &str) -> Result<(), TransitionError> {
        let mut uplink = self.uplink.lock();
        if uplink.state != UplinkState::Idle {
            return Err(TransitionError {
                from: uplink.state,
                to: UplinkState::Connecting,
            });
        }
        uplink.state = UplinkState::Connecting;
        uplink.target = Some(parent_addr.to_string());
        log::info!("[DEVICE] connecting uplink to {parent_addr}");
        Ok(())
    }

    /// The transport link is up; authentication starts.
    pub fn transport_up(&self) -> Result<(), TransitionError> {
        let mut uplink = self.uplink.lock();
        if uplink.state != UplinkState::Connecting {
            return Err(TransitionError {
                from: uplink.state,
                to: UplinkState::Authenticating,
            });
        }
        uplink.state = UplinkState::Authenticating;
        log::debug!("[DEVICE] uplink transport up, authenticating");
        Ok(())
    }

    /// Mutual authentication completed; the device owns `hop_count` now.
    pub fn attached(&self, hop_count: u8) -> Result<(), TransitionError> {
        let mut uplink = self.uplink.lock();
        if uplink.state != UplinkState::Authenticating {
            return Err(TransitionError {
                from: uplink.state,
                to: UplinkState::Attached,
            });
        }
        uplink.state = UplinkState::Attached;
        uplink.hop_count = hop_count;
        uplink.failures = 0;
        log::info!("[DEVICE] uplink attached, hop_count={hop_count}");
        Ok(())
    }

    /// Authentication failed or timed out; back to scanning, with backoff.
    pub fn auth_failed(&self) {
        let mut uplink = self.uplink.lock();
        uplink.state = UplinkState::Idle;
        uplink.target = None;
        uplink.hop_count = HOP_UNKNOWN;
        uplink.failures = uplink.failures.saturating_add(1);
        log::warn!("[DEVICE] uplink authentication failed (attempt {})", uplink.failures);
    }

    /// The attached uplink died (heartbeat timeout or transport down).
    pub fn uplink_lost(&self) {
        let mut uplink = self.uplink.lock();
        if uplink.state == UplinkState::Idle {
            return;
        }
        log::warn!("[DEVICE] uplink lost (was {:?})", uplink.state);
        uplink.state = UplinkState::Idle;
        uplink.target = None;
        uplink.hop_count = HOP_UNKNOWN;
    }

    /// How long to wait before the next attach attempt: exponential in the
    /// consecutive failure count, capped.
    pub fn retry_backoff(&self) -> Duration {
        let failures = self.uplink.lock().failures;
        let exp = failures.min(6); // 2^6 * base already exceeds the cap
        Self::BACKOFF_BASE
            .saturating_mul(1u32 << exp)
            .min(Self::BACKOFF_CAP)
    }
}
