// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topology control: hop-count advertising, parent selection, the
//! per-device link supervisor and the top-level device state machine.

pub mod advert;
pub mod device;
pub mod supervisor;

pub use advert::{
    choose_parent, DeviceAdvert, DeviceInfo, NeighborInfo, HOP_MAX, HOP_UNKNOWN,
};
pub use device::{DeviceStateMachine, TransitionError, UplinkState};
pub use supervisor::LinkSupervisor;
