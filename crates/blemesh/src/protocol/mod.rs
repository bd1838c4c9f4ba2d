// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-wire formats: packet header, fragmentation framing, heartbeat payload,
//! authentication messages.

pub mod auth;
pub mod fragment;
pub mod heartbeat;
pub mod packet;

pub use auth::{AuthMessage, AuthMessageType};
pub use fragment::{fragment_message, Fragment, Reassembler, FRAGMENT_CHUNK_LEN, MAX_MESSAGE_LEN};
pub use heartbeat::{HeartbeatPayload, HEARTBEAT_PAYLOAD_LEN, HEARTBEAT_SIGNATURE_LEN};
pub use packet::{MessageType, Packet, MAC_LEN, PACKET_HEADER_LEN};

/// Default TTL for locally originated packets.
pub const DEFAULT_TTL: u8 = 8;

/// Fixed HMAC key for heartbeat packets. Heartbeats are broadcast before any
/// pairwise session exists; their authenticity comes from the ECDSA signature
/// inside the payload, the HMAC exists only for uniform packet framing.
pub const DEFAULT_HMAC_KEY: &[u8; 32] = b"IoT_Network_Shared_Secret_Key_32";
