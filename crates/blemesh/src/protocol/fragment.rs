// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragmentation for small-MTU BLE links.
//!
//! Any message larger than one chunk is split into up-to-180-byte fragments,
//! each carrying three bytes of framing:
//!
//! ```text
//! +-------+-------+-------+----------------+
//! | flags | seq   | total | chunk (<=180)  |
//! | 1 B   | 1 B   | 1 B   |                |
//! +-------+-------+-------+----------------+
//! ```
//!
//! Flag bit 0 marks the FIRST fragment, bit 1 the LAST. `total` is a single
//! byte, so a message can span at most 255 fragments (45 900 payload bytes);
//! larger messages are rejected at the sender.

use std::time::{Duration, Instant};

/// Maximum payload bytes per fragment. Chosen so a chunk plus its 3-byte
/// framing fits the conservative BLE write size used by the transport.
pub const FRAGMENT_CHUNK_LEN: usize = 180;

/// Framing overhead per fragment.
pub const FRAGMENT_HEADER_LEN: usize = 3;

/// Largest message representable with a one-byte `total` field.
pub const MAX_MESSAGE_LEN: usize = FRAGMENT_CHUNK_LEN * 255;

/// Partial reassembly state older than this is discarded when the next
/// fragment arrives. The wire format has no cross-fragment timeout of its
/// own; this bound keeps a dead peer from pinning a half-built message.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5);

pub const FLAG_FIRST: u8 = 0x01;
pub const FLAG_LAST: u8 = 0x02;

/// Fragmentation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_LEN}-byte fragmentation limit")]
    MessageTooLarge(usize),

    #[error("fragment shorter than its {FRAGMENT_HEADER_LEN}-byte header: {0} bytes")]
    TooShort(usize),

    #[error("fragment total changed mid-message: expected {expected}, got {got}")]
    TotalMismatch { expected: u8, got: u8 },

    #[error("fragment sequence {seq} out of range for total {total}")]
    SequenceOutOfRange { seq: u8, total: u8 },
}

/// One parsed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub flags: u8,
    pub seq: u8,
    pub total: u8,
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        buf.push(self.flags);
        buf.push(self.seq);
        buf.push(self.total);
        buf.extend_from_slice(&self.chunk);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FragmentError> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(FragmentError::TooShort(data.len()));
        }
        Ok(Self {
            flags: data[0],
            seq: data[1],
            total: data[2],
            chunk: data[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split a message into wire-ready fragments.
///
/// A message of up to [`FRAGMENT_CHUNK_LEN`] bytes becomes a single fragment
/// with both FIRST and LAST set. Larger messages are cut into
/// [`FRAGMENT_CHUNK_LEN`]-byte chunks, all sharing the same `total`.
pub fn fragment_message(data: &[u8]) -> Result<Vec<Vec<u8>>, FragmentError> {
    if data.len() > MAX_MESSAGE_LEN {
        return Err(FragmentError::MessageTooLarge(data.len()));
    }

    if data.len() <= FRAGMENT_CHUNK_LEN {
        let frag = Fragment {
            flags: FLAG_FIRST | FLAG_LAST,
            seq: 0,
            total: 1,
            chunk: data.to_vec(),
        };
        return Ok(vec![frag.encode()]);
    }

    let count = data.len().div_ceil(FRAGMENT_CHUNK_LEN);
    let mut out = Vec::with_capacity(count);
    for (i, chunk) in data.chunks(FRAGMENT_CHUNK_LEN).enumerate() {
        let mut flags = 0;
        if i == 0 {
            flags |= FLAG_FIRST;
        }
        if i == count - 1 {
            flags |= FLAG_LAST;
        }
        let frag = Fragment {
            flags,
            seq: i as u8,
            total: count as u8,
            chunk: chunk.to_vec(),
        };
        out.push(frag.encode());
    }

    log::debug!("[FRAG] message of {} bytes split into {} fragments", data.len(), count);
    Ok(out)
}

/// Per-link reassembler. One instance per link, destroyed with the link.
///
/// Idle until a FIRST fragment arrives; fragments may then land in any
/// order. A `total` mismatch or out-of-range sequence resets the state and
/// surfaces the error so the caller can count the aborted message.
pub struct Reassembler {
    slots: Vec<Option<Vec<u8>>>,
    total: Option<u8>,
    filled: usize,
    started_at: Option<Instant>,
    stale_timeout: Duration,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_stale_timeout(DEFAULT_STALE_TIMEOUT)
    }

    pub fn with_stale_timeout(stale_timeout: Duration) -> Self {
        Self {
            slots: Vec::new(),
            total: None,
            filled: 0,
            started_at: None,
            stale_timeout,
        }
    }

    /// Feed one fragment. Returns `Ok(Some(message))` when the message is
    /// complete, `Ok(None)` while more fragments are pending.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let fragment = Fragment::decode(data)?;

        // Drop a half-built message the peer abandoned.
        if let Some(started) = self.started_at {
            if started.elapsed() > self.stale_timeout {
                log::debug!("[FRAG] discarding stale partial message");
                self.reset();
            }
        }

        if fragment.is_first() {
            self.slots = vec![None; fragment.total as usize];
            self.total = Some(fragment.total);
            self.filled = 0;
            self.started_at = Some(Instant::now());
        }

        let Some(total) = self.total else {
            // No FIRST seen yet; nothing to attach this fragment to.
            log::debug!("[FRAG] fragment seq={} before FIRST, ignoring", fragment.seq);
            return Ok(None);
        };

        if fragment.total != total {
            let err = FragmentError::TotalMismatch {
                expected: total,
                got: fragment.total,
            };
            self.reset();
            return Err(err);
        }

        if fragment.seq >= total {
            let err = FragmentError::SequenceOutOfRange {
                seq: fragment.seq,
                total,
            };
            self.reset();
            return Err(err);
        }

        let slot = &mut self.slots[fragment.seq as usize];
        if slot.is_none() {
            *slot = Some(fragment.chunk);
            self.filled += 1;
        }
        // Duplicate seq: slot already filled, silently ignored.

        if self.filled == total as usize {
            let mut message = Vec::new();
            for chunk in self.slots.drain(..) {
                message.extend_from_slice(&chunk.unwrap_or_default());
            }
            self.reset();
            log::debug!("[FRAG] message of {} bytes reassembled ({} fragments)", message.len(), total);
            return Ok(Some(message));
        }

        Ok(None)
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.total = None;
        self.filled = 0;
        self.started_at = None;
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
