// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replay protection via per-source sequence-number windows.
//!
//! For every source NID the window tracks the highest sequence seen and the
//! set of sequences accepted within the last `window_size` numbers. A packet
//! is rejected when its sequence was already seen (duplicate) or falls below
//! the window (too old). Reordering inside the window is accepted.
//!
//! Sequence numbers are 32-bit and never wrap: a source that reaches
//! `u32::MAX` is flagged exhausted and everything after it is rejected until
//! its state is reset, which in practice means the link re-keys.

use dashmap::DashMap;

use crate::nid::Nid;

/// Default window size: reordering of up to 100 packets is tolerated.
pub const DEFAULT_WINDOW_SIZE: u32 = 100;

/// Why a sequence number was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayReject {
    /// Sequence already accepted from this source.
    Duplicate,
    /// Sequence below `highest - window_size`.
    TooOld,
    /// The source consumed the whole 32-bit sequence space; only a re-key
    /// (state reset) recovers it.
    SequenceExhausted,
}

impl std::fmt::Display for ReplayReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate sequence"),
            Self::TooOld => write!(f, "sequence below window"),
            Self::SequenceExhausted => write!(f, "sequence space exhausted"),
        }
    }
}

#[derive(Debug)]
struct SourceState {
    highest: u32,
    seen: Vec<u32>,
    exhausted: bool,
}

/// Sliding-window replay detector, one window per source NID.
///
/// Thread-safe; per-source access is naturally serialised by the per-link
/// ingress task, the map itself is sharded.
pub struct ReplayWindow {
    window_size: u32,
    sources: DashMap<Nid, SourceState>,
}

impl ReplayWindow {
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size,
            sources: DashMap::new(),
        }
    }

    /// Check `seq` from `source` and record it when accepted.
    pub fn check_and_update(&self, source: Nid, seq: u32) -> Result<(), ReplayReject> {
        use dashmap::mapref::entry::Entry;

        let mut entry = match self.sources.entry(source) {
            Entry::Vacant(vacant) => {
                vacant.insert(SourceState {
                    highest: seq,
                    seen: vec![seq],
                    exhausted: seq == u32::MAX,
                });
                log::debug!("[REPLAY] new source {} at seq={}", source.short(), seq);
                return Ok(());
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };
        let state = entry.value_mut();

        if state.exhausted {
            return Err(ReplayReject::SequenceExhausted);
        }

        if state.seen.contains(&seq) {
            return Err(ReplayReject::Duplicate);
        }

        // The window floor itself is out: entries at `highest - window` are
        // purged from the seen set, so accepting the floor would open a
        // boundary replay.
        if seq < state.highest && state.highest - seq >= self.window_size {
            return Err(ReplayReject::TooOld);
        }

        state.seen.push(seq);
        if seq > state.highest {
            state.highest = seq;
            let floor = seq.saturating_sub(self.window_size);
            state.seen.retain(|&s| s > floor);
            if seq == u32::MAX {
                log::warn!(
                    "[REPLAY] source {} exhausted its sequence space, link must re-key",
                    source.short()
                );
                state.exhausted = true;
            }
        }

        Ok(())
    }

    /// Forget a source entirely, e.g. when its route ages out or its link
    /// re-keys after a reconnect.
    pub fn reset(&self, source: &Nid) {
        if self.sources.remove(source).is_some() {
            log::debug!("[REPLAY] state reset for source {}", source.short());
        }
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
