// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Pending-association and acknowledgment bookkeeping.
//!
//! Reliable transports confirm connection setup with acknowledgment
//! messages. The publishing side records each requested association as
//! pending; when an ack for every pending remote of a publication has
//! arrived, the association flips to fully-associated and the writer is
//! notified exactly once.
//!
//! # Ack envelope
//!
//! ```text
//! +----------------+------------------+------------------+ ...
//! | count (u32 LE) | pub_id (16B)     | sub_id (16B)     |
//! +----------------+------------------+------------------+ ...
//! ```
//!
//! One `(pub_id, sub_id)` pair per acknowledged association. Length
//! mismatches are rejected as a whole; no partial application.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, TransportError};
use crate::types::{fmt_repo_id, RepoId};

/// Size of one `(pub_id, sub_id)` pair on the wire.
const ACK_PAIR_SIZE: usize = 32;

/// Size of the pair-count header.
const ACK_HEADER_SIZE: usize = 4;

// ============================================================================
// Demarshaling
// ============================================================================

/// Parse an acknowledgment payload into its `(pub_id, sub_id)` pairs.
///
/// `swap_bytes` demarshals the count with swapped byte order (peers with
/// opposite endianness). Malformed input is rejected with
/// [`TransportError::Format`]; the caller applies either every pair or none.
pub fn demarshal_acks(payload: &[u8], swap_bytes: bool) -> Result<Vec<(RepoId, RepoId)>> {
    if payload.len() < ACK_HEADER_SIZE {
        return Err(TransportError::Format(format!(
            "ack payload too short: {} bytes",
            payload.len()
        )));
    }

    let raw = [payload[0], payload[1], payload[2], payload[3]];
    let count = if swap_bytes {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    } as usize;

    let body = &payload[ACK_HEADER_SIZE..];
    let expected = count.checked_mul(ACK_PAIR_SIZE).ok_or_else(|| {
        TransportError::Format(format!("ack pair count overflows: {}", count))
    })?;
    if body.len() != expected {
        return Err(TransportError::Format(format!(
            "ack payload length mismatch: {} pairs declared, {} bytes of body",
            count,
            body.len()
        )));
    }

    let mut pairs = Vec::with_capacity(count);
    for chunk in body.chunks_exact(ACK_PAIR_SIZE) {
        let mut pub_id: RepoId = [0; 16];
        let mut sub_id: RepoId = [0; 16];
        pub_id.copy_from_slice(&chunk[..16]);
        sub_id.copy_from_slice(&chunk[16..]);
        pairs.push((pub_id, sub_id));
    }
    Ok(pairs)
}

/// Marshal `(pub_id, sub_id)` pairs into the core ack envelope.
///
/// The subscribing side of a reliable plugin uses this to confirm
/// connection setup.
pub fn marshal_acks(pairs: &[(RepoId, RepoId)], swap_bytes: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ACK_HEADER_SIZE + pairs.len() * ACK_PAIR_SIZE);
    let count = pairs.len() as u32;
    if swap_bytes {
        buf.extend_from_slice(&count.to_be_bytes());
    } else {
        buf.extend_from_slice(&count.to_le_bytes());
    }
    for (pub_id, sub_id) in pairs {
        buf.extend_from_slice(pub_id);
        buf.extend_from_slice(sub_id);
    }
    buf
}

// ============================================================================
// Association table
// ============================================================================

/// Pending-association and acked maps, guarded by the instance's ack lock.
///
/// Invariant: every pending entry is removed exactly once, either because
/// the publication became fully associated or because the endpoint was
/// unregistered / the instance shut down.
#[derive(Debug, Default)]
pub struct AssociationTable {
    /// Remotes each local publication is still waiting on
    pending: HashMap<RepoId, Vec<RepoId>>,

    /// Acknowledged `(pub_id, sub_id)` pairs; survive full association so
    /// `acked()` keeps answering, dropped on unregistration
    acked: HashSet<(RepoId, RepoId)>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a not-yet-acknowledged association. Duplicates are ignored.
    pub fn add_pending(&mut self, local_id: RepoId, remote_id: RepoId) {
        let remotes = self.pending.entry(local_id).or_default();
        if !remotes.contains(&remote_id) {
            remotes.push(remote_id);
            log::debug!(
                "[ASSOC] pending {} -> {} ({} outstanding)",
                fmt_repo_id(&local_id),
                fmt_repo_id(&remote_id),
                remotes.len()
            );
        }
    }

    /// Mark one pair acknowledged. Returns false for duplicates.
    pub fn mark_acked(&mut self, pub_id: RepoId, sub_id: RepoId) -> bool {
        self.acked.insert((pub_id, sub_id))
    }

    /// Whether a pair has been acknowledged.
    pub fn is_acked(&self, pub_id: &RepoId, sub_id: &RepoId) -> bool {
        self.acked.contains(&(*pub_id, *sub_id))
    }

    /// Whether the publication has a pending entry at all.
    pub fn has_pending(&self, pub_id: &RepoId) -> bool {
        self.pending.contains_key(pub_id)
    }

    /// Remove the pending entry if every remote for `pub_id` is acked.
    ///
    /// Returns true exactly once per completed entry; the caller owns the
    /// resulting notification. Must run under the ack lock so the
    /// read-modify-notify is atomic with respect to concurrent acks.
    pub fn take_if_complete(&mut self, pub_id: &RepoId) -> bool {
        let complete = match self.pending.get(pub_id) {
            Some(remotes) => remotes
                .iter()
                .all(|remote| self.acked.contains(&(*pub_id, *remote))),
            None => false,
        };
        if complete {
            self.pending.remove(pub_id);
            log::debug!("[ASSOC] {} fully associated", fmt_repo_id(pub_id));
        }
        complete
    }

    /// Drop every trace of an endpoint: its pending entry and every acked
    /// pair it participates in, on either side.
    pub fn remove_endpoint(&mut self, id: &RepoId) {
        self.pending.remove(id);
        self.acked
            .retain(|(pub_id, sub_id)| pub_id != id && sub_id != id);
    }

    /// Number of publications still waiting on acks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard everything (instance shutdown).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.acked.clear();
    }
}
