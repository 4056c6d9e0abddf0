// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Core value types shared across the transport layer.
//!
//! These are the inputs the discovery/federation collaborator hands to the
//! transport core: endpoint identifiers, resolved QoS values, association
//! requests, and the opaque connection-info blob exchanged between peers.

use std::fmt::Write as _;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// 16-byte opaque endpoint identifier, supplied by discovery.
///
/// Identifies one local or remote publication/subscription endpoint. The
/// transport core never interprets its contents.
pub type RepoId = [u8; 16];

/// Short hex rendering of a [`RepoId`] for log messages (first 6 bytes).
pub fn fmt_repo_id(id: &RepoId) -> String {
    let mut s = String::with_capacity(12);
    for b in &id[..6] {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

// ============================================================================
// Direction and QoS
// ============================================================================

/// Which side of connection establishment this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Dial out to the remote endpoint
    Active,
    /// Wait for the remote endpoint to connect
    Passive,
}

/// Reliability kind resolved from the endpoint's QoS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReliabilityKind {
    /// Samples may be dropped; no acknowledgment protocol
    #[default]
    BestEffort,
    /// Associations must be acknowledged before they are fully established
    Reliable,
}

/// The already-resolved QoS values the transport core consumes.
///
/// QoS policy representation and parsing belong to the upper layers; the
/// core only needs these three values.
#[derive(Clone, Copy, Debug)]
pub struct LinkQos {
    /// Reliability kind of the association
    pub reliability: ReliabilityKind,

    /// Upper bound on blocking connection establishment
    /// (`None` = no bound; connectionless transports never block)
    pub max_blocking_time: Option<Duration>,

    /// Transport priority for the association
    pub priority: i32,
}

impl Default for LinkQos {
    fn default() -> Self {
        Self {
            reliability: ReliabilityKind::BestEffort,
            max_blocking_time: Some(Duration::from_secs(5)),
            priority: 0,
        }
    }
}

// ============================================================================
// Connection info blob
// ============================================================================

/// Opaque addressing blob exchanged between peers via discovery.
///
/// `kind` identifies the concrete plugin so a peer can reject incompatible
/// transport kinds before interpreting `data`. The blob's internal layout is
/// plugin-specific; the core only guarantees it round-trips losslessly
/// through [`ConnectionInfo::encode`] / [`ConnectionInfo::decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Concrete transport kind id (one per plugin)
    pub kind: u32,

    /// Plugin-specific address bytes
    pub data: Vec<u8>,
}

/// Size of the kind header in an encoded blob.
const INFO_HEADER_SIZE: usize = 4;

impl ConnectionInfo {
    /// Create a connection info blob.
    pub fn new(kind: u32, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    /// Encode as `[kind: u32 LE][data]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INFO_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode from `[kind: u32 LE][data]`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFO_HEADER_SIZE {
            return Err(TransportError::Format(format!(
                "connection info too short: {} bytes",
                buf.len()
            )));
        }
        let kind = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Self {
            kind,
            data: buf[INFO_HEADER_SIZE..].to_vec(),
        })
    }
}

// ============================================================================
// Association request
// ============================================================================

/// Association request consumed from the discovery collaborator.
///
/// Created at association-request time, consumed by
/// [`crate::TransportInstance::reserve_datalink`], and discarded once the
/// association is confirmed fully associated or permanently failed.
#[derive(Clone, Debug)]
pub struct AssociationInfo {
    /// Local endpoint id
    pub local_id: RepoId,

    /// Remote endpoint id
    pub remote_id: RepoId,

    /// Remote endpoint's addressing blob
    pub remote_info: ConnectionInfo,

    /// Transport priority for the backing link
    pub priority: i32,

    /// Which side dials
    pub direction: Direction,
}

// ============================================================================
// Local endpoint handles
// ============================================================================

/// Application-facing handle for a registered publication.
///
/// The instance notifies the writer exactly once when every pending remote
/// for the publication has acknowledged the association.
pub trait WriterHandle: Send + Sync {
    /// All pending associations for `pub_id` are acknowledged.
    fn on_fully_associated(&self, pub_id: &RepoId);
}

/// Application-facing handle for a registered subscription.
///
/// Receive strategies deliver demarshaled sample payloads through this.
pub trait ReaderHandle: Send + Sync {
    /// A serialized sample arrived for this subscription.
    fn on_data(&self, payload: &[u8]);
}
