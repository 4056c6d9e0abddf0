// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Connection key: the value identifying which data link an association uses.
//!
//! Two reservations with equal keys must share one [`crate::DataLink`]; the
//! reservation table is keyed and iterated by this total order, so ordering,
//! equality, and hashing all agree.

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use crate::types::Direction;

/// Identifies one logical connection: remote address, priority, and
/// direction flags.
///
/// The key includes the active/passive flag, so a simultaneous-open (the
/// same `(remote, priority)` pair reserved Active by one side and Passive by
/// the other) produces two distinct keys and therefore two independent
/// links. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Transport priority of the link
    pub priority: i32,

    /// Remote endpoint address
    pub remote: SocketAddr,

    /// Remote endpoint is on this host
    pub loopback: bool,

    /// This side dials the connection
    pub active: bool,
}

impl ConnectionKey {
    /// Build a key from an association request's resolved fields.
    pub fn new(remote: SocketAddr, priority: i32, direction: Direction, loopback: bool) -> Self {
        Self {
            priority,
            remote,
            loopback,
            active: direction == Direction::Active,
        }
    }
}

impl Ord for ConnectionKey {
    /// Total order: priority, then remote address, then loopback, then
    /// active. Any deterministic order works for the reservation table; this
    /// one groups links by priority band first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.remote.cmp(&other.remote))
            .then_with(|| self.loopback.cmp(&other.loopback))
            .then_with(|| self.active.cmp(&other.active))
    }
}

impl PartialOrd for ConnectionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}{}{}",
            self.remote,
            self.priority,
            if self.loopback { " lo" } else { "" },
            if self.active { " active" } else { " passive" },
        )
    }
}
