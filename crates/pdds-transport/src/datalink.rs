// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Data link: one established (or establishing) connection to a remote
//! endpoint at a given priority.
//!
//! A [`DataLink`] is shared by every association that reuses the same
//! physical connection, so it is reference counted: the owning
//! [`crate::TransportInstance`] tracks reservations and removes the link
//! from its table when the count reaches zero. The link holds only a weak
//! back-reference to its owner, so an instance can shut down while links
//! are draining.
//!
//! # State Machine
//!
//! ```text
//!      +--------------+
//!      | Disconnected |
//!      +------+-------+
//!             | connect()
//!             v
//!      +--------------+
//!      |  Connecting  |--(open failed)------------+
//!      +------+-------+                           |
//!             | opened / mark_connected()         v
//!             v                              +--------+
//!      +--------------+--(I/O error)-------->|  Lost  |  (terminal)
//!      |  Connected   |--(backpressure       +--------+
//!      +--------------+    timeout)---------------^
//! ```
//!
//! `Lost` is terminal: a lost link is never reused, and a fresh reservation
//! for the same key creates a new one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, TransportError};
use crate::instance::TransportInstance;
use crate::key::ConnectionKey;

// ============================================================================
// Link State
// ============================================================================

/// Data link state machine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Created, no connection attempt made
    #[default]
    Disconnected,

    /// Connection establishment in progress
    Connecting,

    /// Connection established and operational
    Connected,

    /// Connection lost (terminal, never reused)
    Lost,
}

impl LinkState {
    /// Check if the link can carry samples.
    pub fn is_operational(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// Check if the link is in its terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Lost)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Lost => "Lost",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Strategy contracts
// ============================================================================

/// Result of a non-blocking send attempt.
///
/// Backpressure is a normal, transient condition, distinct from failure; it
/// only escalates to link loss after the configured output pause period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Payload fully handed to the wire
    Sent,

    /// The connection cannot accept more outbound data right now
    Backpressure,
}

/// Result of opening a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Establishment completed synchronously
    Connected,

    /// Interest registered (e.g. with the reactor); the plugin calls
    /// [`DataLink::mark_connected`] when the handshake completes
    Pending,
}

/// Plugin-supplied outbound side of a data link.
pub trait SendStrategy: Send + Sync {
    /// Establish the connection. Active transports dial out, passive
    /// transports adopt an accepted connection.
    fn open(&self, active: bool) -> Result<OpenOutcome>;

    /// Attempt a non-blocking send of one serialized payload.
    fn send(&self, payload: &[u8]) -> Result<SendOutcome>;

    /// Release outbound resources. Idempotence is the caller's concern.
    fn stop(&self);
}

/// Plugin-supplied inbound side of a data link.
///
/// Demarshaled payloads are delivered to the registered
/// [`crate::ReaderHandle`]s by the plugin; the core only manages lifetime.
pub trait ReceiveStrategy: Send + Sync {
    /// Release inbound resources.
    fn stop(&self);
}

// ============================================================================
// Data Link
// ============================================================================

/// A (possibly shared) connection to a remote peer at a given priority.
pub struct DataLink {
    /// Key this link is registered under in the owner's reservation table
    key: ConnectionKey,

    /// Owning instance (weak: links never keep an instance alive)
    owner: Weak<TransportInstance>,

    /// Outbound strategy
    send_strategy: Box<dyn SendStrategy>,

    /// Inbound strategy (send-only links have none)
    receive_strategy: Option<Box<dyn ReceiveStrategy>>,

    /// Backpressure escalation bound (`None` = never escalate)
    max_output_pause: Option<Duration>,

    /// Current state
    state: Mutex<LinkState>,

    /// When the current backpressure episode started
    backpressure_since: Mutex<Option<Instant>>,

    /// Number of outstanding reservations
    reservations: AtomicUsize,

    /// Loss transition and notification happen exactly once
    lost_latch: AtomicBool,

    /// Strategies stopped exactly once
    stopped: AtomicBool,

    /// Plugin teardown hook invoked exactly once (set by the cleanup task)
    released: AtomicBool,
}

impl DataLink {
    /// Create a new link in the `Disconnected` state.
    ///
    /// Called by a plugin's `find_or_create_datalink`; `owner` is the
    /// instance issuing the reservation, `max_output_pause` normally comes
    /// from the instance's [`crate::CommonConfig`].
    pub fn new(
        key: ConnectionKey,
        owner: Weak<TransportInstance>,
        send_strategy: Box<dyn SendStrategy>,
        receive_strategy: Option<Box<dyn ReceiveStrategy>>,
        max_output_pause: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            owner,
            send_strategy,
            receive_strategy,
            max_output_pause,
            state: Mutex::new(LinkState::Disconnected),
            backpressure_since: Mutex::new(None),
            reservations: AtomicUsize::new(0),
            lost_latch: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// The key this link serves.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Number of outstanding reservations.
    pub fn reservations(&self) -> usize {
        self.reservations.load(Ordering::Acquire)
    }

    /// The owning instance, if it is still alive.
    pub(crate) fn owner(&self) -> Option<Arc<TransportInstance>> {
        self.owner.upgrade()
    }

    pub(crate) fn add_reservation(&self) -> usize {
        self.reservations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the reservation count, saturating at zero.
    pub(crate) fn remove_reservation(&self) -> usize {
        let mut current = self.reservations.load(Ordering::Acquire);
        loop {
            if current == 0 {
                log::error!("[LINK] {} released more often than reserved", self.key);
                return 0;
            }
            match self.reservations.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// First call wins the right to run the plugin teardown hook.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    // ========================================================================
    // Connection establishment
    // ========================================================================

    /// Establish the connection in the given direction.
    ///
    /// Synchronous establishment transitions straight to `Connected`;
    /// reactor-driven plugins return pending from their strategy and call
    /// [`mark_connected`](Self::mark_connected) once the handshake finishes.
    /// Calling `connect` on a link already connecting or connected is a
    /// no-op; a lost link returns `LinkLost`.
    pub fn connect(self: &Arc<Self>, as_active: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                LinkState::Disconnected => *state = LinkState::Connecting,
                LinkState::Connecting | LinkState::Connected => return Ok(()),
                LinkState::Lost => return Err(TransportError::LinkLost),
            }
        }

        match self.send_strategy.open(as_active) {
            Ok(OpenOutcome::Connected) => {
                self.mark_connected();
                Ok(())
            }
            Ok(OpenOutcome::Pending) => {
                log::debug!("[LINK] {} establishment pending", self.key);
                Ok(())
            }
            Err(e) => {
                self.notify_lost("connection establishment failed");
                Err(e)
            }
        }
    }

    /// Complete a pending establishment.
    ///
    /// Ignored once the link is lost.
    pub fn mark_connected(&self) {
        let mut state = self.state.lock();
        match *state {
            LinkState::Connecting | LinkState::Disconnected => {
                *state = LinkState::Connected;
                log::debug!("[LINK] {} connected", self.key);
            }
            LinkState::Connected | LinkState::Lost => {}
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Attempt to send one serialized payload. Never blocks.
    ///
    /// Completes, reports [`SendOutcome::Backpressure`], or fails. A link
    /// still connecting reports backpressure; backpressure older than the
    /// configured output pause period escalates to `Lost` and returns
    /// `LinkLost`.
    pub fn send(self: &Arc<Self>, payload: &[u8]) -> Result<SendOutcome> {
        match self.state() {
            LinkState::Connected => {}
            LinkState::Connecting => {
                if self.note_backpressure() {
                    return Err(TransportError::LinkLost);
                }
                return Ok(SendOutcome::Backpressure);
            }
            LinkState::Disconnected => {
                return Err(TransportError::ConnectFailed("link never opened".into()));
            }
            LinkState::Lost => return Err(TransportError::LinkLost),
        }

        match self.send_strategy.send(payload) {
            Ok(SendOutcome::Sent) => {
                *self.backpressure_since.lock() = None;
                Ok(SendOutcome::Sent)
            }
            Ok(SendOutcome::Backpressure) => {
                if self.note_backpressure() {
                    return Err(TransportError::LinkLost);
                }
                Ok(SendOutcome::Backpressure)
            }
            Err(e) => {
                log::warn!("[LINK] {} send failed: {}", self.key, e);
                self.notify_lost("send failed");
                Err(e)
            }
        }
    }

    /// Re-evaluate an ongoing backpressure episode (e.g. from a reactor
    /// timer). Returns true if the link just escalated to `Lost`.
    pub fn check_backpressure(self: &Arc<Self>) -> bool {
        let expired = {
            let since = self.backpressure_since.lock();
            match (*since, self.max_output_pause) {
                (Some(start), Some(pause)) => start.elapsed() >= pause,
                _ => false,
            }
        };
        if expired {
            self.notify_lost("backpressure timeout exceeded");
        }
        expired
    }

    /// Record a backpressure observation; returns true if it escalated.
    fn note_backpressure(self: &Arc<Self>) -> bool {
        {
            let mut since = self.backpressure_since.lock();
            let start = since.get_or_insert_with(Instant::now);
            match self.max_output_pause {
                Some(pause) if start.elapsed() >= pause => {}
                _ => return false,
            }
        }
        self.notify_lost("backpressure timeout exceeded");
        true
    }

    // ========================================================================
    // Loss and teardown
    // ========================================================================

    /// Transition to `Lost` and notify the owning instance, exactly once.
    ///
    /// Safe to call from plugin callbacks: the owner defers the actual
    /// destruction through the cleanup task, so the caller is never still
    /// inside a link that is being destroyed under it.
    pub fn notify_lost(self: &Arc<Self>, reason: &str) {
        if self.lost_latch.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = LinkState::Lost;
        log::warn!("[LINK] {} lost: {}", self.key, reason);

        if let Some(owner) = self.owner.upgrade() {
            owner.on_link_lost(self.clone());
        }
    }

    /// Graceful local shutdown: stop both strategies. Does not signal peer
    /// loss and fires no loss notification.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[LINK] {} stopping", self.key);
        self.send_strategy.stop();
        if let Some(recv) = &self.receive_strategy {
            recv.stop();
        }
    }
}

impl fmt::Debug for DataLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLink")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("reservations", &self.reservations())
            .finish_non_exhaustive()
    }
}
