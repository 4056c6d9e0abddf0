// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Transport instance: one configured transport and everything it owns.
//!
//! A [`TransportInstance`] pairs the generic association machinery (endpoint
//! registration, link reservation, ack tracking) with one concrete plugin
//! implementing the [`Transport`] trait. The factory creates instances; the
//! discovery/federation collaborator drives them.
//!
//! # Locking
//!
//! Four independent locks, never nested in the other direction:
//!
//! - the reservation lock (`links`) serializes datalink lookup/creation and
//!   IS held across the plugin's `find_or_create_datalink`, so two
//!   concurrent requests for the same key cannot both create;
//! - the general lock (`endpoints`) guards endpoint registrations;
//! - the config slot has its own lock and is written at most once;
//! - the ack lock (`assoc`) guards pending/acked maps so the
//!   check-complete-and-notify sequence is atomic.
//!
//! Loss callbacks can arrive on a thread that already holds the reservation
//! lock (a synchronous connect failure), so [`TransportInstance::on_link_lost`]
//! only ever try-locks it; a lost entry that stays behind is evicted lazily
//! by the next reservation for its key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::association::{self, AssociationTable};
use crate::cleanup::CleanupHandle;
use crate::config::{CommonConfig, TransportConfig};
use crate::datalink::DataLink;
use crate::error::{Result, TransportError};
use crate::key::ConnectionKey;
use crate::reactor::{ReactorHandle, ReactorTask};
use crate::types::{
    fmt_repo_id, AssociationInfo, ConnectionInfo, LinkQos, ReaderHandle, RepoId, WriterHandle,
};

// ============================================================================
// Plugin contract
// ============================================================================

/// One concrete transport implementation (UDP, TCP, shared memory, ...).
///
/// Plugins supply connection establishment and wire I/O; the owning
/// [`TransportInstance`] supplies everything else. Methods taking `owner`
/// run under the instance's reservation lock and must not call back into
/// reservation paths.
pub trait Transport: Send + Sync + 'static {
    /// Numeric kind id carried in every [`crate::ConnectionInfo`] this
    /// plugin produces. One id per plugin type.
    fn kind(&self) -> u32;

    /// Apply the resolved configuration: bind sockets, size buffers.
    ///
    /// Called at most once, before any other operation that needs I/O.
    fn configure(&self, config: &Arc<dyn TransportConfig>) -> Result<()>;

    /// This instance's own addressing blob, for publication via discovery.
    fn connection_info(&self) -> Result<ConnectionInfo>;

    /// Extract the remote socket address from a peer's addressing blob.
    fn remote_address(&self, info: &ConnectionInfo) -> Result<SocketAddr>;

    /// Create the data link for `key`, or adopt an already-accepted
    /// connection matching it. Runs under the reservation lock.
    fn find_or_create_datalink(
        &self,
        owner: &Arc<TransportInstance>,
        key: &ConnectionKey,
        request: &AssociationInfo,
        qos: &LinkQos,
    ) -> Result<Arc<DataLink>>;

    /// Teardown hook, invoked exactly once per link by the cleanup task
    /// after the link's strategies have been stopped.
    fn release_datalink(&self, link: &DataLink);

    /// Whether associations through this plugin need explicit
    /// acknowledgment. Connectionless transports return false and their
    /// associations complete immediately.
    fn requires_acks(&self) -> bool {
        false
    }

    /// Whether `addr` is local to this host (affects key derivation).
    fn is_loopback(&self, addr: &SocketAddr) -> bool {
        addr.ip().is_loopback()
    }

    /// Release every plugin resource. Called once, from instance shutdown.
    fn shutdown(&self);
}

// ============================================================================
// Instance
// ============================================================================

#[derive(Default)]
struct Endpoints {
    publications: HashMap<RepoId, Arc<dyn WriterHandle>>,
    subscriptions: HashMap<RepoId, Arc<dyn ReaderHandle>>,
    interfaces: HashSet<u64>,
    next_interface: u64,
}

/// One configured transport: a plugin plus the association state around it.
pub struct TransportInstance {
    /// Factory-assigned instance id, used in logs and thread names
    id: String,

    /// The concrete transport implementation
    plugin: Box<dyn Transport>,

    /// General lock: registered endpoints and attached interfaces
    endpoints: Mutex<Endpoints>,

    /// Config slot, written at most once
    config: Mutex<Option<Arc<dyn TransportConfig>>>,

    /// Reservation lock: every live link, keyed for reuse
    links: Mutex<BTreeMap<ConnectionKey, Arc<DataLink>>>,

    /// Ack lock: pending associations and acknowledged pairs
    assoc: Mutex<AssociationTable>,

    /// Serializes the whole configure path, plugin call included
    setup: Mutex<()>,

    /// Lazily created reactor for connection-oriented plugins
    reactor: Mutex<Option<ReactorTask>>,

    /// Producer side of the factory's cleanup task
    cleanup: CleanupHandle,

    shut_down: AtomicBool,
}

impl TransportInstance {
    pub(crate) fn new(id: &str, plugin: Box<dyn Transport>, cleanup: CleanupHandle) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            plugin,
            endpoints: Mutex::new(Endpoints::default()),
            config: Mutex::new(None),
            links: Mutex::new(BTreeMap::new()),
            assoc: Mutex::new(AssociationTable::new()),
            setup: Mutex::new(()),
            reactor: Mutex::new(None),
            cleanup,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Factory-assigned instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind id of the underlying plugin.
    pub fn kind(&self) -> u32 {
        self.plugin.kind()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply the resolved configuration, exactly once.
    ///
    /// The setup lock covers the emptiness check, the plugin's own
    /// `configure`, and the slot write, so the plugin sees at most one
    /// `configure` call no matter how callers race. A failure at any step
    /// leaves the instance unconfigured and configurable again.
    pub fn configure(&self, config: Arc<dyn TransportConfig>) -> Result<()> {
        config.common().validate()?;

        let _setup = self.setup.lock();
        if self.config.lock().is_some() {
            return Err(TransportError::AlreadyConfigured);
        }

        self.plugin.configure(&config)?;
        *self.config.lock() = Some(config);
        log::info!("[CONFIG] {} configured", self.id);
        Ok(())
    }

    /// The applied configuration, if any.
    pub fn config(&self) -> Option<Arc<dyn TransportConfig>> {
        self.config.lock().clone()
    }

    /// Backpressure escalation bound links created by this instance use.
    pub fn output_pause_bound(&self) -> Option<Duration> {
        match self.config.lock().as_ref() {
            Some(config) => config.common().max_output_pause,
            None => CommonConfig::default().max_output_pause,
        }
    }

    /// This instance's addressing blob for publication via discovery.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        if self.config.lock().is_none() {
            return Err(TransportError::NotConfigured);
        }
        self.plugin.connection_info()
    }

    // ========================================================================
    // Endpoint registration
    // ========================================================================

    /// Register a local publication with its writer handle.
    pub fn register_publication(&self, id: RepoId, writer: Arc<dyn WriterHandle>) {
        self.endpoints.lock().publications.insert(id, writer);
        log::debug!("[ASSOC] {}: publication {} registered", self.id, fmt_repo_id(&id));
    }

    /// Register a local subscription with its reader handle.
    pub fn register_subscription(&self, id: RepoId, reader: Arc<dyn ReaderHandle>) {
        self.endpoints.lock().subscriptions.insert(id, reader);
        log::debug!(
            "[ASSOC] {}: subscription {} registered",
            self.id,
            fmt_repo_id(&id)
        );
    }

    /// Unregister a local publication and scrub its association state.
    pub fn unregister_publication(&self, id: &RepoId) {
        self.endpoints.lock().publications.remove(id);
        self.assoc.lock().remove_endpoint(id);
        log::debug!(
            "[ASSOC] {}: publication {} unregistered",
            self.id,
            fmt_repo_id(id)
        );
    }

    /// Unregister a local subscription and scrub its association state.
    pub fn unregister_subscription(&self, id: &RepoId) {
        self.endpoints.lock().subscriptions.remove(id);
        self.assoc.lock().remove_endpoint(id);
        log::debug!(
            "[ASSOC] {}: subscription {} unregistered",
            self.id,
            fmt_repo_id(id)
        );
    }

    /// Look up a registered publication's writer.
    pub fn find_publication(&self, id: &RepoId) -> Option<Arc<dyn WriterHandle>> {
        self.endpoints.lock().publications.get(id).cloned()
    }

    /// Look up a registered subscription's reader.
    pub fn find_subscription(&self, id: &RepoId) -> Option<Arc<dyn ReaderHandle>> {
        self.endpoints.lock().subscriptions.get(id).cloned()
    }

    /// Attach a network-interface tracker; returns its handle.
    ///
    /// The instance only tracks the handles. Whether an instance with
    /// attached interfaces may be torn down is the caller's decision,
    /// consulted via [`interface_count`](Self::interface_count); `shutdown`
    /// proceeds regardless and logs leftovers.
    pub fn attach_interface(&self) -> u64 {
        let mut endpoints = self.endpoints.lock();
        endpoints.next_interface += 1;
        let handle = endpoints.next_interface;
        endpoints.interfaces.insert(handle);
        handle
    }

    /// Detach a previously attached interface tracker.
    pub fn detach_interface(&self, handle: u64) {
        self.endpoints.lock().interfaces.remove(&handle);
    }

    /// Number of attached interface trackers.
    pub fn interface_count(&self) -> usize {
        self.endpoints.lock().interfaces.len()
    }

    // ========================================================================
    // Data link reservation
    // ========================================================================

    /// Reserve (finding or creating) the data link for one association
    /// request.
    ///
    /// Requests that map to the same [`ConnectionKey`] share one link; the
    /// reservation lock is held across the plugin's creation path, so
    /// exactly one of N concurrent requests creates. Every successful call
    /// must be balanced by one [`release_datalink`](Self::release_datalink).
    pub fn reserve_datalink(
        self: &Arc<Self>,
        request: &AssociationInfo,
        qos: &LinkQos,
    ) -> Result<Arc<DataLink>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        if request.remote_info.kind != self.plugin.kind() {
            return Err(TransportError::Format(format!(
                "connection info kind {:#x} does not match transport kind {:#x}",
                request.remote_info.kind,
                self.plugin.kind()
            )));
        }

        let remote = self.plugin.remote_address(&request.remote_info)?;
        let loopback = self.plugin.is_loopback(&remote);
        let key = ConnectionKey::new(remote, request.priority, request.direction, loopback);

        let mut evicted = None;
        let link = {
            let mut links = self.links.lock();

            // Shutdown drains the table under this lock; a reservation that
            // was in flight when the flag flipped must not repopulate it
            if self.shut_down.load(Ordering::Acquire) {
                return Err(TransportError::Shutdown);
            }

            if let Some(existing) = links.get(&key) {
                if existing.state().is_terminal() {
                    // Left behind by a loss callback that could not take
                    // this lock; replace it
                    evicted = links.remove(&key);
                } else {
                    existing.add_reservation();
                    log::debug!(
                        "[RESERVE] {}: reusing {} ({} reservations)",
                        self.id,
                        key,
                        existing.reservations()
                    );
                    return Ok(existing.clone());
                }
            }

            let link = self.plugin.find_or_create_datalink(self, &key, request, qos)?;
            link.add_reservation();
            links.insert(key, link.clone());
            log::debug!("[RESERVE] {}: created {}", self.id, key);
            link
        };

        if let Some(old) = evicted {
            self.cleanup.schedule(old, true);
        }
        Ok(link)
    }

    /// Return one reservation on a link.
    ///
    /// When the last reservation goes, the link leaves the table and is
    /// handed to the cleanup task. `release_pending` defers the teardown by
    /// one cleanup scheduling step, for callers that may still be inside a
    /// callback from the link.
    pub fn release_datalink(&self, link: &Arc<DataLink>, release_pending: bool) {
        let last = {
            let mut links = self.links.lock();
            let remaining = link.remove_reservation();
            if remaining == 0 {
                if let Some(entry) = links.get(link.key()) {
                    if Arc::ptr_eq(entry, link) {
                        links.remove(link.key());
                    }
                }
                true
            } else {
                log::trace!(
                    "[RESERVE] {}: released {} ({} reservations left)",
                    self.id,
                    link.key(),
                    remaining
                );
                false
            }
        };
        if last {
            self.cleanup.schedule(link.clone(), release_pending);
        }
    }

    /// Number of live links (test and introspection hook).
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    // ========================================================================
    // Association acknowledgment
    // ========================================================================

    /// Record a requested association as pending acknowledgment.
    ///
    /// For plugins that do not use acks the association completes
    /// immediately and the writer is notified from this call.
    pub fn add_pending_association(&self, local_id: RepoId, remote_id: RepoId) {
        let auto_ack = !self.plugin.requires_acks();
        {
            let mut assoc = self.assoc.lock();
            assoc.add_pending(local_id, remote_id);
            if auto_ack {
                assoc.mark_acked(local_id, remote_id);
            }
        }
        if auto_ack {
            self.check_fully_association(&local_id);
        }
    }

    /// Apply one received acknowledgment payload.
    ///
    /// Every pair is marked under one ack-lock acquisition; writers whose
    /// pending set completed are notified afterwards, outside the lock.
    /// Malformed payloads are rejected whole.
    pub fn demarshal_acks(&self, payload: &[u8]) -> Result<()> {
        let swap = self
            .config
            .lock()
            .as_ref()
            .map(|c| c.common().swap_bytes)
            .unwrap_or(false);
        let pairs = association::demarshal_acks(payload, swap)?;

        let mut completed: Vec<RepoId> = Vec::new();
        {
            let mut assoc = self.assoc.lock();
            for (pub_id, sub_id) in &pairs {
                assoc.mark_acked(*pub_id, *sub_id);
                if assoc.take_if_complete(pub_id) {
                    completed.push(*pub_id);
                }
            }
        }
        for pub_id in completed {
            self.notify_fully_associated(&pub_id);
        }
        Ok(())
    }

    /// Re-evaluate one publication's pending set and notify its writer if
    /// it just completed.
    pub fn check_fully_association(&self, pub_id: &RepoId) {
        let complete = self.assoc.lock().take_if_complete(pub_id);
        if complete {
            self.notify_fully_associated(pub_id);
        }
    }

    /// Whether `(pub_id, sub_id)` is acknowledged. Plugins without an ack
    /// protocol report every association as acknowledged.
    pub fn acked(&self, pub_id: &RepoId, sub_id: &RepoId) -> bool {
        if !self.plugin.requires_acks() {
            return true;
        }
        self.assoc.lock().is_acked(pub_id, sub_id)
    }

    /// Number of publications still waiting on acks (test hook).
    pub fn pending_association_count(&self) -> usize {
        self.assoc.lock().pending_count()
    }

    fn notify_fully_associated(&self, pub_id: &RepoId) {
        let writer = self.endpoints.lock().publications.get(pub_id).cloned();
        match writer {
            Some(writer) => writer.on_fully_associated(pub_id),
            None => log::debug!(
                "[ASSOC] {}: {} fully associated but unregistered",
                self.id,
                fmt_repo_id(pub_id)
            ),
        }
    }

    // ========================================================================
    // Reactor
    // ========================================================================

    /// Handle to this instance's reactor, spawning it on first use.
    ///
    /// Connectionless plugins never call this and never pay for the thread.
    pub fn reactor(&self) -> Result<ReactorHandle> {
        let mut slot = self.reactor.lock();
        if let Some(task) = slot.as_ref() {
            return Ok(task.handle());
        }
        let task = ReactorTask::spawn(&format!("pdds-reactor-{}", self.id))?;
        let handle = task.handle();
        *slot = Some(task);
        Ok(handle)
    }

    // ========================================================================
    // Loss and teardown
    // ========================================================================

    /// Loss notification from a link. May run on any thread, including one
    /// currently holding the reservation lock, hence the try-lock.
    pub(crate) fn on_link_lost(&self, link: Arc<DataLink>) {
        if let Some(mut links) = self.links.try_lock() {
            if let Some(entry) = links.get(link.key()) {
                if Arc::ptr_eq(entry, &link) {
                    links.remove(link.key());
                }
            }
        }
        // If the try-lock failed the entry stays behind as terminal and is
        // evicted by the next reservation for its key
        self.cleanup.schedule(link, true);
    }

    /// Remove a link from the table if it is still the registered entry.
    /// Called by the cleanup worker, which must never block on instance
    /// locks.
    pub(crate) fn forget_link(&self, link: &DataLink) {
        if let Some(mut links) = self.links.try_lock() {
            if let Some(entry) = links.get(link.key()) {
                if std::ptr::eq(Arc::as_ptr(entry), link) {
                    links.remove(link.key());
                }
            }
        }
    }

    /// Run the plugin teardown hook for a link (cleanup worker only; the
    /// exactly-once guarantee lives in `DataLink::mark_released`).
    pub(crate) fn plugin_release(&self, link: &DataLink) {
        self.plugin.release_datalink(link);
    }

    /// Stop everything this instance owns. Idempotent.
    ///
    /// Links still alive are stopped and handed to the cleanup task;
    /// outstanding reservations held by callers become inert handles.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[ASSOC] {}: shutting down", self.id);

        if let Some(mut reactor) = self.reactor.lock().take() {
            reactor.shutdown();
        }

        let drained: Vec<Arc<DataLink>> = {
            let mut links = self.links.lock();
            std::mem::take(&mut *links).into_values().collect()
        };
        for link in drained {
            link.stop();
            self.cleanup.schedule(link, false);
        }

        self.assoc.lock().clear();
        {
            let mut endpoints = self.endpoints.lock();
            endpoints.publications.clear();
            endpoints.subscriptions.clear();
            if !endpoints.interfaces.is_empty() {
                log::warn!(
                    "[ASSOC] {}: {} interface(s) still attached at shutdown",
                    self.id,
                    endpoints.interfaces.len()
                );
            }
            endpoints.interfaces.clear();
        }

        self.plugin.shutdown();
    }
}

impl fmt::Debug for TransportInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportInstance")
            .field("id", &self.id)
            .field("kind", &self.plugin.kind())
            .field("links", &self.link_count())
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for TransportInstance {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            log::warn!("[ASSOC] {}: dropped without shutdown", self.id);
        }
    }
}
