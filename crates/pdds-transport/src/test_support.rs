// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Shared test doubles: a scriptable send strategy, a mock transport
//! plugin, and small helpers for building association requests.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cleanup::DataLinkCleanupTask;
use crate::config::{CommonConfig, TransportConfig};
use crate::datalink::{DataLink, OpenOutcome, SendOutcome, SendStrategy};
use crate::error::{Result, TransportError};
use crate::instance::{Transport, TransportInstance};
use crate::key::ConnectionKey;
use crate::types::{AssociationInfo, ConnectionInfo, Direction, LinkQos, RepoId, WriterHandle};

// ============================================================================
// Scriptable send strategy
// ============================================================================

/// Behavior script for a [`RecordingStrategy`].
#[derive(Clone, Copy, Default)]
pub struct StrategyScript {
    /// open() returns `Pending` instead of `Connected`
    pub open_pending: bool,
    /// open() fails
    pub open_fails: bool,
    /// send() fails
    pub send_fails: bool,
    /// Number of sends that report backpressure before sends succeed
    /// (`usize::MAX` = backpressure forever)
    pub backpressure_sends: usize,
}

#[derive(Default)]
struct StrategyState {
    opens: AtomicUsize,
    sends: AtomicUsize,
    stops: AtomicUsize,
    backpressure_left: AtomicUsize,
}

/// Shareable view of a strategy's call counters.
#[derive(Clone)]
pub struct StrategyCounters {
    state: Arc<StrategyState>,
}

impl StrategyCounters {
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

/// Send strategy that follows a [`StrategyScript`] and records every call.
pub struct RecordingStrategy {
    script: StrategyScript,
    state: Arc<StrategyState>,
}

impl RecordingStrategy {
    pub fn new(script: StrategyScript) -> Self {
        let state = Arc::new(StrategyState::default());
        state
            .backpressure_left
            .store(script.backpressure_sends, Ordering::SeqCst);
        Self { script, state }
    }

    pub fn counters(&self) -> StrategyCounters {
        StrategyCounters {
            state: self.state.clone(),
        }
    }
}

impl SendStrategy for RecordingStrategy {
    fn open(&self, _active: bool) -> Result<OpenOutcome> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.script.open_fails {
            return Err(TransportError::ConnectFailed("scripted open failure".into()));
        }
        if self.script.open_pending {
            Ok(OpenOutcome::Pending)
        } else {
            Ok(OpenOutcome::Connected)
        }
    }

    fn send(&self, _payload: &[u8]) -> Result<SendOutcome> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        if self.script.send_fails {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }
        let left = self.state.backpressure_left.load(Ordering::SeqCst);
        if left == usize::MAX {
            return Ok(SendOutcome::Backpressure);
        }
        if left > 0 {
            self.state.backpressure_left.fetch_sub(1, Ordering::SeqCst);
            return Ok(SendOutcome::Backpressure);
        }
        Ok(SendOutcome::Sent)
    }

    fn stop(&self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock transport plugin
// ============================================================================

#[derive(Default)]
struct MockCounters {
    created: AtomicUsize,
    configured: AtomicUsize,
    released: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// Shareable view of a [`MockTransport`]'s call counters; stays valid after
/// the transport moves into an instance.
#[derive(Clone)]
pub struct MockStats {
    counters: Arc<MockCounters>,
}

impl MockStats {
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn configured(&self) -> usize {
        self.counters.configured.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }
}

/// In-memory transport plugin. Addressing blobs carry the remote address as
/// a UTF-8 socket-address string; links get a default-scripted
/// [`RecordingStrategy`] and connect synchronously.
pub struct MockTransport {
    kind: u32,
    requires_acks: bool,
    create_delay: Option<Duration>,
    resolve_delay: Option<Duration>,
    configure_delay: Option<Duration>,
    counters: Arc<MockCounters>,
}

impl MockTransport {
    /// Connection-oriented mock: associations need acks.
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            requires_acks: true,
            create_delay: None,
            resolve_delay: None,
            configure_delay: None,
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Connectionless mock: associations complete immediately.
    pub fn connectionless(kind: u32) -> Self {
        Self {
            requires_acks: false,
            ..Self::new(kind)
        }
    }

    /// Sleep inside `find_or_create_datalink`, widening race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Sleep inside `remote_address`, stalling a reservation before it
    /// reaches the reservation lock.
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    /// Sleep inside `configure`, widening the configure race window.
    pub fn with_configure_delay(mut self, delay: Duration) -> Self {
        self.configure_delay = Some(delay);
        self
    }

    pub fn stats(&self) -> MockStats {
        MockStats {
            counters: self.counters.clone(),
        }
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> u32 {
        self.kind
    }

    fn configure(&self, _config: &Arc<dyn TransportConfig>) -> Result<()> {
        if let Some(delay) = self.configure_delay {
            std::thread::sleep(delay);
        }
        self.counters.configured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection_info(&self) -> Result<ConnectionInfo> {
        Ok(ConnectionInfo::new(self.kind, b"127.0.0.1:0".to_vec()))
    }

    fn remote_address(&self, info: &ConnectionInfo) -> Result<SocketAddr> {
        if let Some(delay) = self.resolve_delay {
            std::thread::sleep(delay);
        }
        let text = std::str::from_utf8(&info.data)
            .map_err(|e| TransportError::Format(format!("mock address not UTF-8: {}", e)))?;
        text.parse()
            .map_err(|e| TransportError::Format(format!("mock address '{}': {}", text, e)))
    }

    fn find_or_create_datalink(
        &self,
        owner: &Arc<TransportInstance>,
        key: &ConnectionKey,
        _request: &AssociationInfo,
        _qos: &LinkQos,
    ) -> Result<Arc<DataLink>> {
        if let Some(delay) = self.create_delay {
            std::thread::sleep(delay);
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let link = DataLink::new(
            *key,
            Arc::downgrade(owner),
            Box::new(RecordingStrategy::new(StrategyScript::default())),
            None,
            owner.output_pause_bound(),
        );
        link.connect(key.active)?;
        Ok(link)
    }

    fn release_datalink(&self, _link: &DataLink) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }

    fn requires_acks(&self) -> bool {
        self.requires_acks
    }

    fn shutdown(&self) {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Config and endpoint doubles
// ============================================================================

/// Minimal config type for the mock plugin.
#[derive(Default)]
pub struct MockConfig {
    pub common: CommonConfig,
}

impl TransportConfig for MockConfig {
    fn common(&self) -> &CommonConfig {
        &self.common
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Writer handle that counts fully-associated notifications.
#[derive(Default)]
pub struct CountingWriter {
    hits: AtomicUsize,
}

impl CountingWriter {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl WriterHandle for CountingWriter {
    fn on_fully_associated(&self, _pub_id: &RepoId) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Instance wired to a fresh cleanup worker. The caller shuts both down.
pub fn test_instance(transport: MockTransport) -> (Arc<TransportInstance>, DataLinkCleanupTask) {
    let task = DataLinkCleanupTask::spawn().expect("spawn cleanup worker");
    let instance = TransportInstance::new("mock0", Box::new(transport), task.handle());
    (instance, task)
}

/// Association request toward `addr`, with ids derived from the address so
/// distinct targets get distinct endpoints.
pub fn association_to(kind: u32, addr: &str, direction: Direction) -> AssociationInfo {
    let mut local_id: RepoId = [0xAA; 16];
    let mut remote_id: RepoId = [0xBB; 16];
    for (i, b) in addr.bytes().take(8).enumerate() {
        local_id[i] = b;
        remote_id[i] = b.wrapping_add(1);
    }
    AssociationInfo {
        local_id,
        remote_id,
        remote_info: ConnectionInfo::new(kind, addr.as_bytes().to_vec()),
        priority: 0,
        direction,
    }
}
