// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Deferred data-link destruction.
//!
//! A link that discovers its own uselessness (for example inside a receive
//! callback) cannot safely destroy itself while still on the call stack that
//! owns it, and a caller holding the reservation lock must never recurse
//! into plugin teardown. [`DataLinkCleanupTask`] decouples the two: loss and
//! zero-refcount events enqueue the link on a bounded work queue, and one
//! worker thread performs the actual teardown outside every caller lock.
//!
//! A request flagged `release_pending` is re-queued once before it is
//! finalized, so destruction happens at least one scheduling step after the
//! callback that triggered it has unwound.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};

use crate::datalink::DataLink;

/// Default work-queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

enum Command {
    /// Finish destroying this now-unreferenced link
    Reclaim {
        link: Arc<DataLink>,
        /// Re-queue once before finalizing
        deferred: bool,
    },
    /// Drain the queue and exit
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable producer side of the cleanup queue.
///
/// Held by every [`crate::TransportInstance`] the owning factory creates.
#[derive(Clone)]
pub struct CleanupHandle {
    tx: Sender<Command>,
}

impl CleanupHandle {
    /// Hand a link to the worker for destruction.
    ///
    /// `release_pending` defers the teardown by one scheduling step, for
    /// callers that may still be inside a callback from the link. If the
    /// worker is already gone (process teardown) the link is finalized
    /// inline.
    pub fn schedule(&self, link: Arc<DataLink>, release_pending: bool) {
        let key = *link.key();
        if self
            .tx
            .send(Command::Reclaim {
                link: link.clone(),
                deferred: release_pending,
            })
            .is_err()
        {
            log::warn!("[CLEANUP] worker gone; finalizing {} inline", key);
            finalize(link);
        } else {
            log::trace!("[CLEANUP] scheduled {} (deferred={})", key, release_pending);
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Background worker performing deferred [`DataLink`] destruction.
pub struct DataLinkCleanupTask {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl DataLinkCleanupTask {
    /// Spawn the worker with the default queue capacity.
    pub fn spawn() -> io::Result<Self> {
        Self::spawn_with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Spawn the worker with an explicit queue capacity.
    pub fn spawn_with_capacity(capacity: usize) -> io::Result<Self> {
        let (tx, rx) = bounded(capacity);
        let worker_tx = tx.clone();
        let thread = thread::Builder::new()
            .name("pdds-link-cleanup".to_string())
            .spawn(move || run(rx, worker_tx))?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Producer handle for instances.
    pub fn handle(&self) -> CleanupHandle {
        CleanupHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drain outstanding requests and stop the worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(Command::Shutdown);
            if thread.join().is_err() {
                log::error!("[CLEANUP] worker panicked during shutdown");
            }
        }
    }
}

impl Drop for DataLinkCleanupTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<Command>, requeue: Sender<Command>) {
    log::debug!("[CLEANUP] worker started");
    while let Ok(command) = rx.recv() {
        match command {
            Command::Reclaim { link, deferred } => {
                if deferred {
                    // One scheduling step: behind everything already queued
                    if requeue
                        .try_send(Command::Reclaim {
                            link: link.clone(),
                            deferred: false,
                        })
                        .is_err()
                    {
                        finalize(link);
                    }
                } else {
                    finalize(link);
                }
            }
            Command::Shutdown => {
                // Drain whatever is still queued, no further deferral
                loop {
                    match rx.try_recv() {
                        Ok(Command::Reclaim { link, .. }) => finalize(link),
                        Ok(Command::Shutdown) => {}
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                break;
            }
        }
    }
    log::debug!("[CLEANUP] worker stopped");
}

/// Tear a link down: stop strategies, remove it from the owner's table if
/// still present, and run the plugin teardown hook exactly once.
fn finalize(link: Arc<DataLink>) {
    log::debug!("[CLEANUP] finalizing {}", link.key());
    link.stop();
    if let Some(owner) = link.owner() {
        owner.forget_link(&link);
        if link.mark_released() {
            owner.plugin_release(&link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_instance, MockTransport};
    use crate::types::Direction;
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_scheduled_link_gets_finalized() {
        let transport = MockTransport::new(1);
        let stats = transport.stats();
        let (instance, mut task) = test_instance(transport);

        let link = instance
            .reserve_datalink(
                &crate::test_support::association_to(1, "127.0.0.1:9001", Direction::Active),
                &crate::LinkQos::default(),
            )
            .unwrap();

        instance.release_datalink(&link, false);
        assert!(wait_until(1000, || stats.released() == 1));

        task.shutdown();
    }

    #[test]
    fn test_deferred_release_still_finalizes_once() {
        let transport = MockTransport::new(1);
        let stats = transport.stats();
        let (instance, mut task) = test_instance(transport);

        let link = instance
            .reserve_datalink(
                &crate::test_support::association_to(1, "127.0.0.1:9002", Direction::Active),
                &crate::LinkQos::default(),
            )
            .unwrap();

        instance.release_datalink(&link, true);
        assert!(wait_until(1000, || stats.released() == 1));
        // No double teardown
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.released(), 1);

        task.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let transport = MockTransport::new(1);
        let stats = transport.stats();
        let (instance, mut task) = test_instance(transport);

        let mut links = Vec::new();
        for port in 9100..9110u16 {
            links.push(
                instance
                    .reserve_datalink(
                        &crate::test_support::association_to(
                            1,
                            &format!("127.0.0.1:{}", port),
                            Direction::Active,
                        ),
                        &crate::LinkQos::default(),
                    )
                    .unwrap(),
            );
        }
        for link in &links {
            instance.release_datalink(link, true);
        }

        task.shutdown();
        assert_eq!(stats.released(), links.len());
    }
}
