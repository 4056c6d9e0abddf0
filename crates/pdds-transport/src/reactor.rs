// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! Reactor task: a dedicated thread running a readiness-based I/O loop.
//!
//! Connection-oriented plugins need asynchronous accept/connect/read
//! notifications; connectionless plugins never touch this module. The
//! reactor is owned by the [`crate::TransportInstance`] that needs it and is
//! created lazily on first use.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                       ReactorTask                            |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - registered plugin sources (sockets, listeners)     |  |
//! |  |  - Waker (command channel from any thread)            |  |
//! |  +-------------------------------------------------------+  |
//! |                 |                          |                 |
//! |                 v                          v                 |
//! |       EventHandler::on_ready        timer callbacks          |
//! +-------------------------------------------------------------+
//! ```
//!
//! Handlers receive a [`ReactorHandle`] and interact with the reactor only
//! through its command channel -- they can register, deregister, and
//! schedule timers, but never re-enter the loop's own state. A connect or
//! accept therefore either completes synchronously, registers interest and
//! returns pending, or times out via a scheduled timer.

use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the command-channel waker.
const WAKER_TOKEN: Token = Token(0);

/// First token handed out to registered sources.
const SOURCE_TOKEN_START: usize = 1;

/// Poll timeout when no timer is due sooner.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events processed per poll.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Handler contract
// ============================================================================

/// Readiness callback for a registered source.
pub trait EventHandler: Send {
    /// The source became readable and/or writable.
    fn on_ready(&mut self, readable: bool, writable: bool, reactor: &ReactorHandle);
}

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce(&ReactorHandle) + Send>;

enum Command {
    Register {
        token: Token,
        source: Box<dyn Source + Send>,
        interests: Interest,
        handler: Box<dyn EventHandler>,
    },
    Deregister {
        token: Token,
    },
    Schedule {
        deadline: Instant,
        callback: TimerCallback,
    },
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle for interacting with a running reactor from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    next_token: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Register a source; its handler runs on the reactor thread.
    pub fn register(
        &self,
        source: Box<dyn Source + Send>,
        interests: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Register {
            token,
            source,
            interests,
            handler,
        })?;
        Ok(token)
    }

    /// Remove a source and drop its handler.
    pub fn deregister(&self, token: Token) -> io::Result<()> {
        self.send(Command::Deregister { token })
    }

    /// Run a one-shot callback on the reactor thread after `delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce(&ReactorHandle) + Send + 'static,
    ) -> io::Result<()> {
        self.send(Command::Schedule {
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        })
    }

    /// Whether the reactor thread is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> io::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor stopped"))?;
        self.waker.wake()
    }
}

// ============================================================================
// Task
// ============================================================================

/// Owner of the reactor thread.
pub struct ReactorTask {
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
}

impl ReactorTask {
    /// Spawn the reactor on a dedicated named thread.
    pub fn spawn(name: &str) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let handle = ReactorHandle {
            cmd_tx,
            waker,
            next_token: Arc::new(AtomicUsize::new(SOURCE_TOKEN_START)),
            running: running.clone(),
        };

        let mut reactor = Reactor {
            poll,
            cmd_rx,
            handle: handle.clone(),
            sources: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            running,
        };

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || reactor.run())?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle for registering sources and timers.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.cmd_tx.send(Command::Shutdown);
            let _ = self.handle.waker.wake();
            if thread.join().is_err() {
                log::error!("[REACTOR] thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ReactorTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback,
}

// Min-heap by deadline (BinaryHeap is a max-heap, so the order is reversed);
// seq keeps same-deadline timers in submission order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct Reactor {
    poll: Poll,
    cmd_rx: Receiver<Command>,
    handle: ReactorHandle,
    sources: HashMap<Token, (Box<dyn Source + Send>, Box<dyn EventHandler>)>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    running: Arc<AtomicBool>,
}

impl Reactor {
    fn run(&mut self) {
        log::debug!("[REACTOR] loop started");
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Acquire) {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("[REACTOR] poll error: {}", e);
                    break;
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.drain_commands(),
                    token => {
                        if let Some((_, handler)) = self.sources.get_mut(&token) {
                            handler.on_ready(
                                event.is_readable(),
                                event.is_writable(),
                                &self.handle,
                            );
                        }
                    }
                }
            }

            self.fire_due_timers();
        }

        // Deregister whatever is left so sockets close cleanly
        for (token, (mut source, _)) in self.sources.drain() {
            if let Err(e) = self.poll.registry().deregister(&mut source) {
                log::debug!("[REACTOR] deregister {:?} at shutdown: {}", token, e);
            }
        }
        self.running.store(false, Ordering::Release);
        log::debug!("[REACTOR] loop stopped");
    }

    fn next_timeout(&self) -> Duration {
        match self.timers.peek() {
            Some(entry) => entry
                .deadline
                .saturating_duration_since(Instant::now())
                .min(DEFAULT_POLL_TIMEOUT),
            None => DEFAULT_POLL_TIMEOUT,
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::Register {
                    token,
                    mut source,
                    interests,
                    handler,
                }) => {
                    match self.poll.registry().register(&mut source, token, interests) {
                        Ok(()) => {
                            self.sources.insert(token, (source, handler));
                            log::trace!("[REACTOR] registered source {:?}", token);
                        }
                        Err(e) => {
                            log::error!("[REACTOR] register {:?} failed: {}", token, e);
                        }
                    }
                }
                Ok(Command::Deregister { token }) => {
                    if let Some((mut source, _)) = self.sources.remove(&token) {
                        if let Err(e) = self.poll.registry().deregister(&mut source) {
                            log::debug!("[REACTOR] deregister {:?}: {}", token, e);
                        }
                    }
                }
                Ok(Command::Schedule { deadline, callback }) => {
                    self.timer_seq += 1;
                    self.timers.push(TimerEntry {
                        deadline,
                        seq: self.timer_seq,
                        callback,
                    });
                }
                Ok(Command::Shutdown) => {
                    self.running.store(false, Ordering::Release);
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.timers.pop() {
                (entry.callback)(&self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawn_and_shutdown() {
        let mut task = ReactorTask::spawn("pdds-reactor-test").unwrap();
        assert!(task.handle().is_running());
        task.shutdown();
        assert!(!task.handle().is_running());
        // Idempotent
        task.shutdown();
    }

    #[test]
    fn test_timer_fires_on_reactor_thread() {
        let mut task = ReactorTask::spawn("pdds-reactor-timer").unwrap();
        let (tx, rx) = mpsc::channel();

        task.handle()
            .schedule(Duration::from_millis(10), move |_| {
                let _ = tx.send(thread::current().name().map(String::from));
            })
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("pdds-reactor-timer"));
        task.shutdown();
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut task = ReactorTask::spawn("pdds-reactor-order").unwrap();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        task.handle()
            .schedule(Duration::from_millis(60), move |_| {
                let _ = tx2.send(2u8);
            })
            .unwrap();
        task.handle()
            .schedule(Duration::from_millis(10), move |_| {
                let _ = tx.send(1u8);
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        task.shutdown();
    }

    #[test]
    fn test_readable_source_dispatches_handler() {
        use mio::net::{TcpListener, TcpStream};

        struct AcceptOnce {
            listener_accepted: Arc<AtomicUsize>,
        }

        impl EventHandler for AcceptOnce {
            fn on_ready(&mut self, readable: bool, _writable: bool, _reactor: &ReactorHandle) {
                if readable {
                    self.listener_accepted.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let mut task = ReactorTask::spawn("pdds-reactor-io").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        task.handle()
            .register(
                Box::new(listener),
                Interest::READABLE,
                Box::new(AcceptOnce {
                    listener_accepted: accepted.clone(),
                }),
            )
            .unwrap();

        let _stream = TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while accepted.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted.load(Ordering::SeqCst) >= 1);
        task.shutdown();
    }

    #[test]
    fn test_handle_calls_fail_after_shutdown() {
        let mut task = ReactorTask::spawn("pdds-reactor-closed").unwrap();
        let handle = task.handle();
        task.shutdown();
        drop(task);
        assert!(handle.schedule(Duration::from_millis(1), |_| {}).is_err());
    }
}
