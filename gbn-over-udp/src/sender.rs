//! Go-Back-N sender: window, timer and socket driven by concurrent tasks.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ send(data) / finish()        ┌──────────────────────┐
//!      ▼                               │  Mutex<Inner>        │
//!  window-filling loop ───── lock ───▶ │   SenderWindow       │
//!  ACK loop (task)     ───── lock ───▶ │   RetransmitTimer    │
//!  timer task (per arm)───── lock ───▶ │   TransferStats      │
//!                                      └──────────────────────┘
//!                 all three send through one Socket
//! ```
//!
//! Every read or mutation of `{base, next_seq, window, timer}` holds the one
//! `tokio::sync::Mutex`, including the socket sends that depend on them, so a
//! retransmission always works from a consistent `(base, next_seq)` snapshot.
//! The window-filling loop sleeps on a [`Notify`] that the ACK loop signals
//! whenever `base` advances, with a short poll as fallback.
//!
//! # Shutdown
//!
//! [`Sender::finish`] waits for the window to drain, sends the empty
//! sentinel packet, waits for its ACK, then cancels the timer, marks the
//! sender inactive and stops the ACK loop, joining it with a bounded wait.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::ack::AckMessage;
use crate::gbn_sender::{AckOutcome, SenderWindow, WindowError, WINDOW_SIZE};
use crate::packet::MAX_DATA_SIZE;
use crate::socket::{Socket, SocketError};
use crate::timer::{RetransmitTimer, TIMEOUT};

/// Fallback wake-up while waiting for window capacity.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for the ACK loop to stop.
const JOIN_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Configuration, errors, stats
// ---------------------------------------------------------------------------

/// Sender endpoints and protocol constants.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Local address; ACKs arrive here.
    pub bind: SocketAddr,
    /// Where data packets go (normally the router's forward-listen address).
    pub peer: SocketAddr,
    pub window_size: usize,
    pub max_chunk: usize,
    pub timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9001)),
            peer: SocketAddr::from(([127, 0, 0, 1], 9002)),
            window_size: WINDOW_SIZE,
            max_chunk: MAX_DATA_SIZE,
            timeout: TIMEOUT,
        }
    }
}

/// Errors surfaced by [`Sender`].
#[derive(Debug, Error)]
pub enum SenderError {
    /// The local socket could not be bound; nothing was started.
    #[error("sender bind failed: {0}")]
    Bind(#[source] SocketError),
    #[error("invalid sender configuration: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Window(#[from] WindowError),
    /// The sender was shut down.
    #[error("sender is no longer active")]
    Inactive,
}

/// Counters for one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// First transmissions, sentinel included.
    pub packets_sent: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub acks_received: u64,
    /// Stale, duplicate and out-of-window ACKs.
    pub acks_ignored: u64,
}

/// Point-in-time view of the window edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub base: u64,
    pub next_seq: u64,
    pub timer_armed: bool,
    /// Bumped by every arm and cancel of the retransmission timer.
    pub timer_generation: u64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner {
    window: SenderWindow,
    timer: RetransmitTimer,
    stats: TransferStats,
}

struct Shared {
    socket: Socket,
    peer: SocketAddr,
    state: Mutex<Inner>,
    /// Signalled whenever `base` advances.
    progress: Notify,
    active: AtomicBool,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// (Re)arm the retransmission timer.  Caller holds the state lock.
    fn arm_timer(self: &Arc<Self>, inner: &mut Inner) {
        let shared = Arc::downgrade(self);
        inner.timer.arm(move |generation| expire(shared, generation));
    }

    async fn on_ack(self: &Arc<Self>, ack_num: i64) {
        let mut inner = self.state.lock().await;
        inner.stats.acks_received += 1;

        match inner.window.on_ack(ack_num) {
            AckOutcome::Ignored => {
                inner.stats.acks_ignored += 1;
                log::debug!(
                    "[gbn] ← ACK ack={ack_num} ignored (base={})",
                    inner.window.base()
                );
            }
            AckOutcome::Drained { base } => {
                inner.timer.cancel();
                log::debug!("[gbn] ← ACK ack={ack_num} base={base}; timer stopped");
                self.progress.notify_one();
            }
            AckOutcome::Advanced { base } => {
                self.arm_timer(&mut inner);
                log::debug!(
                    "[gbn] ← ACK ack={ack_num} base={base} in_flight={}; timer restarted",
                    inner.window.in_flight()
                );
                self.progress.notify_one();
            }
        }
    }

    async fn on_timeout(self: &Arc<Self>, generation: u64) {
        let mut inner = self.state.lock().await;
        if !inner.timer.claim(generation) {
            log::trace!("[gbn] stale timer generation={generation} skipped");
            return;
        }
        if !self.is_active() {
            return;
        }

        // Go-Back-N: retransmit every unacked packet from base, in order.
        let resend = inner.window.on_timeout();
        log::debug!(
            "[gbn] timeout: retransmitting {} packet(s) [{}, {})",
            resend.len(),
            inner.window.base(),
            inner.window.next_seq()
        );
        for datagram in &resend {
            if let Err(e) = self.socket.send_to(datagram, self.peer).await {
                log::warn!("[gbn] retransmit failed: {e}");
            }
        }
        inner.stats.timeouts += 1;
        inner.stats.retransmissions += resend.len() as u64;
        self.arm_timer(&mut inner);
    }
}

/// Timer expiry entry point.  A dropped sender leaves nothing to do.
async fn expire(shared: Weak<Shared>, generation: u64) {
    if let Some(shared) = shared.upgrade() {
        shared.on_timeout(generation).await;
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// A Go-Back-N sender bound to a local UDP socket.
pub struct Sender {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    ack_loop: Option<JoinHandle<()>>,
}

impl Sender {
    /// Bind the local socket and start the ACK-receiving loop.
    ///
    /// Bind failure is reported before any task is spawned.
    pub async fn bind(config: SenderConfig) -> Result<Self, SenderError> {
        if config.window_size == 0 {
            return Err(SenderError::Config("window size must be at least 1"));
        }
        if config.max_chunk == 0 {
            return Err(SenderError::Config("max chunk size must be at least 1"));
        }

        let socket = Socket::bind(config.bind).await.map_err(SenderError::Bind)?;
        log::info!(
            "[gbn] bound {} → peer {} (window={} chunk={} timeout={:?})",
            socket.local_addr,
            config.peer,
            config.window_size,
            config.max_chunk,
            config.timeout
        );

        let shared = Arc::new(Shared {
            socket,
            peer: config.peer,
            state: Mutex::new(Inner {
                window: SenderWindow::new(config.window_size, config.max_chunk),
                timer: RetransmitTimer::new(config.timeout),
                stats: TransferStats::default(),
            }),
            progress: Notify::new(),
            active: AtomicBool::new(true),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ack_loop = tokio::spawn(ack_loop(Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            shutdown,
            ack_loop: Some(ack_loop),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    pub async fn stats(&self) -> TransferStats {
        self.shared.state.lock().await.stats
    }

    pub async fn snapshot(&self) -> WindowSnapshot {
        let inner = self.shared.state.lock().await;
        WindowSnapshot {
            base: inner.window.base(),
            next_seq: inner.window.next_seq(),
            timer_armed: inner.timer.is_armed(),
            timer_generation: inner.timer.generation(),
        }
    }

    /// Split `data` into chunks and push each through the window.
    ///
    /// Returns once every chunk has been admitted (transmitted at least
    /// once), not once it has been acknowledged.
    pub async fn send(&self, data: &[u8]) -> Result<(), SenderError> {
        let chunks = self.shared.state.lock().await.window.chunks(data);
        for chunk in chunks {
            self.admit(chunk).await?;
        }
        Ok(())
    }

    /// Wait for the window to drain, send the sentinel, wait for its ACK and
    /// tear down.
    pub async fn finish(mut self) -> Result<TransferStats, SenderError> {
        self.wait_until(SenderWindow::is_drained).await?;

        let sentinel = self.admit(&[]).await?;
        log::info!("[gbn] → FIN sentinel seq={sentinel}");
        self.wait_until(|w| w.base() > sentinel).await?;

        let stats = self.teardown().await;
        log::info!(
            "[gbn] transfer complete: {} sent, {} retransmitted, {} timeout(s)",
            stats.packets_sent,
            stats.retransmissions,
            stats.timeouts
        );
        Ok(stats)
    }

    /// Admit one chunk, waiting for window capacity as needed.
    async fn admit(&self, chunk: &[u8]) -> Result<u64, SenderError> {
        loop {
            if !self.shared.is_active() {
                return Err(SenderError::Inactive);
            }
            {
                let mut inner = self.shared.state.lock().await;
                if inner.window.can_admit() {
                    let admission = inner.window.admit(chunk)?;
                    // Armed before sending so a failed send is retried on timeout.
                    if admission.arm_timer {
                        self.shared.arm_timer(&mut inner);
                    }
                    inner.stats.packets_sent += 1;
                    match self
                        .shared
                        .socket
                        .send_to(&admission.datagram, self.shared.peer)
                        .await
                    {
                        Ok(()) => log::debug!(
                            "[gbn] → DATA seq={} len={} in_flight={}",
                            admission.seq,
                            chunk.len(),
                            inner.window.in_flight()
                        ),
                        Err(e) => log::warn!("[gbn] send seq={} failed: {e}", admission.seq),
                    }
                    return Ok(admission.seq);
                }
            }
            self.idle().await;
        }
    }

    async fn wait_until<F>(&self, done: F) -> Result<(), SenderError>
    where
        F: Fn(&SenderWindow) -> bool,
    {
        loop {
            if !self.shared.is_active() {
                return Err(SenderError::Inactive);
            }
            if done(&self.shared.state.lock().await.window) {
                return Ok(());
            }
            self.idle().await;
        }
    }

    async fn idle(&self) {
        let _ = tokio::time::timeout(IDLE_POLL, self.shared.progress.notified()).await;
    }

    async fn teardown(&mut self) -> TransferStats {
        self.shared.active.store(false, Ordering::Release);
        let stats = {
            let mut inner = self.shared.state.lock().await;
            inner.timer.cancel();
            inner.stats
        };

        let _ = self.shutdown.send(true);
        if let Some(handle) = self.ack_loop.take() {
            if tokio::time::timeout(JOIN_WAIT, handle).await.is_err() {
                log::warn!("[gbn] ACK loop did not stop within {JOIN_WAIT:?}");
            }
        }
        stats
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        if let Ok(mut inner) = self.shared.state.try_lock() {
            inner.timer.cancel();
        }
        if let Some(handle) = self.ack_loop.take() {
            handle.abort();
        }
    }
}

/// Bind, send all of `data`, and finish.
pub async fn transfer(config: SenderConfig, data: &[u8]) -> Result<TransferStats, SenderError> {
    let sender = Sender::bind(config).await?;
    sender.send(data).await?;
    sender.finish().await
}

// ---------------------------------------------------------------------------
// ACK loop
// ---------------------------------------------------------------------------

async fn ack_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = shared.socket.recv_from() => {
                let (bytes, from) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        if !shared.is_active() {
                            break;
                        }
                        log::debug!("[gbn] recv error: {e}");
                        tokio::time::sleep(IDLE_POLL).await;
                        continue;
                    }
                };
                match AckMessage::decode(&bytes) {
                    Ok(ack) => shared.on_ack(ack.ack_num).await,
                    Err(e) => log::debug!("[gbn] ← from {from}: discarding {e}"),
                }
            }
        }
    }
    log::debug!("[gbn] ACK loop stopped");
}
