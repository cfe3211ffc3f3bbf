//! Channel-emulating router between the sender and the receiver.
//!
//! # Architecture
//!
//! ```text
//!   sender ──data──▶ forward socket ──ChannelEmulator──▶ receiver
//!   sender ◀──ACK─── backward socket ◀──AckRelay──────── receiver
//!                         ▲
//!                  ControlPlane (forced rules)
//! ```
//!
//! Each direction is one spawned task blocking on its own socket.  The two
//! paths share nothing except the learned sender address.  The forward
//! task's reorder buffer and the forced rules live in one
//! `parking_lot::Mutex` that the [`ControlPlane`] also locks; it is never
//! held across an `.await`.
//!
//! A datagram is processed to completion, delays and duplicates included,
//! before the next one is read, so datagrams that bypass the reorder
//! buffer leave in the order they arrived.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{self, ChannelEmulator, ForwardConfig, ForwardState, ForwardStats, Ingress};
use crate::control::ControlPlane;
use crate::packet;
use crate::relay::{self, AckRelay, BackwardConfig, BackwardStats, Relay};
use crate::rules::ForcedRules;
use crate::socket::{Socket, SocketError};

/// Upper bound on waiting for each path task to stop.
pub const JOIN_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed receive before polling the socket again.
const RECV_BACKOFF: Duration = Duration::from_millis(10);

/// Router endpoints, impairment knobs and initial forced rules.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Where the sender sends data.
    pub forward_listen: SocketAddr,
    /// Where the receiver sends ACKs.
    pub backward_listen: SocketAddr,
    /// Where data is forwarded.
    pub receiver: SocketAddr,
    /// Where ACKs are forwarded; learned from incoming data when `None`.
    pub sender: Option<SocketAddr>,
    pub forward: ForwardConfig,
    pub backward: BackwardConfig,
    pub rules: ForcedRules,
    /// Seed for both paths' RNGs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward_listen: SocketAddr::from(([127, 0, 0, 1], 9002)),
            backward_listen: SocketAddr::from(([127, 0, 0, 1], 9004)),
            receiver: SocketAddr::from(([127, 0, 0, 1], 9003)),
            sender: None,
            forward: ForwardConfig::default(),
            backward: BackwardConfig::default(),
            rules: ForcedRules::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("cannot bind {path} socket: {source}")]
    Bind {
        path: &'static str,
        #[source]
        source: SocketError,
    },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// A bound, not yet running router.
pub struct Router {
    config: RouterConfig,
    forward: Socket,
    backward: Socket,
    state: Arc<Mutex<ForwardState>>,
}

impl Router {
    /// Bind both listening sockets.  Nothing runs until [`Router::run`].
    pub async fn bind(config: RouterConfig) -> Result<Self, RouterError> {
        let forward = Socket::bind(config.forward_listen)
            .await
            .map_err(|source| RouterError::Bind {
                path: "forward",
                source,
            })?;
        let backward = Socket::bind(config.backward_listen)
            .await
            .map_err(|source| RouterError::Bind {
                path: "backward",
                source,
            })?;
        let state = Arc::new(Mutex::new(ForwardState::new(config.rules.clone())));
        Ok(Self {
            config,
            forward,
            backward,
            state,
        })
    }

    pub fn forward_addr(&self) -> SocketAddr {
        self.forward.local_addr
    }

    pub fn backward_addr(&self) -> SocketAddr {
        self.backward.local_addr
    }

    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(Arc::clone(&self.state))
    }

    /// Spawn the forward and backward tasks.
    pub fn run(self) -> RouterHandle {
        let Router {
            config,
            forward,
            backward,
            state,
        } = self;
        let forward_addr = forward.local_addr;
        let backward_addr = backward.local_addr;

        // Distinct streams per path, both derived from the one seed.
        let forward_seed = config.seed;
        let backward_seed = config.seed.map(|s| s.wrapping_add(1));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (route_tx, route_rx) = watch::channel(config.sender);
        let learn = config.sender.is_none().then_some(route_tx);
        let backward_stats = Arc::new(Mutex::new(BackwardStats::default()));

        log::info!(
            "[router] forward {forward_addr} → receiver {}; backward {backward_addr} → sender {}",
            config.receiver,
            config
                .sender
                .map_or_else(|| "(learned)".to_string(), |a| a.to_string())
        );
        if !config.rules.is_empty() {
            log::info!("[router] forced rules: {}", config.rules);
        }

        let forward_task = tokio::spawn(forward_loop(ForwardPath {
            socket: forward,
            receiver: config.receiver,
            channel: ChannelEmulator::new(config.forward, forward_seed),
            state: Arc::clone(&state),
            learn,
            shutdown: shutdown_rx.clone(),
        }));
        let backward_task = tokio::spawn(backward_loop(BackwardPath {
            socket: backward,
            relay: AckRelay::new(config.backward, backward_seed),
            route: route_rx,
            stats: Arc::clone(&backward_stats),
            shutdown: shutdown_rx,
        }));

        RouterHandle {
            state,
            backward_stats,
            forward_addr,
            backward_addr,
            shutdown,
            tasks: vec![("forward", forward_task), ("backward", backward_task)],
        }
    }
}

/// Handle onto a running router.
pub struct RouterHandle {
    state: Arc<Mutex<ForwardState>>,
    backward_stats: Arc<Mutex<BackwardStats>>,
    forward_addr: SocketAddr,
    backward_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RouterHandle {
    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(Arc::clone(&self.state))
    }

    pub fn forward_addr(&self) -> SocketAddr {
        self.forward_addr
    }

    pub fn backward_addr(&self) -> SocketAddr {
        self.backward_addr
    }

    pub fn forward_stats(&self) -> ForwardStats {
        self.state.lock().stats
    }

    pub fn backward_stats(&self) -> BackwardStats {
        *self.backward_stats.lock()
    }

    /// Datagrams currently parked in the reorder buffer.
    pub fn held(&self) -> usize {
        self.state.lock().reorder.len()
    }

    /// Stop both paths and wait (bounded) for them to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for (path, task) in std::mem::take(&mut self.tasks) {
            let abort = task.abort_handle();
            if tokio::time::timeout(JOIN_WAIT, task).await.is_err() {
                log::warn!("[router] {path} path did not stop within {JOIN_WAIT:?}");
                abort.abort();
            }
        }
        log::info!("[router] stopped");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Path tasks
// ---------------------------------------------------------------------------

struct ForwardPath {
    socket: Socket,
    receiver: SocketAddr,
    channel: ChannelEmulator,
    state: Arc<Mutex<ForwardState>>,
    /// Present when the sender address is learned rather than configured.
    learn: Option<watch::Sender<Option<SocketAddr>>>,
    shutdown: watch::Receiver<bool>,
}

struct BackwardPath {
    socket: Socket,
    relay: AckRelay,
    route: watch::Receiver<Option<SocketAddr>>,
    stats: Arc<Mutex<BackwardStats>>,
    shutdown: watch::Receiver<bool>,
}

/// Sleep for `delay` unless shutdown arrives first; `false` means stop.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn send(socket: &Socket, datagram: &[u8], dest: SocketAddr, arrow: &str) {
    if let Err(e) = socket.send_to(datagram, dest).await {
        log::debug!("[{arrow}] send to {dest} failed: {e}");
    }
}

async fn forward_loop(mut path: ForwardPath) {
    loop {
        let result = tokio::select! {
            _ = path.shutdown.changed() => break,
            result = path.socket.recv_from() => result,
        };
        let (datagram, from) = match result {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[router→] recv error: {e}");
                if !pause(RECV_BACKOFF, &mut path.shutdown).await {
                    break;
                }
                continue;
            }
        };

        if let Some(learn) = &path.learn {
            learn.send_if_modified(|addr| {
                if *addr == Some(from) {
                    return false;
                }
                log::info!("[router] sender address is {from}");
                *addr = Some(from);
                true
            });
        }

        let seq = packet::peek_seq(&datagram);
        let ingress = {
            let mut state = path.state.lock();
            path.channel.ingress(datagram, &mut state)
        };
        let Ingress::Pass(datagram) = ingress else {
            continue;
        };

        let delay = path.channel.delay();
        if !delay.is_zero() {
            path.state.lock().stats.delayed += 1;
            if !pause(delay, &mut path.shutdown).await {
                break;
            }
        }

        let staged = {
            let mut state = path.state.lock();
            path.channel.stage(datagram, &mut state)
        };
        if let Some(released) = staged.released {
            path.state.lock().stats.forwarded += 1;
            send(&path.socket, &released, path.receiver, "router→").await;
        }
        let Some(datagram) = staged.send_now else {
            continue;
        };

        path.state.lock().stats.forwarded += 1;
        send(&path.socket, &datagram, path.receiver, "router→").await;
        log::info!("[router→] SEND seq={}", channel::show_seq(seq));

        let duplicate = {
            let mut state = path.state.lock();
            path.channel.duplicate(seq, &mut state)
        };
        if let Some(gap) = duplicate {
            if !pause(gap, &mut path.shutdown).await {
                break;
            }
            send(&path.socket, &datagram, path.receiver, "router→").await;
            log::info!("[router→] DUP seq={}", channel::show_seq(seq));
        }
    }
    log::debug!("[router→] forward path stopped");
}

async fn backward_loop(mut path: BackwardPath) {
    loop {
        let result = tokio::select! {
            _ = path.shutdown.changed() => break,
            result = path.socket.recv_from() => result,
        };
        let datagram = match result {
            Ok((datagram, _)) => datagram,
            Err(e) => {
                log::debug!("[router←] recv error: {e}");
                if !pause(RECV_BACKOFF, &mut path.shutdown).await {
                    break;
                }
                continue;
            }
        };
        path.stats.lock().received += 1;

        let (delay, duplicate) = match path.relay.decide() {
            Relay::Drop => {
                log::info!("[router←] DROP ACK ({})", relay::preview(&datagram));
                path.stats.lock().dropped += 1;
                continue;
            }
            Relay::Forward { delay, duplicate } => (delay, duplicate),
        };

        if !delay.is_zero() {
            path.stats.lock().delayed += 1;
            if !pause(delay, &mut path.shutdown).await {
                break;
            }
        }

        let route = *path.route.borrow();
        let Some(dest) = route else {
            log::warn!("[router←] no sender address known yet; discarding ACK");
            path.stats.lock().unroutable += 1;
            continue;
        };

        path.stats.lock().forwarded += 1;
        send(&path.socket, &datagram, dest, "router←").await;
        log::info!("[router←] ACK → sender ({})", relay::preview(&datagram));

        if let Some(gap) = duplicate {
            if !pause(gap, &mut path.shutdown).await {
                break;
            }
            path.stats.lock().duplicated += 1;
            send(&path.socket, &datagram, dest, "router←").await;
            log::info!("[router←] DUP ACK");
        }
    }
    log::debug!("[router←] backward path stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::rules::ImpairmentKind;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn transparent_router(
        receiver: SocketAddr,
        sender: Option<SocketAddr>,
    ) -> RouterHandle {
        let config = RouterConfig {
            forward_listen: loopback(),
            backward_listen: loopback(),
            receiver,
            sender,
            forward: ForwardConfig::transparent(),
            backward: BackwardConfig::transparent(),
            rules: ForcedRules::default(),
            seed: Some(1),
        };
        Router::bind(config).await.unwrap().run()
    }

    async fn recv_within(sock: &Socket, ms: u64) -> Option<Vec<u8>> {
        tokio::time::timeout(Duration::from_millis(ms), sock.recv_from())
            .await
            .ok()
            .map(|r| r.unwrap().0)
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = Socket::bind(loopback()).await.unwrap();
        let config = RouterConfig {
            forward_listen: taken.local_addr,
            backward_listen: loopback(),
            ..RouterConfig::default()
        };
        let err = Router::bind(config).await.err().unwrap();
        assert!(matches!(err, RouterError::Bind { path: "forward", .. }));
    }

    #[tokio::test]
    async fn forwards_data_and_relays_acks_to_learned_sender() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let sender = Socket::bind(loopback()).await.unwrap();
        let router = transparent_router(receiver.local_addr, None).await;

        let data = packet::encode(0, b"hi");
        sender.send_to(&data, router.forward_addr()).await.unwrap();
        assert_eq!(recv_within(&receiver, 500).await, Some(data));

        receiver
            .send_to(br#"{"ack_num": 0}"#, router.backward_addr())
            .await
            .unwrap();
        assert_eq!(
            recv_within(&sender, 500).await,
            Some(br#"{"ack_num": 0}"#.to_vec())
        );

        assert_eq!(router.forward_stats().forwarded, 1);
        assert_eq!(router.backward_stats().forwarded, 1);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn acks_before_any_data_are_discarded() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let router = transparent_router(receiver.local_addr, None).await;

        receiver
            .send_to(br#"{"ack_num": -1}"#, router.backward_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.backward_stats().unroutable, 1);
        router.shutdown().await;
    }

    #[tokio::test]
    async fn control_changes_apply_to_the_next_datagram() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let sender = Socket::bind(loopback()).await.unwrap();
        let router = transparent_router(receiver.local_addr, Some(sender.local_addr)).await;
        let control = router.control();

        control.add(ImpairmentKind::Drop, "2").unwrap();
        sender
            .send_to(&packet::encode(2, b"x"), router.forward_addr())
            .await
            .unwrap();
        assert_eq!(recv_within(&receiver, 200).await, None);
        assert_eq!(router.forward_stats().dropped, 1);

        control.clear(None);
        let data = packet::encode(2, b"x");
        sender.send_to(&data, router.forward_addr()).await.unwrap();
        assert_eq!(recv_within(&receiver, 500).await, Some(data));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn forced_duplicate_delivers_twice() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let sender = Socket::bind(loopback()).await.unwrap();
        let router = transparent_router(receiver.local_addr, None).await;
        router
            .control()
            .set(ImpairmentKind::Duplicate, "5")
            .unwrap();

        let data = packet::encode(5, b"twice");
        sender.send_to(&data, router.forward_addr()).await.unwrap();
        assert_eq!(recv_within(&receiver, 500).await, Some(data.clone()));
        assert_eq!(recv_within(&receiver, 500).await, Some(data));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn initial_rules_come_from_config() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let mut rules = ForcedRules::default();
        rules.add(ImpairmentKind::Corrupt, &BTreeSet::from([1, 2]));
        let config = RouterConfig {
            forward_listen: loopback(),
            backward_listen: loopback(),
            receiver: receiver.local_addr,
            rules,
            ..RouterConfig::default()
        };
        let router = Router::bind(config).await.unwrap();
        assert!(router.control().list().contains(ImpairmentKind::Corrupt, 2));
        let handle = router.run();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_both_paths_promptly() {
        let receiver = Socket::bind(loopback()).await.unwrap();
        let router = transparent_router(receiver.local_addr, None).await;
        let forward = router.forward_addr();
        tokio::time::timeout(Duration::from_millis(500), router.shutdown())
            .await
            .expect("shutdown within bound");
        // The port is free again once the forward task has dropped its socket.
        Socket::bind(forward).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn receive_backoff_waits_unless_shutting_down() {
        let (tx, mut rx) = watch::channel(false);
        let start = tokio::time::Instant::now();
        assert!(pause(RECV_BACKOFF, &mut rx).await);
        assert!(start.elapsed() >= RECV_BACKOFF);

        tx.send(true).unwrap();
        let start = tokio::time::Instant::now();
        assert!(!pause(RECV_BACKOFF, &mut rx).await);
        assert!(start.elapsed() < RECV_BACKOFF);
    }

    #[tokio::test]
    async fn unreachable_receiver_does_not_stall_forwarding() {
        // Nothing listens on this port; sends may surface as receive errors.
        let closed = Socket::bind(loopback()).await.unwrap().local_addr;
        let router = transparent_router(closed, None).await;
        let sender = Socket::bind(loopback()).await.unwrap();
        for seq in 0..5u16 {
            let data = packet::encode(seq, b"x");
            sender.send_to(&data, router.forward_addr()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut forwarded = 0;
        for _ in 0..100 {
            forwarded = router.forward_stats().forwarded;
            if forwarded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(forwarded, 5);
        tokio::time::timeout(Duration::from_millis(500), router.shutdown())
            .await
            .expect("shutdown within bound");
    }
}
