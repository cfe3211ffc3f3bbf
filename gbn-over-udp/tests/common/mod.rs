//! Test harness: a minimal in-order Go-Back-N receiver.
//!
//! It accepts the next expected packet when its checksum verifies, discards
//! everything else, and always answers with a cumulative ACK of the last
//! in-order sequence number (`-1` before anything arrived).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gbn_over_udp::ack::AckMessage;
use gbn_over_udp::packet;
use gbn_over_udp::socket::Socket;
use tokio::task::JoinHandle;

/// Bind a socket to an OS-assigned port on loopback.
pub async fn ephemeral() -> Socket {
    Socket::bind(loopback()).await.expect("bind failed")
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[derive(Default)]
struct Log {
    /// Sequence numbers of every datagram that arrived, in arrival order.
    arrivals: Vec<u16>,
    /// In-order accepted packets.
    accepted: Vec<(u16, Vec<u8>)>,
    corrupted: usize,
}

pub struct Receiver {
    pub addr: SocketAddr,
    log: Arc<Mutex<Log>>,
    task: JoinHandle<()>,
}

impl Receiver {
    /// Start receiving on `socket`, sending ACKs to `ack_to`.
    pub fn spawn(socket: Socket, ack_to: SocketAddr) -> Self {
        let addr = socket.local_addr;
        let log = Arc::new(Mutex::new(Log::default()));
        let task = tokio::spawn(receive(socket, ack_to, Arc::clone(&log)));
        Self { addr, log, task }
    }

    pub fn arrivals(&self) -> Vec<u16> {
        self.log.lock().unwrap().arrivals.clone()
    }

    pub fn accepted(&self) -> Vec<(u16, Vec<u8>)> {
        self.log.lock().unwrap().accepted.clone()
    }

    pub fn corrupted(&self) -> usize {
        self.log.lock().unwrap().corrupted
    }

    /// Concatenated payloads of everything accepted so far.
    pub fn message(&self) -> Vec<u8> {
        self.accepted().into_iter().flat_map(|(_, p)| p).collect()
    }

    /// Arrivals of sequence number `seq` so far.
    pub fn arrivals_of(&self, seq: u16) -> usize {
        self.arrivals().into_iter().filter(|s| *s == seq).count()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive(socket: Socket, ack_to: SocketAddr, log: Arc<Mutex<Log>>) {
    let mut expected: u64 = 0;
    loop {
        let Ok((datagram, _)) = socket.recv_from().await else {
            return;
        };
        let Some(seq) = packet::peek_seq(&datagram) else {
            continue;
        };
        {
            let mut log = log.lock().unwrap();
            log.arrivals.push(seq);
            if !packet::verify(&datagram) {
                log.corrupted += 1;
            } else if seq == expected as u16 {
                log.accepted.push((seq, datagram[packet::HEADER_LEN..].to_vec()));
                expected += 1;
            }
        }
        let ack_num = if expected == 0 {
            -1
        } else {
            i64::from((expected - 1) as u16)
        };
        let _ = socket
            .send_to(&AckMessage::new(ack_num).encode(), ack_to)
            .await;
    }
}

/// Poll `cond` every 10 ms until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
