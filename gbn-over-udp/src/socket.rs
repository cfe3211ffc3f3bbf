//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` shared by the
//! sender and both router paths.  It speaks raw datagrams: the router must be
//! able to forward bytes it cannot (or must not) interpret.  All protocol
//! logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
pub const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The local address could not be bound (typically already in use).
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| SocketError::Bind {
                addr: local_addr,
                source,
            })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send `datagram` as a single UDP datagram to `dest`.
    pub async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(datagram, dest).await?;
        Ok(())
    }

    /// Receive the next datagram.
    ///
    /// Returns `(bytes, sender_address)`.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let sock = Socket::bind(loopback()).await.unwrap();
        assert_ne!(sock.local_addr.port(), 0);
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let first = Socket::bind(loopback()).await.unwrap();
        let err = Socket::bind(first.local_addr).await.unwrap_err();
        assert!(matches!(err, SocketError::Bind { addr, .. } if addr == first.local_addr));
    }

    #[tokio::test]
    async fn datagrams_round_trip_over_loopback() {
        let a = Socket::bind(loopback()).await.unwrap();
        let b = Socket::bind(loopback()).await.unwrap();
        a.send_to(b"\x00\x01", b.local_addr).await.unwrap();
        let (bytes, from) = b.recv_from().await.unwrap();
        assert_eq!(bytes, b"\x00\x01");
        assert_eq!(from, a.local_addr);
    }
}
