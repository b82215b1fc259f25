//! The UDP socket the DHT speaks KRPC over.
//!
//! A thin wrapper around `tokio::net::UdpSocket` that turns OS-level send
//! failures into a signal the maintenance loop can act on, rather than
//! letting them bubble up as an opaque `io::Error` at every call site.
use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{instrument, warn};

/// A send failed in a way that indicates the local machine, not the remote
/// peer, is the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// The kernel send buffer is full (`ENOBUFS`/`EAGAIN`-class errors).
    BandwidthExhausted,
    /// The OS refused the send outright (`EPERM`/`EACCES`-class errors),
    /// usually a firewall or sandbox policy.
    PermissionDenied,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("local send backpressure: {0:?}")]
    Backpressure(Backpressure),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

fn classify(err: &io::Error) -> Option<Backpressure> {
    match err.kind() {
        io::ErrorKind::WouldBlock => Some(Backpressure::BandwidthExhausted),
        io::ErrorKind::PermissionDenied => Some(Backpressure::PermissionDenied),
        _ => match err.raw_os_error() {
            Some(libc_enobufs) if libc_enobufs == 105 => Some(Backpressure::BandwidthExhausted),
            _ => None,
        },
    }
}

/// The DHT's UDP endpoint. One socket serves every query, response, and
/// error KRPC packet for the whole process.
pub struct Transport {
    socket: UdpSocket,
}

impl Transport {
    #[instrument(level = "info")]
    pub async fn bind(address: std::net::Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((address, port)).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            std::net::SocketAddr::V4(addr) => Ok(addr),
            std::net::SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        }
    }

    /// Sends `bytes` to `target`. Backpressure conditions are surfaced as
    /// [`TransportError::Backpressure`] rather than a raw `io::Error` so
    /// callers can decide to slow down instead of treating it as fatal.
    #[instrument(skip(self, bytes), level = "trace")]
    pub async fn send_to(&self, bytes: &[u8], target: SocketAddrV4) -> Result<(), TransportError> {
        match self.socket.send_to(bytes, target).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(signal) = classify(&err) {
                    warn!(?signal, %target, "send backpressure");
                    Err(TransportError::Backpressure(signal))
                } else {
                    Err(TransportError::Io(err))
                }
            }
        }
    }

    /// Receives a single datagram. Returns the number of bytes read and the
    /// sender's address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        match addr {
            std::net::SocketAddr::V4(addr) => Ok((len, addr)),
            std::net::SocketAddr::V6(addr) => {
                warn!(%addr, "dropping datagram from an IPv6 sender");
                Ok((0, SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_round_trip_a_datagram() {
        let server = Transport::bind(std::net::Ipv4Addr::LOCALHOST, 0).await.unwrap();
        let client = Transport::bind(std::net::Ipv4Addr::LOCALHOST, 0).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        client.send_to(b"hello", server_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[test]
    fn classifies_would_block_as_bandwidth_exhausted() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(classify(&err), Some(Backpressure::BandwidthExhausted));
    }

    #[test]
    fn classifies_permission_denied() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify(&err), Some(Backpressure::PermissionDenied));
    }
}
