//! UDP transport for the remote LAN protocol.
//!
//! This module provides [`UdpTransport`], a connected UDP socket that
//! implements [`DatagramTransport`](icomlan_core::DatagramTransport). Each
//! remote LAN stream (control on 50001, serial on 50002, audio on 50003)
//! uses its own association, so one `UdpTransport` talks to exactly one
//! radio port.
//!
//! # Example
//!
//! ```no_run
//! use icomlan_transport::UdpTransport;
//! use icomlan_core::DatagramTransport;
//! use std::time::Duration;
//!
//! # async fn example() -> icomlan_core::Result<()> {
//! let mut transport = UdpTransport::connect_to("192.168.1.50", 50001).await?;
//!
//! // "Are you there" framing packet.
//! let mut pkt = [0u8; 16];
//! pkt[0] = 0x10;
//! pkt[4] = 0x03;
//! transport.send(&pkt).await?;
//!
//! let mut buf = [0u8; 1500];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! println!("Received {} bytes", n);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use icomlan_core::error::{Error, Result};
use icomlan_core::transport::DatagramTransport;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// UDP transport bound to one radio port.
///
/// Wraps a [`tokio::net::UdpSocket`] with error mapping consistent with the
/// rest of the icomlan transport layer.
#[derive(Debug)]
pub struct UdpTransport {
    /// The underlying UDP socket.
    socket: UdpSocket,
    /// The local address the socket is bound to.
    local_addr: SocketAddr,
    /// Cleared by `close()`.
    open: bool,
}

impl UdpTransport {
    /// Bind an unconnected socket to a local address such as `"0.0.0.0:0"`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Cannot bind UDP socket");
            Error::Io(e)
        })?;
        let local_addr = socket.local_addr()?;
        tracing::debug!(local_addr = %local_addr, "UDP socket bound");

        Ok(Self {
            socket,
            local_addr,
            open: true,
        })
    }

    /// Resolve `host`, bind an ephemeral local port, and connect to
    /// `host:port`.
    ///
    /// This is the usual way to open one of the radio's streams.
    pub async fn connect_to(host: &str, port: u16) -> Result<Self> {
        let target = format!("{host}:{port}");
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| Error::Transport(format!("cannot resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| Error::Transport(format!("no address for {target}")))?;

        let bind_addr = if addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let transport = Self::bind(bind_addr).await?;
        transport.connect(addr).await?;
        Ok(transport)
    }

    /// Get the local address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connect this socket to the radio address.
    ///
    /// UDP "connect" does not perform a handshake. It sets the default
    /// destination and makes the OS drop datagrams from other sources.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        tracing::debug!(local = %self.local_addr, radio = %addr, "Associating with radio");
        self.socket.connect(addr).await.map_err(|e| {
            tracing::error!(radio = %addr, error = %e, "Cannot associate UDP socket");
            Error::Io(e)
        })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        tracing::trace!(local = %self.local_addr, bytes = data.len(), "Sending datagram");

        self.socket.send(data).await.map_err(|e| {
            tracing::error!(local = %self.local_addr, error = %e, "Failed to send datagram");
            Error::Io(e)
        })?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        match tokio::time::timeout(timeout, self.socket.recv(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(local = %self.local_addr, bytes = n, "Received datagram");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::debug!(local = %self.local_addr, error = %e, "Receive failed");
                Err(Error::Io(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        tracing::debug!(local = %self.local_addr, "Closing UDP transport");
        self.open = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plain socket standing in for the radio.
    async fn radio() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[tokio::test]
    async fn bind_assigns_a_port() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr();
        assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn connected_send_and_receive() {
        let (radio, port) = radio().await;
        let mut client = UdpTransport::connect_to("127.0.0.1", port).await.unwrap();
        client.send(&[0x10, 0x00, 0x00, 0x00, 0x03, 0x00]).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, src) = radio.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x10, 0x00, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(src.port(), client.local_addr().port());

        radio.send_to(&[0x10, 0x00, 0x00, 0x00, 0x04], src).await.unwrap();
        let n = client.receive(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], &[0x10, 0x00, 0x00, 0x00, 0x04]);
    }

    #[tokio::test]
    async fn datagram_boundaries_are_preserved() {
        let (radio, port) = radio().await;
        let mut client = UdpTransport::connect_to("127.0.0.1", port).await.unwrap();

        client.send(&[0u8; 16]).await.unwrap();
        client.send(&[0u8; 21]).await.unwrap();

        let mut buf = [0u8; 256];
        let (first, _) = radio.recv_from(&mut buf).await.unwrap();
        let (second, _) = radio.recv_from(&mut buf).await.unwrap();
        assert_eq!((first, second), (16, 21));
    }

    #[tokio::test]
    async fn silent_radio_times_out() {
        let (_radio, port) = radio().await;
        let mut client = UdpTransport::connect_to("127.0.0.1", port).await.unwrap();

        let mut buf = [0u8; 64];
        let result = client.receive(&mut buf, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    }

    #[tokio::test]
    async fn closed_transport_rejects_io() {
        let (_radio, port) = radio().await;
        let mut client = UdpTransport::connect_to("127.0.0.1", port).await.unwrap();
        assert!(client.is_connected());

        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert!(matches!(client.send(&[0x00]).await, Err(Error::NotConnected)));

        let mut buf = [0u8; 8];
        let result = client.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
