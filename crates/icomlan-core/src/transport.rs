//! Datagram transport trait.
//!
//! The [`DatagramTransport`] trait abstracts over the UDP association to a
//! radio. The control stream operates on a `DatagramTransport` rather than
//! directly on a socket, so that the handshake and the steady-state worker
//! can be tested deterministically with the mock transport from the
//! `icomlan-test-harness` crate.
//!
//! Unlike a byte stream, every `send()` is one datagram and every
//! `receive()` yields exactly one datagram. Packet boundaries carry meaning
//! in this protocol: replies are told apart by their length.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous datagram transport to a radio.
///
/// Implementations own one association with a fixed peer. Session ids,
/// sequence numbers, and retransmission are handled by the layers above.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to the radio.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one datagram into `buf`.
    ///
    /// Returns the datagram length. Waits up to `timeout`; returns
    /// [`Error::Timeout`](crate::error::Error::Timeout) if nothing arrives.
    /// Implementations must be cancel-safe: dropping the future before it
    /// completes must not lose a datagram.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the association.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the association is still open.
    fn is_connected(&self) -> bool;
}
