//! Session layer over a datagram transport.
//!
//! [`SessionChannel`] owns the transport and adds what every control packet
//! needs: the current session ids, the outer send sequence, and the
//! low-level keepalive (ping and idle packets) with round-trip latency
//! measurement. It also provides [`SessionChannel::expect`], the blocking
//! wait used during the handshake.

use std::time::Duration;

use tokio::time::{Instant, Interval};
use tracing::{debug, trace, warn};

use icomlan_core::error::{Error, Result};
use icomlan_core::transport::DatagramTransport;

use crate::dispatch::{self, ReplyKind};
use crate::packet::{self, SessionIds};

/// Receive buffer size; larger than any packet the radio sends.
pub const MAX_DATAGRAM: usize = 1500;

/// Ping reply sequence gaps at or above this are treated as a counter reset
/// rather than loss.
const LOST_PING_WINDOW: u16 = 1000;

#[derive(Debug)]
struct PingTracker {
    /// Sequence of the next ping request.
    seq: u16,
    /// Sequence the next ping reply should carry.
    expected_reply: u16,
    sent_at: Option<Instant>,
    latency: Duration,
}

/// The control session's view of the transport.
pub struct SessionChannel {
    transport: Box<dyn DatagramTransport>,
    ids: SessionIds,
    send_seq: u16,
    ping: PingTracker,
}

impl SessionChannel {
    /// Wrap `transport` for a session with the given local id. The remote
    /// id is zero until the radio announces it.
    pub fn new(transport: Box<dyn DatagramTransport>, local_id: u32) -> Self {
        SessionChannel {
            transport,
            ids: SessionIds {
                local: local_id,
                remote: 0,
            },
            send_seq: 1,
            ping: PingTracker {
                seq: 1,
                expected_reply: 1,
                sent_at: None,
                latency: Duration::ZERO,
            },
        }
    }

    pub fn ids(&self) -> SessionIds {
        self.ids
    }

    /// Replace the session ids. Applies to every packet sent afterwards.
    pub fn set_ids(&mut self, ids: SessionIds) {
        if ids != self.ids {
            debug!(
                local = format_args!("{:08x}", ids.local),
                remote = format_args!("{:08x}", ids.remote),
                "Session ids updated"
            );
        }
        self.ids = ids;
    }

    /// Smoothed round-trip latency of our pings.
    pub fn latency(&self) -> Duration {
        self.ping.latency
    }

    /// Take the next outer sequence number.
    pub fn next_seq(&mut self) -> u16 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!(bytes = data.len(), "Sending control packet");
        self.transport.send(data).await
    }

    /// Receive one datagram. Cancel-safe.
    pub async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.transport.receive(buf, timeout).await
    }

    pub async fn send_are_you_there(&mut self) -> Result<()> {
        let pkt = packet::are_you_there(self.ids.local);
        self.send(&pkt).await
    }

    pub async fn send_are_you_ready(&mut self) -> Result<()> {
        let pkt = packet::are_you_ready(self.ids);
        self.send(&pkt).await
    }

    pub async fn send_disconnect(&mut self) -> Result<()> {
        let pkt = packet::disconnect(self.ids);
        self.send(&pkt).await
    }

    pub async fn send_idle(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let pkt = packet::idle(seq, self.ids);
        self.send(&pkt).await
    }

    /// One keepalive round: a ping request followed by an idle packet.
    pub async fn send_keepalive(&mut self) -> Result<()> {
        self.send_ping().await?;
        self.send_idle().await
    }

    async fn send_ping(&mut self) -> Result<()> {
        let seq = self.ping.seq;
        self.ping.seq = seq.wrapping_add(1);
        self.ping.expected_reply = seq;
        self.ping.sent_at = Some(Instant::now());
        let pkt = packet::ping(seq, self.ids, false, rand::random());
        self.send(&pkt).await
    }

    /// Answer the radio's idle packet by echoing its sequence number.
    pub async fn echo_idle(&mut self, r: &[u8]) -> Result<()> {
        let Some(seq) = packet::sequence(r) else {
            return Ok(());
        };
        let pkt = packet::idle(seq, self.ids);
        self.send(&pkt).await
    }

    /// Handle a 21-byte ping.
    ///
    /// Requests from the radio are answered. Replies to our pings update the
    /// latency average, which is returned.
    pub async fn handle_ping(&mut self, r: &[u8]) -> Result<Option<Duration>> {
        let Some(ping) = packet::parse_ping(r) else {
            return Ok(None);
        };

        if !ping.is_reply {
            let pkt = packet::ping(ping.seq, self.ids, true, ping.token);
            self.send(&pkt).await?;
            return Ok(None);
        }

        if let Some(sent_at) = self.ping.sent_at {
            self.ping.latency = (self.ping.latency + sent_at.elapsed()) / 2;
        }
        let expected = self.ping.expected_reply;
        if ping.seq != expected {
            let missing = ping.seq.wrapping_sub(expected);
            if missing < LOST_PING_WINDOW {
                warn!(missing, got = ping.seq, expected, "Lost ping replies");
            }
        }
        Ok(Some(self.ping.latency))
    }

    /// Answer keepalive traffic that arrives outside the worker loop.
    async fn service(&mut self, r: &[u8]) -> Result<()> {
        match dispatch::classify(r) {
            Some(ReplyKind::RemoteIdle) => self.echo_idle(r).await,
            Some(ReplyKind::Ping) => self.handle_ping(r).await.map(|_| ()),
            _ => {
                trace!(len = r.len(), "Dropping packet while waiting for reply");
                Ok(())
            }
        }
    }

    /// Wait for a datagram of exactly `len` bytes starting with `prefix`.
    ///
    /// Pings and idle packets that arrive meanwhile are answered and, when
    /// `keepalive` is given, our own keepalive keeps running. Other packets
    /// are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no matching datagram arrives within
    /// `timeout`.
    pub async fn expect(
        &mut self,
        len: usize,
        prefix: &[u8],
        timeout: Duration,
        mut keepalive: Option<&mut Interval>,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }

            tokio::select! {
                received = self.transport.receive(&mut buf, remaining) => {
                    let n = received?;
                    let r = &buf[..n];
                    if n == len && r.starts_with(prefix) {
                        return Ok(r.to_vec());
                    }
                    self.service(r).await?;
                }
                _ = tick(&mut keepalive) => {
                    self.send_keepalive().await?;
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}

async fn tick(keepalive: &mut Option<&mut Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
