//! Mock datagram transport for deterministic testing of the control stream.
//!
//! [`mock_pair`] returns a [`MockDatagramTransport`], which is handed to the
//! code under test, and a [`MockRemote`], which the test keeps to play the
//! radio. The remote can:
//!
//! - install a *responder* that answers each sent datagram synchronously,
//! - push unsolicited datagrams (idle packets, pings, grants),
//! - inspect every datagram sent so far.
//!
//! Replies are queued, so `receive()` on the transport side behaves like a
//! real socket: cancel-safe, one datagram per call, and `Timeout` when
//! nothing arrives in time. With tokio's paused clock the timeout elapses
//! instantly once every task is idle.
//!
//! # Example
//!
//! ```
//! use icomlan_test_harness::mock_pair;
//!
//! let (transport, remote) = mock_pair();
//! // Answer every "are you there" with "I am here".
//! remote.set_responder(|pkt| {
//!     if pkt.len() == 16 && pkt[4] == 0x03 {
//!         let mut reply = pkt.to_vec();
//!         reply[4] = 0x04;
//!         vec![reply]
//!     } else {
//!         Vec::new()
//!     }
//! });
//! # drop(transport);
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use icomlan_core::error::{Error, Result};
use icomlan_core::transport::DatagramTransport;

/// Callback that answers one sent datagram with zero or more replies.
type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Shared {
    /// Every datagram passed to `send()`, in order.
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    closed: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // A panicking test thread must not hide the log from the others.
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create a connected mock transport and the remote end that controls it.
pub fn mock_pair() -> (MockDatagramTransport, MockRemote) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = MockDatagramTransport {
        shared: Arc::clone(&shared),
        inbound: rx,
        loopback: tx.clone(),
        connected: true,
    };
    let remote = MockRemote { shared, inbound: tx };
    (transport, remote)
}

/// A mock [`DatagramTransport`] driven by a [`MockRemote`].
pub struct MockDatagramTransport {
    shared: Arc<Mutex<Shared>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Used to queue responder replies.
    loopback: mpsc::UnboundedSender<Vec<u8>>,
    connected: bool,
}

#[async_trait]
impl DatagramTransport for MockDatagramTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let replies = {
            let mut shared = lock(&self.shared);
            shared.sent.push(data.to_vec());
            match shared.responder.as_mut() {
                Some(responder) => responder(data),
                None => Vec::new(),
            }
        };
        for reply in replies {
            // The receiver lives in `self`, so this cannot fail.
            let _ = self.loopback.send(reply);
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(datagram)) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            Ok(None) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        lock(&self.shared).closed = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// The test's handle on the radio side of a [`MockDatagramTransport`].
#[derive(Clone)]
pub struct MockRemote {
    shared: Arc<Mutex<Shared>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockRemote {
    /// Install a responder called with every datagram sent from now on.
    ///
    /// Replaces any previous responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        lock(&self.shared).responder = Some(Box::new(responder));
    }

    /// Remove the responder; sent datagrams are only recorded.
    pub fn clear_responder(&self) {
        lock(&self.shared).responder = None;
    }

    /// Deliver an unsolicited datagram to the transport.
    pub fn push(&self, datagram: &[u8]) {
        let _ = self.inbound.send(datagram.to_vec());
    }

    /// Every datagram sent through the transport so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).sent.clone()
    }

    /// Sent datagrams for which `predicate` returns true.
    pub fn sent_matching(&self, predicate: impl Fn(&[u8]) -> bool) -> Vec<Vec<u8>> {
        lock(&self.shared)
            .sent
            .iter()
            .filter(|pkt| predicate(pkt))
            .cloned()
            .collect()
    }

    /// Forget the datagrams recorded so far.
    pub fn clear_sent(&self) {
        lock(&self.shared).sent.clear();
    }

    /// Whether `close()` has been called on the transport.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }
}
