//! Mock audio backend that records playback and scripts capture.
//!
//! [`MockAudioBackend`] is `Clone`; every clone shares the same state, so a
//! test hands one clone to the control stream and keeps another to inspect
//! what was played and to feed capture data.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use icomlan_core::audio::{AudioBackend, AudioEndpoints, CaptureDevice, PlaybackDevice};
use icomlan_core::error::{Error, Result};

#[derive(Default)]
struct AudioState {
    opens: usize,
    device_names: Vec<String>,
    /// Bytes of every accepted playback write, one entry per call.
    writes: Vec<Vec<u8>>,
    /// Cap on bytes accepted per write, to exercise partial writes.
    write_limit: Option<usize>,
    /// Error returned by the next playback write.
    write_error: Option<String>,
    capture_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    playback_closed: bool,
    capture_closed: bool,
}

fn lock(state: &Mutex<AudioState>) -> MutexGuard<'_, AudioState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock [`AudioBackend`] for tests.
#[derive(Clone, Default)]
pub struct MockAudioBackend {
    state: Arc<Mutex<AudioState>>,
}

impl MockAudioBackend {
    /// Create a backend with no write limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `open()` was called.
    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Device names passed to `open()`, in order.
    pub fn device_names(&self) -> Vec<String> {
        lock(&self.state).device_names.clone()
    }

    /// The accepted bytes of each playback write, one entry per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// All played bytes concatenated.
    pub fn played(&self) -> Vec<u8> {
        lock(&self.state).writes.concat()
    }

    /// Accept at most `limit` bytes per playback write.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        lock(&self.state).write_limit = limit;
    }

    /// Make the next playback write fail with a transport error.
    pub fn fail_next_write(&self, message: &str) {
        lock(&self.state).write_error = Some(message.to_string());
    }

    /// Queue bytes to be returned by capture reads.
    ///
    /// Each call is delivered as its own chunk; a read returns at most one
    /// chunk. Ignored before `open()`.
    pub fn feed_capture(&self, data: &[u8]) {
        if let Some(tx) = lock(&self.state).capture_tx.as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// End the capture stream; pending and later reads see `StreamClosed`.
    pub fn end_capture(&self) {
        lock(&self.state).capture_tx = None;
    }

    /// Whether the playback endpoint was closed.
    pub fn playback_closed(&self) -> bool {
        lock(&self.state).playback_closed
    }

    /// Whether the capture endpoint was closed.
    pub fn capture_closed(&self) -> bool {
        lock(&self.state).capture_closed
    }
}

impl AudioBackend for MockAudioBackend {
    fn open(&mut self, device_name: &str) -> Result<AudioEndpoints> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            state.opens += 1;
            state.device_names.push(device_name.to_string());
            state.capture_tx = Some(tx);
            state.playback_closed = false;
            state.capture_closed = false;
        }
        Ok(AudioEndpoints {
            playback: Box::new(MockPlayback {
                state: Arc::clone(&self.state),
                closed: false,
            }),
            capture: Box::new(MockCapture {
                state: Arc::clone(&self.state),
                rx: Some(rx),
                leftover: Vec::new(),
            }),
        })
    }
}

struct MockPlayback {
    state: Arc<Mutex<AudioState>>,
    closed: bool,
}

#[async_trait]
impl PlaybackDevice for MockPlayback {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        let mut state = lock(&self.state);
        if let Some(message) = state.write_error.take() {
            return Err(Error::Transport(message));
        }
        let n = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.writes.push(data[..n].to_vec());
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        lock(&self.state).playback_closed = true;
        Ok(())
    }
}

struct MockCapture {
    state: Arc<Mutex<AudioState>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    leftover: Vec<u8>,
}

#[async_trait]
impl CaptureDevice for MockCapture {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.leftover.is_empty() {
            let rx = self.rx.as_mut().ok_or(Error::StreamClosed)?;
            self.leftover = rx.recv().await.ok_or(Error::StreamClosed)?;
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx = None;
        lock(&self.state).capture_closed = true;
        Ok(())
    }
}
