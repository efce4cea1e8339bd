//! Audio pipeline between the network audio queues and the local devices.
//!
//! Three tasks run once the radio has granted the audio stream:
//!
//! - **feeder**: appends received network payloads to the play buffer and
//!   wakes the playback pump;
//! - **playback pump**: plays the buffer in whole 20 ms quanta;
//! - **capture pump**: reads the capture device and emits whole quanta on
//!   the outbound queue.
//!
//! The feeder and the playback pump share only the play buffer, whose lock
//! is held for a single append or dequeue. The wake signal is a
//! [`Notify`], which stores at most one pending permit, so any number of
//! appends between two drains cost a single wake-up.
//!
//! A device error other than [`Error::StreamClosed`] is reported as the
//! session's fatal error and stops all three tasks.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use icomlan_core::audio::{AudioEndpoints, CaptureDevice, PlaybackDevice, QUANTUM_BYTES};
use icomlan_core::error::{Error, Result};

use crate::control::FatalReporter;

/// Growth policy of the play buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayBufferMode {
    /// Keep everything; latency grows if the device plays slower than the
    /// radio sends.
    #[default]
    Unbounded,
    /// Keep at most `max_quanta` whole quanta, dropping the oldest.
    DropOldest { max_quanta: usize },
}

/// Byte accumulator for received audio.
#[derive(Debug)]
pub struct PlayBuffer {
    data: BytesMut,
    mode: PlayBufferMode,
}

impl PlayBuffer {
    pub fn new(mode: PlayBufferMode) -> Self {
        PlayBuffer {
            data: BytesMut::with_capacity(QUANTUM_BYTES * 8),
            mode,
        }
    }

    /// Append a payload. Returns the number of quanta dropped to respect
    /// the buffer mode.
    pub fn append(&mut self, payload: &[u8]) -> usize {
        self.data.extend_from_slice(payload);
        match self.mode {
            PlayBufferMode::Unbounded => 0,
            PlayBufferMode::DropOldest { max_quanta } => {
                let limit = max_quanta.max(1) * QUANTUM_BYTES;
                if self.data.len() <= limit {
                    return 0;
                }
                let excess = (self.data.len() - limit).div_ceil(QUANTUM_BYTES);
                let drop_bytes = (excess * QUANTUM_BYTES).min(self.data.len());
                let _ = self.data.split_to(drop_bytes);
                excess
            }
        }
    }

    /// Remove one whole quantum, if present.
    pub fn pop_quantum(&mut self) -> Option<Bytes> {
        (self.data.len() >= QUANTUM_BYTES).then(|| self.data.split_to(QUANTUM_BYTES).freeze())
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

type SharedBuffer = Arc<Mutex<PlayBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, PlayBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Network side of the pipeline.
pub struct AudioQueues {
    /// Received audio payloads to play.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Captured quanta to transmit.
    pub outbound: mpsc::Sender<Bytes>,
}

/// Running audio pipeline.
pub struct AudioPipeline {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AudioPipeline {
    /// Spawn the feeder and both pumps.
    pub(crate) fn start(
        endpoints: AudioEndpoints,
        queues: AudioQueues,
        mode: PlayBufferMode,
        fatal: FatalReporter,
    ) -> Self {
        let cancel = CancellationToken::new();
        let buffer: SharedBuffer = Arc::new(Mutex::new(PlayBuffer::new(mode)));
        let wake = Arc::new(Notify::new());

        let tasks = vec![
            tokio::spawn(feeder(
                queues.inbound,
                Arc::clone(&buffer),
                Arc::clone(&wake),
                cancel.clone(),
            )),
            tokio::spawn(playback_pump(
                endpoints.playback,
                buffer,
                wake,
                fatal.clone(),
                cancel.clone(),
            )),
            tokio::spawn(capture_pump(
                endpoints.capture,
                queues.outbound,
                fatal,
                cancel.clone(),
            )),
        ];
        debug!("Audio pipeline started");

        AudioPipeline { cancel, tasks }
    }

    /// Stop all tasks and close both devices.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!("Audio pipeline stopped");
    }
}

async fn feeder(
    mut inbound: mpsc::Receiver<Bytes>,
    buffer: SharedBuffer,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = inbound.recv() => payload,
        };
        let Some(payload) = payload else {
            debug!("Audio input queue closed");
            break;
        };

        let dropped = lock(&buffer).append(&payload);
        if dropped > 0 {
            warn!(dropped, "Play buffer full, dropped oldest audio");
        }
        wake.notify_one();
    }
}

/// A device failed outside teardown: report it and stop the whole pipeline.
fn device_failed(fatal: &FatalReporter, cancel: &CancellationToken, e: Error) {
    error!(error = %e, "Audio device failed");
    fatal.report(e);
    cancel.cancel();
}

/// Write all of `quantum`, retrying partial writes.
async fn write_all(device: &mut dyn PlaybackDevice, quantum: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < quantum.len() {
        let written = device.write(&quantum[offset..]).await?;
        if written == 0 {
            // Device accepted nothing; let other tasks run before retrying.
            tokio::task::yield_now().await;
        }
        offset += written;
    }
    Ok(())
}

async fn playback_pump(
    mut device: Box<dyn PlaybackDevice>,
    buffer: SharedBuffer,
    wake: Arc<Notify>,
    fatal: FatalReporter,
    cancel: CancellationToken,
) {
    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
        }

        loop {
            let Some(quantum) = lock(&buffer).pop_quantum() else {
                break;
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                result = write_all(&mut *device, &quantum) => result,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_closed() => {
                    debug!("Playback device closed");
                    break 'outer;
                }
                Err(e) => {
                    device_failed(&fatal, &cancel, e);
                    break 'outer;
                }
            }
        }
    }

    if let Err(e) = device.close().await {
        debug!(error = %e, "Closing playback device");
    }
}

async fn capture_pump(
    mut device: Box<dyn CaptureDevice>,
    outbound: mpsc::Sender<Bytes>,
    fatal: FatalReporter,
    cancel: CancellationToken,
) {
    let mut chunk = vec![0u8; QUANTUM_BYTES];
    let mut accumulator = BytesMut::with_capacity(QUANTUM_BYTES * 2);

    'outer: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if e.is_closed() => {
                debug!("Capture device closed");
                break;
            }
            Err(e) => {
                device_failed(&fatal, &cancel, e);
                break;
            }
        };
        accumulator.extend_from_slice(&chunk[..n]);

        // Only whole quanta leave the accumulator.
        while accumulator.len() >= QUANTUM_BYTES {
            let quantum = accumulator.split_to(QUANTUM_BYTES).freeze();
            let sent = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                sent = outbound.send(quantum) => sent,
            };
            if sent.is_err() {
                debug!("Audio output queue closed");
                break 'outer;
            }
        }
    }

    if let Err(e) = device.close().await {
        debug!(error = %e, "Closing capture device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icomlan_core::AudioBackend;
    use icomlan_test_harness::MockAudioBackend;
    use std::time::Duration;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    struct Harness {
        backend: MockAudioBackend,
        inbound: mpsc::Sender<Bytes>,
        outbound: mpsc::Receiver<Bytes>,
        fatal: mpsc::Receiver<Error>,
        pipeline: AudioPipeline,
    }

    fn start(mode: PlayBufferMode) -> Harness {
        let backend = MockAudioBackend::new();
        let endpoints = backend.clone().open("IC-705").unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (fatal, fatal_rx) = FatalReporter::new();
        let pipeline = AudioPipeline::start(
            endpoints,
            AudioQueues {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            mode,
            fatal,
        );
        Harness {
            backend,
            inbound: inbound_tx,
            outbound: outbound_rx,
            fatal: fatal_rx,
            pipeline,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn pop_quantum_needs_a_full_quantum() {
        let mut buffer = PlayBuffer::new(PlayBufferMode::Unbounded);
        buffer.append(&[0u8; QUANTUM_BYTES - 1]);
        assert!(buffer.pop_quantum().is_none());
        buffer.append(&[0u8; 2]);
        assert_eq!(buffer.pop_quantum().unwrap().len(), QUANTUM_BYTES);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn drop_oldest_keeps_whole_quanta() {
        let mut buffer = PlayBuffer::new(PlayBufferMode::DropOldest { max_quanta: 2 });
        let data = pattern(QUANTUM_BYTES * 3 + 100, 1);
        let dropped = buffer.append(&data);

        assert_eq!(dropped, 2);
        assert_eq!(buffer.len(), QUANTUM_BYTES + 100);
        let first = buffer.pop_quantum().unwrap();
        assert_eq!(&first[..], &data[QUANTUM_BYTES * 2..QUANTUM_BYTES * 3]);
    }

    #[test]
    fn unbounded_never_drops() {
        let mut buffer = PlayBuffer::new(PlayBufferMode::Unbounded);
        assert_eq!(buffer.append(&vec![0u8; QUANTUM_BYTES * 100]), 0);
        assert_eq!(buffer.len(), QUANTUM_BYTES * 100);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_writes_whole_quanta_in_order() {
        let h = start(PlayBufferMode::Unbounded);
        // Odd payload sizes so quanta straddle payload boundaries.
        let stream = pattern(QUANTUM_BYTES * 5, 3);
        for piece in stream.chunks(1000) {
            h.inbound.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        settle().await;

        let writes = h.backend.writes();
        assert_eq!(writes.len(), 5);
        assert!(writes.iter().all(|w| w.len() == QUANTUM_BYTES));
        assert_eq!(h.backend.played(), stream);
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_quantum_is_held_back() {
        let h = start(PlayBufferMode::Unbounded);
        h.inbound
            .send(Bytes::from(vec![1u8; QUANTUM_BYTES + 10]))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.backend.played().len(), QUANTUM_BYTES);
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_writes_are_retried() {
        let h = start(PlayBufferMode::Unbounded);
        h.backend.set_write_limit(Some(500));
        let stream = pattern(QUANTUM_BYTES * 2, 9);
        h.inbound.send(Bytes::from(stream.clone())).await.unwrap();
        settle().await;

        assert_eq!(h.backend.played(), stream);
        assert!(h.backend.writes().iter().all(|w| w.len() <= 500));
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn playback_error_stops_the_whole_pipeline() {
        let mut h = start(PlayBufferMode::Unbounded);
        h.backend.fail_next_write("device unplugged");
        h.inbound
            .send(Bytes::from(vec![0u8; QUANTUM_BYTES]))
            .await
            .unwrap();
        settle().await;

        assert!(matches!(h.fatal.try_recv(), Ok(Error::Transport(_))));
        assert!(h.backend.playback_closed());
        assert!(h.backend.capture_closed());
        // The feeder is gone, so received audio is refused instead of buffered.
        assert!(h.inbound.is_closed());
        assert!(h.inbound.send(Bytes::from(vec![0u8; QUANTUM_BYTES])).await.is_err());
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capture_emits_whole_quanta() {
        let mut h = start(PlayBufferMode::Unbounded);
        let stream = pattern(QUANTUM_BYTES * 3, 5);
        for piece in stream.chunks(700) {
            h.backend.feed_capture(piece);
        }
        settle().await;

        let mut emitted = Vec::new();
        while let Ok(quantum) = h.outbound.try_recv() {
            assert_eq!(quantum.len(), QUANTUM_BYTES);
            emitted.extend_from_slice(&quantum);
        }
        assert_eq!(emitted, stream);
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_capture_ends_silently() {
        let mut h = start(PlayBufferMode::Unbounded);
        h.backend.end_capture();
        settle().await;

        assert!(h.backend.capture_closed());
        assert!(h.fatal.try_recv().is_err());
        h.pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_both_devices() {
        let h = start(PlayBufferMode::Unbounded);
        let backend = h.backend.clone();
        h.pipeline.stop().await;

        assert!(backend.playback_closed());
        assert!(backend.capture_closed());
    }
}
