//! cpal-based audio backend for icomlan.
//!
//! This module provides [`CpalAudioBackend`], an
//! [`AudioBackend`](icomlan_core::AudioBackend) that plays the radio's
//! receive audio on a local output device and captures transmit audio from a
//! local input device through the [`cpal`] crate.
//!
//! # Architecture
//!
//! cpal uses a callback model: the operating system's audio subsystem invokes
//! a closure on a high-priority audio thread whenever samples are available
//! (input) or needed (output). This module bridges that model to the
//! blocking `read`/`write` device traits:
//!
//! - **Playback**: `PlaybackDevice::write()` -> `mpsc::Sender`
//!   -> cpal output callback
//! - **Capture**: cpal input callback -> `mpsc::Sender`
//!   -> `CaptureDevice::read()`
//!
//! cpal streams are not `Send` on every platform, so each stream is built
//! and kept alive on its own thread. Closing the device ends the thread,
//! which drops the stream and releases the OS device.
//!
//! The radio's PCM format is fixed (48 kHz, 16-bit, mono). Streams are opened
//! at 48 kHz with the device's default channel count; mono audio is copied
//! to every output channel and the first input channel is captured.
//!
//! # Feature flag
//!
//! This module is only compiled when the `audio` feature is enabled.

use async_trait::async_trait;
use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use icomlan_core::audio::{
    AudioBackend, AudioEndpoints, CaptureDevice, PlaybackDevice, SAMPLE_RATE, f32_to_i16,
    i16_to_f32,
};
use icomlan_core::error::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;

/// Channel capacity between the device traits and the cpal callbacks.
///
/// 16 chunks absorbs scheduling jitter; for playback each chunk is one
/// 20 ms quantum, so this is about 320 ms of audio.
const CHANNEL_BUFFER_SIZE: usize = 16;

/// Information about an available audio device.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    /// Device name as reported by the OS audio subsystem.
    pub name: String,
    /// Whether this device supports audio input.
    pub is_input: bool,
    /// Whether this device supports audio output.
    pub is_output: bool,
}

fn device_name(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|desc| desc.name().to_string())
}

/// Input or output devices of the default host.
fn host_devices(host: &cpal::Host, for_input: bool) -> Result<Vec<cpal::Device>> {
    let direction = if for_input { "input" } else { "output" };
    let devices = if for_input {
        host.input_devices().map(|d| d.collect())
    } else {
        host.output_devices().map(|d| d.collect())
    };
    devices.map_err(|e| Error::Transport(format!("cannot enumerate {direction} devices: {e}")))
}

/// Audio devices of the default host, sorted by name.
///
/// A device that both captures and plays is listed once.
pub fn list_audio_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let mut by_name: BTreeMap<String, AudioDeviceInfo> = BTreeMap::new();

    for for_input in [true, false] {
        for name in host_devices(&host, for_input)?.iter().filter_map(device_name) {
            let info = by_name.entry(name.clone()).or_insert(AudioDeviceInfo {
                name,
                is_input: false,
                is_output: false,
            });
            if for_input {
                info.is_input = true;
            } else {
                info.is_output = true;
            }
        }
    }
    Ok(by_name.into_values().collect())
}

/// Find a device by name, or the host default when `name` is `None`.
fn find_device(name: Option<&str>, for_input: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => {
            let default = if for_input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            default.ok_or_else(|| {
                let direction = if for_input { "input" } else { "output" };
                Error::Transport(format!("no default {direction} device"))
            })
        }
        Some(wanted) => host_devices(&host, for_input)?
            .into_iter()
            .find(|device| device_name(device).as_deref() == Some(wanted))
            .ok_or_else(|| Error::Transport(format!("audio device not found: {wanted}"))),
    }
}

/// Decode little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
fn pcm_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Take the first channel of interleaved frames as little-endian PCM bytes.
fn first_channel_to_pcm<T: Copy>(data: &[T], channels: usize, to_i16: impl Fn(T) -> i16) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(data.len() / channels.max(1) * 2);
    for frame in data.chunks(channels.max(1)) {
        pcm.extend_from_slice(&to_i16(frame[0]).to_le_bytes());
    }
    pcm
}

// ---------------------------------------------------------------------------
// CpalAudioBackend
// ---------------------------------------------------------------------------

/// Audio backend that opens local devices through cpal.
///
/// # Example
///
/// ```no_run
/// use icomlan_transport::audio::CpalAudioBackend;
/// use icomlan_core::AudioBackend;
///
/// # fn example() -> icomlan_core::Result<()> {
/// let mut backend = CpalAudioBackend::new(None, Some("USB Audio CODEC"));
/// let endpoints = backend.open("IC-705")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CpalAudioBackend {
    /// Capture device name; host default when `None`.
    input_device: Option<String>,
    /// Playback device name; host default when `None`.
    output_device: Option<String>,
}

impl CpalAudioBackend {
    /// Create a backend for the named input and output devices.
    pub fn new(input_device: Option<&str>, output_device: Option<&str>) -> Self {
        CpalAudioBackend {
            input_device: input_device.map(str::to_string),
            output_device: output_device.map(str::to_string),
        }
    }
}

impl AudioBackend for CpalAudioBackend {
    fn open(&mut self, device_name: &str) -> Result<AudioEndpoints> {
        tracing::info!(
            radio = %device_name,
            input = ?self.input_device,
            output = ?self.output_device,
            "Opening local audio devices"
        );
        let playback = CpalPlayback::start(self.output_device.clone())?;
        let capture = CpalCapture::start(self.input_device.clone())?;
        Ok(AudioEndpoints {
            playback: Box::new(playback),
            capture: Box::new(capture),
        })
    }
}

/// Spawn a thread that builds a cpal stream, plays it, and keeps it alive
/// until `stop_rx` is closed.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<std_mpsc::Sender<()>>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| Error::Transport(format!("failed to start stream: {e}")))?;
                Ok(stream)
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Blocks until the device handle is closed or dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(Error::Io)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(stop_tx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Transport("audio thread exited during startup".into())),
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Output device fed by [`PlaybackDevice::write`].
struct CpalPlayback {
    tx: Option<mpsc::Sender<Vec<i16>>>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl CpalPlayback {
    fn start(device_name: Option<String>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<i16>>(CHANNEL_BUFFER_SIZE);
        let stop = spawn_stream_thread("icomlan-playback", move || {
            build_output_stream(device_name.as_deref(), rx)
        })?;
        Ok(CpalPlayback {
            tx: Some(tx),
            stop: Some(stop),
        })
    }
}

#[async_trait]
impl PlaybackDevice for CpalPlayback {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let tx = self.tx.as_ref().ok_or(Error::StreamClosed)?;
        let accepted = data.len() & !1;
        if accepted == 0 {
            return Ok(0);
        }
        tx.send(pcm_to_samples(&data[..accepted]))
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(accepted)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.stop = None;
        Ok(())
    }
}

fn build_output_stream(
    name: Option<&str>,
    mut rx: mpsc::Receiver<Vec<i16>>,
) -> Result<cpal::Stream> {
    let device = find_device(name, false)?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::Transport(format!("no default output config: {e}")))?;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    // Samples received but not yet handed to the device.
    let mut pending: VecDeque<i16> = VecDeque::new();
    let mut next_sample = move || -> i16 {
        if pending.is_empty() {
            if let Ok(chunk) = rx.try_recv() {
                pending.extend(chunk);
            }
        }
        // Silence on underrun.
        pending.pop_front().unwrap_or(0)
    };

    let err_fn = |err| tracing::error!("cpal output stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(next_sample());
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(i16_to_f32(next_sample()));
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Transport(format!(
                "unsupported output sample format: {other}"
            )));
        }
    };

    stream.map_err(|e| Error::Transport(format!("failed to build output stream: {e}")))
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Input device drained by [`CaptureDevice::read`].
struct CpalCapture {
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    /// Bytes from the last chunk that did not fit the caller's buffer.
    leftover: Vec<u8>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl CpalCapture {
    fn start(device_name: Option<String>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);
        let stop = spawn_stream_thread("icomlan-capture", move || {
            build_input_stream(device_name.as_deref(), tx)
        })?;
        Ok(CpalCapture {
            rx: Some(rx),
            leftover: Vec::new(),
            stop: Some(stop),
        })
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
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
        self.leftover.clear();
        self.stop = None;
        Ok(())
    }
}

fn build_input_stream(name: Option<&str>, tx: mpsc::Sender<Vec<u8>>) -> Result<cpal::Stream> {
    let device = find_device(name, true)?;
    let supported = device
        .default_input_config()
        .map_err(|e| Error::Transport(format!("no default input config: {e}")))?;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| tracing::error!("cpal input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                // Never block the audio thread; drop the chunk if the
                // capture pump is behind.
                let _ = tx.try_send(first_channel_to_pcm(data, channels, |s| s));
            },
            err_fn,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let _ = tx.try_send(first_channel_to_pcm(data, channels, f32_to_i16));
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Transport(format!(
                "unsupported input sample format: {other}"
            )));
        }
    };

    stream.map_err(|e| Error::Transport(format!("failed to build input stream: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
