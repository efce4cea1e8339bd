// icomlan -- command-line client for Icom transceivers on the remote LAN
// protocol. Logs in, keeps the session alive, opens the serial and audio
// streams, and reconnects after the session is lost.
//
// Usage:
//   icomlan --host 192.168.1.50 --username beer --password beerbeer
//   icomlan --host ic-705.local --username beer --password beerbeer \
//       --client-name shack-pc --reconnect-delay 10 --log-level debug
//
// With the `audio` feature, local audio goes through cpal:
//   icomlan --host 192.168.1.50 --username beer --password beerbeer \
//       --output-device "USB Audio CODEC" --input-device "USB Audio CODEC"

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use icomlan::{AudioBackend, ControlStreamBuilder, Error, SerialBridge, SessionEvent};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Remote LAN client for Icom transceivers.
#[derive(Parser, Debug)]
#[command(name = "icomlan", version, about)]
struct Cli {
    /// Radio address or host name.
    #[arg(long)]
    host: String,

    /// Network username configured on the radio.
    #[arg(long)]
    username: String,

    /// Network password configured on the radio.
    #[arg(long)]
    password: String,

    /// Name this client reports to the radio.
    #[arg(long, default_value = "icomlan")]
    client_name: String,

    /// Radio model named in the stream request.
    #[arg(long, default_value = "IC-705")]
    device: String,

    /// Capture device for transmit audio (default input if omitted).
    #[arg(long)]
    input_device: Option<String>,

    /// Playback device for received audio (default output if omitted).
    #[arg(long)]
    output_device: Option<String>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait before reconnecting after the session is lost.
    #[arg(long, default_value_t = 5)]
    reconnect_delay: u64,
}

// ---------------------------------------------------------------------------
// Serial bridge and audio backend
// ---------------------------------------------------------------------------

/// Serial bridge that only logs; no virtual port is created.
#[derive(Default)]
struct LoggingSerialBridge {
    device: Option<String>,
}

#[async_trait]
impl SerialBridge for LoggingSerialBridge {
    async fn init(&mut self, device_name: &str) -> icomlan::Result<()> {
        info!(device = %device_name, "Serial stream available");
        self.device = Some(device_name.to_string());
        Ok(())
    }

    async fn deinit(&mut self) {
        if let Some(device) = self.device.take() {
            info!(device = %device, "Serial stream released");
        }
    }
}

#[cfg(not(feature = "audio"))]
mod null_audio {
    use async_trait::async_trait;
    use icomlan::{
        AudioBackend, AudioEndpoints, CaptureDevice, Error, PlaybackDevice, Result,
    };

    /// Discards playback and never produces capture audio.
    pub struct NullAudioBackend;

    struct NullPlayback {
        closed: bool,
    }

    struct NullCapture {
        closed: bool,
    }

    impl AudioBackend for NullAudioBackend {
        fn open(&mut self, device_name: &str) -> Result<AudioEndpoints> {
            tracing::info!(device = %device_name, "Audio disabled, discarding received audio");
            Ok(AudioEndpoints {
                playback: Box::new(NullPlayback { closed: false }),
                capture: Box::new(NullCapture { closed: false }),
            })
        }
    }

    #[async_trait]
    impl PlaybackDevice for NullPlayback {
        async fn write(&mut self, data: &[u8]) -> Result<usize> {
            if self.closed {
                return Err(Error::StreamClosed);
            }
            Ok(data.len())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[async_trait]
    impl CaptureDevice for NullCapture {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            if self.closed {
                return Err(Error::StreamClosed);
            }
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }
}

#[cfg(feature = "audio")]
fn audio_backend(cli: &Cli) -> Box<dyn AudioBackend> {
    Box::new(icomlan::CpalAudioBackend::new(
        cli.input_device.as_deref(),
        cli.output_device.as_deref(),
    ))
}

#[cfg(not(feature = "audio"))]
fn audio_backend(cli: &Cli) -> Box<dyn AudioBackend> {
    if cli.input_device.is_some() || cli.output_device.is_some() {
        warn!("Built without the `audio` feature; audio device options are ignored");
    }
    Box::new(null_audio::NullAudioBackend)
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// How one session ended.
enum Outcome {
    /// The user asked to quit.
    Shutdown,
    /// The session failed and may be retried.
    Lost(Error),
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Authenticated) => info!("Logged in"),
            Ok(SessionEvent::StreamsOpened { device_name }) => {
                info!(device = %device_name, "Streams open")
            }
            Ok(SessionEvent::LatencyMeasured { rtt }) => debug!(?rtt, "Latency"),
            Ok(SessionEvent::Disconnected) => info!("Disconnected"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Session events lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_session(cli: &Cli) -> icomlan::Result<Outcome> {
    let mut stream = ControlStreamBuilder::new(&cli.username, &cli.password)
        .client_name(&cli.client_name)
        .device_name(&cli.device)
        .serial_bridge(Box::new(LoggingSerialBridge::default()))
        .audio_backend(audio_backend(cli))
        .connect(&cli.host)
        .await?;

    tokio::spawn(log_events(stream.subscribe()));
    if let Some(mut captured) = stream.take_capture_receiver() {
        // No audio stream to the radio yet; captured quanta are counted.
        tokio::spawn(async move {
            let mut quanta: u64 = 0;
            while captured.recv().await.is_some() {
                quanta += 1;
                if quanta % 250 == 0 {
                    debug!(quanta, "Captured audio");
                }
            }
        });
    }

    tokio::select! {
        result = stream.init() => result?,
        _ = tokio::signal::ctrl_c() => return Ok(Outcome::Shutdown),
    }

    let outcome = tokio::select! {
        fatal = stream.next_fatal() => match fatal {
            Some(error) => Outcome::Lost(error),
            None => Outcome::Lost(Error::StreamClosed),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing session");
            Outcome::Shutdown
        }
    };
    stream.deinit().await;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let delay = Duration::from_secs(cli.reconnect_delay);
    info!(host = %cli.host, user = %cli.username, "Starting icomlan");

    loop {
        match run_session(&cli).await {
            Ok(Outcome::Shutdown) => break,
            Ok(Outcome::Lost(error)) => warn!(error = %error, "Session lost"),
            Err(Error::InvalidCredentials) => {
                bail!("radio at {} rejected the username or password", cli.host)
            }
            Err(Error::InvalidParameter(msg)) => bail!("invalid configuration: {msg}"),
            Err(error) => warn!(error = %error, "Connection failed"),
        }

        info!(delay = ?delay, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from([
            "icomlan",
            "--host",
            "192.168.1.50",
            "--username",
            "beer",
            "--password",
            "beerbeer",
        ])
        .unwrap();
        assert_eq!(cli.client_name, "icomlan");
        assert_eq!(cli.device, "IC-705");
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.reconnect_delay, 5);
        assert!(cli.input_device.is_none());
    }

    #[test]
    fn cli_requires_credentials() {
        assert!(Cli::try_parse_from(["icomlan", "--host", "radio"]).is_err());
    }

    #[tokio::test]
    async fn logging_bridge_deinit_without_init() {
        let mut bridge = LoggingSerialBridge::default();
        bridge.deinit().await;
        bridge.init("IC-705").await.unwrap();
        assert_eq!(bridge.device.as_deref(), Some("IC-705"));
        bridge.deinit().await;
        assert!(bridge.device.is_none());
    }
}
