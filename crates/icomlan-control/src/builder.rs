//! ControlStreamBuilder -- fluent builder for [`ControlStream`] instances.
//!
//! Separates session configuration (credentials, names, timers, overrides)
//! from construction, so callers can set everything up before the UDP
//! association to the radio is opened.
//!
//! # Example
//!
//! ```no_run
//! use icomlan_control::ControlStreamBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> icomlan_core::Result<()> {
//! let mut stream = ControlStreamBuilder::new("beer", "beerbeer")
//!     .client_name("shack-pc")
//!     .device_name("IC-705")
//!     .handshake_timeout(Duration::from_secs(2))
//!     .connect("192.168.1.50")
//!     .await?;
//! stream.init().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use icomlan_core::audio::AudioBackend;
use icomlan_core::error::{Error, Result};
use icomlan_core::serial::SerialBridge;
use icomlan_core::transport::DatagramTransport;
use icomlan_transport::UdpTransport;

use crate::audio::PlayBufferMode;
use crate::control::{ControlConfig, ControlStream};
use crate::packet::{CONTROL_PORT, Credentials, NAME_FIELD_LEN, StreamCapabilities};

/// Fluent builder for [`ControlStream`].
///
/// Only the credentials are required; everything else defaults to the
/// values the radio expects:
///
/// ```ignore
/// let stream = ControlStreamBuilder::new("user", "pass")
///     .connect("ic-705.local")
///     .await?;
/// ```
pub struct ControlStreamBuilder {
    credentials: Credentials,
    client_name: String,
    device_name: String,
    control_port: u16,
    capabilities: StreamCapabilities,
    handshake_timeout: Duration,
    keepalive_interval: Duration,
    second_auth_delay: Duration,
    request_timeout: Duration,
    reauth_interval: Duration,
    status_interval: Duration,
    local_id: Option<u32>,
    client_id: Option<u16>,
    initial_inner_seq: Option<u16>,
    play_buffer_mode: PlayBufferMode,
    serial: Option<Box<dyn SerialBridge>>,
    audio: Option<Box<dyn AudioBackend>>,
}

impl ControlStreamBuilder {
    /// Create a builder for the given radio account.
    pub fn new(username: &str, password: &str) -> Self {
        ControlStreamBuilder {
            credentials: Credentials::new(username, password),
            client_name: "icomlan".to_string(),
            device_name: "IC-705".to_string(),
            control_port: CONTROL_PORT,
            capabilities: StreamCapabilities::default(),
            handshake_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(100),
            second_auth_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            reauth_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(3),
            local_id: None,
            client_id: None,
            initial_inner_seq: None,
            play_buffer_mode: PlayBufferMode::Unbounded,
            serial: None,
            audio: None,
        }
    }

    /// Name this client reports at login (default `"icomlan"`).
    pub fn client_name(mut self, name: &str) -> Self {
        self.client_name = name.to_string();
        self
    }

    /// Radio model named in the stream request (default `"IC-705"`).
    pub fn device_name(mut self, name: &str) -> Self {
        self.device_name = name.to_string();
        self
    }

    /// Override the radio's control port (default 50001).
    pub fn control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    /// Ports requested for the serial and audio streams
    /// (default 50002 and 50003).
    pub fn stream_ports(mut self, serial: u16, audio: u16) -> Self {
        self.capabilities.serial_port = serial;
        self.capabilities.audio_port = audio;
        self
    }

    /// Audio sample rate requested from the radio (default 48000).
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.capabilities.sample_rate = rate;
        self
    }

    /// Radio-side transmit buffer length (default 100 ms).
    pub fn tx_buffer(mut self, length: Duration) -> Self {
        self.capabilities.tx_buffer = length;
        self
    }

    /// How long to wait for each handshake reply (default 1 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Interval of the ping and idle keepalive (default 100 ms).
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Delay before the second auth packet (default 1 s).
    pub fn second_auth_delay(mut self, delay: Duration) -> Self {
        self.second_auth_delay = delay;
        self
    }

    /// Maximum wait for the stream grant after login (default 5 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Interval of reauthentication (default 60 s).
    pub fn reauth_interval(mut self, interval: Duration) -> Self {
        self.reauth_interval = interval;
        self
    }

    /// Interval of the status log line (default 3 s).
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Fix the local session id instead of picking a random one.
    pub fn local_id(mut self, id: u32) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Fix the 2-byte client id sent at login instead of a random one.
    pub fn client_id(mut self, id: u16) -> Self {
        self.client_id = Some(id);
        self
    }

    /// Fix the first inner sequence number instead of a random one.
    pub fn initial_inner_seq(mut self, seq: u16) -> Self {
        self.initial_inner_seq = Some(seq);
        self
    }

    /// Growth policy of the play buffer (default unbounded).
    pub fn play_buffer_mode(mut self, mode: PlayBufferMode) -> Self {
        self.play_buffer_mode = mode;
        self
    }

    /// Serial bridge started when the streams are granted.
    pub fn serial_bridge(mut self, bridge: Box<dyn SerialBridge>) -> Self {
        self.serial = Some(bridge);
        self
    }

    /// Audio backend opened when the streams are granted.
    pub fn audio_backend(mut self, backend: Box<dyn AudioBackend>) -> Self {
        self.audio = Some(backend);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.credentials.username.is_empty() {
            return Err(Error::InvalidParameter("username must not be empty".into()));
        }
        let fields = [
            ("username", &self.credentials.username),
            ("password", &self.credentials.password),
            ("client name", &self.client_name),
            ("device name", &self.device_name),
        ];
        for (what, value) in fields {
            if value.len() >= NAME_FIELD_LEN {
                return Err(Error::InvalidParameter(format!(
                    "{what} must be shorter than {NAME_FIELD_LEN} bytes"
                )));
            }
        }
        if self.keepalive_interval.is_zero()
            || self.reauth_interval.is_zero()
            || self.status_interval.is_zero()
        {
            return Err(Error::InvalidParameter(
                "periodic intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Build a control stream on an already opened transport.
    ///
    /// Used by tests with a mock transport, and by callers that open the
    /// UDP association themselves.
    pub fn build_with_transport(
        self,
        transport: Box<dyn DatagramTransport>,
    ) -> Result<ControlStream> {
        self.validate()?;
        let config = ControlConfig {
            credentials: self.credentials,
            client_name: self.client_name,
            device_name: self.device_name,
            capabilities: self.capabilities,
            handshake_timeout: self.handshake_timeout,
            keepalive_interval: self.keepalive_interval,
            second_auth_delay: self.second_auth_delay,
            request_timeout: self.request_timeout,
            reauth_interval: self.reauth_interval,
            status_interval: self.status_interval,
            local_id: self.local_id,
            client_id: self.client_id,
            initial_inner_seq: self.initial_inner_seq,
            play_buffer_mode: self.play_buffer_mode,
        };
        Ok(ControlStream::new(config, transport, self.serial, self.audio))
    }

    /// Open a UDP association to `host` on the control port and build the
    /// control stream.
    pub async fn connect(self, host: &str) -> Result<ControlStream> {
        self.validate()?;
        tracing::debug!(host = %host, port = self.control_port, "Connecting control stream");
        let transport = UdpTransport::connect_to(host, self.control_port).await?;
        self.build_with_transport(Box::new(transport))
    }
}
