//! Transport implementations for icomlan.
//!
//! - [`UdpTransport`]: a connected tokio UDP socket implementing
//!   [`DatagramTransport`](icomlan_core::DatagramTransport), one per radio
//!   port.
//! - `CpalAudioBackend` (feature `audio`): local playback and capture
//!   through cpal, implementing [`AudioBackend`](icomlan_core::AudioBackend).
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
//! transport.send(&[0x10, 0, 0, 0, 0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await?;
//!
//! let mut buf = [0u8; 1500];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod udp;

#[cfg(feature = "audio")]
pub mod audio;

pub use udp::UdpTransport;

#[cfg(feature = "audio")]
pub use audio::{AudioDeviceInfo, CpalAudioBackend, list_audio_devices};
