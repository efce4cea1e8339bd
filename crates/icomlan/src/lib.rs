//! # icomlan -- Icom remote LAN client
//!
//! `icomlan` is an asynchronous client for the UDP protocol Icom
//! transceivers (IC-705, IC-9700, IC-7610 and others) use for remote
//! operation over a network. It logs in on the radio's control stream,
//! keeps the session alive, requests the serial and audio streams, and
//! moves audio between the network and local sound devices.
//!
//! ## Quick Start
//!
//! ```no_run
//! use icomlan::{ControlStreamBuilder, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> icomlan::Result<()> {
//!     let mut stream = ControlStreamBuilder::new("beer", "beerbeer")
//!         .client_name("shack-pc")
//!         .connect("192.168.1.50")
//!         .await?;
//!     let mut events = stream.subscribe();
//!     stream.init().await?;
//!
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let SessionEvent::StreamsOpened { device_name } = event {
//!                 println!("streaming from {device_name}");
//!             }
//!         }
//!     });
//!
//!     if let Some(error) = stream.next_fatal().await {
//!         eprintln!("session lost: {error}");
//!     }
//!     stream.deinit().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                  | Purpose                                          |
//! |------------------------|--------------------------------------------------|
//! | `icomlan-core`         | Traits, session events, errors                   |
//! | `icomlan-transport`    | UDP transport, cpal audio backend                |
//! | `icomlan-control`      | Packet codec, control stream, audio pipeline     |
//! | **`icomlan`**          | This facade crate -- re-exports everything       |
//!
//! ## Feature Flags
//!
//! | Feature | Enables                                  | Default |
//! |---------|------------------------------------------|---------|
//! | `audio` | [`CpalAudioBackend`] and device listing  | no      |
//!
//! Without `audio` the control stream still runs; plug in your own
//! [`AudioBackend`] or leave it out to skip local audio.

pub use icomlan_core::*;

pub use icomlan_control::{
    AudioPipeline, ControlState, ControlStream, ControlStreamBuilder, PlayBufferMode,
};

/// Wire format of the control stream.
pub mod packet {
    pub use icomlan_control::packet::*;
}

/// UDP transport and, with the `audio` feature, the cpal audio backend.
pub mod transport {
    pub use icomlan_transport::*;
}

#[cfg(feature = "audio")]
pub use icomlan_transport::{AudioDeviceInfo, CpalAudioBackend, list_audio_devices};
