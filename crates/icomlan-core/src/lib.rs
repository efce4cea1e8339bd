//! icomlan-core: Core traits, types, and error definitions for icomlan.
//!
//! This crate defines the abstractions shared by the control stream, the
//! concrete transports, and the test harness. Applications depend on these
//! types to plug in their own serial bridge or audio backend.
//!
//! # Key types
//!
//! - [`DatagramTransport`] -- one UDP association to the radio
//! - [`AudioBackend`], [`PlaybackDevice`], [`CaptureDevice`] -- local audio
//! - [`SerialBridge`] -- virtual serial port for CI-V applications
//! - [`SessionEvent`] -- session progress notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod audio;
pub mod error;
pub mod events;
pub mod serial;
pub mod transport;

pub use audio::{
    AudioBackend, AudioEndpoints, CaptureDevice, PlaybackDevice, QUANTUM_BYTES, QUANTUM_SAMPLES,
    SAMPLE_RATE,
};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use serial::SerialBridge;
pub use transport::DatagramTransport;
