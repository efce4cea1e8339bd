//! Icom remote LAN control stream for icomlan.
//!
//! This crate implements the client side of the UDP protocol Icom
//! transceivers use for remote operation over a network. It provides:
//!
//! - **Packet codec** ([`packet`]) -- builders and parsers for the framing,
//!   login, auth and stream request packets.
//! - **Reply table** ([`dispatch`]) -- classification of the radio's replies
//!   by length and leading bytes.
//! - **Deadlines** ([`timers`]) -- the named one-shot and periodic timers of
//!   the session.
//! - **Session channel** ([`session`]) -- session ids, sequence numbers,
//!   keepalive and latency over a [`DatagramTransport`](icomlan_core::DatagramTransport).
//! - **ControlStream** ([`control`]) -- handshake, worker task and teardown.
//! - **Audio pipeline** ([`audio`]) -- jitter buffer and pumps between the
//!   network audio queues and the local audio devices.
//! - **ControlStreamBuilder** ([`builder`]) -- fluent configuration.
//!
//! # Example
//!
//! ```
//! use icomlan_control::dispatch::{classify, ReplyKind};
//! use icomlan_control::packet::{idle, SessionIds};
//!
//! let pkt = idle(0x13, SessionIds { local: 1, remote: 2 });
//! assert_eq!(classify(&pkt), Some(ReplyKind::RemoteIdle));
//! ```

pub mod audio;
pub mod auth;
pub mod builder;
pub mod control;
pub mod dispatch;
pub mod packet;
pub mod session;
pub mod timers;

pub use audio::{AudioPipeline, PlayBufferMode};
pub use builder::ControlStreamBuilder;
pub use control::{ControlState, ControlStream};
