//! Asynchronous session event types.
//!
//! Events are emitted by the control stream through a
//! tokio `broadcast` channel as the session progresses. Status
//! displays subscribe to them instead of polling.
//!
//! Fatal errors are *not* events: they travel on the control stream's single
//! fatal error path so that exactly one owner decides whether to reconnect.

use std::time::Duration;

/// An event emitted by the control stream.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss latency samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The radio accepted the login.
    Authenticated,

    /// The radio granted the serial and audio streams.
    StreamsOpened {
        /// Device name reported by the radio (e.g. `"IC-705"`).
        device_name: String,
    },

    /// A new round-trip latency average is available.
    LatencyMeasured {
        /// Smoothed round-trip time.
        rtt: Duration,
    },

    /// The session was torn down.
    Disconnected,
}
