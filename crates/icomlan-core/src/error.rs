//! Error types for icomlan.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! session-level failures are all captured here.

/// The error type for all icomlan operations.
///
/// Variants cover the failure modes of a remote LAN session: datagram
/// transport failures, malformed or unexpected replies, handshake timeouts,
/// credential rejection, and conditions the radio reports once the session
/// is running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (UDP socket, audio device).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed reply, audio framing corruption).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a reply from the radio.
    ///
    /// During the handshake this typically means the radio is powered off,
    /// unreachable, or the remote LAN server is disabled in its menu.
    #[error("timeout waiting for response")]
    Timeout,

    /// The radio rejected the username or password.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The radio rejected a reauthentication attempt.
    #[error("authentication failed")]
    AuthFailed,

    /// The radio closed the session from its side.
    #[error("disconnected by the radio")]
    RemoteDisconnected,

    /// A pending request never got its reply and the session cannot proceed.
    #[error("session stalled: {0}")]
    Stalled(String),

    /// An invalid parameter was passed to a builder or command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No session has been established, or it was already torn down.
    #[error("not connected")]
    NotConnected,

    /// An audio or data stream was closed.
    ///
    /// Audio devices return this once they have been closed; the audio
    /// pumps treat it as the normal end of a stream during teardown.
    #[error("stream closed")]
    StreamClosed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the device or channel was already closed.
    ///
    /// Used to keep teardown noise out of the logs.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::StreamClosed | Error::NotConnected)
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
