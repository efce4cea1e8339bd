//! icomlan-test-harness: Mock transports and devices for icomlan.
//!
//! - [`mock_pair`] / [`MockRemote`]: a datagram transport whose radio side
//!   is scripted by the test.
//! - [`MockAudioBackend`]: records playback writes and feeds capture reads.
//! - [`RecordingSerialBridge`]: counts serial bridge start/stop calls.

pub mod mock_audio;
pub mod mock_datagram;
pub mod mock_serial;

pub use mock_audio::MockAudioBackend;
pub use mock_datagram::{MockDatagramTransport, MockRemote, mock_pair};
pub use mock_serial::RecordingSerialBridge;
