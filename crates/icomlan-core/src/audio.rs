//! Audio device abstractions and PCM framing constants.
//!
//! The radio streams 16-bit signed little-endian mono PCM at 48 kHz. All
//! buffering between the network and the local audio device is done in
//! whole *quanta* of 20 ms (960 samples, 1920 bytes).
//!
//! The actual device binding lives outside this crate: the cpal backend in
//! `icomlan-transport` (feature `audio`) and the mock devices in
//! `icomlan-test-harness` both implement the traits defined here.
//!
//! # Device model
//!
//! - [`PlaybackDevice`]: sink for audio received from the radio. `write()`
//!   may accept fewer bytes than offered; callers retry the remainder.
//! - [`CaptureDevice`]: source of audio to transmit. `read()` blocks until
//!   some bytes are available.
//!
//! Both return [`Error::StreamClosed`](crate::error::Error::StreamClosed)
//! once the device has been closed, which the audio pumps treat as the
//! normal end of a stream.

use async_trait::async_trait;

use crate::error::Result;

/// Sample rate of the radio's PCM audio in hertz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels (mono).
pub const CHANNELS: u16 = 1;

/// Bytes per sample (16-bit signed little-endian).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples in one 20 ms quantum.
pub const QUANTUM_SAMPLES: usize = 960;

/// Bytes in one 20 ms quantum.
pub const QUANTUM_BYTES: usize = QUANTUM_SAMPLES * BYTES_PER_SAMPLE * CHANNELS as usize;

/// Convert a 16-bit signed integer audio sample to f32 in `[-1.0, 1.0]`.
///
/// `i16::MIN` maps to slightly below `-1.0`.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Convert an f32 audio sample to 16-bit signed integer, clamping to
/// `[-1.0, 1.0]` first.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Local sink for audio received from the radio.
#[async_trait]
pub trait PlaybackDevice: Send {
    /// Write PCM bytes to the device.
    ///
    /// Returns how many bytes were accepted, which may be fewer than
    /// `data.len()`.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Close the device. Pending and later writes fail with `StreamClosed`.
    async fn close(&mut self) -> Result<()>;
}

/// Local source of audio to send to the radio.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Read PCM bytes from the device into `buf`.
    ///
    /// Blocks until at least one byte is available. Returns the number of
    /// bytes read.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the device. Pending and later reads fail with `StreamClosed`.
    async fn close(&mut self) -> Result<()>;
}

/// A pair of opened audio endpoints.
pub struct AudioEndpoints {
    /// Where received radio audio is played.
    pub playback: Box<dyn PlaybackDevice>,
    /// Where transmit audio is captured from.
    pub capture: Box<dyn CaptureDevice>,
}

/// Factory for the local audio endpoints.
///
/// Called once the radio has granted the audio stream. `device_name` is the
/// name the radio reported in its grant (e.g. `"IC-705"`); backends may use
/// it to label virtual devices or only log it.
pub trait AudioBackend: Send {
    /// Open the playback and capture endpoints.
    fn open(&mut self, device_name: &str) -> Result<AudioEndpoints>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_is_twenty_milliseconds() {
        assert_eq!(QUANTUM_BYTES, 1920);
        let samples_per_ms = SAMPLE_RATE as usize / 1000;
        assert_eq!(QUANTUM_SAMPLES / samples_per_ms, 20);
    }

    #[test]
    fn i16_to_f32_bounds() {
        assert_eq!(i16_to_f32(0), 0.0);
        assert_eq!(i16_to_f32(i16::MAX), 1.0);
        let min = i16_to_f32(i16::MIN);
        assert!(min < -1.0 && min > -1.001);
    }

    #[test]
    fn f32_to_i16_clamps() {
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(-1.5), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn i16_f32_round_trip_is_close() {
        for original in [0i16, 1, -1, 1000, -1000, 20000, i16::MAX] {
            let converted = f32_to_i16(i16_to_f32(original));
            assert!(
                (original - converted).abs() <= 1,
                "round-trip failed for {original}: got {converted}"
            );
        }
    }
}
