//! System audio output
//!
//! A [`RodioBackend`] line turns each engine dispatch into panned, interleaved
//! `f32` samples and pushes them into a [`RingBuffer`] that a rodio `Source`
//! drains on the audio callback thread. When the ring is full the line backs
//! off and retries, which paces the render thread to the device clock.

#[cfg(feature = "streaming")]
mod audio_device;
pub mod ring_buffer;

#[cfg(feature = "streaming")]
pub use audio_device::{AudioDevice, RodioBackend};
pub use ring_buffer::RingBuffer;

use crate::control::StereoVolume;
use crate::frame::Frame;

/// Default sample rate (44.1 kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Buffer backoff time in microseconds
pub const BUFFER_BACKOFF_MICROS: u64 = 100;

/// Backoff periods without progress before a blocking write gives up (~100ms)
pub const MAX_BACKOFF_RETRIES: u32 = 1000;

/// Lines a system device backend hands out
pub const MAX_DEVICE_LINES: usize = 8;

/// Write all of `samples`, backing off while the ring is full
///
/// Gives up after [`MAX_BACKOFF_RETRIES`] consecutive backoffs without
/// progress, so a stalled device never wedges the render thread. Returns the
/// number of samples written.
pub fn write_blocking(ring: &RingBuffer, samples: &[f32]) -> usize {
    let mut total_written = 0;
    let mut remaining = samples;
    let mut retry_count = 0;

    while !remaining.is_empty() && retry_count < MAX_BACKOFF_RETRIES {
        let written = ring.write(remaining);
        total_written += written;

        if written == 0 {
            std::thread::sleep(std::time::Duration::from_micros(BUFFER_BACKOFF_MICROS));
            retry_count += 1;
        } else {
            remaining = &remaining[written..];
            retry_count = 0;
        }
    }

    total_written
}

/// Convert frames to interleaved `f32` samples with panning applied
///
/// `out` is cleared first; `max_volume` is the unity-gain volume value.
pub fn interleave_panned(
    frames: &[Frame],
    volume: StereoVolume,
    max_volume: u16,
    out: &mut Vec<f32>,
) {
    out.clear();
    out.reserve(frames.len() * 2);
    let gain = |value: u16| {
        if max_volume == 0 {
            0.0
        } else {
            f32::from(value) / f32::from(max_volume) / 32_768.0
        }
    };
    let (left_gain, right_gain) = (gain(volume.left), gain(volume.right));
    for frame in frames {
        out.push(f32::from(frame.left) * left_gain);
        out.push(f32::from(frame.right) * right_gain);
    }
}
