//! Audio device integration using rodio
//!
//! Each reserved line owns one [`AudioDevice`]: a rodio sink playing a source
//! that drains the line's ring buffer.

use super::{interleave_panned, write_blocking, RingBuffer, MAX_DEVICE_LINES};
use crate::backend::{OutputBackend, OutputLine, MAX_VOLUME};
use crate::control::StereoVolume;
use crate::frame::Frame;
use crate::{EngineError, Result};
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Samples fetched from the ring per batch on the audio callback thread
const SOURCE_BATCH: usize = 1024;

/// Audio source that reads from the ring buffer
struct RingBufferSource {
    ring_buffer: Arc<RingBuffer>,
    sample_rate: u32,
    finished: Arc<AtomicBool>,
    /// Internal buffer for batch reads
    buffer: Vec<f32>,
    /// Current position in the internal buffer
    buffer_pos: usize,
}

impl RingBufferSource {
    fn new(ring_buffer: Arc<RingBuffer>, sample_rate: u32, finished: Arc<AtomicBool>) -> Self {
        RingBufferSource {
            ring_buffer,
            sample_rate,
            finished,
            buffer: vec![0.0f32; SOURCE_BATCH],
            buffer_pos: SOURCE_BATCH,
        }
    }
}

impl Source for RingBufferSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for RingBufferSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished.load(Ordering::Relaxed) {
            return None;
        }

        if self.buffer_pos >= self.buffer.len() {
            // Whole frames only, so left/right stay interleaved across underruns
            let wanted = (self.ring_buffer.available_read() & !1).min(self.buffer.len());
            let read = self.ring_buffer.read(&mut self.buffer[..wanted]);
            // Underrun: play silence to keep the stream alive
            self.buffer[read..].fill(0.0);
            self.buffer_pos = 0;
        }

        let sample = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Some(sample)
    }
}

/// Stereo playback device fed from a ring buffer
pub struct AudioDevice {
    _stream: OutputStream,
    sink: Sink,
    finished: Arc<AtomicBool>,
}

impl AudioDevice {
    /// Open the default output device and start draining `ring_buffer`
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate in Hz (typically 44100)
    /// * `ring_buffer` - Interleaved stereo samples to play
    pub fn new(sample_rate: u32, ring_buffer: Arc<RingBuffer>) -> Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| EngineError::Device(format!("Failed to create audio stream: {e}")))?;

        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| EngineError::Device(format!("Failed to create audio sink: {e}")))?;

        let finished = Arc::new(AtomicBool::new(false));
        sink.append(RingBufferSource::new(
            ring_buffer,
            sample_rate,
            Arc::clone(&finished),
        ));

        Ok(AudioDevice {
            _stream: stream,
            sink,
            finished,
        })
    }

    /// Pause playback
    pub fn pause(&self) {
        self.sink.pause();
    }

    /// Resume playback
    pub fn play(&self) {
        self.sink.play();
    }

    /// Whether playback is paused
    pub fn is_paused(&self) -> bool {
        self.sink.is_paused()
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Relaxed);
        self.sink.stop();
    }
}

/// Backend that plays each line on the default system output device
pub struct RodioBackend {
    sample_rate: u32,
    max_lines: usize,
    reserved: Arc<AtomicUsize>,
}

impl RodioBackend {
    /// Create a backend playing at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        RodioBackend {
            sample_rate,
            max_lines: MAX_DEVICE_LINES,
            reserved: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of lines currently reserved
    pub fn reserved_lines(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

impl Default for RodioBackend {
    fn default() -> Self {
        Self::new(super::DEFAULT_SAMPLE_RATE)
    }
}

impl OutputBackend for RodioBackend {
    fn reserve(&self, channel: usize, frames_per_dispatch: usize) -> Result<Box<dyn OutputLine>> {
        let claimed = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_lines).then_some(count + 1)
            });
        if claimed.is_err() {
            return Err(EngineError::HardwareReservation {
                channel,
                reason: format!("all {} device lines in use", self.max_lines),
            });
        }

        // Four dispatches of interleaved stereo in flight
        let ring = RingBuffer::new(frames_per_dispatch * 2 * 4).and_then(|ring| {
            let ring = Arc::new(ring);
            AudioDevice::new(self.sample_rate, Arc::clone(&ring)).map(|device| (ring, device))
        });
        let (ring, device) = match ring {
            Ok(parts) => parts,
            Err(err) => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                return Err(EngineError::HardwareReservation {
                    channel,
                    reason: err.to_string(),
                });
            }
        };

        log::info!(
            "Opened audio device for channel {channel} at {} Hz ({} sample ring)",
            self.sample_rate,
            ring.capacity()
        );
        Ok(Box::new(RodioLine {
            channel,
            ring,
            device,
            scratch: Vec::with_capacity(frames_per_dispatch * 2),
            reserved: Arc::clone(&self.reserved),
        }))
    }

    fn max_volume(&self) -> u16 {
        MAX_VOLUME
    }
}

struct RodioLine {
    channel: usize,
    ring: Arc<RingBuffer>,
    device: AudioDevice,
    scratch: Vec<f32>,
    reserved: Arc<AtomicUsize>,
}

// SAFETY: rodio::OutputStream is !Send on some platforms because of a marker
// type, not because of thread-affine state we touch. The stream is never
// accessed after construction; it only has to stay alive. The line is owned by
// a single render thread at a time, and the sink itself is Send + Sync.
unsafe impl Send for RodioLine {}

impl OutputLine for RodioLine {
    fn output_blocking(&mut self, frames: &[Frame], volume: StereoVolume) -> Result<()> {
        interleave_panned(frames, volume, MAX_VOLUME, &mut self.scratch);
        let written = write_blocking(&self.ring, &self.scratch);
        if written < self.scratch.len() {
            return Err(EngineError::Device(format!(
                "device stalled; dropped {} of {} samples",
                self.scratch.len() - written,
                self.scratch.len()
            )));
        }
        Ok(())
    }
}

impl Drop for RodioLine {
    fn drop(&mut self) {
        self.device.pause();
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        log::info!("Closed audio device for channel {}", self.channel);
    }
}
