//! In-memory output backend
//!
//! Records every dispatch a render thread makes, together with the panning it
//! was dispatched with. Useful for offline rendering and for checking what a
//! channel actually emitted. Each dispatch sleeps for a configurable pacing
//! interval, standing in for the hardware queue's backpressure.

use super::{OutputBackend, OutputLine, MAX_VOLUME};
use crate::control::StereoVolume;
use crate::frame::{Frame, SAMPLE_ALIGN};
use crate::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Default number of lines a capture backend can hand out
pub const DEFAULT_CAPTURE_LINES: usize = 8;

/// Default number of dispatches retained per channel
pub const DEFAULT_RETAIN_LIMIT: usize = 4096;

/// One recorded hardware dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Frames exactly as handed to the line (before panning)
    pub frames: Vec<Frame>,
    /// Panning the frames were dispatched with
    pub volume: StereoVolume,
}

#[derive(Debug, Default)]
struct CaptureState {
    active_lines: usize,
    reservations: usize,
    releases: usize,
    channels: Vec<Vec<Dispatch>>,
    discarded: usize,
}

/// Backend that records dispatches in memory
#[derive(Debug, Clone)]
pub struct CaptureBackend {
    state: Arc<Mutex<CaptureState>>,
    max_lines: usize,
    max_volume: u16,
    pacing: Duration,
    retain_limit: usize,
}

impl CaptureBackend {
    /// Create a backend with 8 lines, unity volume [`MAX_VOLUME`] and 1 ms pacing
    pub fn new() -> Self {
        CaptureBackend {
            state: Arc::new(Mutex::new(CaptureState::default())),
            max_lines: DEFAULT_CAPTURE_LINES,
            max_volume: MAX_VOLUME,
            pacing: Duration::from_millis(1),
            retain_limit: DEFAULT_RETAIN_LIMIT,
        }
    }

    /// Limit how many lines may be reserved at the same time
    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Set the volume value reported as unity gain
    pub fn with_max_volume(mut self, max_volume: u16) -> Self {
        self.max_volume = max_volume;
        self
    }

    /// Set how long each dispatch blocks
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set how many dispatches are kept per channel; later ones are counted and discarded
    pub fn with_retain_limit(mut self, retain_limit: usize) -> Self {
        self.retain_limit = retain_limit;
        self
    }

    /// Number of lines currently reserved and not yet released
    pub fn active_lines(&self) -> usize {
        self.state.lock().active_lines
    }

    /// Number of successful reservations since creation
    pub fn total_reservations(&self) -> usize {
        self.state.lock().reservations
    }

    /// Number of lines released since creation
    pub fn released_lines(&self) -> usize {
        self.state.lock().releases
    }

    /// Dispatches discarded after the retain limit was reached
    pub fn discarded_dispatches(&self) -> usize {
        self.state.lock().discarded
    }

    /// Retained dispatches for `channel`, oldest first
    pub fn dispatches(&self, channel: usize) -> Vec<Dispatch> {
        self.state
            .lock()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of retained dispatches for `channel`
    pub fn dispatch_count(&self, channel: usize) -> usize {
        self.state.lock().channels.get(channel).map_or(0, Vec::len)
    }

    /// All retained frames for `channel`, concatenated in dispatch order
    pub fn captured_frames(&self, channel: usize) -> Vec<Frame> {
        let state = self.state.lock();
        state
            .channels
            .get(channel)
            .map(|dispatches| {
                dispatches
                    .iter()
                    .flat_map(|dispatch| dispatch.frames.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write a captured channel, panning applied, as 16-bit stereo WAV
    #[cfg(feature = "export-wav")]
    pub fn write_wav<P: AsRef<std::path::Path>>(
        &self,
        channel: usize,
        path: P,
        sample_rate: u32,
    ) -> Result<usize> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        let mut written = 0;
        for dispatch in self.dispatches(channel) {
            for frame in &dispatch.frames {
                let panned = dispatch.volume.apply(*frame, self.max_volume);
                writer.write_sample(panned.left)?;
                writer.write_sample(panned.right)?;
                written += 1;
            }
        }
        writer.finalize()?;
        log::info!("Exported {written} frames of channel {channel} to WAV");
        Ok(written)
    }
}

impl Default for CaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for CaptureBackend {
    fn reserve(&self, channel: usize, frames_per_dispatch: usize) -> Result<Box<dyn OutputLine>> {
        let mut state = self.state.lock();
        if state.active_lines >= self.max_lines {
            return Err(EngineError::HardwareReservation {
                channel,
                reason: format!("all {} capture lines in use", self.max_lines),
            });
        }

        state.active_lines += 1;
        state.reservations += 1;
        if state.channels.len() <= channel {
            state.channels.resize_with(channel + 1, Vec::new);
        }
        state.channels[channel].clear();
        drop(state);

        log::debug!("Reserved capture line for channel {channel} ({frames_per_dispatch} frames)");
        Ok(Box::new(CaptureLine {
            channel,
            frames_per_dispatch,
            state: Arc::clone(&self.state),
            pacing: self.pacing,
            retain_limit: self.retain_limit,
        }))
    }

    fn max_volume(&self) -> u16 {
        self.max_volume
    }
}

struct CaptureLine {
    channel: usize,
    frames_per_dispatch: usize,
    state: Arc<Mutex<CaptureState>>,
    pacing: Duration,
    retain_limit: usize,
}

impl OutputLine for CaptureLine {
    fn output_blocking(&mut self, frames: &[Frame], volume: StereoVolume) -> Result<()> {
        if frames.len() % SAMPLE_ALIGN != 0 || frames.len() > self.frames_per_dispatch {
            return Err(EngineError::Device(format!(
                "dispatch of {} frames violates line limits ({} max, {}-frame alignment)",
                frames.len(),
                self.frames_per_dispatch,
                SAMPLE_ALIGN
            )));
        }

        {
            let mut state = self.state.lock();
            if state.channels[self.channel].len() < self.retain_limit {
                state.channels[self.channel].push(Dispatch {
                    frames: frames.to_vec(),
                    volume,
                });
            } else {
                state.discarded += 1;
            }
        }

        if !self.pacing.is_zero() {
            std::thread::sleep(self.pacing);
        }
        Ok(())
    }
}

impl Drop for CaptureLine {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active_lines -= 1;
        state.releases += 1;
        log::debug!("Released capture line for channel {}", self.channel);
    }
}
