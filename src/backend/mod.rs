//! Output line abstraction
//!
//! An [`OutputBackend`] hands out [`OutputLine`]s, one per engine channel.
//! A line is the engine's view of one hardware output: a blocking, panned
//! dispatch primitive. Dropping the line releases the hardware output.
//!
//! Backends shipped with the crate:
//! - [`capture::CaptureBackend`]: in-memory recording, for offline rendering
//!   and tests
//! - [`crate::streaming::RodioBackend`] (`streaming` feature): system audio

pub mod capture;

pub use capture::{CaptureBackend, Dispatch};

use crate::control::StereoVolume;
use crate::frame::Frame;
use crate::Result;

/// Maximum hardware volume (unity gain)
pub const MAX_VOLUME: u16 = 0x8000;

/// One reserved hardware output line
///
/// Owned by exactly one render thread. The line is released when dropped.
pub trait OutputLine: Send {
    /// Output `frames` with the given panning
    ///
    /// Blocks until the hardware has accepted the data. `frames.len()` is
    /// always a multiple of [`SAMPLE_ALIGN`](crate::SAMPLE_ALIGN) and never
    /// exceeds the `frames_per_dispatch` the line was reserved with.
    fn output_blocking(&mut self, frames: &[Frame], volume: StereoVolume) -> Result<()>;
}

/// Source of hardware output lines
pub trait OutputBackend {
    /// Reserve the output line for `channel`
    ///
    /// # Arguments
    ///
    /// * `channel` - Engine channel index the line will serve
    /// * `frames_per_dispatch` - Largest dispatch the line must accept
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HardwareReservation`](crate::EngineError::HardwareReservation)
    /// when no line is free.
    fn reserve(&self, channel: usize, frames_per_dispatch: usize) -> Result<Box<dyn OutputLine>>;

    /// Volume value that means unity gain for this backend's lines
    fn max_volume(&self) -> u16 {
        MAX_VOLUME
    }
}
