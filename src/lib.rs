//! Realtime PCM channel output engine
//!
//! A double-buffered, callback-driven pipeline that keeps one or more audio
//! output lines fed while an emulation or game loop runs on its own thread.
//! Each channel owns a dedicated render thread that pulls frames from a
//! registered [`SampleSource`], realigns them to the 64-frame granularity the
//! output DMA requires, and hands them to a blocking output line.
//!
//! # Features
//! - Loss-free carryover of unaligned producer output between render cycles
//! - Lock-free producer attach/detach/replace while rendering
//! - Clamped, tear-free stereo volume per channel
//! - Full rollback when initialization fails part-way
//! - Cooperative shutdown that joins every render thread before releasing
//!   buffers and output lines
//!
//! # Crate feature flags
//! - `streaming` (opt-in): [`streaming::RodioBackend`] for system audio output
//! - `export-wav` (opt-in): WAV export of captured channels
//!
//! # Quick start
//! ```
//! use pcm_channels::{AudioEngine, CaptureBackend, Frame};
//!
//! let backend = CaptureBackend::new();
//! let mut engine = AudioEngine::with_defaults(500, 1, &backend).unwrap();
//! assert_eq!(engine.aligned_capacity(), 512);
//!
//! let mut phase = 0i16;
//! engine
//!     .set_callback(0, move |out: &mut [Frame]| {
//!         for frame in out.iter_mut() {
//!             phase = phase.wrapping_add(300);
//!             *frame = Frame::mono(phase);
//!         }
//!         out.len()
//!     })
//!     .unwrap();
//! engine.set_volume(0, 0x4000, 0x4000).unwrap();
//! engine.shutdown();
//! ```

#![warn(missing_docs)]

pub mod backend; // Output line abstraction and in-memory capture
pub mod buffer; // Double-buffered sample storage with carry tails
pub mod control; // Producer registry and volume control
pub mod engine; // Init/shutdown lifecycle
pub mod frame; // Stereo frames and alignment arithmetic
mod render; // Per-channel render loop
pub mod streaming; // Ring buffer and rodio output

use std::collections::TryReserveError;

/// Error types for engine operations
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Sample buffer memory could not be allocated
    #[error("Failed to allocate a sample buffer of {frames} frames")]
    Allocation {
        /// Requested buffer size in frames
        frames: usize,
        /// Allocator failure, absent when the size itself overflowed
        #[source]
        source: Option<TryReserveError>,
    },

    /// No hardware output line could be reserved
    #[error("No output line available for channel {channel}: {reason}")]
    HardwareReservation {
        /// Channel that failed to reserve
        channel: usize,
        /// Backend-specific reason
        reason: String,
    },

    /// The OS refused to start a render thread
    #[error("Failed to start render thread for channel {channel}: {source}")]
    ThreadStart {
        /// Channel whose thread failed to start
        channel: usize,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Channel index outside the engine's channel range
    #[error("Channel {channel} out of range (engine has {count} channels)")]
    InvalidChannel {
        /// Requested channel
        channel: usize,
        /// Number of channels in the engine
        count: usize,
    },

    /// Operation on an engine that has already been shut down
    #[error("Audio engine has been shut down")]
    ShutDown,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Audio device error during dispatch
    #[error("Audio device error: {0}")]
    Device(String),

    /// WAV encoding error
    #[cfg(feature = "export-wav")]
    #[error("WAV export error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

// Public API exports
pub use backend::{CaptureBackend, Dispatch};
pub use backend::{OutputBackend, OutputLine, MAX_VOLUME};
pub use buffer::{BufferPair, CarryTail, SampleBuffer};
pub use control::{SampleSource, StereoVolume};
pub use engine::{AudioEngine, EngineConfig};
pub use frame::{Frame, DEFAULT_SAMPLE_COUNT, GUARD_FRAMES, SAMPLE_ALIGN};

#[cfg(feature = "streaming")]
pub use streaming::{AudioDevice, RodioBackend};
pub use streaming::RingBuffer;
