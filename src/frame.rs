//! Stereo frames and output alignment arithmetic
//!
//! The output DMA only accepts dispatches whose length is a multiple of
//! [`SAMPLE_ALIGN`] frames. Buffers reserve an extra [`GUARD_FRAMES`] so an
//! unaligned tail always fits.

/// Output DMA granularity in frames
pub const SAMPLE_ALIGN: usize = 64;

/// Extra frames reserved at the end of every buffer for carry tails
pub const GUARD_FRAMES: usize = 64;

/// Sample count used when the caller passes a hint of 0
pub const DEFAULT_SAMPLE_COUNT: usize = 512;

/// One stereo sample pair (signed 16-bit PCM)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Frame {
    /// Left sample
    pub left: i16,
    /// Right sample
    pub right: i16,
}

impl Frame {
    /// Digital silence
    pub const SILENCE: Frame = Frame { left: 0, right: 0 };

    /// Create a frame from explicit left/right samples
    pub const fn new(left: i16, right: i16) -> Self {
        Frame { left, right }
    }

    /// Create a frame carrying the same sample on both sides
    pub const fn mono(sample: i16) -> Self {
        Frame {
            left: sample,
            right: sample,
        }
    }

    /// Check whether both samples are zero
    pub const fn is_silent(&self) -> bool {
        self.left == 0 && self.right == 0
    }
}

/// Round `count` up to the next multiple of [`SAMPLE_ALIGN`]
///
/// Returns `None` on overflow.
pub const fn align_up(count: usize) -> Option<usize> {
    match count.checked_add(SAMPLE_ALIGN - 1) {
        Some(padded) => Some(padded & !(SAMPLE_ALIGN - 1)),
        None => None,
    }
}

/// Round `count` down to a multiple of [`SAMPLE_ALIGN`]
pub const fn align_down(count: usize) -> usize {
    count & !(SAMPLE_ALIGN - 1)
}

/// Total buffer capacity (aligned hint plus guard) for a sample count hint
///
/// A hint of 0 selects [`DEFAULT_SAMPLE_COUNT`]. Returns `None` on overflow.
pub const fn buffer_capacity(sample_count_hint: usize) -> Option<usize> {
    let hint = if sample_count_hint == 0 {
        DEFAULT_SAMPLE_COUNT
    } else {
        sample_count_hint
    };
    match align_up(hint) {
        Some(aligned) => aligned.checked_add(GUARD_FRAMES),
        None => None,
    }
}
