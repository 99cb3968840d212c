//! Double-buffered sample storage
//!
//! Each channel renders into a [`BufferPair`] in strict ping-pong order. When a
//! cycle produces a frame count that is not a multiple of
//! [`SAMPLE_ALIGN`](crate::SAMPLE_ALIGN), the unaligned suffix stays in place
//! in the buffer that rendered it and is recorded as a [`CarryTail`]. The next
//! cycle takes that tail out of the other buffer and copies it to the front of
//! its own.

use crate::frame::{Frame, GUARD_FRAMES};
use crate::{EngineError, Result};
use std::ops::Range;

/// Rendered frames that missed the last dispatch
///
/// Not `Clone`: a tail is taken out of its buffer exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct CarryTail {
    offset: usize,
    len: usize,
}

impl CarryTail {
    /// Frame offset of the tail inside its buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of frames in the tail
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tail holds no frames
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Fixed-capacity stereo sample storage for one render cycle plus guard
#[derive(Debug)]
pub struct SampleBuffer {
    frames: Box<[Frame]>,
    tail: Option<CarryTail>,
}

impl SampleBuffer {
    /// Allocate a silence-initialized buffer of `capacity` frames
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Allocation`] if the allocator refuses the request
    /// or `capacity` is smaller than the guard region.
    pub fn allocate(capacity: usize) -> Result<Self> {
        if capacity < GUARD_FRAMES {
            return Err(EngineError::Allocation {
                frames: capacity,
                source: None,
            });
        }

        let mut frames = Vec::new();
        frames
            .try_reserve_exact(capacity)
            .map_err(|source| EngineError::Allocation {
                frames: capacity,
                source: Some(source),
            })?;
        frames.resize(capacity, Frame::SILENCE);

        Ok(SampleBuffer {
            frames: frames.into_boxed_slice(),
            tail: None,
        })
    }

    /// Total capacity in frames, guard included
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Per-cycle render target in frames (capacity minus guard)
    pub fn nominal_len(&self) -> usize {
        self.frames.len() - GUARD_FRAMES
    }

    /// Read access to the stored frames
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Carry tail left behind by the cycle that filled this buffer
    pub fn tail(&self) -> Option<&CarryTail> {
        self.tail.as_ref()
    }

    pub(crate) fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    pub(crate) fn take_tail(&mut self) -> Option<CarryTail> {
        self.tail.take()
    }

    pub(crate) fn clear_tail(&mut self) {
        self.tail = None;
    }

    /// Record `frames[offset..offset + len]` as unsent
    pub(crate) fn keep_tail(&mut self, offset: usize, len: usize) {
        debug_assert!(self.tail.is_none(), "carry tail set twice in one cycle");
        debug_assert!(offset + len <= self.capacity());
        if len > 0 {
            self.tail = Some(CarryTail { offset, len });
        }
    }

    /// Copy this buffer's tail frames (if any) into the front of `dest`
    ///
    /// Consumes the tail and returns the number of frames copied.
    pub(crate) fn move_tail_into(&mut self, dest: &mut SampleBuffer) -> usize {
        match self.take_tail() {
            Some(tail) => {
                dest.frames[..tail.len].copy_from_slice(&self.frames[tail.range()]);
                tail.len
            }
            None => 0,
        }
    }
}

/// Two equally sized buffers used in ping-pong order
#[derive(Debug)]
pub struct BufferPair {
    buffers: [SampleBuffer; 2],
}

impl BufferPair {
    /// Allocate both buffers of a pair
    ///
    /// Either both buffers exist or neither does: if the second allocation
    /// fails the first is freed before returning.
    pub fn allocate(capacity: usize) -> Result<Self> {
        let first = SampleBuffer::allocate(capacity)?;
        let second = SampleBuffer::allocate(capacity)?;
        Ok(BufferPair {
            buffers: [first, second],
        })
    }

    /// Capacity of each buffer in frames
    pub fn capacity(&self) -> usize {
        self.buffers[0].capacity()
    }

    /// Per-cycle render target in frames
    pub fn nominal_len(&self) -> usize {
        self.buffers[0].nominal_len()
    }

    /// Shared access to one buffer of the pair
    pub fn get(&self, index: usize) -> &SampleBuffer {
        &self.buffers[index & 1]
    }

    /// Split into `(current, previous)` for the given active index
    pub(crate) fn split(&mut self, active: usize) -> (&mut SampleBuffer, &mut SampleBuffer) {
        let (first, second) = self.buffers.split_at_mut(1);
        if active & 1 == 0 {
            (&mut first[0], &mut second[0])
        } else {
            (&mut second[0], &mut first[0])
        }
    }
}
