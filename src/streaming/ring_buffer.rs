//! Ring buffer between a render thread and the system audio callback
//!
//! A ring buffer (circular buffer) lets two threads operate concurrently:
//! - Producer: a channel's output line, writing panned interleaved samples
//! - Consumer: the audio device callback, reading samples for playback
//!
//! Memory consumption is fixed at capacity * sizeof(f32).
//! Uses mutex-based storage access with atomic position tracking for visibility.

use crate::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ring buffer for streaming interleaved audio samples
///
/// # Thread Safety
/// - One producer thread (output line)
/// - One consumer thread (audio playback)
/// - Storage sits behind a parking_lot::Mutex; positions are atomics so fill
///   queries never take the lock
#[derive(Debug)]
pub struct RingBuffer {
    /// Shared sample storage
    buffer: Mutex<Vec<f32>>,
    /// Write position (producer)
    write_pos: AtomicUsize,
    /// Read position (consumer)
    read_pos: AtomicUsize,
    /// Capacity (power of 2)
    capacity: usize,
    /// Capacity mask: `pos & mask == pos % capacity`
    mask: usize,
}

impl RingBuffer {
    /// Create a new ring buffer
    /// Capacity is rounded up to the next power of 2
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the requested capacity is 0 or would
    /// exceed 512 MB of samples.
    pub fn new(requested_capacity: usize) -> Result<Self> {
        if requested_capacity == 0 {
            return Err(EngineError::Config(
                "Ring buffer capacity must be greater than 0".into(),
            ));
        }

        const MAX_CAPACITY: usize = 512 * 1024 * 1024 / std::mem::size_of::<f32>();
        let capacity = requested_capacity
            .checked_next_power_of_two()
            .filter(|capacity| *capacity <= MAX_CAPACITY)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "Ring buffer capacity {requested_capacity} exceeds maximum safe size \
                     {MAX_CAPACITY}"
                ))
            })?;

        Ok(RingBuffer {
            buffer: Mutex::new(vec![0.0; capacity]),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        })
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples available to read
    pub fn available_read(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Number of samples that can be written without overwriting unread data
    pub fn available_write(&self) -> usize {
        self.capacity - self.available_read() - 1
    }

    /// Write samples to the buffer (producer)
    /// Returns the number of samples written, 0 if the buffer is full
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = self.capacity - write_pos.wrapping_sub(read_pos) - 1;

        let to_write = samples.len().min(available);
        if to_write == 0 {
            return 0;
        }

        let write_idx = write_pos & self.mask;
        if write_idx + to_write <= self.capacity {
            buf[write_idx..write_idx + to_write].copy_from_slice(&samples[..to_write]);
        } else {
            let first_part = self.capacity - write_idx;
            buf[write_idx..].copy_from_slice(&samples[..first_part]);
            buf[..to_write - first_part].copy_from_slice(&samples[first_part..to_write]);
        }

        drop(buf);

        self.write_pos
            .store(write_pos.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// Read samples from the buffer (consumer)
    /// Returns the number of samples read
    pub fn read(&self, dest: &mut [f32]) -> usize {
        let buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = write_pos.wrapping_sub(read_pos);

        let to_read = dest.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let read_idx = read_pos & self.mask;
        if read_idx + to_read <= self.capacity {
            dest[..to_read].copy_from_slice(&buf[read_idx..read_idx + to_read]);
        } else {
            let first_part = self.capacity - read_idx;
            dest[..first_part].copy_from_slice(&buf[read_idx..]);
            dest[first_part..to_read].copy_from_slice(&buf[..to_read - first_part]);
        }

        drop(buf);

        self.read_pos
            .store(read_pos.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// Drain and discard all pending samples
    pub fn flush(&self) {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write_pos, Ordering::Release);
    }

    /// Fill percentage (0.0 to 1.0)
    pub fn fill_percentage(&self) -> f32 {
        (self.available_read() as f32) / (self.capacity as f32)
    }
}
