//! Engine lifecycle
//!
//! [`AudioEngine::init`] brings channels up in three stages: allocate every
//! buffer pair, reserve every output line, then start every render thread.
//! A failure at any stage unwinds everything acquired so far, so a failed
//! init leaves nothing allocated or reserved.
//!
//! Shutdown is cooperative: the stop flag is raised, every render thread is
//! joined, and only then are the lines released and the buffers freed.

use crate::backend::{OutputBackend, OutputLine};
use crate::buffer::BufferPair;
use crate::control::{ChannelControl, SampleSource, StereoVolume};
use crate::frame::{buffer_capacity, DEFAULT_SAMPLE_COUNT, GUARD_FRAMES};
use crate::render::{ChannelRenderer, RenderParts};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Largest number of channels an engine may drive
pub const MAX_CHANNELS: usize = 8;

/// Default render thread name prefix; threads are named `audiot0`, `audiot1`, ...
pub const DEFAULT_THREAD_NAME: &str = "audiot";

/// Default render thread stack size in bytes
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Configuration for engine initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requested frames per render cycle (0 selects 512)
    ///
    /// Rounded up to a multiple of 64; the buffers add a 64-frame guard.
    pub sample_count: usize,

    /// Number of independent output channels
    pub channels: usize,

    /// Render thread name prefix
    pub thread_name: String,

    /// Render thread stack size in bytes (0 = platform default)
    pub stack_size: usize,
}

impl EngineConfig {
    /// Create a configuration for `channels` channels of `sample_count` frames
    pub fn new(sample_count: usize, channels: usize) -> Self {
        EngineConfig {
            sample_count,
            channels,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("Failed to parse engine config: {e}")))
    }

    /// Check the configuration before anything is allocated
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(EngineError::Config(format!(
                "channel count {} outside 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        if self.thread_name.contains('\0') {
            return Err(EngineError::Config(
                "thread name may not contain NUL bytes".into(),
            ));
        }
        Ok(())
    }

    /// Buffer capacity in frames, guard included
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Allocation`] when the aligned size overflows.
    pub fn capacity(&self) -> Result<usize> {
        buffer_capacity(self.sample_count).ok_or(EngineError::Allocation {
            frames: self.sample_count,
            source: None,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_count: DEFAULT_SAMPLE_COUNT,
            channels: 1,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

struct ChannelSlot {
    control: Arc<ChannelControl>,
    worker: Option<JoinHandle<RenderParts>>,
}

/// Running set of output channels
///
/// Dropping the engine shuts it down.
pub struct AudioEngine {
    channels: Vec<ChannelSlot>,
    stop: Arc<AtomicBool>,
    capacity: usize,
    running: bool,
}

impl AudioEngine {
    /// Allocate buffers, reserve lines and start one render thread per channel
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] for an invalid configuration
    /// - [`EngineError::Allocation`] when a buffer cannot be allocated
    /// - [`EngineError::HardwareReservation`] when the backend has no free line
    /// - [`EngineError::ThreadStart`] when a render thread cannot be spawned
    ///
    /// In every error case nothing stays allocated or reserved.
    pub fn init(config: &EngineConfig, backend: &dyn OutputBackend) -> Result<Self> {
        Self::init_staged(config, backend, allocate_buffers, spawn_render_thread)
    }

    /// Initialize with default thread settings
    pub fn with_defaults(
        sample_count_hint: usize,
        channel_count: usize,
        backend: &dyn OutputBackend,
    ) -> Result<Self> {
        Self::init(&EngineConfig::new(sample_count_hint, channel_count), backend)
    }

    /// Staged init with the buffer allocator and thread spawner supplied
    fn init_staged<A, S>(
        config: &EngineConfig,
        backend: &dyn OutputBackend,
        mut allocate: A,
        mut spawn: S,
    ) -> Result<Self>
    where
        A: FnMut(usize, usize) -> Result<BufferPair>,
        S: FnMut(&EngineConfig, ChannelRenderer, Arc<AtomicBool>) -> SpawnResult,
    {
        config.validate()?;
        let capacity = config.capacity()?;
        let count = config.channels;

        // Stage 1: buffers. Collecting into a Result drops every pair
        // allocated so far on the first failure.
        let buffers = (0..count)
            .map(|channel| allocate(channel, capacity))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|err| log::error!("Audio buffer allocation failed: {err}"))?;

        // Stage 2: output lines
        let mut lines: Vec<Box<dyn OutputLine>> = Vec::with_capacity(count);
        for channel in 0..count {
            match backend.reserve(channel, capacity) {
                Ok(line) => lines.push(line),
                Err(err) => {
                    log::error!("Output line reservation failed: {err}");
                    release_lines(lines);
                    drop(buffers);
                    return Err(err);
                }
            }
        }

        // Stage 3: render threads
        let stop = Arc::new(AtomicBool::new(false));
        let max_volume = backend.max_volume();
        let controls: Vec<Arc<ChannelControl>> = (0..count)
            .map(|_| Arc::new(ChannelControl::new(max_volume)))
            .collect();

        let mut workers = Vec::with_capacity(count);
        let mut pending = lines.into_iter().zip(buffers);
        for (channel, control) in controls.iter().enumerate() {
            let Some((line, pair)) = pending.next() else {
                break;
            };
            let renderer = ChannelRenderer::new(channel, pair, line, Arc::clone(control));
            match spawn(config, renderer, Arc::clone(&stop)) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    log::error!("Render thread for channel {channel} failed to start: {source}");
                    stop.store(true, Ordering::Release);
                    let parts = join_workers(workers.into_iter().map(Some).collect());
                    let (lines, buffers): (Vec<_>, Vec<_>) = parts
                        .into_iter()
                        .map(|parts| (parts.line, parts.buffers))
                        .chain(pending)
                        .unzip();
                    release_lines(lines);
                    drop(buffers);
                    return Err(EngineError::ThreadStart { channel, source });
                }
            }
        }

        log::info!(
            "Audio engine started: {count} channel(s), {capacity} frames per buffer ({} per cycle)",
            capacity - GUARD_FRAMES
        );

        Ok(AudioEngine {
            channels: controls
                .into_iter()
                .zip(workers)
                .map(|(control, worker)| ChannelSlot {
                    control,
                    worker: Some(worker),
                })
                .collect(),
            stop,
            capacity,
            running: true,
        })
    }

    /// Stop every render thread and release all lines and buffers
    ///
    /// Waits for each thread to finish its current cycle. Calling this again
    /// is a no-op.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.stop.store(true, Ordering::Release);

        let workers = self.channels.iter_mut().map(|slot| slot.worker.take()).collect();
        let (lines, buffers): (Vec<_>, Vec<_>) = join_workers(workers)
            .into_iter()
            .map(|parts| (parts.line, parts.buffers))
            .unzip();
        let released = lines.len();
        release_lines(lines);
        drop(buffers);

        log::info!("Audio engine shut down ({released} line(s) released)");
    }

    /// Whether the render threads are running
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Buffer capacity in frames, guard included
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames available to a producer per cycle (capacity minus guard)
    pub fn aligned_capacity(&self) -> usize {
        self.capacity - GUARD_FRAMES
    }

    /// Attach `source` as the producer for `channel`, replacing any previous one
    pub fn set_callback<S>(&self, channel: usize, source: S) -> Result<()>
    where
        S: SampleSource + 'static,
    {
        self.set_callback_boxed(channel, Some(Box::new(source)))
    }

    /// Detach the producer from `channel`; the channel renders silence
    pub fn clear_callback(&self, channel: usize) -> Result<()> {
        self.set_callback_boxed(channel, None)
    }

    /// Replace or detach the producer for `channel`
    ///
    /// A cycle already rendering with the previous producer finishes with it;
    /// the next cycle uses the new one.
    pub fn set_callback_boxed(
        &self,
        channel: usize,
        source: Option<Box<dyn SampleSource>>,
    ) -> Result<()> {
        let attach = source.is_some();
        let replaced = self.control(channel)?.registry.set(source);
        log::debug!(
            "Channel {channel}: producer {}{}",
            if attach { "attached" } else { "detached" },
            if replaced { " (replaced previous)" } else { "" }
        );
        Ok(())
    }

    /// Whether a producer is registered on `channel`
    pub fn has_callback(&self, channel: usize) -> Result<bool> {
        Ok(self.control(channel)?.registry.is_registered())
    }

    /// Render silence on `channel` without detaching its producer
    pub fn pause(&self, channel: usize) -> Result<()> {
        self.control(channel)?.registry.set_paused(true);
        Ok(())
    }

    /// Resume rendering from the producer on `channel`
    pub fn resume(&self, channel: usize) -> Result<()> {
        self.control(channel)?.registry.set_paused(false);
        Ok(())
    }

    /// Whether `channel` is paused
    pub fn is_paused(&self, channel: usize) -> Result<bool> {
        Ok(self.control(channel)?.registry.is_paused())
    }

    /// Set the panning of `channel`
    ///
    /// Each side is clamped into `[0, max_volume]`; out-of-range values are
    /// never rejected. Takes effect at the next dispatch. Returns the stored
    /// volume.
    pub fn set_volume(&self, channel: usize, left: i32, right: i32) -> Result<StereoVolume> {
        Ok(self.control(channel)?.volume.set(left, right))
    }

    /// Current panning of `channel`
    pub fn volume(&self, channel: usize) -> Result<StereoVolume> {
        Ok(self.control(channel)?.volume.get())
    }

    /// Unity-gain volume value of the backend the engine was started on
    pub fn max_volume(&self) -> u16 {
        self.channels
            .first()
            .map_or(crate::MAX_VOLUME, |slot| slot.control.volume.max())
    }

    fn control(&self, channel: usize) -> Result<&ChannelControl> {
        if !self.running {
            return Err(EngineError::ShutDown);
        }
        self.channels
            .get(channel)
            .map(|slot| slot.control.as_ref())
            .ok_or(EngineError::InvalidChannel {
                channel,
                count: self.channels.len(),
            })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type SpawnResult = io::Result<JoinHandle<RenderParts>>;

fn allocate_buffers(_channel: usize, capacity: usize) -> Result<BufferPair> {
    BufferPair::allocate(capacity)
}

fn spawn_render_thread(
    config: &EngineConfig,
    renderer: ChannelRenderer,
    stop: Arc<AtomicBool>,
) -> SpawnResult {
    let mut builder =
        thread::Builder::new().name(format!("{}{}", config.thread_name, renderer.channel()));
    if config.stack_size > 0 {
        builder = builder.stack_size(config.stack_size);
    }
    builder.spawn(move || renderer.run(&stop))
}

/// Join render threads, collecting the resources they hand back
///
/// A thread that panicked lost its line and buffers during unwinding; it is
/// logged and skipped.
fn join_workers(workers: Vec<Option<JoinHandle<RenderParts>>>) -> Vec<RenderParts> {
    workers
        .into_iter()
        .enumerate()
        .filter_map(|(channel, worker)| {
            let worker = worker?;
            match worker.join() {
                Ok(parts) => Some(parts),
                Err(_) => {
                    log::error!("Render thread for channel {channel} panicked");
                    None
                }
            }
        })
        .collect()
}

fn release_lines(lines: Vec<Box<dyn OutputLine>>) {
    let count = lines.len();
    drop(lines);
    if count > 0 {
        log::debug!("Released {count} output line(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CaptureBackend;
    use std::time::Duration;

    fn failing_spawner(
        fail_on: usize,
    ) -> impl FnMut(&EngineConfig, ChannelRenderer, Arc<AtomicBool>) -> SpawnResult {
        move |config, renderer, stop| {
            if renderer.channel() == fail_on {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"));
            }
            spawn_render_thread(config, renderer, stop)
        }
    }

    #[test]
    fn test_thread_start_failure_rolls_back() {
        let backend = CaptureBackend::new();
        let config = EngineConfig::new(256, 2);
        let result =
            AudioEngine::init_staged(&config, &backend, allocate_buffers, failing_spawner(1));

        assert!(matches!(
            result,
            Err(EngineError::ThreadStart { channel: 1, .. })
        ));
        assert_eq!(backend.active_lines(), 0);
        assert_eq!(backend.released_lines(), 2);
    }

    #[test]
    fn test_first_thread_failure_rolls_back() {
        let backend = CaptureBackend::new();
        let config = EngineConfig::new(256, 2);
        let result =
            AudioEngine::init_staged(&config, &backend, allocate_buffers, failing_spawner(0));

        assert!(matches!(
            result,
            Err(EngineError::ThreadStart { channel: 0, .. })
        ));
        assert_eq!(backend.active_lines(), 0);
        assert_eq!(backend.dispatch_count(0), 0);
        assert_eq!(backend.dispatch_count(1), 0);
    }

    #[test]
    fn test_started_thread_is_joined_on_rollback() {
        let backend = CaptureBackend::new().with_pacing(Duration::from_millis(2));
        let result = AudioEngine::init_staged(
            &EngineConfig::new(64, 3),
            &backend,
            allocate_buffers,
            failing_spawner(2),
        );
        assert!(result.is_err());

        // Nothing renders after init returns
        let settled = backend.dispatch_count(0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.dispatch_count(0), settled);
        assert_eq!(backend.active_lines(), 0);
    }

    #[test]
    fn test_second_allocation_failure_rolls_back() {
        let backend = CaptureBackend::new();
        let allocated = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let allocate = {
            let allocated = Arc::clone(&allocated);
            move |channel: usize, capacity: usize| -> Result<BufferPair> {
                if channel == 1 {
                    return Err(EngineError::Allocation {
                        frames: capacity,
                        source: None,
                    });
                }
                let pair = BufferPair::allocate(capacity)?;
                allocated.lock().push(channel);
                Ok(pair)
            }
        };

        let result = AudioEngine::init_staged(
            &EngineConfig::new(256, 2),
            &backend,
            allocate,
            spawn_render_thread,
        );

        assert!(matches!(
            result,
            Err(EngineError::Allocation { frames: 320, .. })
        ));
        assert_eq!(*allocated.lock(), vec![0]);
        assert_eq!(backend.total_reservations(), 0);
        assert_eq!(backend.active_lines(), 0);
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_count, 512);
        assert_eq!(config.channels, 1);
        assert_eq!(config.thread_name, "audiot");
        assert_eq!(config.capacity().unwrap(), 576);
    }

    #[test]
    fn test_config_from_json() {
        let config = EngineConfig::from_json(r#"{ "sample_count": 500, "channels": 2 }"#).unwrap();
        assert_eq!(config.sample_count, 500);
        assert_eq!(config.channels, 2);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);

        assert!(matches!(
            EngineConfig::from_json("{ \"channels\": \"two\" }"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::new(512, 0).validate().is_err());
        assert!(EngineConfig::new(512, MAX_CHANNELS + 1).validate().is_err());
        assert!(EngineConfig::new(512, MAX_CHANNELS).validate().is_ok());

        let mut config = EngineConfig::default();
        config.thread_name = "bad\0name".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threads_are_named() {
        let backend = CaptureBackend::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let engine = AudioEngine::with_defaults(64, 1, &backend).unwrap();
        {
            let seen = Arc::clone(&seen);
            engine
                .set_callback(0, move |out: &mut [crate::Frame]| {
                    *seen.lock() = thread::current().name().map(str::to_owned);
                    out.len()
                })
                .unwrap();
        }

        for _ in 0..200 {
            if seen.lock().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        drop(engine);
        assert_eq!(seen.lock().as_deref(), Some("audiot0"));
    }
}
