//! Cross-thread channel controls
//!
//! The producer slot, the volume word and the pause flag are the only state a
//! host thread shares with a render thread. All three are updated with single
//! atomic stores, so the render thread sees either the old or the new value
//! and never a mix of the two.

use crate::frame::Frame;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Producer of stereo frames for one channel
///
/// Called once per render cycle on the channel's render thread. Implementors
/// write at most `out.len()` frames to the front of `out` and return how many
/// they wrote. The call must not block and must not call back into the engine.
///
/// Any `FnMut(&mut [Frame]) -> usize + Send` closure is a `SampleSource`; the
/// closure's captured state plays the role of the callback context.
pub trait SampleSource: Send {
    /// Render up to `out.len()` frames, returning the number produced
    fn render(&mut self, out: &mut [Frame]) -> usize;
}

impl<F> SampleSource for F
where
    F: FnMut(&mut [Frame]) -> usize + Send,
{
    fn render(&mut self, out: &mut [Frame]) -> usize {
        self(out)
    }
}

/// Registered producer, locked only by the render thread while it renders
pub(crate) type Producer = Mutex<Box<dyn SampleSource>>;

/// Attach/detach point for a channel's producer
pub(crate) struct CallbackRegistry {
    producer: ArcSwapOption<Producer>,
    paused: AtomicBool,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        CallbackRegistry {
            producer: ArcSwapOption::empty(),
            paused: AtomicBool::new(false),
        }
    }

    /// Replace the producer; returns whether one was registered before
    pub(crate) fn set(&self, source: Option<Box<dyn SampleSource>>) -> bool {
        let next = source.map(|source| Arc::new(Mutex::new(source)));
        self.producer.swap(next).is_some()
    }

    /// Producer to use for this cycle, `None` when detached or paused
    pub(crate) fn current(&self) -> Option<Arc<Producer>> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        self.producer.load_full()
    }

    /// Detach `producer` unless the host has already replaced it
    pub(crate) fn detach(&self, producer: &Arc<Producer>) -> bool {
        let expected = Some(Arc::clone(producer));
        let previous = self.producer.compare_and_swap(&expected, None);
        previous
            .as_ref()
            .is_some_and(|previous| Arc::ptr_eq(previous, producer))
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.producer.load().is_some()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Left/right output volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StereoVolume {
    /// Left volume
    pub left: u16,
    /// Right volume
    pub right: u16,
}

impl StereoVolume {
    /// Build a volume, clamping each side independently into `[0, max]`
    pub fn clamped(left: i32, right: i32, max: u16) -> Self {
        let clamp = |value: i32| value.clamp(0, i32::from(max)) as u16;
        StereoVolume {
            left: clamp(left),
            right: clamp(right),
        }
    }

    /// Scale a frame by this volume, where `max` is unity gain
    pub fn apply(self, frame: Frame, max: u16) -> Frame {
        if max == 0 {
            return Frame::SILENCE;
        }
        let scale = |sample: i16, volume: u16| {
            let scaled = i32::from(sample) * i32::from(volume) / i32::from(max);
            scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        };
        Frame {
            left: scale(frame.left, self.left),
            right: scale(frame.right, self.right),
        }
    }

    fn pack(self) -> u32 {
        (u32::from(self.left) << 16) | u32::from(self.right)
    }

    fn unpack(word: u32) -> Self {
        StereoVolume {
            left: (word >> 16) as u16,
            right: word as u16,
        }
    }
}

/// Volume of one channel, both sides stored in a single atomic word
pub(crate) struct VolumeControl {
    word: AtomicU32,
    max: u16,
}

impl VolumeControl {
    /// Start at full volume on both sides
    pub(crate) fn new(max: u16) -> Self {
        let full = StereoVolume {
            left: max,
            right: max,
        };
        VolumeControl {
            word: AtomicU32::new(full.pack()),
            max,
        }
    }

    pub(crate) fn set(&self, left: i32, right: i32) -> StereoVolume {
        let volume = StereoVolume::clamped(left, right, self.max);
        self.word.store(volume.pack(), Ordering::Release);
        volume
    }

    pub(crate) fn get(&self) -> StereoVolume {
        StereoVolume::unpack(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn max(&self) -> u16 {
        self.max
    }
}

/// Everything a host thread may change on a running channel
pub(crate) struct ChannelControl {
    pub(crate) registry: CallbackRegistry,
    pub(crate) volume: VolumeControl,
}

impl ChannelControl {
    pub(crate) fn new(max_volume: u16) -> Self {
        ChannelControl {
            registry: CallbackRegistry::new(),
            volume: VolumeControl::new(max_volume),
        }
    }
}
