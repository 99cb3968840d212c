//! Per-channel render loop
//!
//! One [`ChannelRenderer`] runs on each channel's render thread. A cycle:
//!
//! 1. takes the carry tail out of the buffer rendered last cycle and copies it
//!    to the front of the current buffer
//! 2. asks the registered producer for the rest of the nominal length, or
//!    fills it with silence when no producer is registered
//! 3. keeps the unaligned remainder in place as the current buffer's tail
//! 4. dispatches the aligned prefix to the output line
//! 5. flips to the other buffer
//!
//! A producer that panics is detached and the channel carries on with
//! silence. A failing line is reported once per run of failures.

use crate::backend::OutputLine;
use crate::buffer::BufferPair;
use crate::control::{ChannelControl, Producer};
use crate::frame::{align_down, Frame};
use crate::streaming::BUFFER_BACKOFF_MICROS;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Resources a render thread hands back when it exits
pub(crate) struct RenderParts {
    pub(crate) line: Box<dyn OutputLine>,
    pub(crate) buffers: BufferPair,
}

pub(crate) struct ChannelRenderer {
    channel: usize,
    buffers: BufferPair,
    active: usize,
    line: Box<dyn OutputLine>,
    control: Arc<ChannelControl>,
    overrun_reported: bool,
    /// Consecutive failed dispatches
    failed_dispatches: usize,
}

impl ChannelRenderer {
    pub(crate) fn new(
        channel: usize,
        buffers: BufferPair,
        line: Box<dyn OutputLine>,
        control: Arc<ChannelControl>,
    ) -> Self {
        ChannelRenderer {
            channel,
            buffers,
            active: 0,
            line,
            control,
            overrun_reported: false,
            failed_dispatches: 0,
        }
    }

    pub(crate) fn channel(&self) -> usize {
        self.channel
    }

    /// Render until `stop` is raised, then hand the line and buffers back
    pub(crate) fn run(mut self, stop: &AtomicBool) -> RenderParts {
        log::debug!("Render thread for channel {} started", self.channel);

        while !stop.load(Ordering::Acquire) {
            if self.render_cycle() == 0 {
                // Nothing aligned to send; the line gave no backpressure this cycle
                std::thread::sleep(Duration::from_micros(BUFFER_BACKOFF_MICROS));
            }
        }

        log::debug!("Render thread for channel {} stopped", self.channel);
        RenderParts {
            line: self.line,
            buffers: self.buffers,
        }
    }

    /// Run one cycle, returning the number of frames dispatched
    pub(crate) fn render_cycle(&mut self) -> usize {
        let nominal = self.buffers.nominal_len();
        let (cur, prev) = self.buffers.split(self.active);

        let carried = prev.move_tail_into(cur);
        cur.clear_tail();
        let budget = nominal - carried;

        let total = match self.control.registry.current() {
            Some(producer) => {
                let region = &mut cur.frames_mut()[carried..nominal];
                match render_guarded(&producer, region) {
                    Some(produced) => {
                        if produced > budget && !self.overrun_reported {
                            log::warn!(
                                "Producer on channel {} reported {produced} frames for a \
                                 budget of {budget}; clamping",
                                self.channel
                            );
                            self.overrun_reported = true;
                        }
                        carried + produced.min(budget)
                    }
                    None => {
                        if self.control.registry.detach(&producer) {
                            log::error!(
                                "Producer on channel {} panicked; detached, rendering silence",
                                self.channel
                            );
                        }
                        carried
                    }
                }
            }
            None => {
                cur.frames_mut()[carried..nominal].fill(Frame::SILENCE);
                nominal
            }
        };

        let aligned = align_down(total);
        cur.keep_tail(aligned, total - aligned);

        if aligned > 0 {
            let volume = self.control.volume.get();
            match self.line.output_blocking(&cur.frames()[..aligned], volume) {
                Ok(()) => {
                    if self.failed_dispatches > 0 {
                        log::info!(
                            "Dispatch on channel {} recovered after {} failure(s)",
                            self.channel,
                            self.failed_dispatches
                        );
                        self.failed_dispatches = 0;
                    }
                }
                Err(err) => {
                    if self.failed_dispatches == 0 {
                        log::warn!("Dispatch on channel {} failed: {err}", self.channel);
                    }
                    self.failed_dispatches += 1;
                }
            }
        }

        self.active ^= 1;
        aligned
    }

    #[cfg(test)]
    pub(crate) fn buffers(&self) -> &BufferPair {
        &self.buffers
    }
}

/// Run the producer, returning `None` if it panicked
///
/// Frames it wrote before panicking are discarded with the rest of the cycle.
fn render_guarded(producer: &Producer, region: &mut [Frame]) -> Option<usize> {
    panic::catch_unwind(AssertUnwindSafe(|| producer.lock().render(region))).ok()
}
