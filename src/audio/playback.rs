//! Gapless playback scheduling against a shared audio clock.
//!
//! Each decoded buffer is scheduled at `max(next_start, now)`: a late
//! buffer starts immediately instead of leaving a silence gap, and an
//! early one waits for the previous buffer to finish instead of
//! overlapping it.

use std::collections::VecDeque;

use super::codec::PlayableBuffer;

/// Output device capable of scheduling buffers on its own clock.
pub trait AudioOutput: Send {
    /// Current position of the device clock, in seconds.
    fn now(&self) -> f64;

    /// Schedule `buffer` to start at `start_at` seconds on the device clock.
    /// Returns a handle that can later be passed to [`AudioOutput::stop`].
    fn schedule(&mut self, buffer: &PlayableBuffer, start_at: f64) -> anyhow::Result<u64>;

    /// Stop a scheduled or playing buffer. Unknown handles are ignored.
    fn stop(&mut self, handle: u64);

    /// Release the underlying device.
    fn release(&mut self);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn schedule(&mut self, buffer: &PlayableBuffer, start_at: f64) -> anyhow::Result<u64> {
        (**self).schedule(buffer, start_at)
    }

    fn stop(&mut self, handle: u64) {
        (**self).stop(handle);
    }

    fn release(&mut self) {
        (**self).release();
    }
}

/// Placement of one buffer on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub handle: u64,
    pub start: f64,
    pub end: f64,
}

pub struct PlaybackQueue<O: AudioOutput> {
    output: O,
    next_start: f64,
    in_flight: VecDeque<ScheduledBuffer>,
    closed: bool,
}

impl<O: AudioOutput> PlaybackQueue<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_start: 0.0,
            in_flight: VecDeque::new(),
            closed: false,
        }
    }

    /// Schedule a buffer after everything already queued.
    ///
    /// Scheduling failures are logged and the chunk is dropped; the queue
    /// keeps its position so later chunks stay gapless.
    pub fn enqueue(&mut self, buffer: &PlayableBuffer) -> Option<ScheduledBuffer> {
        if self.closed || buffer.is_empty() {
            return None;
        }

        let now = self.output.now();
        self.prune(now);

        let start = self.next_start.max(now);
        let handle = match self.output.schedule(buffer, start) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, start, "Dropping audio chunk: schedule failed");
                return None;
            }
        };

        let end = start + buffer.duration_secs();
        self.next_start = end;
        let placed = ScheduledBuffer { handle, start, end };
        self.in_flight.push_back(placed);
        Some(placed)
    }

    /// Barge-in: stop whatever is audible and discard the pending queue.
    pub fn clear(&mut self) {
        let stopped = self.in_flight.len();
        for scheduled in self.in_flight.drain(..) {
            self.output.stop(scheduled.handle);
        }
        self.next_start = 0.0;
        if stopped > 0 {
            tracing::debug!(stopped, "Playback queue cleared");
        }
    }

    /// Whether any scheduled buffer is still audible.
    pub fn is_playing(&self) -> bool {
        let now = self.output.now();
        self.in_flight.iter().any(|s| s.end > now)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop playback and release the output device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.clear();
        self.output.release();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    fn prune(&mut self, now: f64) {
        while self.in_flight.front().is_some_and(|s| s.end <= now) {
            self.in_flight.pop_front();
        }
    }
}

impl<O: AudioOutput> Drop for PlaybackQueue<O> {
    fn drop(&mut self) {
        self.close();
    }
}
