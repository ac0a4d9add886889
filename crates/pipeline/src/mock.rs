//! A simulated backend for exercising the coordinator without a GPU.
//!
//! Both devices are modelled as in-order queues on one simulated clock
//! measured in timestamp ticks. Submitting work never advances the clock;
//! only [`RelayBackend::acquire_target`] (by the configured acquire cost)
//! and [`RelayBackend::wait_for_value`] (up to the awaited completion) do.
//!
//! The backend checks the hazards the coordinator must prevent and writes
//! them to a shared [`MockJournal`] instead of failing, so tests can assert
//! on the whole run after [`Coordinator::shutdown`](crate::Coordinator::shutdown)
//! consumed the backend.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::backend::{PresentTarget, RelayBackend, RenderSubmit, TimestampPair, TransferSubmit};
use crate::error::{RelayError, RelayResult};
use crate::fence::{FenceRole, FenceValue};
use crate::ring::RetiredFrame;

/// Simulated durations, in ticks.
#[derive(Clone, Debug)]
pub struct MockTiming {
    /// Ticks per second reported as the timestamp frequency.
    pub frequency: u64,
    /// Producer work per frame.
    pub render_ticks: u64,
    /// Consumer copy per frame.
    pub copy_ticks: u64,
    /// Host time spent acquiring an image.
    pub acquire_ticks: u64,
    /// Extra consumer delay between the copy ending and the present fence
    /// signaling, indexed by frame modulo the length. Empty means none.
    pub retire_delays: Vec<u64>,
}

impl Default for MockTiming {
    fn default() -> Self {
        Self {
            frequency: 1_000_000,
            render_ticks: 300,
            copy_ticks: 500,
            acquire_ticks: 0,
            retire_delays: Vec::new(),
        }
    }
}

/// Something the simulated host or devices did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    Acquired { slot: usize, image: u32 },
    Rendered { slot: usize, frame: u64, value: u64 },
    Transferred { slot: usize, frame: u64, value: u64 },
    Presented { image: u32 },
    HostWait { value: FenceValue, until: u64 },
    TimestampsRead { slot: usize, frame: u64 },
    Released,
}

/// Observations shared between a [`MockBackend`] and the test driving it.
#[derive(Debug, Default)]
pub struct MockJournal {
    /// Events in the order the host issued them.
    pub events: Vec<MockEvent>,
    /// Hazards detected during the run.
    pub violations: Vec<String>,
    /// Render fence values in signal order.
    pub render_signals: Vec<u64>,
    /// Present fence values in signal order.
    pub present_signals: Vec<u64>,
    /// Set once the backend released its resources.
    pub released: bool,
}

impl MockJournal {
    /// Number of host waits issued.
    pub fn host_waits(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, MockEvent::HostWait { .. }))
            .count()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SlotTrack {
    /// Tick at which the last write to the slot finished.
    written_at: u64,
    /// Tick at which the last read of the slot finished.
    read_done_at: u64,
    /// Render value of the last write.
    render_value: u64,
    /// Copy timestamps of the last transfer and the frame they belong to.
    timestamps: Option<(u64, TimestampPair)>,
}

/// In-memory [`RelayBackend`].
pub struct MockBackend {
    depth: usize,
    timing: MockTiming,
    now: u64,
    producer_free_at: u64,
    consumer_free_at: u64,
    /// Completion tick of render value `n` at index `n - 1`.
    render_ready: Vec<u64>,
    /// Completion tick of present value `n` at index `n - 1`.
    present_ready: Vec<u64>,
    slots: Vec<SlotTrack>,
    next_image: u32,
    journal: Rc<RefCell<MockJournal>>,
}

impl MockBackend {
    /// A backend with `depth` slots and default timing.
    pub fn new(depth: usize) -> Self {
        Self::with_timing(depth, MockTiming::default())
    }

    /// A backend with `depth` slots and the given timing.
    pub fn with_timing(depth: usize, timing: MockTiming) -> Self {
        Self {
            depth,
            timing,
            now: 0,
            producer_free_at: 0,
            consumer_free_at: 0,
            render_ready: Vec::new(),
            present_ready: Vec::new(),
            slots: vec![SlotTrack::default(); depth],
            next_image: 0,
            journal: Rc::new(RefCell::new(MockJournal::default())),
        }
    }

    /// Handle on the journal that outlives the backend.
    pub fn journal(&self) -> Rc<RefCell<MockJournal>> {
        Rc::clone(&self.journal)
    }

    /// Current simulated tick.
    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    fn ready_list(&self, role: FenceRole) -> &[u64] {
        match role {
            FenceRole::Render => &self.render_ready,
            FenceRole::Present => &self.present_ready,
        }
    }

    fn ready_at(&self, value: FenceValue) -> Option<u64> {
        let index = usize::try_from(value.get()).ok()?.checked_sub(1)?;
        self.ready_list(value.role()).get(index).copied()
    }

    fn violation(&self, message: String) {
        trace!("mock violation: {}", message);
        self.journal.borrow_mut().violations.push(message);
    }

    fn event(&self, event: MockEvent) {
        self.journal.borrow_mut().events.push(event);
    }

    fn record_signal(&mut self, value: FenceValue, ready_at: u64) -> RelayResult<()> {
        let list = match value.role() {
            FenceRole::Render => &mut self.render_ready,
            FenceRole::Present => &mut self.present_ready,
        };
        let expected = list.len() as u64 + 1;
        if value.get() != expected {
            return Err(RelayError::FenceRegression {
                role: value.role(),
                value: value.get(),
                last: expected - 1,
            });
        }
        list.push(ready_at);

        let mut journal = self.journal.borrow_mut();
        match value.role() {
            FenceRole::Render => journal.render_signals.push(value.get()),
            FenceRole::Present => journal.present_signals.push(value.get()),
        }
        Ok(())
    }

    fn retire_delay(&self, frame: u64) -> u64 {
        let delays = &self.timing.retire_delays;
        if delays.is_empty() {
            0
        } else {
            delays[(frame % delays.len() as u64) as usize]
        }
    }
}

impl RelayBackend for MockBackend {
    fn ring_depth(&self) -> usize {
        self.depth
    }

    fn timestamp_frequency(&self) -> u64 {
        self.timing.frequency
    }

    fn acquire_target(&mut self, slot: usize) -> RelayResult<PresentTarget> {
        self.now += self.timing.acquire_ticks;
        let image = self.next_image;
        self.next_image = (self.next_image + 1) % self.depth.max(1) as u32;
        self.event(MockEvent::Acquired { slot, image });
        Ok(PresentTarget(image))
    }

    fn submit_render(&mut self, submit: &RenderSubmit) -> RelayResult<()> {
        let slot = submit.slot;
        let track = self.slots[slot];

        let gate = match submit.wait_present {
            Some(value) => self.ready_at(value).unwrap_or_else(|| {
                self.violation(format!(
                    "frame {} waits on unsignaled {}",
                    submit.frame, value
                ));
                u64::MAX / 2
            }),
            None => {
                if !submit.first_use {
                    self.violation(format!(
                        "frame {} rewrites slot {} without a present wait",
                        submit.frame, slot
                    ));
                }
                0
            }
        };

        let start = self.now.max(self.producer_free_at).max(gate);
        if start < track.read_done_at {
            self.violation(format!(
                "frame {} writes slot {} at {} while it is read until {}",
                submit.frame, slot, start, track.read_done_at
            ));
        }
        let done = start + self.timing.render_ticks;
        self.producer_free_at = done;
        self.record_signal(submit.signal_render, done)?;

        let track = &mut self.slots[slot];
        track.written_at = done;
        track.render_value = submit.signal_render.get();

        self.event(MockEvent::Rendered {
            slot,
            frame: submit.frame,
            value: submit.signal_render.get(),
        });
        Ok(())
    }

    fn submit_transfer(&mut self, submit: &TransferSubmit) -> RelayResult<()> {
        let slot = submit.slot;
        let track = self.slots[slot];

        if submit.wait_render.get() != track.render_value {
            self.violation(format!(
                "frame {} copies slot {} behind {} but it was written as render#{}",
                submit.frame, slot, submit.wait_render, track.render_value
            ));
        }
        let gate = self.ready_at(submit.wait_render).unwrap_or(u64::MAX / 2);

        let start = self.now.max(self.consumer_free_at).max(gate);
        if start < track.written_at {
            self.violation(format!(
                "frame {} reads slot {} at {} before its write finished at {}",
                submit.frame, slot, start, track.written_at
            ));
        }
        let end = start + self.timing.copy_ticks;
        let done = end + self.retire_delay(submit.frame);
        self.consumer_free_at = done;
        self.record_signal(submit.signal_present, done)?;

        let track = &mut self.slots[slot];
        track.read_done_at = done;
        track.timestamps = Some((submit.frame, TimestampPair { start, end }));

        self.event(MockEvent::Transferred {
            slot,
            frame: submit.frame,
            value: submit.signal_present.get(),
        });
        Ok(())
    }

    fn present(&mut self, target: PresentTarget) -> RelayResult<()> {
        self.event(MockEvent::Presented { image: target.0 });
        Ok(())
    }

    fn completed_value(&self, role: FenceRole) -> RelayResult<u64> {
        // Queues are in order, so completion ticks never decrease.
        let completed = self
            .ready_list(role)
            .iter()
            .take_while(|&&ready| ready <= self.now)
            .count();
        Ok(completed as u64)
    }

    fn wait_for_value(&mut self, value: FenceValue) -> RelayResult<()> {
        let Some(ready) = self.ready_at(value) else {
            return Err(RelayError::FenceOverrun {
                role: value.role(),
                completed: value.get(),
                signaled: self.ready_list(value.role()).len() as u64,
            });
        };
        self.now = self.now.max(ready);
        self.event(MockEvent::HostWait {
            value,
            until: self.now,
        });
        Ok(())
    }

    fn read_timestamps(&self, frame: &RetiredFrame) -> RelayResult<TimestampPair> {
        let retired = self
            .ready_at(frame.present_value())
            .is_some_and(|ready| ready <= self.now);
        if !retired {
            self.violation(format!(
                "timestamps of frame {} read before {} completed",
                frame.frame(),
                frame.present_value()
            ));
        }

        self.event(MockEvent::TimestampsRead {
            slot: frame.slot(),
            frame: frame.frame(),
        });
        match self.slots[frame.slot()].timestamps {
            Some((owner, timestamps)) if owner == frame.frame() => Ok(timestamps),
            Some((owner, timestamps)) => {
                self.violation(format!(
                    "timestamps of slot {} belong to frame {} not {}",
                    frame.slot(),
                    owner,
                    frame.frame()
                ));
                Ok(timestamps)
            }
            None => {
                self.violation(format!(
                    "slot {} has no timestamps for frame {}",
                    frame.slot(),
                    frame.frame()
                ));
                Ok(TimestampPair::default())
            }
        }
    }

    fn release(self) -> RelayResult<()> {
        let pending = self
            .render_ready
            .iter()
            .chain(&self.present_ready)
            .any(|&ready| ready > self.now);
        if pending {
            self.violation(format!("released at {} with GPU work pending", self.now));
        }
        let mut journal = self.journal.borrow_mut();
        journal.events.push(MockEvent::Released);
        journal.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceTimeline;

    #[test]
    fn test_in_order_completion() {
        let mut backend = MockBackend::new(2);
        let mut render = FenceTimeline::new(FenceRole::Render, 0);

        let first = render.advance().unwrap();
        backend
            .submit_render(&RenderSubmit {
                slot: 0,
                frame: 0,
                first_use: true,
                wait_present: None,
                signal_render: first,
            })
            .unwrap();
        assert_eq!(backend.completed_value(FenceRole::Render).unwrap(), 0);

        backend.wait_for_value(first).unwrap();
        assert_eq!(backend.now(), 300);
        assert_eq!(backend.completed_value(FenceRole::Render).unwrap(), 1);
    }

    #[test]
    fn test_waiting_on_unsignaled_value_fails() {
        let mut backend = MockBackend::new(1);
        let value = FenceTimeline::new(FenceRole::Present, 0).advance().unwrap();
        assert!(matches!(
            backend.wait_for_value(value),
            Err(RelayError::FenceOverrun { .. })
        ));
    }

    #[test]
    fn test_rewrite_without_wait_is_flagged() {
        let mut backend = MockBackend::new(1);
        let mut render = FenceTimeline::new(FenceRole::Render, 0);
        backend
            .submit_render(&RenderSubmit {
                slot: 0,
                frame: 1,
                first_use: false,
                wait_present: None,
                signal_render: render.advance().unwrap(),
            })
            .unwrap();
        assert_eq!(backend.journal().borrow().violations.len(), 1);
    }
}
