//! The per-frame relay loop.
//!
//! [`Coordinator::run_frame`] performs one iteration:
//!
//! 1. acquire the next presentation image
//! 2. claim the frame's ring slot (it is guaranteed `Free`, see step 6)
//! 3. submit producer work, waiting on the GPU for the slot's previous
//!    present value and signaling the next render value
//! 4. submit the consumer copy behind a GPU wait for that render value,
//!    signaling the next present value
//! 5. present
//! 6. retire whatever already completed, then block only if the frames in
//!    flight would exceed the ring depth on the next iteration
//!
//! Timestamps are read for each frame as it retires, never earlier.
//! [`Coordinator::shutdown`] drains every outstanding value before the
//! backend releases anything.

use std::collections::VecDeque;

use tracing::{info, trace};

use crate::backend::{RelayBackend, RenderSubmit, TransferSubmit};
use crate::error::{RelayError, RelayResult};
use crate::fence::{FenceRole, FenceTimeline};
use crate::latency::{FrameRecord, LatencySampler, LatencyStats};
use crate::ring::{InFlightFrame, SharedRing};

/// Result of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// Frames submitted.
    pub frames: u64,
    /// Timestamp frequency the records were taken at.
    pub frequency: u64,
    /// One record per retired frame, in retirement order.
    pub records: Vec<FrameRecord>,
}

impl RunSummary {
    /// Aggregate copy latency, `None` if no frame retired.
    pub fn stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_records(&self.records, self.frequency)
    }
}

/// Drives the producer and consumer through the shared ring.
pub struct Coordinator<B: RelayBackend> {
    backend: B,
    ring: SharedRing,
    render: FenceTimeline,
    present: FenceTimeline,
    in_flight: VecDeque<InFlightFrame>,
    sampler: LatencySampler,
    next_frame: u64,
}

impl<B: RelayBackend> Coordinator<B> {
    /// Takes ownership of `backend` and sizes the ring to its depth.
    pub fn new(backend: B) -> RelayResult<Self> {
        let ring = SharedRing::new(backend.ring_depth())?;
        let sampler = LatencySampler::new(backend.timestamp_frequency())?;
        let render = FenceTimeline::new(FenceRole::Render, backend.completed_value(FenceRole::Render)?);
        let present =
            FenceTimeline::new(FenceRole::Present, backend.completed_value(FenceRole::Present)?);

        info!(
            "Relay coordinator ready: ring depth {}, timestamp frequency {} Hz",
            ring.depth(),
            sampler.frequency()
        );

        Ok(Self {
            in_flight: VecDeque::with_capacity(ring.depth()),
            backend,
            ring,
            render,
            present,
            sampler,
            next_frame: 0,
        })
    }

    /// Runs one frame through the relay.
    pub fn run_frame(&mut self) -> RelayResult<()> {
        let frame = self.next_frame;
        let slot = self.ring.slot_for_frame(frame);

        let target = self.backend.acquire_target(slot)?;

        let lease = self.ring.begin_write(frame)?;
        let signal_render = self.render.advance()?;
        self.backend.submit_render(&RenderSubmit {
            slot,
            frame,
            first_use: lease.first_use(),
            wait_present: lease.release_wait(),
            signal_render,
        })?;
        let ticket = self.ring.finish_write(lease, signal_render)?;

        let copy = self.ring.begin_transfer(ticket);
        let signal_present = self.present.advance()?;
        self.backend.submit_transfer(&TransferSubmit {
            slot,
            frame,
            target,
            wait_render: copy.render_value(),
            signal_present,
        })?;
        let in_flight = self.ring.finish_transfer(copy, signal_present)?;

        self.backend.present(target)?;
        trace!(
            "frame {} slot {} image {} render {} present {}",
            frame, slot, target.0, signal_render, signal_present
        );

        self.in_flight.push_back(in_flight);
        self.next_frame += 1;

        self.collect_retired()?;
        self.pace()
    }

    /// Blocks until the oldest frame retires if the ring is fully in flight.
    fn pace(&mut self) -> RelayResult<()> {
        if self.in_flight.len() < self.ring.depth() {
            return Ok(());
        }
        let Some(oldest) = self.in_flight.front().map(InFlightFrame::present_value) else {
            return Ok(());
        };

        trace!("Frame pacing: waiting for {}", oldest);
        self.backend.wait_for_value(oldest)?;
        self.collect_retired()?;

        if self
            .in_flight
            .front()
            .is_some_and(|frame| frame.present_value() == oldest)
        {
            return Err(RelayError::WaitUnsatisfied { value: oldest });
        }
        Ok(())
    }

    /// Frees every in-flight frame whose present value completed and samples it.
    fn collect_retired(&mut self) -> RelayResult<()> {
        let completed = self.backend.completed_value(FenceRole::Present)?;
        self.present.observe(completed)?;

        while let Some(frame) = self.in_flight.pop_front() {
            match self.ring.retire(frame, completed) {
                Ok(retired) => {
                    let timestamps = self.backend.read_timestamps(&retired)?;
                    let record = self.sampler.record(&retired, timestamps);
                    trace!(
                        "frame {} retired, copy took {} ticks",
                        record.frame,
                        record.ticks()
                    );
                }
                Err(frame) => {
                    self.in_flight.push_front(frame);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Waits for all outstanding work, frees every slot and then releases the backend.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DrainIncomplete`] if a slot is still busy after
    /// every signaled value completed. The backend is not released then.
    pub fn shutdown(mut self) -> RelayResult<RunSummary> {
        info!(
            "Draining relay: {} frame(s) in flight",
            self.in_flight.len()
        );

        if let Some(value) = self.render.last_signaled() {
            self.backend.wait_for_value(value)?;
            let completed = self.backend.completed_value(FenceRole::Render)?;
            self.render.observe(completed)?;
        }
        if let Some(value) = self.present.last_signaled() {
            self.backend.wait_for_value(value)?;
        }
        self.collect_retired()?;

        if !self.ring.all_free() || !self.in_flight.is_empty() {
            return Err(RelayError::DrainIncomplete {
                busy: self.ring.busy_slots(),
            });
        }

        let frames = self.next_frame;
        let frequency = self.sampler.frequency();
        let records = self.sampler.into_records();
        self.backend.release()?;

        info!("Relay drained: {} frame(s), {} record(s)", frames, records.len());
        Ok(RunSummary {
            frames,
            frequency,
            records,
        })
    }

    /// Frames submitted so far.
    #[inline]
    pub fn frames_submitted(&self) -> u64 {
        self.next_frame
    }

    /// Frames submitted but not yet retired.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Records of the frames retired so far.
    #[inline]
    pub fn records(&self) -> &[FrameRecord] {
        self.sampler.records()
    }

    /// Host view of the ring.
    #[inline]
    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// The backend driven by this coordinator.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
