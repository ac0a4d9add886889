//! The shared surface ring and its per-slot state machine.
//!
//! Each slot moves through
//!
//! ```text
//! Free -> Rendering -> ReadyForTransfer -> Transferring -> Presenting -> Free
//! ```
//!
//! and every transition consumes a token produced by the previous one:
//!
//! | call                | consumes          | produces          | new state          |
//! |---------------------|-------------------|-------------------|--------------------|
//! | [`SharedRing::begin_write`]     | (slot is Free)    | [`WriteLease`]     | `Rendering`        |
//! | [`SharedRing::finish_write`]    | [`WriteLease`]     | [`TransferTicket`] | `ReadyForTransfer` |
//! | [`SharedRing::begin_transfer`]  | [`TransferTicket`] | [`CopyLease`]      | `Transferring`     |
//! | [`SharedRing::finish_transfer`] | [`CopyLease`]      | [`InFlightFrame`]  | `Presenting`       |
//! | [`SharedRing::retire`]          | [`InFlightFrame`]  | [`RetiredFrame`]   | `Free`             |
//!
//! Tokens cannot be cloned or built outside this module, so a slot can only
//! be written while it is `Free` and only becomes `Free` again once the
//! present fence value of its last use was observed complete.

use tracing::trace;

use crate::error::{RelayError, RelayResult};
use crate::fence::FenceValue;

/// Lifecycle state of one ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Neither device references the slot.
    Free,
    /// Producer work writing the slot has been or is being submitted.
    Rendering,
    /// Producer work is submitted and will signal the render fence.
    ReadyForTransfer,
    /// Consumer copy is being submitted behind a wait on the render fence.
    Transferring,
    /// Copy submitted; waiting for the present fence to retire.
    Presenting,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    first_use: bool,
    render_value: Option<FenceValue>,
    present_value: Option<FenceValue>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            first_use: true,
            render_value: None,
            present_value: None,
        }
    }
}

/// Permission to record producer work into a `Free` slot.
#[must_use = "a write lease must be finished with SharedRing::finish_write"]
#[derive(Debug)]
pub struct WriteLease {
    slot: usize,
    frame: u64,
    first_use: bool,
    release_wait: Option<FenceValue>,
}

impl WriteLease {
    /// Ring slot being written.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame number being produced.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Whether this is the first write to the slot in this run.
    #[inline]
    pub fn first_use(&self) -> bool {
        self.first_use
    }

    /// Present fence value of the slot's previous use. The producer waits
    /// for it on the GPU before writing.
    #[inline]
    pub fn release_wait(&self) -> Option<FenceValue> {
        self.release_wait
    }
}

/// A written slot whose render fence value is known.
#[must_use = "a transfer ticket must be handed to SharedRing::begin_transfer"]
#[derive(Debug)]
pub struct TransferTicket {
    slot: usize,
    frame: u64,
    render_value: FenceValue,
}

impl TransferTicket {
    /// Ring slot ready for transfer.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Render fence value the consumer must wait for.
    #[inline]
    pub fn render_value(&self) -> FenceValue {
        self.render_value
    }
}

/// Permission to copy out of a slot.
#[must_use = "a copy lease must be finished with SharedRing::finish_transfer"]
#[derive(Debug)]
pub struct CopyLease {
    slot: usize,
    frame: u64,
    render_value: FenceValue,
}

impl CopyLease {
    /// Ring slot being copied.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame number being copied.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Render fence value the copy waits for.
    #[inline]
    pub fn render_value(&self) -> FenceValue {
        self.render_value
    }
}

/// A frame whose copy was submitted and has not been observed complete.
#[must_use = "an in-flight frame must be retired to free its slot"]
#[derive(Debug)]
pub struct InFlightFrame {
    slot: usize,
    frame: u64,
    present_value: FenceValue,
}

impl InFlightFrame {
    /// Ring slot in flight.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame number in flight.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Present fence value that retires this frame.
    #[inline]
    pub fn present_value(&self) -> FenceValue {
        self.present_value
    }
}

/// A frame whose slot has returned to `Free`.
///
/// Holding one proves the GPU work of the frame completed, so its
/// timestamps may be read.
#[derive(Debug, PartialEq, Eq)]
pub struct RetiredFrame {
    slot: usize,
    frame: u64,
    present_value: FenceValue,
}

impl RetiredFrame {
    /// Ring slot that was freed.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame number that retired.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Present fence value that retired it.
    #[inline]
    pub fn present_value(&self) -> FenceValue {
        self.present_value
    }
}

/// Host-side state of the shared surface ring.
#[derive(Debug)]
pub struct SharedRing {
    slots: Vec<Slot>,
}

impl SharedRing {
    /// Creates a ring of `depth` free slots.
    pub fn new(depth: usize) -> RelayResult<Self> {
        if depth == 0 {
            return Err(RelayError::InvalidRingDepth);
        }
        Ok(Self {
            slots: (0..depth).map(|_| Slot::new()).collect(),
        })
    }

    /// Number of slots.
    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slot used by `frame`.
    #[inline]
    pub fn slot_for_frame(&self, frame: u64) -> usize {
        (frame % self.slots.len() as u64) as usize
    }

    /// Current state of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    #[inline]
    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    /// Whether every slot is `Free`.
    pub fn all_free(&self) -> bool {
        self.slots.iter().all(|slot| slot.state == SlotState::Free)
    }

    /// Slots that are not `Free`.
    pub fn busy_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state != SlotState::Free)
            .map(|(index, _)| index)
            .collect()
    }

    fn require_state(&self, slot: usize, expected: SlotState) -> RelayResult<()> {
        let actual = self.slots[slot].state;
        if actual != expected {
            return Err(RelayError::SlotState {
                slot,
                actual,
                expected,
            });
        }
        Ok(())
    }

    fn set(&mut self, slot: usize, state: SlotState) {
        trace!("slot {} {:?} -> {:?}", slot, self.slots[slot].state, state);
        self.slots[slot].state = state;
    }

    /// Claims the slot of `frame` for producer work.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SlotState`] if the slot is not `Free`.
    pub fn begin_write(&mut self, frame: u64) -> RelayResult<WriteLease> {
        let slot = self.slot_for_frame(frame);
        self.require_state(slot, SlotState::Free)?;

        let entry = &self.slots[slot];
        let lease = WriteLease {
            slot,
            frame,
            first_use: entry.first_use,
            release_wait: entry.present_value,
        };
        self.set(slot, SlotState::Rendering);
        Ok(lease)
    }

    /// Records the render fence value signaled after the producer work.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::FenceRegression`] if `render_value` does not
    /// exceed the slot's previous render value.
    pub fn finish_write(
        &mut self,
        lease: WriteLease,
        render_value: FenceValue,
    ) -> RelayResult<TransferTicket> {
        let entry = &mut self.slots[lease.slot];
        if let Some(previous) = entry.render_value
            && !render_value.follows(previous)
        {
            return Err(RelayError::FenceRegression {
                role: render_value.role(),
                value: render_value.get(),
                last: previous.get(),
            });
        }
        entry.render_value = Some(render_value);
        entry.first_use = false;
        self.set(lease.slot, SlotState::ReadyForTransfer);

        Ok(TransferTicket {
            slot: lease.slot,
            frame: lease.frame,
            render_value,
        })
    }

    /// Hands a written slot to the consumer.
    pub fn begin_transfer(&mut self, ticket: TransferTicket) -> CopyLease {
        debug_assert_eq!(self.slots[ticket.slot].state, SlotState::ReadyForTransfer);
        self.set(ticket.slot, SlotState::Transferring);
        CopyLease {
            slot: ticket.slot,
            frame: ticket.frame,
            render_value: ticket.render_value,
        }
    }

    /// Records the present fence value signaled after the copy.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::FenceRegression`] if `present_value` does not
    /// exceed the slot's previous present value.
    pub fn finish_transfer(
        &mut self,
        lease: CopyLease,
        present_value: FenceValue,
    ) -> RelayResult<InFlightFrame> {
        let entry = &mut self.slots[lease.slot];
        if let Some(previous) = entry.present_value
            && !present_value.follows(previous)
        {
            return Err(RelayError::FenceRegression {
                role: present_value.role(),
                value: present_value.get(),
                last: previous.get(),
            });
        }
        entry.present_value = Some(present_value);
        self.set(lease.slot, SlotState::Presenting);

        Ok(InFlightFrame {
            slot: lease.slot,
            frame: lease.frame,
            present_value,
        })
    }

    /// Frees the slot of `frame` if `completed` has reached its present value.
    ///
    /// Hands the frame back unchanged when it has not retired yet.
    pub fn retire(
        &mut self,
        frame: InFlightFrame,
        completed: u64,
    ) -> Result<RetiredFrame, InFlightFrame> {
        if completed < frame.present_value.get() {
            return Err(frame);
        }
        debug_assert_eq!(self.slots[frame.slot].state, SlotState::Presenting);
        self.set(frame.slot, SlotState::Free);
        Ok(RetiredFrame {
            slot: frame.slot,
            frame: frame.frame,
            present_value: frame.present_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{FenceRole, FenceTimeline};

    struct Fences {
        render: FenceTimeline,
        present: FenceTimeline,
    }

    impl Fences {
        fn new() -> Self {
            Self {
                render: FenceTimeline::new(FenceRole::Render, 0),
                present: FenceTimeline::new(FenceRole::Present, 0),
            }
        }
    }

    fn submit(ring: &mut SharedRing, fences: &mut Fences, frame: u64) -> InFlightFrame {
        let lease = ring.begin_write(frame).unwrap();
        let ticket = ring
            .finish_write(lease, fences.render.advance().unwrap())
            .unwrap();
        let copy = ring.begin_transfer(ticket);
        ring.finish_transfer(copy, fences.present.advance().unwrap())
            .unwrap()
    }

    #[test]
    fn test_zero_depth_rejected() {
        assert!(matches!(
            SharedRing::new(0),
            Err(RelayError::InvalidRingDepth)
        ));
    }

    #[test]
    fn test_full_cycle_visits_every_state() {
        let mut ring = SharedRing::new(3).unwrap();
        let mut fences = Fences::new();

        let lease = ring.begin_write(0).unwrap();
        assert_eq!(ring.state(0), SlotState::Rendering);
        assert!(lease.first_use());
        assert_eq!(lease.release_wait(), None);

        let ticket = ring
            .finish_write(lease, fences.render.advance().unwrap())
            .unwrap();
        assert_eq!(ring.state(0), SlotState::ReadyForTransfer);

        let copy = ring.begin_transfer(ticket);
        assert_eq!(ring.state(0), SlotState::Transferring);

        let in_flight = ring
            .finish_transfer(copy, fences.present.advance().unwrap())
            .unwrap();
        assert_eq!(ring.state(0), SlotState::Presenting);
        assert!(!ring.all_free());

        let retired = ring.retire(in_flight, 1).unwrap();
        assert_eq!(retired.slot(), 0);
        assert_eq!(retired.frame(), 0);
        assert!(ring.all_free());
    }

    #[test]
    fn test_slot_not_reused_before_retirement() {
        let mut ring = SharedRing::new(3).unwrap();
        let mut fences = Fences::new();

        let first = submit(&mut ring, &mut fences, 0);
        let _second = submit(&mut ring, &mut fences, 1);
        let _third = submit(&mut ring, &mut fences, 2);

        // Frame 3 maps onto slot 0, still presenting.
        assert!(matches!(
            ring.begin_write(3),
            Err(RelayError::SlotState {
                slot: 0,
                actual: SlotState::Presenting,
                ..
            })
        ));

        // Completed value below the slot's present value keeps it busy.
        let first = ring.retire(first, 0).unwrap_err();
        assert_eq!(ring.state(0), SlotState::Presenting);

        ring.retire(first, 1).unwrap();
        let lease = ring.begin_write(3).unwrap();
        assert!(!lease.first_use());
        assert_eq!(lease.release_wait().map(|v| v.get()), Some(1));
    }

    #[test]
    fn test_first_use_only_once_per_slot() {
        let mut ring = SharedRing::new(2).unwrap();
        let mut fences = Fences::new();

        for frame in 0..2 {
            let in_flight = submit(&mut ring, &mut fences, frame);
            let completed = in_flight.present_value().get();
            ring.retire(in_flight, completed).unwrap();
        }
        for frame in 2..4 {
            let lease = ring.begin_write(frame).unwrap();
            assert!(!lease.first_use(), "frame {frame}");
            let ticket = ring
                .finish_write(lease, fences.render.advance().unwrap())
                .unwrap();
            let copy = ring.begin_transfer(ticket);
            let in_flight = ring
                .finish_transfer(copy, fences.present.advance().unwrap())
                .unwrap();
            let completed = in_flight.present_value().get();
            ring.retire(in_flight, completed).unwrap();
        }
    }

    #[test]
    fn test_render_value_must_increase_per_slot() {
        let mut ring = SharedRing::new(1).unwrap();
        let mut fences = Fences::new();

        let in_flight = submit(&mut ring, &mut fences, 0);
        ring.retire(in_flight, 1).unwrap();

        let stale = FenceTimeline::new(FenceRole::Render, 0).advance().unwrap();
        let lease = ring.begin_write(1).unwrap();
        assert!(matches!(
            ring.finish_write(lease, stale),
            Err(RelayError::FenceRegression { .. })
        ));
    }

    #[test]
    fn test_busy_slots() {
        let mut ring = SharedRing::new(3).unwrap();
        let mut fences = Fences::new();
        let _a = submit(&mut ring, &mut fences, 0);
        let _b = submit(&mut ring, &mut fences, 1);
        assert_eq!(ring.busy_slots(), vec![0, 1]);
    }
}
