//! Shutdown drains every outstanding fence value before the backend is released.

use relay_pipeline::mock::{MockBackend, MockEvent, MockTiming};
use relay_pipeline::{
    Coordinator, FenceRole, FenceValue, PresentTarget, RelayBackend, RelayError, RelayResult,
    RenderSubmit, TimestampPair, TransferSubmit,
};
use relay_pipeline::ring::RetiredFrame;

#[test]
fn test_shutdown_waits_for_in_flight_frames() {
    let timing = MockTiming {
        retire_delays: vec![50_000],
        ..MockTiming::default()
    };
    let backend = MockBackend::with_timing(3, timing);
    let journal = backend.journal();
    let mut coordinator = Coordinator::new(backend).unwrap();

    coordinator.run_frame().unwrap();
    coordinator.run_frame().unwrap();
    assert_eq!(coordinator.frames_in_flight(), 2);
    assert!(coordinator.records().is_empty());

    let summary = coordinator.shutdown().unwrap();
    assert_eq!(summary.records.len(), 2);

    let journal = journal.borrow();
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);

    let released_at = journal
        .events
        .iter()
        .position(|event| *event == MockEvent::Released)
        .expect("backend released");
    assert_eq!(released_at, journal.events.len() - 1);

    for frame in 0..2 {
        let read_at = journal
            .events
            .iter()
            .position(|event| matches!(event, MockEvent::TimestampsRead { frame: f, .. } if *f == frame))
            .expect("timestamps read");
        assert!(read_at < released_at);
    }
    assert!(journal.host_waits() >= 1);
}

#[test]
fn test_shutdown_without_frames() {
    let backend = MockBackend::new(3);
    let journal = backend.journal();
    let coordinator = Coordinator::new(backend).unwrap();

    let summary = coordinator.shutdown().unwrap();
    assert_eq!(summary.frames, 0);
    assert!(summary.records.is_empty());
    assert!(summary.stats().is_none());

    let journal = journal.borrow();
    assert!(journal.released);
    assert_eq!(journal.host_waits(), 0);
}

/// Delegates to [`MockBackend`] but never reports the present fence complete.
struct StalledPresent {
    inner: MockBackend,
}

impl RelayBackend for StalledPresent {
    fn ring_depth(&self) -> usize {
        self.inner.ring_depth()
    }

    fn timestamp_frequency(&self) -> u64 {
        self.inner.timestamp_frequency()
    }

    fn acquire_target(&mut self, slot: usize) -> RelayResult<PresentTarget> {
        self.inner.acquire_target(slot)
    }

    fn submit_render(&mut self, submit: &RenderSubmit) -> RelayResult<()> {
        self.inner.submit_render(submit)
    }

    fn submit_transfer(&mut self, submit: &TransferSubmit) -> RelayResult<()> {
        self.inner.submit_transfer(submit)
    }

    fn present(&mut self, target: PresentTarget) -> RelayResult<()> {
        self.inner.present(target)
    }

    fn completed_value(&self, role: FenceRole) -> RelayResult<u64> {
        match role {
            FenceRole::Render => self.inner.completed_value(role),
            FenceRole::Present => Ok(0),
        }
    }

    fn wait_for_value(&mut self, value: FenceValue) -> RelayResult<()> {
        self.inner.wait_for_value(value)
    }

    fn read_timestamps(&self, frame: &RetiredFrame) -> RelayResult<TimestampPair> {
        self.inner.read_timestamps(frame)
    }

    fn release(self) -> RelayResult<()> {
        self.inner.release()
    }
}

#[test]
fn test_busy_slot_blocks_release() {
    let inner = MockBackend::new(3);
    let journal = inner.journal();
    let mut coordinator = Coordinator::new(StalledPresent { inner }).unwrap();
    coordinator.run_frame().unwrap();

    match coordinator.shutdown() {
        Err(RelayError::DrainIncomplete { busy }) => assert_eq!(busy, vec![0]),
        other => panic!("expected DrainIncomplete, got {other:?}"),
    }
    assert!(!journal.borrow().released);
}

#[test]
fn test_pacing_reports_unsatisfied_wait() {
    let inner = MockBackend::new(1);
    let mut coordinator = Coordinator::new(StalledPresent { inner }).unwrap();

    assert!(matches!(
        coordinator.run_frame(),
        Err(RelayError::WaitUnsatisfied { value }) if value.get() == 1
    ));
}
