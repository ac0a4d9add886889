//! End-to-end relay runs against the simulated backend.

use relay_pipeline::mock::{MockBackend, MockEvent, MockTiming};
use relay_pipeline::{Coordinator, SlotState};

const DEPTH: usize = 3;

#[test]
fn test_three_frames_produce_three_records() {
    let backend = MockBackend::new(DEPTH);
    let journal = backend.journal();
    let mut coordinator = Coordinator::new(backend).unwrap();

    for _ in 0..DEPTH {
        coordinator.run_frame().unwrap();
    }
    assert_eq!(coordinator.frames_submitted(), 3);

    let summary = coordinator.shutdown().unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.records.len(), 3);

    for (expected, record) in summary.records.iter().enumerate() {
        assert_eq!(record.frame, expected as u64);
        assert_eq!(record.slot, expected % DEPTH);
        assert!(record.end_tick >= record.start_tick);
    }
    assert!(
        summary
            .records
            .windows(2)
            .all(|pair| pair[0].start_tick <= pair[1].start_tick),
        "start ticks must not decrease: {:?}",
        summary.records
    );

    let journal = journal.borrow();
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    assert!(journal.released);
}

#[test]
fn test_fence_values_strictly_increase() {
    let backend = MockBackend::new(DEPTH);
    let journal = backend.journal();
    let mut coordinator = Coordinator::new(backend).unwrap();

    for _ in 0..10 {
        coordinator.run_frame().unwrap();
    }
    coordinator.shutdown().unwrap();

    let journal = journal.borrow();
    assert_eq!(journal.render_signals, (1..=10).collect::<Vec<u64>>());
    assert_eq!(journal.present_signals, (1..=10).collect::<Vec<u64>>());
}

#[test]
fn test_frames_in_flight_bounded_by_ring_depth() {
    let timing = MockTiming {
        copy_ticks: 5_000,
        ..MockTiming::default()
    };
    let mut coordinator = Coordinator::new(MockBackend::with_timing(DEPTH, timing)).unwrap();

    for _ in 0..12 {
        coordinator.run_frame().unwrap();
        assert!(coordinator.frames_in_flight() < DEPTH);
    }
    coordinator.shutdown().unwrap();
}

#[test]
fn test_slot_reused_only_after_its_frame_retired() {
    let timing = MockTiming {
        retire_delays: vec![0, 4_000, 250, 9_000],
        ..MockTiming::default()
    };
    let backend = MockBackend::with_timing(DEPTH, timing);
    let journal = backend.journal();
    let mut coordinator = Coordinator::new(backend).unwrap();

    for _ in 0..9 {
        coordinator.run_frame().unwrap();
    }
    coordinator.shutdown().unwrap();

    let journal = journal.borrow();
    assert!(journal.violations.is_empty(), "{:?}", journal.violations);

    // Every write of frame f >= N must follow the retirement of frame f - N.
    for (position, event) in journal.events.iter().enumerate() {
        if let MockEvent::Rendered { slot, frame, .. } = *event
            && frame >= DEPTH as u64
        {
            let previous = frame - DEPTH as u64;
            let retired_before = journal.events[..position].iter().any(|earlier| {
                *earlier
                    == MockEvent::TimestampsRead {
                        slot,
                        frame: previous,
                    }
            });
            assert!(retired_before, "frame {frame} reused slot {slot} too early");
        }
    }
}

#[test]
fn test_ring_state_between_frames() {
    let timing = MockTiming {
        copy_ticks: 1_000_000,
        ..MockTiming::default()
    };
    let mut coordinator = Coordinator::new(MockBackend::with_timing(DEPTH, timing)).unwrap();

    coordinator.run_frame().unwrap();
    assert_eq!(coordinator.ring().state(0), SlotState::Presenting);
    assert_eq!(coordinator.ring().state(1), SlotState::Free);
    assert!(coordinator.records().is_empty());

    coordinator.run_frame().unwrap();
    assert_eq!(coordinator.ring().busy_slots(), vec![0, 1]);

    // The third frame fills the ring, so pacing retires the first.
    coordinator.run_frame().unwrap();
    assert_eq!(coordinator.ring().state(0), SlotState::Free);
    assert_eq!(coordinator.records().len(), 1);
    assert_eq!(coordinator.frames_in_flight(), 2);

    let summary = coordinator.shutdown().unwrap();
    assert_eq!(summary.records.len(), 3);
}

#[test]
fn test_acquire_precedes_submissions() {
    let backend = MockBackend::new(DEPTH);
    let journal = backend.journal();
    let mut coordinator = Coordinator::new(backend).unwrap();
    coordinator.run_frame().unwrap();

    let journal = journal.borrow();
    assert!(matches!(
        journal.events.as_slice(),
        [
            MockEvent::Acquired { slot: 0, image: 0 },
            MockEvent::Rendered { slot: 0, frame: 0, value: 1 },
            MockEvent::Transferred { slot: 0, frame: 0, value: 1 },
            MockEvent::Presented { image: 0 },
        ]
    ));
}
