//! Property tests for fence monotonicity and delayed retirement.

use proptest::prelude::*;

use relay_pipeline::mock::{MockBackend, MockEvent, MockTiming};
use relay_pipeline::{Coordinator, FenceRole, FenceTimeline};

#[derive(Debug, Clone)]
struct Scenario {
    depth: usize,
    frames: u64,
    timing: MockTiming,
}

fn scenario_strategy() -> impl Strategy<Value = Scenario> {
    (
        1usize..=4,
        1u64..40,
        1u64..2_000,
        1u64..2_000,
        0u64..3_000,
        prop::collection::vec(0u64..20_000, 0..8),
    )
        .prop_map(
            |(depth, frames, render_ticks, copy_ticks, acquire_ticks, retire_delays)| Scenario {
                depth,
                frames,
                timing: MockTiming {
                    frequency: 1_000_000,
                    render_ticks,
                    copy_ticks,
                    acquire_ticks,
                    retire_delays,
                },
            },
        )
}

#[derive(Debug, Clone, Copy)]
enum FenceOp {
    Advance,
    Complete,
}

fn fence_op_strategy() -> impl Strategy<Value = FenceOp> {
    prop_oneof![Just(FenceOp::Advance), Just(FenceOp::Complete)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn relay_never_reuses_a_slot_early(scenario in scenario_strategy()) {
        let depth = scenario.depth;
        let backend = MockBackend::with_timing(depth, scenario.timing.clone());
        let journal = backend.journal();
        let mut coordinator = Coordinator::new(backend).unwrap();

        for _ in 0..scenario.frames {
            coordinator.run_frame().unwrap();
            prop_assert!(coordinator.frames_in_flight() < depth);
        }
        let summary = coordinator.shutdown().unwrap();

        let journal = journal.borrow();
        prop_assert!(journal.violations.is_empty(), "{:?}", journal.violations);
        prop_assert!(journal.released);

        let expected: Vec<u64> = (1..=scenario.frames).collect();
        prop_assert_eq!(&journal.render_signals, &expected);
        prop_assert_eq!(&journal.present_signals, &expected);

        prop_assert_eq!(summary.records.len() as u64, scenario.frames);
        for (index, record) in summary.records.iter().enumerate() {
            prop_assert_eq!(record.frame, index as u64);
            prop_assert!(record.end_tick >= record.start_tick);
        }

        for (position, event) in journal.events.iter().enumerate() {
            if let MockEvent::Rendered { slot, frame, .. } = *event
                && frame >= depth as u64
            {
                let previous = frame - depth as u64;
                let retired = journal.events[..position].iter().any(|earlier| {
                    *earlier == MockEvent::TimestampsRead { slot, frame: previous }
                });
                prop_assert!(retired, "frame {} reused slot {} early", frame, slot);
            }
        }
    }

    #[test]
    fn fence_values_strictly_increase(ops in prop::collection::vec(fence_op_strategy(), 1..200)) {
        let mut timeline = FenceTimeline::new(FenceRole::Present, 0);
        let mut last = 0;
        let mut completed = 0;

        for op in ops {
            match op {
                FenceOp::Advance => {
                    let value = timeline.advance().unwrap();
                    prop_assert!(value.get() > last);
                    last = value.get();
                }
                FenceOp::Complete => {
                    if completed < last {
                        completed += 1;
                    }
                    timeline.observe(completed).unwrap();
                    prop_assert_eq!(timeline.has_outstanding(), completed < last);
                }
            }
        }
        prop_assert!(timeline.observe(last + 1).is_err());
    }
}
