//! Aggregate latency and the report file.

use std::fs;

use relay_pipeline::mock::{MockBackend, MockTiming};
use relay_pipeline::{Coordinator, FrameRecord, LatencyStats, TimestampPair, write_report};

fn pair(start: u64, end: u64) -> TimestampPair {
    TimestampPair { start, end }
}

#[test]
fn test_reference_samples() {
    let records = [
        FrameRecord::new(0, 0, pair(0, 500)),
        FrameRecord::new(1, 1, pair(1000, 1600)),
        FrameRecord::new(2, 2, pair(2000, 2450)),
    ];
    let frequency = 1_000_000;

    let durations: Vec<f64> = records.iter().map(|r| r.duration_ms(frequency)).collect();
    assert!((durations[0] - 0.5).abs() < 1e-9);
    assert!((durations[1] - 0.6).abs() < 1e-9);
    assert!((durations[2] - 0.45).abs() < 1e-9);

    let stats = LatencyStats::from_records(&records, frequency).unwrap();
    assert_eq!(stats.frames, 3);
    assert!((stats.mean_ms - 0.516_666_7).abs() < 1e-6);
    assert!((stats.min_ms - 0.45).abs() < 1e-9);
    assert!((stats.max_ms - 0.6).abs() < 1e-9);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay_latency.txt");
    write_report(&path, Some(&stats)).unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Average copy times: 0.516667ms\n"
    );
}

#[test]
fn test_report_from_relay_run() {
    let timing = MockTiming {
        frequency: 1_000_000,
        copy_ticks: 500,
        ..MockTiming::default()
    };
    let mut coordinator = Coordinator::new(MockBackend::with_timing(3, timing)).unwrap();
    for _ in 0..6 {
        coordinator.run_frame().unwrap();
    }
    let summary = coordinator.shutdown().unwrap();
    let stats = summary.stats().unwrap();
    assert_eq!(stats.frames, 6);
    assert!((stats.mean_ms - 0.5).abs() < 1e-9);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    write_report(&path, Some(&stats)).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "Average copy times: 0.5ms\n");
}

#[test]
fn test_report_without_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.txt");
    write_report(&path, None).unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Average copy times: n/a (no frames retired)\n"
    );
}
