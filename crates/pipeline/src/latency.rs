//! Copy latency sampling and the aggregate report.
//!
//! Ticks are converted to seconds with the consumer queue's timestamp
//! frequency: `(end - start) / frequency`. Aggregates are reported in
//! milliseconds.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::backend::TimestampPair;
use crate::error::{RelayError, RelayResult};
use crate::ring::RetiredFrame;

/// One measured copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    /// Frame number.
    pub frame: u64,
    /// Ring slot the frame used.
    pub slot: usize,
    /// Tick before the copy.
    pub start_tick: u64,
    /// Tick after the copy. Never below `start_tick`.
    pub end_tick: u64,
}

impl FrameRecord {
    /// Builds a record, clamping an end tick that precedes the start.
    pub fn new(frame: u64, slot: usize, timestamps: TimestampPair) -> Self {
        let end_tick = if timestamps.end < timestamps.start {
            warn!(
                "frame {} end tick {} precedes start tick {}, clamping",
                frame, timestamps.end, timestamps.start
            );
            timestamps.start
        } else {
            timestamps.end
        };
        Self {
            frame,
            slot,
            start_tick: timestamps.start,
            end_tick,
        }
    }

    /// Elapsed ticks.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.end_tick - self.start_tick
    }

    /// Copy duration in milliseconds at `frequency` ticks per second.
    #[inline]
    pub fn duration_ms(&self, frequency: u64) -> f64 {
        self.ticks() as f64 / frequency as f64 * 1000.0
    }
}

/// Accumulates one [`FrameRecord`] per retired frame.
#[derive(Debug)]
pub struct LatencySampler {
    frequency: u64,
    records: Vec<FrameRecord>,
}

impl LatencySampler {
    /// Creates a sampler for a queue ticking `frequency` times per second.
    pub fn new(frequency: u64) -> RelayResult<Self> {
        if frequency == 0 {
            return Err(RelayError::InvalidFrequency);
        }
        Ok(Self {
            frequency,
            records: Vec::new(),
        })
    }

    /// Ticks per second.
    #[inline]
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Appends the record of a retired frame.
    pub fn record(&mut self, frame: &RetiredFrame, timestamps: TimestampPair) -> &FrameRecord {
        self.records
            .push(FrameRecord::new(frame.frame(), frame.slot(), timestamps));
        &self.records[self.records.len() - 1]
    }

    /// Records in retirement order.
    #[inline]
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Aggregate statistics, or `None` before the first record.
    pub fn stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_records(&self.records, self.frequency)
    }

    /// Consumes the sampler, returning its records.
    pub fn into_records(self) -> Vec<FrameRecord> {
        self.records
    }
}

/// Aggregate copy latency.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyStats {
    /// Number of records aggregated.
    pub frames: usize,
    /// Arithmetic mean in milliseconds.
    pub mean_ms: f64,
    /// Fastest copy in milliseconds.
    pub min_ms: f64,
    /// Slowest copy in milliseconds.
    pub max_ms: f64,
}

impl LatencyStats {
    /// Aggregates `records`, or returns `None` when there are none.
    pub fn from_records(records: &[FrameRecord], frequency: u64) -> Option<Self> {
        if records.is_empty() || frequency == 0 {
            return None;
        }

        let mut total = 0.0;
        let mut min_ms = f64::INFINITY;
        let mut max_ms = 0.0f64;
        for record in records {
            let ms = record.duration_ms(frequency);
            total += ms;
            min_ms = min_ms.min(ms);
            max_ms = max_ms.max(ms);
        }

        Some(Self {
            frames: records.len(),
            mean_ms: total / records.len() as f64,
            min_ms,
            max_ms,
        })
    }
}

/// The one-line report written at shutdown.
pub fn report_line(stats: Option<&LatencyStats>) -> String {
    match stats {
        Some(stats) => format!("Average copy times: {}ms", format_significant(stats.mean_ms, 6)),
        None => "Average copy times: n/a (no frames retired)".to_string(),
    }
}

/// Writes [`report_line`] to `path`, replacing any previous report.
pub fn write_report(path: &Path, stats: Option<&LatencyStats>) -> RelayResult<()> {
    let line = report_line(stats);
    fs::write(path, format!("{line}\n"))?;
    info!("Wrote '{}' to {}", line, path.display());
    Ok(())
}

/// Formats `value` with at most `digits` significant digits, trailing zeros trimmed.
fn format_significant(value: f64, digits: i32) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits - 1 - magnitude).max(0) as usize;
    let text = format!("{value:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(frame: u64, start: u64, end: u64) -> FrameRecord {
        FrameRecord::new(frame, (frame % 3) as usize, TimestampPair { start, end })
    }

    #[test]
    fn test_zero_frequency_rejected() {
        assert!(matches!(
            LatencySampler::new(0),
            Err(RelayError::InvalidFrequency)
        ));
    }

    #[test]
    fn test_durations_and_mean() {
        let records = [
            record(0, 0, 500),
            record(1, 1000, 1600),
            record(2, 2000, 2450),
        ];
        let durations: Vec<f64> = records.iter().map(|r| r.duration_ms(1_000_000)).collect();
        assert!((durations[0] - 0.5).abs() < 1e-12);
        assert!((durations[1] - 0.6).abs() < 1e-12);
        assert!((durations[2] - 0.45).abs() < 1e-12);

        let stats = LatencyStats::from_records(&records, 1_000_000).unwrap();
        assert_eq!(stats.frames, 3);
        assert!((stats.mean_ms - 0.516_666_666).abs() < 1e-6);
        assert!((stats.min_ms - 0.45).abs() < 1e-12);
        assert!((stats.max_ms - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_end_before_start_is_clamped() {
        let record = record(7, 900, 100);
        assert_eq!(record.end_tick, record.start_tick);
        assert_eq!(record.ticks(), 0);
        assert_eq!(record.duration_ms(1_000), 0.0);
    }

    #[test]
    fn test_empty_stats() {
        assert!(LatencyStats::from_records(&[], 1_000_000).is_none());
        assert_eq!(
            report_line(None),
            "Average copy times: n/a (no frames retired)"
        );
    }

    #[test]
    fn test_report_line_format() {
        let stats = LatencyStats {
            frames: 3,
            mean_ms: 0.516_666_666_7,
            min_ms: 0.45,
            max_ms: 0.6,
        };
        assert_eq!(report_line(Some(&stats)), "Average copy times: 0.516667ms");
    }

    #[test]
    fn test_format_significant() {
        assert_eq!(format_significant(0.5, 6), "0.5");
        assert_eq!(format_significant(12.345678, 6), "12.3457");
        assert_eq!(format_significant(1234567.0, 6), "1234567");
        assert_eq!(format_significant(0.0, 6), "0");
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay_latency.txt");
        let stats = LatencyStats {
            frames: 1,
            mean_ms: 0.25,
            min_ms: 0.25,
            max_ms: 0.25,
        };
        write_report(&path, Some(&stats)).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Average copy times: 0.25ms\n"
        );
    }
}
