//! Polling performance collection.
//!
//! Provides a ring buffer of per-cycle read and apply durations. Every
//! `window` samples the buffer produces a [`PerformanceSummary`] that the
//! polling manager logs.

use serde::Serialize;
use std::time::Duration;

/// One polling cycle measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSample {
    /// Time spent reading and decoding all active tags.
    pub read: Duration,
    /// Time spent assigning values and fanning out events.
    pub apply: Duration,
}

/// Rolling buffer of cycle samples with periodic summaries.
#[derive(Debug)]
pub struct PerformanceBuffer {
    /// Ring buffer of samples.
    samples: Box<[CycleSample]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Samples collected since the last summary.
    pending: usize,
    /// Total samples ever recorded.
    total_samples: u64,
}

impl PerformanceBuffer {
    /// Create a buffer that summarizes every `window` samples.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let size = window.max(1);
        Self {
            samples: vec![CycleSample::default(); size].into_boxed_slice(),
            write_pos: 0,
            pending: 0,
            total_samples: 0,
        }
    }

    /// Number of samples aggregated per summary.
    #[must_use]
    pub fn window(&self) -> usize {
        self.samples.len()
    }

    /// Total samples recorded since creation.
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Record one cycle. Returns a summary when the window is full.
    pub fn record(&mut self, sample: CycleSample) -> Option<PerformanceSummary> {
        self.samples[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.pending += 1;
        self.total_samples += 1;

        if self.pending == self.samples.len() {
            self.pending = 0;
            Some(self.summarize())
        } else {
            None
        }
    }

    /// Summarize the samples currently held in the buffer.
    #[must_use]
    pub fn summarize(&self) -> PerformanceSummary {
        let count = usize::try_from(self.total_samples)
            .unwrap_or(usize::MAX)
            .min(self.samples.len());
        let window = &self.samples[..count];

        PerformanceSummary {
            samples: count,
            read: DurationStats::from_iter(window.iter().map(|s| s.read)),
            apply: DurationStats::from_iter(window.iter().map(|s| s.apply)),
        }
    }

    /// Drop all samples.
    pub fn reset(&mut self) {
        self.samples.fill(CycleSample::default());
        self.write_pos = 0;
        self.pending = 0;
        self.total_samples = 0;
    }
}

/// Aggregated statistics for one duration series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationStats {
    /// Shortest duration.
    pub min: Duration,
    /// Mean duration.
    pub mean: Duration,
    /// Longest duration.
    pub max: Duration,
    /// 99th percentile.
    pub p99: Duration,
}

impl DurationStats {
    fn from_iter(values: impl Iterator<Item = Duration>) -> Self {
        let mut sorted: Vec<u64> = values
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_unstable();

        let sum: u128 = sorted.iter().map(|&ns| u128::from(ns)).sum();
        let mean = u64::try_from(sum / sorted.len() as u128).unwrap_or(u64::MAX);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let idx = ((0.99 * (sorted.len() - 1) as f64).round() as usize).min(sorted.len() - 1);

        Self {
            min: Duration::from_nanos(sorted[0]),
            mean: Duration::from_nanos(mean),
            max: Duration::from_nanos(sorted[sorted.len() - 1]),
            p99: Duration::from_nanos(sorted[idx]),
        }
    }
}

/// Summary emitted once per window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceSummary {
    /// Number of samples aggregated.
    pub samples: usize,
    /// Read phase statistics.
    pub read: DurationStats,
    /// Apply phase statistics.
    pub apply: DurationStats,
}
