//! Time-bin resampler.
//!
//! Counter readings arrive at irregular intervals: each `(t, v)` sample
//! carries the quantity `v` counted over `(t_prev, t]`. The resampler
//! redistributes those quantities into fixed-width bins starting at the trace
//! origin, assuming a constant rate inside each source interval. Nothing is
//! created or destroyed: with [`TailPolicy::Keep`] the sum over output bins
//! equals the sum over all sample values with positive duration.

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::TailPolicy;
use crate::stats::{Anomaly, CoreId, CoreRecord, CoreRecords, QualityStats};
use crate::trace::{StatSeries, Trace};

/// Fraction of a bin below which leftover time is treated as rounding noise.
const TIME_EPSILON_FRACTION: f64 = 1e-9;

/// Output of resampling a single statistic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resampled {
    /// Bin values; index 0 covers `[0, bin_size)` relative to the origin.
    pub bins: Vec<f64>,
    /// Samples skipped because their interval had non-positive duration.
    pub skipped: usize,
}

/// Redistributes sample series into uniform bins.
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    bin_size: f64,
    tail: TailPolicy,
}

impl Resampler {
    pub fn new(bin_size: f64, tail: TailPolicy) -> Result<Self> {
        if !(bin_size.is_finite() && bin_size > 0.0) {
            bail!("bin size must be positive and finite, got {bin_size}");
        }
        Ok(Self { bin_size, tail })
    }

    pub fn bin_size(&self) -> f64 {
        self.bin_size
    }

    /// Resamples one ordered `(timestamp, value)` series.
    ///
    /// The first interval starts at the origin (`0`). An interval of zero or
    /// negative duration contributes nothing and the cursor moves on.
    pub fn resample(&self, samples: &[(f64, f64)]) -> Resampled {
        let mut even = EvenCursor::new(self.bin_size);
        let mut skipped = 0;
        let mut prev = 0.0;

        for &(timestamp, value) in samples {
            let real_time = timestamp - prev;
            if real_time <= 0.0 {
                skipped += 1;
                continue;
            }
            prev = timestamp;
            even.consume(real_time, value);
        }

        Resampled {
            bins: even.finish(self.tail),
            skipped,
        }
    }

    /// Resamples every statistic of one core into a record.
    pub fn resample_series(&self, series: &StatSeries, quality: &QualityStats) -> CoreRecord {
        let mut record = CoreRecord::new();
        for (statistic, samples) in series.iter() {
            let out = self.resample(samples);
            if out.skipped > 0 {
                debug!(
                    statistic,
                    skipped = out.skipped,
                    "skipped non-positive sample intervals"
                );
                quality.record_n(Anomaly::SkippedInterval, out.skipped as u64);
            }
            for (index, value) in out.bins.into_iter().enumerate() {
                record.set(index as u64, statistic, value);
            }
        }
        record
    }

    /// Resamples every core of a trace, plus the package energy series.
    pub fn resample_trace(&self, trace: &Trace, quality: &QualityStats) -> (CoreRecords, CoreRecord) {
        let mut records = CoreRecords::new();
        for (core, series) in &trace.cores {
            if *core == CoreId::Total {
                continue;
            }
            records.insert(*core, self.resample_series(series, quality));
        }
        let package = self.resample_series(&trace.package, quality);
        (records, package)
    }
}

/// Cursor over the output ("even") bins.
struct EvenCursor {
    bin_size: f64,
    epsilon: f64,
    /// Real time the current bin still wants.
    time_left: f64,
    /// Value accumulated in the current bin.
    value: f64,
    bins: Vec<f64>,
}

impl EvenCursor {
    fn new(bin_size: f64) -> Self {
        Self {
            bin_size,
            epsilon: bin_size * TIME_EPSILON_FRACTION,
            time_left: bin_size,
            value: 0.0,
            bins: Vec::new(),
        }
    }

    /// Spreads one real interval of `real_time` seconds carrying `real_value`.
    fn consume(&mut self, mut real_time: f64, mut real_value: f64) {
        while real_time > 0.0 {
            if self.time_left + self.epsilon < real_time {
                // The interval outlasts this bin: split off the proportional remainder.
                let next_time = real_time - self.time_left;
                let next_value = (next_time / real_time) * real_value;
                self.value += real_value - next_value;
                self.close();
                real_time = next_time;
                real_value = next_value;
            } else {
                self.value += real_value;
                self.time_left -= real_time;
                real_time = 0.0;
                if self.time_left <= self.epsilon {
                    self.close();
                }
            }
        }
    }

    fn close(&mut self) {
        self.bins.push(self.value);
        self.value = 0.0;
        self.time_left = self.bin_size;
    }

    fn finish(mut self, tail: TailPolicy) -> Vec<f64> {
        let partial = self.time_left < self.bin_size - self.epsilon;
        if partial && tail == TailPolicy::Keep {
            self.bins.push(self.value);
        }
        self.bins
    }
}
