use std::sync::atomic::{AtomicU64, Ordering};

/// Data-quality anomalies that are recovered locally instead of failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Anomaly {
    /// A sample interval of non-positive duration was skipped.
    SkippedInterval = 0,
    /// A counter reported as not counted was replaced by the sentinel `1`.
    NotCountedSample = 1,
    /// A reduced busy-cycle estimate exceeded total cycles and was clamped.
    OverlapClamp = 2,
    /// A raw event name had no entry in the translation table.
    UnknownEvent = 3,
    /// A statistic required by a derivation was absent and read as `0`.
    MissingStatistic = 4,
}

const ANOMALY_COUNT: usize = 5;

impl Anomaly {
    /// All anomaly kinds in discriminant order.
    pub const fn all() -> &'static [Anomaly] {
        &[
            Anomaly::SkippedInterval,
            Anomaly::NotCountedSample,
            Anomaly::OverlapClamp,
            Anomaly::UnknownEvent,
            Anomaly::MissingStatistic,
        ]
    }

    /// Label used in log output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SkippedInterval => "skipped_interval",
            Self::NotCountedSample => "not_counted_sample",
            Self::OverlapClamp => "overlap_clamp",
            Self::UnknownEvent => "unknown_event",
            Self::MissingStatistic => "missing_statistic",
        }
    }
}

/// Lock-free per-anomaly counters shared by all pipeline stages.
///
/// Stages only ever add, so the counters stay consistent when bins are
/// processed from several threads.
pub struct QualityStats {
    counts: [AtomicU64; ANOMALY_COUNT],
}

impl QualityStats {
    /// Create a new zeroed QualityStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given anomaly by one.
    pub fn record(&self, anomaly: Anomaly) {
        self.record_n(anomaly, 1);
    }

    /// Increment the counter for the given anomaly by n.
    pub fn record_n(&self, anomaly: Anomaly, n: u64) {
        if let Some(counter) = self.counts.get(anomaly as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of a single counter.
    pub fn get(&self, anomaly: Anomaly) -> u64 {
        self.counts
            .get(anomaly as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Anomaly, u64)> {
        Anomaly::all()
            .iter()
            .filter_map(|&anomaly| {
                let v = self.get(anomaly);
                (v > 0).then_some((anomaly, v))
            })
            .collect()
    }
}

impl Default for QualityStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = QualityStats::new();
        stats.record(Anomaly::OverlapClamp);
        stats.record(Anomaly::OverlapClamp);
        stats.record(Anomaly::SkippedInterval);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let clamps = snap
            .iter()
            .find(|(a, _)| *a == Anomaly::OverlapClamp)
            .map(|(_, v)| *v);
        assert_eq!(clamps, Some(2));
    }

    #[test]
    fn test_snapshot_skips_zero_counters() {
        let stats = QualityStats::new();
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_record_n() {
        let stats = QualityStats::new();
        stats.record_n(Anomaly::UnknownEvent, 42);
        assert_eq!(stats.get(Anomaly::UnknownEvent), 42);
        assert_eq!(stats.get(Anomaly::MissingStatistic), 0);
    }

    #[test]
    fn test_labels_are_unique() {
        let mut labels: Vec<&str> = Anomaly::all().iter().map(|a| a.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), Anomaly::all().len());
    }
}
