pub mod counter_map;
pub mod parse;
pub mod sample;

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use self::counter_map::CounterMap;
use self::parse::{parse_row, Row};
use self::sample::{CounterValue, Sample};
use crate::stats::{Anomaly, CoreId, QualityStats};

/// Canonical statistics measured per package rather than per core.
pub const ENERGY_STATS: &[&str] = &["energy_cores", "energy_pkg", "energy_ram", "energy_gpu"];

/// Per-statistic sample series, each ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatSeries {
    series: BTreeMap<String, Vec<(f64, f64)>>,
}

impl StatSeries {
    pub fn push(&mut self, statistic: &str, timestamp: f64, value: f64) {
        match self.series.get_mut(statistic) {
            Some(points) => points.push((timestamp, value)),
            None => {
                self.series
                    .insert(statistic.to_string(), vec![(timestamp, value)]);
            }
        }
    }

    pub fn get(&self, statistic: &str) -> Option<&[(f64, f64)]> {
        self.series.get(statistic).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[(f64, f64)])> {
        self.series.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    fn sort(&mut self) {
        for points in self.series.values_mut() {
            points.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
    }
}

/// A fully ingested counter trace.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// Absolute start time; sample timestamps are relative to it.
    pub start_time: f64,
    pub end_time: Option<f64>,
    /// Per logical core series.
    pub cores: BTreeMap<CoreId, StatSeries>,
    /// Package-level energy series (see [`ENERGY_STATS`]).
    pub package: StatSeries,
}

impl Trace {
    /// Reads and translates a counter trace from disk.
    pub fn load(path: &Path, map: &CounterMap, quality: &QualityStats) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening counter trace {}", path.display()))?;
        Self::from_reader(file, map, quality)
            .with_context(|| format!("reading counter trace {}", path.display()))
    }

    pub fn from_reader<R: Read>(
        reader: R,
        map: &CounterMap,
        quality: &QualityStats,
    ) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut trace = Trace::default();
        let mut saw_start = false;
        let mut unknown_events = HashSet::new();

        for (idx, record) in rdr.records().enumerate() {
            let record = record?;
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 1);

            match parse_row(&record, line)? {
                Row::StartTime(t) => {
                    trace.start_time = t;
                    saw_start = true;
                }
                Row::EndTime(t) => trace.end_time = Some(t),
                Row::Reading {
                    timestamp,
                    core,
                    value,
                    raw_event,
                } => {
                    let Some(statistic) = map.translate(&raw_event) else {
                        quality.record(Anomaly::UnknownEvent);
                        if unknown_events.insert(raw_event.clone()) {
                            warn!(event = %raw_event, "event missing from counter list, skipping");
                        }
                        continue;
                    };

                    trace.push(
                        Sample {
                            timestamp,
                            core,
                            statistic: statistic.to_string(),
                            value,
                        },
                        quality,
                    );
                }
            }
        }

        if !saw_start {
            debug!("trace has no START TIME row, using 0");
        }

        for series in trace.cores.values_mut() {
            series.sort();
        }
        trace.package.sort();

        Ok(trace)
    }

    /// Routes one translated sample to its core or to the package series.
    pub fn push(&mut self, sample: Sample, quality: &QualityStats) {
        if sample.value == CounterValue::NotCounted {
            quality.record(Anomaly::NotCountedSample);
        }
        let value = sample.value.resolve();

        if ENERGY_STATS.contains(&sample.statistic.as_str()) {
            // Energy counters are package-wide; the collector repeats them per core.
            if !self.package_has(&sample) {
                self.package
                    .push(&sample.statistic, sample.timestamp, value);
            }
            return;
        }

        self.cores
            .entry(sample.core)
            .or_default()
            .push(&sample.statistic, sample.timestamp, value);
    }

    fn package_has(&self, sample: &Sample) -> bool {
        self.package
            .get(&sample.statistic)
            .and_then(|points| points.last())
            .is_some_and(|(t, _)| *t == sample.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> CounterMap {
        let mut map = CounterMap::default();
        map.insert("cpu-cycles", "cycles");
        map.insert("instructions", "instructions");
        map.insert("power/energy-pkg/", "energy_pkg");
        map
    }

    #[test]
    fn test_ingest_routes_samples() {
        let text = "\
START TIME,1000.0
0.5,CPU0,100,,cpu-cycles
0.5,CPU1,200,,cpu-cycles
0.5,CPU0,<not counted>,,instructions
0.5,CPU0,3.5,Joules,power/energy-pkg/
0.5,CPU1,3.5,Joules,power/energy-pkg/
1.0,CPU0,300,,cpu-cycles
1.0,CPU0,9,,branch-misses
END TIME,1001.0
";
        let quality = QualityStats::new();
        let trace = Trace::from_reader(text.as_bytes(), &map(), &quality).expect("trace parses");

        assert_eq!(trace.start_time, 1000.0);
        assert_eq!(trace.end_time, Some(1001.0));
        assert_eq!(trace.cores.len(), 2);

        let cpu0 = &trace.cores[&CoreId::Logical(0)];
        assert_eq!(cpu0.get("cycles"), Some(&[(0.5, 100.0), (1.0, 300.0)][..]));
        assert_eq!(cpu0.get("instructions"), Some(&[(0.5, 1.0)][..]));

        // Package energy is recorded once per timestamp.
        assert_eq!(trace.package.get("energy_pkg"), Some(&[(0.5, 3.5)][..]));
        assert!(cpu0.get("energy_pkg").is_none());

        assert_eq!(quality.get(Anomaly::NotCountedSample), 1);
        assert_eq!(quality.get(Anomaly::UnknownEvent), 1);
    }

    #[test]
    fn test_not_counted_energy_keeps_its_interval() {
        let text = "\
0.5,CPU0,<not counted>,Joules,power/energy-pkg/
0.5,CPU1,<not counted>,Joules,power/energy-pkg/
1.0,CPU0,4,Joules,power/energy-pkg/
1.0,CPU1,4,Joules,power/energy-pkg/
";
        let quality = QualityStats::new();
        let trace = Trace::from_reader(text.as_bytes(), &map(), &quality).expect("trace parses");

        assert_eq!(
            trace.package.get("energy_pkg"),
            Some(&[(0.5, 1.0), (1.0, 4.0)][..])
        );
        assert_eq!(quality.get(Anomaly::NotCountedSample), 2);
    }

    #[test]
    fn test_ingest_sorts_out_of_order_rows() {
        let text = "\
1.0,CPU0,20,,cpu-cycles
0.5,CPU0,10,,cpu-cycles
";
        let quality = QualityStats::new();
        let trace = Trace::from_reader(text.as_bytes(), &map(), &quality).expect("trace parses");
        let cpu0 = &trace.cores[&CoreId::Logical(0)];
        assert_eq!(cpu0.get("cycles"), Some(&[(0.5, 10.0), (1.0, 20.0)][..]));
        assert_eq!(trace.start_time, 0.0);
    }

    #[test]
    fn test_ingest_reports_line_of_bad_row() {
        let text = "START TIME,5\n0.5,CPU0,many,,cpu-cycles\n";
        let quality = QualityStats::new();
        let err = Trace::from_reader(text.as_bytes(), &map(), &quality).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
