use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifies a logical core record, or the synthetic sum over all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreId {
    /// A logical hardware thread as reported by the collector (`CPU<n>`).
    Logical(u32),
    /// Elementwise sum of all logical cores.
    Total,
}

impl CoreId {
    /// Parses collector core labels such as `CPU3`, `cpu3` or a bare `3`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("TOTAL") {
            return Some(Self::Total);
        }
        let digits = raw
            .strip_prefix("CPU")
            .or_else(|| raw.strip_prefix("cpu"))
            .unwrap_or(raw);
        digits.parse().ok().map(Self::Logical)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical(n) => write!(f, "CPU{n}"),
            Self::Total => f.write_str("TOTAL"),
        }
    }
}

/// Maps bin indices to absolute timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinClock {
    /// Absolute trace start time in seconds.
    pub start_time: f64,
    /// Bin width in seconds.
    pub bin_size: f64,
}

impl BinClock {
    pub fn new(start_time: f64, bin_size: f64) -> Self {
        Self {
            start_time,
            bin_size,
        }
    }

    /// Absolute start of bin `index`.
    pub fn timestamp(&self, index: u64) -> f64 {
        self.start_time + index as f64 * self.bin_size
    }
}

/// One fixed-width time bin: statistic name to aggregated value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bin {
    stats: BTreeMap<String, f64>,
}

impl Bin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a statistic, if present.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.stats.get(name).copied()
    }

    /// Value of a statistic, reading an absent one as `0`.
    pub fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stats.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: f64) {
        match self.stats.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.stats.insert(name.to_string(), value);
            }
        }
    }

    pub fn add(&mut self, name: &str, value: f64) {
        match self.stats.get_mut(name) {
            Some(slot) => *slot += value,
            None => {
                self.stats.insert(name.to_string(), value);
            }
        }
    }

    /// Adds every statistic of `other` into this bin.
    pub fn accumulate(&mut self, other: &Bin) {
        for (name, value) in &other.stats {
            self.add(name, *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.stats.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stats.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Per-core series of bins keyed by bin index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreRecord {
    bins: BTreeMap<u64, Bin>,
}

impl CoreRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bin(&self, index: u64) -> Option<&Bin> {
        self.bins.get(&index)
    }

    /// Returns the bin at `index`, creating an empty one if needed.
    pub fn bin_mut(&mut self, index: u64) -> &mut Bin {
        self.bins.entry(index).or_default()
    }

    pub fn set(&mut self, index: u64, name: &str, value: f64) {
        self.bin_mut(index).set(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bin)> {
        self.bins.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut Bin)> {
        self.bins.iter_mut().map(|(k, v)| (*k, v))
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.bins.keys().copied()
    }

    /// Union of statistic names across all bins, sorted.
    pub fn stat_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.bins.values().flat_map(Bin::names).collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Sum of one statistic over all bins.
    pub fn sum(&self, name: &str) -> f64 {
        self.bins.values().map(|b| b.value(name)).sum()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// All per-core records of one ingest, including the derived TOTAL view.
#[derive(Debug, Clone, Default)]
pub struct CoreRecords {
    cores: BTreeMap<CoreId, CoreRecord>,
}

impl CoreRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: CoreId, record: CoreRecord) {
        self.cores.insert(id, record);
    }

    pub fn get(&self, id: CoreId) -> Option<&CoreRecord> {
        self.cores.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoreId, &CoreRecord)> {
        self.cores.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CoreId, &mut CoreRecord)> {
        self.cores.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Logical cores only, in id order.
    pub fn logical(&self) -> impl Iterator<Item = (u32, &CoreRecord)> {
        self.cores.iter().filter_map(|(id, rec)| match id {
            CoreId::Logical(n) => Some((*n, rec)),
            CoreId::Total => None,
        })
    }

    /// Union of bin indices across all cores, sorted.
    pub fn bin_indices(&self) -> Vec<u64> {
        let indices: BTreeSet<u64> = self.cores.values().flat_map(CoreRecord::indices).collect();
        indices.into_iter().collect()
    }

    /// Rebuilds the TOTAL record as the elementwise sum of all logical cores.
    pub fn rebuild_total(&mut self) {
        let mut total = CoreRecord::new();
        for (_, record) in self.logical() {
            for (index, bin) in record.iter() {
                total.bin_mut(index).accumulate(bin);
            }
        }
        self.cores.insert(CoreId::Total, total);
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_id_parse_and_display() {
        assert_eq!(CoreId::parse("CPU3"), Some(CoreId::Logical(3)));
        assert_eq!(CoreId::parse("cpu12"), Some(CoreId::Logical(12)));
        assert_eq!(CoreId::parse(" 7 "), Some(CoreId::Logical(7)));
        assert_eq!(CoreId::parse("TOTAL"), Some(CoreId::Total));
        assert_eq!(CoreId::parse("socket0"), None);

        assert_eq!(CoreId::Logical(3).to_string(), "CPU3");
        assert_eq!(CoreId::Total.to_string(), "TOTAL");
    }

    #[test]
    fn test_total_sorts_after_logical() {
        let mut ids = vec![CoreId::Total, CoreId::Logical(2), CoreId::Logical(0)];
        ids.sort();
        assert_eq!(
            ids,
            vec![CoreId::Logical(0), CoreId::Logical(2), CoreId::Total]
        );
    }

    #[test]
    fn test_bin_clock() {
        let clock = BinClock::new(100.0, 0.5);
        assert_eq!(clock.timestamp(0), 100.0);
        assert_eq!(clock.timestamp(3), 101.5);
    }

    #[test]
    fn test_bin_value_defaults_to_zero() {
        let mut bin = Bin::new();
        bin.set("cycles", 10.0);
        bin.add("cycles", 5.0);
        bin.add("instructions", 3.0);

        assert_eq!(bin.get("cycles"), Some(15.0));
        assert_eq!(bin.value("instructions"), 3.0);
        assert_eq!(bin.value("l3_misses"), 0.0);
        assert!(bin.get("l3_misses").is_none());
    }

    #[test]
    fn test_rebuild_total_sums_logical_cores() {
        let mut records = CoreRecords::new();

        let mut cpu0 = CoreRecord::new();
        cpu0.set(0, "instructions", 100.0);
        cpu0.set(1, "instructions", 50.0);
        records.insert(CoreId::Logical(0), cpu0);

        let mut cpu1 = CoreRecord::new();
        cpu1.set(0, "instructions", 10.0);
        cpu1.set(2, "cycles", 7.0);
        records.insert(CoreId::Logical(1), cpu1);

        records.rebuild_total();
        let total = records.get(CoreId::Total).expect("total exists");

        assert_eq!(total.bin(0).map(|b| b.value("instructions")), Some(110.0));
        assert_eq!(total.bin(1).map(|b| b.value("instructions")), Some(50.0));
        assert_eq!(total.bin(2).map(|b| b.value("cycles")), Some(7.0));
        assert_eq!(records.bin_indices(), vec![0, 1, 2]);

        // Rebuilding must not fold the old TOTAL into itself.
        records.rebuild_total();
        let total = records.get(CoreId::Total).expect("total exists");
        assert_eq!(total.sum("instructions"), 160.0);
    }

    #[test]
    fn test_stat_names_union() {
        let mut rec = CoreRecord::new();
        rec.set(0, "b", 1.0);
        rec.set(1, "a", 1.0);
        assert_eq!(rec.stat_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
