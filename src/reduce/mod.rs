//! Hyperthread reducer.
//!
//! Merges the sibling logical threads of each physical core into one record
//! per bin. Logical thread `j` belongs to physical core `j mod cores`.
//!
//! Counts of work (instructions, cache accesses) are summed across siblings.
//! Cycle counts are not: siblings share one clock, so the physical total is
//! the sibling average and busy cycles come from an [`OverlapPolicy`]
//! estimate clamped to the total.

pub mod overlap;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use self::overlap::{Overlap, OverlapPolicy};
use crate::config::TopologyConfig;
use crate::derive::{CYCLE_STATS, RATIO_STATS};
use crate::stats::{Anomaly, Bin, CoreId, CoreRecords, QualityStats};

/// One physical core's statistics for one bin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalBin {
    /// Additive statistics summed over siblings.
    pub stats: Bin,
    pub total_cycles: f64,
    /// Always `<= total_cycles`.
    pub busy_cycles: f64,
    /// Always `>= 0`.
    pub idle_cycles: f64,
    /// Busy cycles of the busiest sibling.
    pub peak_sibling_busy: f64,
    /// The overlap estimate exceeded `total_cycles` and was clamped.
    pub clamped: bool,
}

/// Reduced record of one physical core, keyed by bin index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalCoreRecord {
    pub core: u32,
    bins: BTreeMap<u64, PhysicalBin>,
}

impl PhysicalCoreRecord {
    pub fn new(core: u32) -> Self {
        Self {
            core,
            bins: BTreeMap::new(),
        }
    }

    pub fn bin(&self, index: u64) -> Option<&PhysicalBin> {
        self.bins.get(&index)
    }

    pub fn insert(&mut self, index: u64, bin: PhysicalBin) {
        self.bins.insert(index, bin);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &PhysicalBin)> {
        self.bins.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// Reduces logical core records onto physical cores.
#[derive(Debug, Clone, Copy)]
pub struct Reducer {
    cores: u32,
    threads_per_core: u32,
    overlap: Overlap,
}

impl Reducer {
    pub fn new(topology: &TopologyConfig, overlap: Overlap) -> Self {
        Self {
            cores: topology.cores,
            threads_per_core: topology.threads_per_core,
            overlap,
        }
    }

    pub fn hw_threads(&self) -> u32 {
        self.cores * self.threads_per_core
    }

    /// Logical threads sharing physical core `core`: `core, core + cores, ...`.
    pub fn siblings(&self, core: u32) -> impl Iterator<Item = u32> {
        (core..self.hw_threads()).step_by(self.cores.max(1) as usize)
    }

    /// Produces one record per physical core, in core order.
    ///
    /// Every logical thread of the topology must have a record. Logical cores
    /// beyond the topology are ignored with a warning.
    pub fn reduce(
        &self,
        records: &CoreRecords,
        quality: &QualityStats,
    ) -> Result<Vec<PhysicalCoreRecord>> {
        let hw_threads = self.hw_threads();

        for (id, _) in records.logical() {
            if id >= hw_threads {
                warn!(
                    core = %CoreId::Logical(id),
                    hw_threads,
                    "logical core outside configured topology, ignoring"
                );
            }
        }
        for j in 0..hw_threads {
            if records.get(CoreId::Logical(j)).is_none() {
                bail!(
                    "trace has no samples for {}, topology expects {} logical threads",
                    CoreId::Logical(j),
                    hw_threads
                );
            }
        }

        let mut physical = Vec::with_capacity(self.cores as usize);

        for core in 0..self.cores {
            let siblings: Vec<_> = self
                .siblings(core)
                .filter_map(|j| records.get(CoreId::Logical(j)))
                .collect();

            let mut indices: Vec<u64> = siblings.iter().flat_map(|r| r.indices()).collect();
            indices.sort_unstable();
            indices.dedup();

            let mut record = PhysicalCoreRecord::new(core);
            for index in indices {
                let bins: Vec<&Bin> = siblings.iter().filter_map(|r| r.bin(index)).collect();
                if bins.len() < siblings.len() {
                    debug!(
                        core,
                        bin = index,
                        present = bins.len(),
                        "bin missing on some siblings, reducing the rest"
                    );
                }
                let bin = self.reduce_bin(&bins);
                if bin.clamped {
                    quality.record(Anomaly::OverlapClamp);
                    warn!(
                        core,
                        bin = index,
                        policy = self.overlap.name(),
                        total_cycles = bin.total_cycles,
                        "busy cycle estimate exceeds total cycles, clamping"
                    );
                }
                record.insert(index, bin);
            }

            debug!(core, bins = record.len(), "reduced physical core");
            physical.push(record);
        }

        Ok(physical)
    }

    /// Reduces the sibling bins of one physical core.
    ///
    /// Only siblings that recorded the bin are passed in; the physical total
    /// is their average.
    pub fn reduce_bin(&self, siblings: &[&Bin]) -> PhysicalBin {
        let mut stats = Bin::new();
        for bin in siblings {
            for (name, value) in bin.iter() {
                if RATIO_STATS.contains(&name) || CYCLE_STATS.contains(&name) {
                    continue;
                }
                stats.add(name, value);
            }
        }

        let busy: Vec<f64> = siblings.iter().map(|b| b.value("busy_cycles")).collect();
        let summed_total: f64 = siblings.iter().map(|b| b.value("total_cycles")).sum();
        let total_cycles = summed_total / siblings.len().max(1) as f64;

        let estimate = self.overlap.estimate(&busy);
        let clamped = estimate > total_cycles;
        let busy_cycles = if clamped { total_cycles } else { estimate };

        PhysicalBin {
            stats,
            total_cycles,
            busy_cycles,
            idle_cycles: total_cycles - busy_cycles,
            peak_sibling_busy: busy.iter().copied().fold(0.0, f64::max),
            clamped,
        }
    }
}
