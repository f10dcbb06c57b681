//! Derived per-bin statistics.
//!
//! Runs after resampling over every core record (TOTAL included) and adds
//! frequency, cycle accounting, IPC, miss rates and TLB MPKI to each bin.
//! Ratios with a zero denominator evaluate to `0`.

use tracing::warn;

use crate::stats::{Anomaly, Bin, CoreId, CoreRecord, CoreRecords, QualityStats};

/// Derived statistics that are ratios or rates; never summed across cores.
pub const RATIO_STATS: &[&str] = &[
    "frequency",
    "ipc",
    "branch_miss_rate",
    "icache_miss_rate",
    "dcache_miss_rate",
    "l2_miss_rate",
    "l3_miss_rate",
    "itlb_mpki",
    "dtlb_mpki",
];

/// Cycle statistics with special reduction rules.
pub const CYCLE_STATS: &[&str] = &["total_cycles", "busy_cycles", "idle_cycles"];

/// Instructions per icache read when the core does not count icache reads.
pub const INSTRUCTIONS_PER_ICACHE_READ: f64 = 3.0;

/// Optional counter groups present in a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `l3_misses` was recorded.
    pub l3: bool,
    /// `fp_uops_executed` was recorded.
    pub fp: bool,
    /// `energy_cores` was recorded in the package series.
    pub rapl: bool,
}

impl Capabilities {
    /// Detects capabilities from the first bin of the first logical core and
    /// the first package bin. Absent groups are logged and counted.
    pub fn detect(records: &CoreRecords, package: &CoreRecord, quality: &QualityStats) -> Self {
        let first = records
            .logical()
            .next()
            .and_then(|(_, rec)| rec.iter().next().map(|(_, bin)| bin));
        let has = |name: &str| first.is_some_and(|bin| bin.contains(name));

        let caps = Self {
            l3: has("l3_misses"),
            fp: has("fp_uops_executed"),
            rapl: package
                .iter()
                .next()
                .is_some_and(|(_, bin)| bin.contains("energy_cores")),
        };

        for (flag, statistic, effect) in [
            (caps.l3, "l3_misses", "L3 statistics will be zero"),
            (caps.fp, "fp_uops_executed", "floating-point statistics will be zero"),
            (caps.rapl, "energy_cores", "rapl.csv will not be written"),
        ] {
            if !flag {
                quality.record(Anomaly::MissingStatistic);
                warn!(statistic, "{effect}");
            }
        }

        caps
    }
}

/// Constants feeding the derivation formulas.
#[derive(Debug, Clone, Copy)]
pub struct DeriveParams {
    pub bin_size_secs: f64,
    pub tsc_frequency_hz: f64,
    /// Lanes per floating-point uop.
    pub fp_simd_scale: f64,
}

/// `num / den`, or `0` when the denominator is zero.
pub fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Adds derived statistics to one bin in place.
///
/// `threads` is the number of logical threads the bin aggregates: `1` for a
/// logical core, the hardware thread count for TOTAL.
pub fn derive_bin(bin: &mut Bin, caps: Capabilities, params: &DeriveParams, threads: u32) {
    let cycles = bin.value("cycles");
    let instructions = bin.value("instructions");

    let frequency = params.tsc_frequency_hz * ratio(cycles, bin.value("ref-cycles")) / 1e6;
    let total_cycles = params.bin_size_secs * frequency * 1e6 * threads.max(1) as f64;

    bin.set("frequency", frequency);
    bin.set("total_cycles", total_cycles);
    bin.set("busy_cycles", cycles);
    bin.set("idle_cycles", total_cycles - cycles);
    bin.set("ipc", ratio(instructions, cycles));

    bin.set(
        "branch_miss_rate",
        ratio(
            bin.value("branches_mispredicted"),
            bin.value("branches_executed"),
        ),
    );
    bin.set(
        "icache_miss_rate",
        ratio(
            bin.value("icache_misses"),
            instructions / INSTRUCTIONS_PER_ICACHE_READ,
        ),
    );
    bin.set(
        "dcache_miss_rate",
        ratio(
            bin.value("dcache_read_misses") + bin.value("dcache_write_misses"),
            bin.value("dcache_reads") + bin.value("dcache_writes"),
        ),
    );
    bin.set(
        "l2_miss_rate",
        ratio(bin.value("l2_misses"), bin.value("l2_accesses")),
    );
    let l3_miss_rate = if caps.l3 {
        ratio(bin.value("l3_misses"), bin.value("l3_accesses"))
    } else {
        0.0
    };
    bin.set("l3_miss_rate", l3_miss_rate);

    bin.set("itlb_mpki", ratio(bin.value("itlb_misses"), instructions) * 1000.0);
    bin.set("dtlb_mpki", ratio(bin.value("dtlb_misses"), instructions) * 1000.0);

    if caps.fp {
        let executed = bin.value("fp_uops_executed") * params.fp_simd_scale;
        let retired = bin
            .get("fp_uops_retired")
            .map(|v| v * params.fp_simd_scale)
            .unwrap_or(executed);
        bin.set("fp_uops_executed", executed);
        bin.set("fp_uops_retired", retired);
    } else {
        bin.set("fp_uops_executed", 0.0);
        bin.set("fp_uops_retired", 0.0);
    }
}

/// Derives every bin of every record. TOTAL is treated as `hw_threads` threads.
pub fn derive_records(
    records: &mut CoreRecords,
    caps: Capabilities,
    params: &DeriveParams,
    hw_threads: u32,
) {
    for (core, record) in records.iter_mut() {
        let threads = match core {
            CoreId::Total => hw_threads,
            CoreId::Logical(_) => 1,
        };
        for (_, bin) in record.iter_mut() {
            derive_bin(bin, caps, params, threads);
        }
    }
}

/// Adds `power_pkg` and `power_cores` (watts) to every package bin.
pub fn derive_rapl(package: &mut CoreRecord, bin_size_secs: f64) {
    for (_, bin) in package.iter_mut() {
        let pkg = bin.value("energy_pkg") / bin_size_secs;
        let cores = bin.value("energy_cores") / bin_size_secs;
        bin.set("power_pkg", pkg);
        bin.set("power_cores", cores);
    }
}
