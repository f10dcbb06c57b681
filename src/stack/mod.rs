//! Power-stack aggregation.
//!
//! Reduces a parsed [`PowerReport`] into a fixed set of functional-unit
//! categories per physical core and for the whole processor. Leakage is
//! interpolated between the always-on and power-gated figures with the
//! core's measured activity for the bin.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};

use crate::config::{CalibrationConfig, StaticModel};
use crate::reduce::PhysicalBin;
use crate::report::{ComponentValues, PowerReport};

/// Functional-unit categories, in output column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    CoreOoo,
    CoreIfetch,
    CoreIcache,
    CoreDcache,
    CoreAluComplex,
    CoreAluFp,
    CoreAluInt,
    CoreMem,
    L2,
    L3,
}

impl Category {
    pub const ALL: &'static [Category] = &[
        Category::CoreOoo,
        Category::CoreIfetch,
        Category::CoreIcache,
        Category::CoreDcache,
        Category::CoreAluComplex,
        Category::CoreAluFp,
        Category::CoreAluInt,
        Category::CoreMem,
        Category::L2,
        Category::L3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CoreOoo => "core-ooo",
            Self::CoreIfetch => "core-ifetch",
            Self::CoreIcache => "core-icache",
            Self::CoreDcache => "core-dcache",
            Self::CoreAluComplex => "core-alu-complex",
            Self::CoreAluFp => "core-alu-fp",
            Self::CoreAluInt => "core-alu-int",
            Self::CoreMem => "core-mem",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }

    /// Sub-paths inside a `Core` component summed into this category.
    fn core_paths(self) -> &'static [&'static str] {
        match self {
            Self::CoreOoo => &[
                "Execution Unit/Instruction Scheduler",
                "Execution Unit/Register Files",
                "Execution Unit/Results Broadcast Bus",
                "Renaming Unit",
            ],
            Self::CoreIfetch => &[
                "Instruction Fetch Unit/Branch Predictor",
                "Instruction Fetch Unit/Branch Target Buffer",
                "Instruction Fetch Unit/Instruction Buffer",
                "Instruction Fetch Unit/Instruction Decoder",
            ],
            Self::CoreIcache => &["Instruction Fetch Unit/Instruction Cache"],
            Self::CoreDcache => &["Load Store Unit/Data Cache"],
            Self::CoreAluComplex => &["Execution Unit/Complex ALUs"],
            Self::CoreAluFp => &["Execution Unit/Floating Point Units"],
            Self::CoreAluInt => &["Execution Unit/Integer ALUs"],
            Self::CoreMem => &[
                "Load Store Unit/LoadQ",
                "Load Store Unit/StoreQ",
                "Memory Management Unit",
            ],
            // Private L2 inside the core.
            Self::L2 => &["L2"],
            Self::L3 => &[],
        }
    }

    fn is_cache(self) -> bool {
        matches!(self, Self::L2 | Self::L3)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantity extracted from a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerKind {
    /// `Runtime Dynamic`.
    Dynamic,
    /// Leakage interpolated by activity, plus gate leakage.
    Static,
    /// `Dynamic + Static`.
    Total,
    /// `Area + Area Overhead`.
    Area,
}

/// Part of the processor a stack is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// All cores plus shared caches.
    All,
    /// One physical core (private resources only).
    Core(usize),
}

impl Scope {
    /// Categories reported for this scope. A single core has no L3 slice.
    pub fn categories(self) -> &'static [Category] {
        match self {
            Self::All => Category::ALL,
            Self::Core(_) => &Category::ALL[..9],
        }
    }
}

/// Value of one kind for the sub-tree at `path` (or the component root).
pub fn component_power(
    values: &ComponentValues,
    path: Option<&str>,
    kind: PowerKind,
    activity: f64,
) -> f64 {
    let get = |suffix: &str| match path {
        Some(path) => values.get(&format!("{path}/{suffix}")),
        None => values.get(suffix),
    };
    let dynamic = || get("Runtime Dynamic");
    let leakage = || {
        get("Subthreshold Leakage") * activity
            + get("Subthreshold Leakage with power gating") * (1.0 - activity)
            + get("Gate Leakage")
    };

    match kind {
        PowerKind::Dynamic => dynamic(),
        PowerKind::Static => leakage(),
        PowerKind::Total => dynamic() + leakage(),
        PowerKind::Area => get("Area") + get("Area Overhead"),
    }
}

/// Sums report sub-paths into categories for one scope and kind.
///
/// `activity[k]` is physical core `k`'s activity fraction; cores without an
/// entry count as fully active. Shared caches always use full activity.
/// Missing sub-paths contribute `0`.
pub fn power_stack(
    report: &PowerReport,
    scope: Scope,
    kind: PowerKind,
    activity: &[f64],
    cache_weight: f64,
) -> Result<BTreeMap<Category, f64>> {
    let activity_of = |k: usize| activity.get(k).copied().unwrap_or(1.0);

    let cores: Vec<(usize, &ComponentValues)> = match scope {
        Scope::All => report.cores.iter().enumerate().collect(),
        Scope::Core(k) => match report.core(k) {
            Some(core) => vec![(k, core)],
            None => bail!(
                "power report has {} cores, core {k} requested",
                report.cores.len()
            ),
        },
    };

    let mut stack = BTreeMap::new();
    for &category in scope.categories() {
        let mut value: f64 = cores
            .iter()
            .map(|&(k, core)| {
                category
                    .core_paths()
                    .iter()
                    .map(|&path| component_power(core, Some(path), kind, activity_of(k)))
                    .sum::<f64>()
            })
            .sum();

        if scope == Scope::All {
            let shared: &[ComponentValues] = match category {
                Category::L2 => report.l2.as_slice(),
                Category::L3 => report.l3.as_slice(),
                _ => &[],
            };
            value += shared
                .iter()
                .map(|cache| component_power(cache, None, kind, 1.0))
                .sum::<f64>();
        }

        if category.is_cache() {
            value *= cache_weight;
        }
        stack.insert(category, value);
    }

    Ok(stack)
}

/// Dynamic and leakage watts of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CategoryPower {
    pub dynamic: f64,
    pub leakage: f64,
}

/// Power stack for one bin and one physical core (or the whole processor).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerStackEntry {
    pub categories: BTreeMap<Category, CategoryPower>,
    /// Static watts attributed to the scope.
    pub static_watts: f64,
}

impl PowerStackEntry {
    pub fn dynamic(&self) -> f64 {
        self.categories.values().map(|c| c.dynamic).sum()
    }

    /// `sum(dynamic) + static`.
    pub fn total(&self) -> f64 {
        self.dynamic() + self.static_watts
    }
}

/// Power stacks of every physical core and the processor for one bin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinPower {
    pub cores: Vec<PowerStackEntry>,
    pub total: PowerStackEntry,
}

/// Turns reports into power stacks using calibration constants.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    cache_weight: f64,
    static_model: StaticModel,
    static_active_watts: f64,
    static_idle_watts: f64,
    reference_clock_hz: f64,
    bin_size_secs: f64,
}

impl Aggregator {
    pub fn new(calibration: &CalibrationConfig, bin_size_secs: f64) -> Self {
        Self {
            cache_weight: calibration.cache_weight,
            static_model: calibration.static_model,
            static_active_watts: calibration.static_active_watts,
            static_idle_watts: calibration.static_idle_watts,
            reference_clock_hz: calibration.reference_clock_hz,
            bin_size_secs,
        }
    }

    /// Busiest sibling's busy cycles over the reference cycles in one bin.
    ///
    /// Not clamped: measurement noise can push it slightly above 1.
    pub fn activity(&self, bin: &PhysicalBin) -> f64 {
        bin.peak_sibling_busy / (self.reference_clock_hz * self.bin_size_secs)
    }

    /// Two-point static estimate for one core.
    pub fn two_point_static(&self, activity: f64) -> f64 {
        activity * self.static_active_watts + (1.0 - activity) * self.static_idle_watts
    }

    fn entry(
        &self,
        report: &PowerReport,
        scope: Scope,
        activity: &[f64],
    ) -> Result<PowerStackEntry> {
        let dynamic = power_stack(report, scope, PowerKind::Dynamic, activity, self.cache_weight)?;
        let leakage = power_stack(report, scope, PowerKind::Static, activity, self.cache_weight)?;

        let categories: BTreeMap<Category, CategoryPower> = dynamic
            .into_iter()
            .map(|(category, dynamic)| {
                let leakage = leakage.get(&category).copied().unwrap_or(0.0);
                (category, CategoryPower { dynamic, leakage })
            })
            .collect();

        let static_watts = match (self.static_model, scope) {
            (StaticModel::TwoPoint, Scope::Core(k)) => {
                self.two_point_static(activity.get(k).copied().unwrap_or(1.0))
            }
            (StaticModel::TwoPoint, Scope::All) => {
                activity.iter().map(|a| self.two_point_static(*a)).sum()
            }
            (StaticModel::Leakage, _) => categories.values().map(|c| c.leakage).sum(),
        };

        Ok(PowerStackEntry {
            categories,
            static_watts,
        })
    }

    /// Builds per-core and processor stacks for one bin.
    ///
    /// `activity` holds one fraction per physical core.
    pub fn aggregate(&self, report: &PowerReport, activity: &[f64]) -> Result<BinPower> {
        let cores = (0..activity.len())
            .map(|k| self.entry(report, Scope::Core(k), activity))
            .collect::<Result<Vec<_>>>()?;
        let total = self.entry(report, Scope::All, activity)?;
        Ok(BinPower { cores, total })
    }
}
