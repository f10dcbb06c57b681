use crate::config::{OverlapConfig, OverlapModel};

/// Estimates how many cycles a physical core was busy from the busy cycles
/// of its sibling logical threads.
///
/// The estimate may exceed the physical core's total cycles; the reducer
/// clamps it.
pub trait OverlapPolicy: Send + Sync {
    /// Returns the policy's name for logging.
    fn name(&self) -> &str;

    fn estimate(&self, sibling_busy: &[f64]) -> f64;
}

/// `factor * sum(sibling busy)`. With `factor = 0.5` this corrects the SMT
/// double counting of two siblings that never overlap.
#[derive(Debug, Clone, Copy)]
pub struct ScaledSum {
    pub factor: f64,
}

impl OverlapPolicy for ScaledSum {
    fn name(&self) -> &str {
        "scaled_sum"
    }

    fn estimate(&self, sibling_busy: &[f64]) -> f64 {
        self.factor * sibling_busy.iter().sum::<f64>()
    }
}

/// Busiest sibling only: siblings are assumed to be busy at the same time.
#[derive(Debug, Clone, Copy)]
pub struct PeakSibling;

impl OverlapPolicy for PeakSibling {
    fn name(&self) -> &str {
        "peak_sibling"
    }

    fn estimate(&self, sibling_busy: &[f64]) -> f64 {
        sibling_busy.iter().copied().fold(0.0, f64::max)
    }
}

/// Configured overlap policy.
///
/// Enum dispatch keeps the reducer free of trait objects.
#[derive(Debug, Clone, Copy)]
pub enum Overlap {
    ScaledSum(ScaledSum),
    PeakSibling(PeakSibling),
}

impl Overlap {
    pub fn from_config(cfg: &OverlapConfig) -> Self {
        match cfg.model {
            OverlapModel::ScaledSum => Self::ScaledSum(ScaledSum { factor: cfg.factor }),
            OverlapModel::PeakSibling => Self::PeakSibling(PeakSibling),
        }
    }
}

impl Default for Overlap {
    fn default() -> Self {
        Self::ScaledSum(ScaledSum { factor: 0.5 })
    }
}

impl OverlapPolicy for Overlap {
    fn name(&self) -> &str {
        match self {
            Self::ScaledSum(p) => p.name(),
            Self::PeakSibling(p) => p.name(),
        }
    }

    fn estimate(&self, sibling_busy: &[f64]) -> f64 {
        match self {
            Self::ScaledSum(p) => p.estimate(sibling_busy),
            Self::PeakSibling(p) => p.estimate(sibling_busy),
        }
    }
}
