use crate::stats::CoreId;

/// Value column of a counter row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    Counted(f64),
    /// The collector could not schedule the event for this interval.
    NotCounted,
}

impl CounterValue {
    /// Sentinel substituted for not-counted events.
    ///
    /// `1` rather than `0` keeps ratio statistics finite downstream; it is
    /// not a measurement.
    pub const NOT_COUNTED_SENTINEL: f64 = 1.0;

    /// Numeric value with the not-counted sentinel applied.
    pub fn resolve(self) -> f64 {
        match self {
            Self::Counted(v) => v,
            Self::NotCounted => Self::NOT_COUNTED_SENTINEL,
        }
    }
}

/// One raw counter reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Seconds since trace start; the reading covers the interval ending here.
    pub timestamp: f64,
    pub core: CoreId,
    /// Canonical statistic name after translation.
    pub statistic: String,
    pub value: CounterValue,
}
