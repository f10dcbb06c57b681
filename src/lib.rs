//! Counter-trace to power-stack pipeline.
//!
//! Hardware counter traces are resampled onto fixed-width bins, reduced from
//! logical threads to physical cores, described to an external power model
//! bin by bin, and the model's reports are folded into per-core power stacks.

pub mod config;
pub mod derive;
pub mod descriptor;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod reduce;
pub mod report;
pub mod resample;
pub mod stack;
pub mod stats;
pub mod trace;
