//! Record types shared by the pipeline stages.
//!
//! Each stage owns the records it produces; later stages only read them.

pub mod quality;
pub mod record;

pub use quality::{Anomaly, QualityStats};
pub use record::{Bin, BinClock, CoreId, CoreRecord, CoreRecords};
