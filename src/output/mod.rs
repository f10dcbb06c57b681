//! CSV result tables.
//!
//! Every table has a leading `timestamp` column holding the absolute start
//! of the bin, with rows in bin order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::stack::{BinPower, Category, PowerStackEntry, Scope};
use crate::stats::{BinClock, CoreId, CoreRecord};

/// Writes result tables into one output directory.
#[derive(Debug, Clone)]
pub struct CsvOutput {
    dir: PathBuf,
    clock: BinClock,
}

impl CsvOutput {
    pub fn new(dir: &Path, clock: BinClock) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
        })
    }

    fn write_table(
        &self,
        file_name: &str,
        header: Vec<String>,
        rows: impl Iterator<Item = Vec<String>>,
    ) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        let mut wtr = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;

        wtr.write_record(&header)?;
        let mut count = 0usize;
        for row in rows {
            wtr.write_record(&row)?;
            count += 1;
        }
        wtr.flush()
            .with_context(|| format!("flushing {}", path.display()))?;

        debug!(path = %path.display(), rows = count, "wrote table");
        Ok(path)
    }

    /// Writes every statistic of a record; absent values are written as `0`.
    fn write_record(&self, file_name: &str, record: &CoreRecord) -> Result<PathBuf> {
        let names = record.stat_names();
        let mut header = vec!["timestamp".to_string()];
        header.extend(names.iter().cloned());

        let rows = record.iter().map(|(index, bin)| {
            let mut row = vec![self.clock.timestamp(index).to_string()];
            row.extend(names.iter().map(|name| bin.value(name).to_string()));
            row
        });
        self.write_table(file_name, header, rows)
    }

    /// `cntrs_processed_<CORE>.csv`.
    pub fn write_core_stats(&self, core: CoreId, record: &CoreRecord) -> Result<PathBuf> {
        self.write_record(&format!("cntrs_processed_{core}.csv"), record)
    }

    /// `rapl.csv` with package energy and the derived power.
    pub fn write_rapl(&self, package: &CoreRecord) -> Result<PathBuf> {
        self.write_record("rapl.csv", package)
    }

    /// `power_core<k>.csv`: per-category dynamic power, static, sum.
    pub fn write_core_power(
        &self,
        core: usize,
        power: &BTreeMap<u64, BinPower>,
    ) -> Result<PathBuf> {
        let categories = Scope::Core(core).categories();
        let mut header = vec!["timestamp".to_string()];
        header.extend(categories.iter().map(|c| format!("{c}_dynamic")));
        header.push("static".to_string());
        header.push("sum".to_string());

        let rows = power.iter().filter_map(|(index, bin)| {
            let entry = bin.cores.get(core)?;
            let mut row = vec![self.clock.timestamp(*index).to_string()];
            row.extend(dynamic_columns(entry, categories));
            row.push(entry.static_watts.to_string());
            row.push(entry.total().to_string());
            Some(row)
        });
        self.write_table(&format!("power_core{core}.csv"), header, rows)
    }

    /// `power.csv`: processor-wide dynamic power by category, plus totals.
    pub fn write_total_power(&self, power: &BTreeMap<u64, BinPower>) -> Result<PathBuf> {
        let categories = Scope::All.categories();
        let mut header = vec!["timestamp".to_string()];
        header.extend(categories.iter().map(|c| format!("{c}_dynamic")));
        header.extend(["dynamic", "static", "sum"].map(String::from));

        let rows = power.iter().map(|(index, bin)| {
            let entry = &bin.total;
            let mut row = vec![self.clock.timestamp(*index).to_string()];
            row.extend(dynamic_columns(entry, categories));
            row.push(entry.dynamic().to_string());
            row.push(entry.static_watts.to_string());
            row.push(entry.total().to_string());
            row
        });
        self.write_table("power.csv", header, rows)
    }
}

fn dynamic_columns<'a>(
    entry: &'a PowerStackEntry,
    categories: &'a [Category],
) -> impl Iterator<Item = String> + 'a {
    categories.iter().map(|c| {
        entry
            .categories
            .get(c)
            .map(|p| p.dynamic)
            .unwrap_or(0.0)
            .to_string()
    })
}
