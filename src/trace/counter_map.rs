use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::parse::IngestError;

/// Translation table from raw collector event names to canonical statistic names.
///
/// One `raw,canonical` pair per line; `#` comments and blank lines are ignored.
#[derive(Debug, Clone, Default)]
pub struct CounterMap {
    names: HashMap<String, String>,
}

impl CounterMap {
    /// Loads the table for a microarchitecture from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening counter list {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("parsing counter list {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, IngestError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut names = HashMap::new();
        for (idx, record) in rdr.records().enumerate() {
            let record = record?;
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 1);

            let raw = record.get(0).unwrap_or_default();
            if raw.is_empty() {
                continue;
            }
            let canonical = record
                .get(1)
                .filter(|c| !c.is_empty())
                .ok_or(IngestError::MalformedMapping { line })?;

            names.insert(raw.to_string(), canonical.to_string());
        }

        Ok(Self { names })
    }

    /// Canonical name for a raw event, if known.
    pub fn translate(&self, raw: &str) -> Option<&str> {
        self.names.get(raw).map(String::as_str)
    }

    pub fn insert(&mut self, raw: &str, canonical: &str) {
        self.names.insert(raw.to_string(), canonical.to_string());
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
