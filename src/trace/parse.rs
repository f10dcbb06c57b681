//! Row decoding for raw counter traces.
//!
//! A trace row is either a sentinel (`START TIME,<t>` / `END TIME,<t>`) or a
//! reading `timestamp,core,value,...,raw_event` where the raw event name is
//! the last non-empty column.

use thiserror::Error;

use super::sample::CounterValue;
use crate::stats::CoreId;

const START_TIME: &str = "START TIME";
const END_TIME: &str = "END TIME";

/// Collector markers for events that were not scheduled during an interval.
const NOT_COUNTED_MARKERS: &[&str] = &["<not counted>", "<not supported>"];

/// Errors that can occur while decoding trace or counter-map rows.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("line {line}: expected at least {expected} columns, found {found}")]
    TooFewColumns {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid timestamp {raw:?}")]
    InvalidTimestamp { line: u64, raw: String },

    #[error("line {line}: invalid core id {raw:?}")]
    InvalidCore { line: u64, raw: String },

    #[error("line {line}: invalid counter value {raw:?}")]
    InvalidValue { line: u64, raw: String },

    #[error("line {line}: counter mapping needs `raw,canonical`")]
    MalformedMapping { line: u64 },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// A decoded trace row.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    StartTime(f64),
    EndTime(f64),
    Reading {
        timestamp: f64,
        core: CoreId,
        value: CounterValue,
        raw_event: String,
    },
}

/// Decodes one CSV record of a counter trace.
pub fn parse_row(record: &csv::StringRecord, line: u64) -> Result<Row, IngestError> {
    let first = record.get(0).unwrap_or_default();

    if first == START_TIME || first == END_TIME {
        let raw = record.get(1).ok_or(IngestError::TooFewColumns {
            line,
            expected: 2,
            found: record.len(),
        })?;
        let t = parse_f64(raw).ok_or_else(|| IngestError::InvalidTimestamp {
            line,
            raw: raw.to_string(),
        })?;
        return Ok(if first == START_TIME {
            Row::StartTime(t)
        } else {
            Row::EndTime(t)
        });
    }

    if record.len() < 4 {
        return Err(IngestError::TooFewColumns {
            line,
            expected: 4,
            found: record.len(),
        });
    }

    let timestamp = parse_f64(first).ok_or_else(|| IngestError::InvalidTimestamp {
        line,
        raw: first.to_string(),
    })?;

    let core_raw = record.get(1).unwrap_or_default();
    let core = CoreId::parse(core_raw).ok_or_else(|| IngestError::InvalidCore {
        line,
        raw: core_raw.to_string(),
    })?;

    let value = parse_value(record.get(2).unwrap_or_default()).ok_or_else(|| {
        IngestError::InvalidValue {
            line,
            raw: record.get(2).unwrap_or_default().to_string(),
        }
    })?;

    let raw_event = (3..record.len())
        .rev()
        .filter_map(|i| record.get(i))
        .find(|field| !field.is_empty())
        .ok_or(IngestError::TooFewColumns {
            line,
            expected: 4,
            found: 3,
        })?;

    Ok(Row::Reading {
        timestamp,
        core,
        value,
        raw_event: raw_event.to_string(),
    })
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_value(raw: &str) -> Option<CounterValue> {
    let raw = raw.trim();
    if NOT_COUNTED_MARKERS.contains(&raw) {
        return Some(CounterValue::NotCounted);
    }
    parse_f64(raw).map(CounterValue::Counted)
}
