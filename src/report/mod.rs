//! Power-model report parser.
//!
//! A report is a sequence of blocks separated by banner lines of `*`. A block
//! whose first non-blank line is a bare `<Name>:` header is a component; any
//! other block (version banner, technology summary) is skipped.
//!
//! Inside a component every line is classified as a [`Line`]. Headers push a
//! path segment onto a [`PathStack`], key/value lines are recorded under the
//! path formed by the enclosing headers, e.g.
//! `Execution Unit/Integer ALUs/Runtime Dynamic`.

use std::collections::BTreeMap;

use thiserror::Error;

/// Characters accepted in a numeric value token.
const NUMBER_CHARS: &[char] = &['-', '+', '.', 'e'];

/// Errors produced while parsing a power report.
#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("power report contains no component blocks")]
    NoComponents,

    #[error("power report lists component {name:?} more than once")]
    DuplicateComponent { name: String },

    #[error("power report line {line}: invalid number in {text:?}")]
    InvalidNumber { line: usize, text: String },
}

/// A classified report line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line<'a> {
    Blank,
    /// Opens a subsection; `segment` is the text before any `:` or `(`.
    Header { indent: usize, segment: &'a str },
    KeyValue { indent: usize, key: &'a str, value: f64 },
    /// Contains `=` but no numeric value (e.g. `Device Type= ITRS ...`).
    Unrecognized,
}

impl<'a> Line<'a> {
    /// Classifies one line. `number` is the 1-based line number used in errors.
    pub fn classify(raw: &'a str, number: usize) -> Result<Self, ReportError> {
        if raw.trim().is_empty() {
            return Ok(Self::Blank);
        }

        let indent = raw.len() - raw.trim_start_matches(' ').len();
        let body = &raw[indent..];

        let Some((key, rest)) = body.split_once('=') else {
            let end = body.find([':', '(']).unwrap_or(body.len());
            return Ok(Self::Header {
                indent,
                segment: body[..end].trim(),
            });
        };

        let rest = rest.trim_start_matches(' ');
        let token_len = rest
            .find(|c: char| !(c.is_ascii_digit() || NUMBER_CHARS.contains(&c)))
            .unwrap_or(rest.len());
        if token_len == 0 {
            return Ok(Self::Unrecognized);
        }
        let (token, tail) = rest.split_at(token_len);

        // `-nan` shows up for leakage of zero-area units.
        let value = if tail.starts_with("nan") {
            0.0
        } else {
            token
                .parse::<f64>()
                .map_err(|_| ReportError::InvalidNumber {
                    line: number,
                    text: raw.trim().to_string(),
                })?
        };

        Ok(Self::KeyValue {
            indent,
            key: key.trim(),
            value,
        })
    }
}

/// Stack of enclosing section headers with their indentation.
#[derive(Debug, Clone, Default)]
pub struct PathStack {
    entries: Vec<(usize, String)>,
}

impl PathStack {
    /// Drops every entry indented at or beyond `indent`.
    fn unwind(&mut self, indent: usize) {
        while self.entries.last().is_some_and(|(i, _)| *i >= indent) {
            self.entries.pop();
        }
    }

    pub fn enter(&mut self, indent: usize, segment: &str) {
        self.unwind(indent);
        self.entries.push((indent, segment.to_string()));
    }

    /// Path of `key` at `indent` (segments joined with `/`).
    pub fn qualify(&mut self, indent: usize, key: &str) -> String {
        self.unwind(indent);
        let mut path = String::new();
        for (_, segment) in &self.entries {
            path.push_str(segment);
            path.push('/');
        }
        path.push_str(key);
        path
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }
}

/// Path-qualified values of one component instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentValues {
    values: BTreeMap<String, f64>,
}

impl ComponentValues {
    /// Value at `path`, `0` when absent.
    pub fn get(&self, path: &str) -> f64 {
        self.values.get(path).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    pub fn insert(&mut self, path: String, value: f64) {
        self.values.insert(path, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A parsed report for one bin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerReport {
    /// Unique components such as `Processor` or `NOC`.
    pub components: BTreeMap<String, ComponentValues>,
    /// `Core` instances in report order.
    pub cores: Vec<ComponentValues>,
    /// Shared `L2` instances.
    pub l2: Vec<ComponentValues>,
    /// Shared `L3` instances.
    pub l3: Vec<ComponentValues>,
}

impl PowerReport {
    pub fn component(&self, name: &str) -> Option<&ComponentValues> {
        self.components.get(name)
    }

    pub fn core(&self, index: usize) -> Option<&ComponentValues> {
        self.cores.get(index)
    }

    fn is_empty(&self) -> bool {
        self.components.is_empty()
            && self.cores.is_empty()
            && self.l2.is_empty()
            && self.l3.is_empty()
    }

    /// `Core`, `L2` and `L3` are appended as instances; other names must be unique.
    fn add(&mut self, name: &str, values: ComponentValues) -> Result<(), ReportError> {
        match name {
            "Core" => self.cores.push(values),
            "L2" => self.l2.push(values),
            "L3" => self.l3.push(values),
            _ => {
                if self.components.contains_key(name) {
                    return Err(ReportError::DuplicateComponent {
                        name: name.to_string(),
                    });
                }
                self.components.insert(name.to_string(), values);
            }
        }
        Ok(())
    }
}

fn is_banner(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.chars().all(|c| c == '*')
}

/// Parses a full report.
pub fn parse_report(text: &str) -> Result<PowerReport, ReportError> {
    let mut report = PowerReport::default();
    let mut block: Vec<(usize, &str)> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if is_banner(line) {
            parse_block(&block, &mut report)?;
            block.clear();
        } else {
            block.push((idx + 1, line));
        }
    }
    parse_block(&block, &mut report)?;

    if report.is_empty() {
        return Err(ReportError::NoComponents);
    }
    Ok(report)
}

/// Parses one banner-delimited block, adding it to `report` if it is a component.
fn parse_block(lines: &[(usize, &str)], report: &mut PowerReport) -> Result<(), ReportError> {
    let mut lines = lines.iter().skip_while(|(_, l)| l.trim().is_empty());
    let Some((_, first)) = lines.next() else {
        return Ok(());
    };
    let first = first.trim();
    let Some(name) = first.strip_suffix(':') else {
        return Ok(());
    };
    if name.contains('=') || name.is_empty() {
        return Ok(());
    }
    let name = name.trim_matches(':').trim();

    let mut values = ComponentValues::default();
    let mut stack = PathStack::default();
    for (number, raw) in lines {
        match Line::classify(raw, *number)? {
            Line::Blank | Line::Unrecognized => {}
            Line::Header { indent, segment } => stack.enter(indent, segment),
            Line::KeyValue { indent, key, value } => {
                let path = stack.qualify(indent, key);
                values.insert(path, value);
            }
        }
    }

    report.add(name, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "*****************************************************************************************";

    fn report(blocks: &[&str]) -> String {
        let mut text = String::from("McPAT (version 1.0) results (current print level is 5)\n");
        for block in blocks {
            text.push_str(BANNER);
            text.push('\n');
            text.push_str(block);
        }
        text.push_str(BANNER);
        text.push('\n');
        text
    }

    const CORE: &str = "\
Core:
      Area = 10.5 mm^2
      Runtime Dynamic = 3.25 W
      Instruction Fetch Unit:
        Area = 2.0 mm^2
        Runtime Dynamic = 0.5 W
        Instruction Cache:
          Runtime Dynamic = 0.125 W
          Subthreshold Leakage with power gating = -nan W
        Branch Predictor (Count 1):
          Runtime Dynamic = 0.0625 W
      Execution Unit:
        Integer ALUs (Count: 6 ):
          Runtime Dynamic = 1.5 W
          Gate Leakage = 0.001 W
";

    #[test]
    fn test_classify_lines() {
        assert_eq!(Line::classify("   ", 1), Ok(Line::Blank));
        assert_eq!(
            Line::classify("    Integer ALUs (Count: 6 ):", 2),
            Ok(Line::Header {
                indent: 4,
                segment: "Integer ALUs"
            })
        );
        assert_eq!(
            Line::classify("  Gate Leakage = 1.5e-03 W", 3),
            Ok(Line::KeyValue {
                indent: 2,
                key: "Gate Leakage",
                value: 0.0015
            })
        );
        assert_eq!(
            Line::classify("  Device Type= ITRS high performance device type", 4),
            Ok(Line::Unrecognized)
        );
        assert_eq!(
            Line::classify("  Runtime Dynamic = -nan W", 5),
            Ok(Line::KeyValue {
                indent: 2,
                key: "Runtime Dynamic",
                value: 0.0
            })
        );
    }

    #[test]
    fn test_invalid_number_names_line() {
        let err = Line::classify("  Area = -. mm^2", 42).unwrap_err();
        assert_eq!(
            err,
            ReportError::InvalidNumber {
                line: 42,
                text: "Area = -. mm^2".to_string()
            }
        );
    }

    #[test]
    fn test_path_stack_pops_siblings() {
        let mut stack = PathStack::default();
        stack.enter(6, "Execution Unit");
        stack.enter(8, "Register Files");
        assert_eq!(
            stack.qualify(10, "Runtime Dynamic"),
            "Execution Unit/Register Files/Runtime Dynamic"
        );
        stack.enter(8, "Integer ALUs");
        assert_eq!(stack.depth(), 2);
        assert_eq!(
            stack.qualify(10, "Area"),
            "Execution Unit/Integer ALUs/Area"
        );
        // A key back at section level leaves the section.
        assert_eq!(stack.qualify(6, "Area"), "Area");
    }

    #[test]
    fn test_parse_core_paths() {
        let text = report(&["Processor:\n  Area = 100 mm^2\n  Runtime Dynamic = 20 W\n", CORE]);
        let parsed = parse_report(&text).expect("report parses");

        assert_eq!(parsed.cores.len(), 1);
        let core = parsed.core(0).expect("core 0");
        assert_eq!(core.get("Area"), 10.5);
        assert_eq!(core.get("Instruction Fetch Unit/Runtime Dynamic"), 0.5);
        assert_eq!(
            core.get("Instruction Fetch Unit/Instruction Cache/Runtime Dynamic"),
            0.125
        );
        assert_eq!(
            core.get("Instruction Fetch Unit/Branch Predictor/Runtime Dynamic"),
            0.0625
        );
        assert_eq!(
            core.get("Execution Unit/Integer ALUs/Runtime Dynamic"),
            1.5
        );
        // nan leakage reads as zero but is present.
        let gated = "Instruction Fetch Unit/Instruction Cache/Subthreshold Leakage with power gating";
        assert!(core.contains(gated));
        assert_eq!(core.get(gated), 0.0);
        // Missing paths read as zero.
        assert_eq!(core.get("Execution Unit/Floating Point Units/Runtime Dynamic"), 0.0);

        let processor = parsed.component("Processor").expect("processor");
        assert_eq!(processor.get("Runtime Dynamic"), 20.0);
    }

    #[test]
    fn test_list_components_keep_order() {
        let text = report(&[
            "Core:\n  Runtime Dynamic = 1 W\n",
            "Core:\n  Runtime Dynamic = 2 W\n",
            "L3:\n  Runtime Dynamic = 4 W\n",
        ]);
        let parsed = parse_report(&text).expect("report parses");
        let dynamic: Vec<f64> = parsed.cores.iter().map(|c| c.get("Runtime Dynamic")).collect();
        assert_eq!(dynamic, vec![1.0, 2.0]);
        assert_eq!(parsed.l3.len(), 1);
        assert!(parsed.l2.is_empty());
    }

    #[test]
    fn test_duplicate_unique_component_is_fatal() {
        let text = report(&["NOC:\n  Area = 1 mm^2\n", "NOC:\n  Area = 2 mm^2\n"]);
        assert_eq!(
            parse_report(&text),
            Err(ReportError::DuplicateComponent {
                name: "NOC".to_string()
            })
        );
    }

    #[test]
    fn test_report_without_components_is_fatal() {
        let text = report(&["  Technology 22 nm\n  Interconnect metal projection= aggressive\n"]);
        assert_eq!(parse_report(&text), Err(ReportError::NoComponents));
        assert_eq!(parse_report(""), Err(ReportError::NoComponents));
    }
}
