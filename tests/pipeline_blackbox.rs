//! Runs the whole pipeline on a small synthetic trace with an in-process
//! power model standing in for the external binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use wattstack::config::{Config, TopologyConfig};
use wattstack::model::PowerModel;
use wattstack::pipeline::{Pipeline, DESCRIPTOR_DIR};
use wattstack::stats::Anomaly;

const BANNER: &str = "*****************************************************************************************";

const COUNTER_LIST: &str = "\
# raw,canonical
cpu-cycles,cycles
ref-cycles,ref-cycles
instructions,instructions
power/energy-pkg/,energy_pkg
power/energy-cores/,energy_cores
";

const TEMPLATE: &str = r#"<?xml version="1.0" ?>
<component id="root" name="root">
  <component id="system" name="system">
    <param name="number_of_cores" value="1"/>
    <stat name="total_cycles" value="0"/>
    <component id="system.core0" name="core0">
      <param name="clock_rate" value="1000"/>
      <stat name="total_instructions" value="0"/>
      <stat name="busy_cycles" value="0"/>
      <stat name="idle_cycles" value="0"/>
    </component>
    <component id="system.L20" name="L20">
      <stat name="read_accesses" value="0"/>
    </component>
  </component>
</component>
"#;

/// Every bin gets the same report: one core and one shared L3.
struct FakeModel {
    fail: bool,
    seen: Mutex<Vec<PathBuf>>,
}

impl FakeModel {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl PowerModel for FakeModel {
    fn name(&self) -> &str {
        "fake"
    }

    async fn evaluate(&self, descriptor: &Path) -> Result<String> {
        let xml = fs::read_to_string(descriptor)?;
        if !xml.contains(r#"name="busy_cycles""#) {
            bail!("descriptor lost its busy_cycles slot");
        }
        self.seen.lock().expect("lock").push(descriptor.to_path_buf());
        if self.fail {
            bail!("simulated model crash");
        }
        Ok(format!(
            "McPAT (version 1.3)\n\
{BANNER}\n\
Processor:\n  Area = 40 mm^2\n  Runtime Dynamic = 12 W\n\
{BANNER}\n\
Core:\n  Runtime Dynamic = 4 W\n  Execution Unit:\n    Integer ALUs:\n      Runtime Dynamic = 1.5 W\n      Gate Leakage = -nan W\n  L2:\n    Runtime Dynamic = 0.5 W\n\
{BANNER}\n\
L3:\n  Runtime Dynamic = 1 W\n"
        ))
    }
}

/// Writes a two-thread, one-core trace spanning two 1 s bins.
fn write_fixture(dir: &Path) -> Config {
    let mut trace = String::from("START TIME,100\n");
    for step in 1..=4 {
        let t = step as f64 * 0.5;
        for (cpu, cycles) in [(0, 0.6e9), (1, 0.4e9)] {
            trace.push_str(&format!("{t},CPU{cpu},{cycles},cpu-cycles\n"));
            trace.push_str(&format!("{t},CPU{cpu},{cycles},ref-cycles\n"));
            trace.push_str(&format!("{t},CPU{cpu},1000000,,instructions\n"));
            trace.push_str(&format!("{t},CPU{cpu},5,power/energy-pkg/\n"));
            trace.push_str(&format!("{t},CPU{cpu},3,power/energy-cores/\n"));
        }
        trace.push_str(&format!("{t},CPU0,<not counted>,mystery-event\n"));
    }
    trace.push_str("END TIME,102\n");

    fs::write(dir.join("trace.csv"), trace).expect("write trace");
    fs::write(dir.join("testarch.txt"), COUNTER_LIST).expect("write counter list");
    fs::write(dir.join("testarch.xml"), TEMPLATE).expect("write template");

    let mut cfg = Config {
        trace: dir.join("trace.csv"),
        output_dir: dir.join("out"),
        microarch: "testarch".to_string(),
        counter_lists_dir: dir.to_path_buf(),
        processor_models_dir: dir.to_path_buf(),
        bin_size: Duration::from_secs(1),
        tsc_frequency_hz: 2_000_000_000,
        topology: TopologyConfig {
            cores: 1,
            threads_per_core: 2,
        },
        ..Config::default()
    };
    cfg.power_model.binary = PathBuf::from("unused");
    cfg
}

fn read_csv(path: &Path) -> Vec<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .expect("open csv");
    rdr.records()
        .map(|r| r.expect("row").iter().map(str::to_string).collect())
        .collect()
}

fn column(rows: &[Vec<String>], row: usize, name: &str) -> f64 {
    let idx = rows[0]
        .iter()
        .position(|h| h == name)
        .unwrap_or_else(|| panic!("no column {name} in {:?}", rows[0]));
    rows[row][idx].parse().expect("numeric cell")
}

#[tokio::test]
async fn test_pipeline_produces_power_stacks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_fixture(dir.path());
    cfg.validate().expect("fixture config is valid");
    let out = cfg.output_dir.clone();

    let summary = Pipeline::with_model(cfg, FakeModel::new(false))
        .run()
        .await
        .expect("pipeline runs");

    assert_eq!(summary.bins, 2);
    for name in [
        "cntrs_processed_CPU0.csv",
        "cntrs_processed_CPU1.csv",
        "cntrs_processed_TOTAL.csv",
        "rapl.csv",
        "power_core0.csv",
        "power.csv",
    ] {
        assert!(out.join(name).exists(), "{name} missing");
    }
    assert!(out.join(DESCRIPTOR_DIR).join("bin_0.xml").exists());
    assert!(out.join(DESCRIPTOR_DIR).join("bin_1.xml").exists());

    let unknown = summary
        .anomalies
        .iter()
        .find(|(a, _)| *a == Anomaly::UnknownEvent)
        .map(|(_, n)| *n);
    assert_eq!(unknown, Some(4));

    // Per-core stats: bins keyed by absolute start time.
    let stats = read_csv(&out.join("cntrs_processed_CPU0.csv"));
    assert_eq!(stats.len(), 3);
    assert_eq!(column(&stats, 1, "timestamp"), 100.0);
    assert_eq!(column(&stats, 2, "timestamp"), 101.0);
    assert_eq!(column(&stats, 1, "busy_cycles"), 1.2e9);
    assert_eq!(column(&stats, 1, "frequency"), 2000.0);

    let rapl = read_csv(&out.join("rapl.csv"));
    assert_eq!(column(&rapl, 1, "power_pkg"), 10.0);
    assert_eq!(column(&rapl, 1, "power_cores"), 6.0);

    // Activity 1.2e9 / 2.4e9 = 0.5 → static 0.5 * 2.2 + 0.5 * 1.0.
    let core = read_csv(&out.join("power_core0.csv"));
    assert_eq!(core.len(), 3);
    assert!(!core[0].iter().any(|h| h == "l3_dynamic"));
    for row in 1..core.len() {
        assert!((column(&core, row, "core-alu-int_dynamic") - 1.5).abs() < 1e-12);
        assert!((column(&core, row, "l2_dynamic") - 2.5).abs() < 1e-12);
        assert!((column(&core, row, "static") - 1.6).abs() < 1e-12);
        assert!((column(&core, row, "sum") - 5.6).abs() < 1e-12);
    }

    let total = read_csv(&out.join("power.csv"));
    for row in 1..total.len() {
        let dynamic = column(&total, row, "dynamic");
        let stat = column(&total, row, "static");
        assert!((column(&total, row, "l3_dynamic") - 5.0).abs() < 1e-12);
        assert!((dynamic - 9.0).abs() < 1e-12);
        assert_eq!(column(&total, row, "sum"), dynamic + stat);
    }
}

#[tokio::test]
async fn test_model_failure_aborts_without_power_tables() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_fixture(dir.path());
    let out = cfg.output_dir.clone();

    let err = Pipeline::with_model(cfg, FakeModel::new(true))
        .run()
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("power model failed for bin"), "{err:#}");
    assert!(!out.join("power.csv").exists());
}

#[tokio::test]
async fn test_template_without_enough_cores_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_fixture(dir.path());
    fs::write(
        dir.path().join("testarch.xml"),
        r#"<component id="root"><component id="system"/></component>"#,
    )
    .expect("overwrite template");

    let err = Pipeline::with_model(cfg, FakeModel::new(false))
        .run()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("describes 0 cores"), "{err:#}");
}
