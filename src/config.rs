use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a wattstack run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Raw counter trace (perf interval CSV with START/END TIME rows).
    #[serde(default)]
    pub trace: PathBuf,

    /// Directory receiving descriptors and CSV results.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Microarchitecture identifier selecting the counter list and processor model.
    #[serde(default)]
    pub microarch: String,

    /// Directory holding `<microarch>.txt` counter translation tables.
    #[serde(default = "default_counter_lists_dir")]
    pub counter_lists_dir: PathBuf,

    /// Directory holding `<microarch>.xml` processor topology templates.
    #[serde(default = "default_processor_models_dir")]
    pub processor_models_dir: PathBuf,

    /// Width of one output bin. Default: 1s.
    #[serde(default = "default_bin_size", with = "humantime_serde")]
    pub bin_size: Duration,

    /// Invariant TSC frequency of the traced machine in Hz.
    #[serde(default = "default_tsc_frequency_hz")]
    pub tsc_frequency_hz: u64,

    /// Physical topology of the traced machine.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Resampler behavior.
    #[serde(default)]
    pub resample: ResampleConfig,

    /// Hyperthread overlap model used by the reducer.
    #[serde(default)]
    pub overlap: OverlapConfig,

    /// Hardware-specific calibration constants.
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// External power model invocation.
    #[serde(default)]
    pub power_model: PowerModelConfig,
}

/// Physical core and SMT layout.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// Number of physical cores. Default: 1.
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// Logical threads per physical core. Default: 1.
    #[serde(default = "default_threads_per_core")]
    pub threads_per_core: u32,
}

/// Resampler configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ResampleConfig {
    /// What to do with a trailing, partially filled bin. Default: keep.
    #[serde(default)]
    pub tail: TailPolicy,
}

/// Handling of the final bin when the trace ends mid-bin.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailPolicy {
    /// Emit the partial bin so the total is conserved exactly.
    #[default]
    Keep,
    /// Discard the partial bin; its value is not conserved.
    Drop,
}

/// Overlap model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlapConfig {
    /// Model estimating physical busy cycles from sibling busy cycles.
    #[serde(default)]
    pub model: OverlapModel,

    /// Scale applied to summed sibling busy cycles (scaled_sum only). Default: 0.5.
    #[serde(default = "default_overlap_factor")]
    pub factor: f64,
}

/// Available overlap estimators.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapModel {
    /// `factor * sum(sibling busy)`.
    #[default]
    ScaledSum,
    /// Busiest sibling only (assumes full overlap).
    PeakSibling,
}

/// Calibration points that depend on the measured hardware.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Clock used to turn busy cycles into an activity fraction. Default: 2.4 GHz.
    #[serde(default = "default_reference_clock_hz")]
    pub reference_clock_hz: f64,

    /// Whole-core static power at full activity, in watts. Default: 2.2.
    #[serde(default = "default_static_active_watts")]
    pub static_active_watts: f64,

    /// Whole-core static power when idle, in watts. Default: 1.0.
    #[serde(default = "default_static_idle_watts")]
    pub static_idle_watts: f64,

    /// Weight applied to L2/L3 power categories. Default: 5.0.
    #[serde(default = "default_cache_weight")]
    pub cache_weight: f64,

    /// SIMD lane factor applied to floating-point uop counts. Default: 16.
    #[serde(default = "default_fp_simd_scale")]
    pub fp_simd_scale: f64,

    /// Source of the per-core static power figure. Default: two_point.
    #[serde(default)]
    pub static_model: StaticModel,
}

/// How static power is attributed per core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticModel {
    /// Blend of `static_active_watts` and `static_idle_watts` by activity.
    #[default]
    TwoPoint,
    /// Sum of the model's leakage figures, interpolated by activity.
    Leakage,
}

/// External power model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PowerModelConfig {
    /// Path to the power model executable.
    #[serde(default)]
    pub binary: PathBuf,

    /// Directory appended to LD_LIBRARY_PATH for the model process.
    #[serde(default)]
    pub library_dir: Option<PathBuf>,

    /// Arguments placed before `-infile <descriptor>`.
    #[serde(default = "default_power_model_args")]
    pub args: Vec<String>,

    /// Concurrent model invocations. Default: 1 (serialized).
    #[serde(default = "default_power_model_workers")]
    pub workers: usize,

    /// Upper bound for a single invocation. Default: 10m.
    #[serde(default = "default_power_model_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_counter_lists_dir() -> PathBuf {
    PathBuf::from("counter_lists")
}

fn default_processor_models_dir() -> PathBuf {
    PathBuf::from("processor_models")
}

fn default_bin_size() -> Duration {
    Duration::from_secs(1)
}

fn default_tsc_frequency_hz() -> u64 {
    2_400_000_000
}

fn default_cores() -> u32 {
    1
}

fn default_threads_per_core() -> u32 {
    1
}

fn default_overlap_factor() -> f64 {
    0.5
}

fn default_reference_clock_hz() -> f64 {
    2.4e9
}

fn default_static_active_watts() -> f64 {
    2.2
}

fn default_static_idle_watts() -> f64 {
    1.0
}

fn default_cache_weight() -> f64 {
    5.0
}

fn default_fp_simd_scale() -> f64 {
    16.0
}

fn default_power_model_args() -> Vec<String> {
    vec![
        "-print_level".to_string(),
        "5".to_string(),
        "-opt_for_clk".to_string(),
        "1".to_string(),
    ]
}

fn default_power_model_workers() -> usize {
    1
}

fn default_power_model_timeout() -> Duration {
    Duration::from_secs(600)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            trace: PathBuf::new(),
            output_dir: default_output_dir(),
            microarch: String::new(),
            counter_lists_dir: default_counter_lists_dir(),
            processor_models_dir: default_processor_models_dir(),
            bin_size: default_bin_size(),
            tsc_frequency_hz: default_tsc_frequency_hz(),
            topology: TopologyConfig::default(),
            resample: ResampleConfig::default(),
            overlap: OverlapConfig::default(),
            calibration: CalibrationConfig::default(),
            power_model: PowerModelConfig::default(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            threads_per_core: default_threads_per_core(),
        }
    }
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            model: OverlapModel::default(),
            factor: default_overlap_factor(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_clock_hz: default_reference_clock_hz(),
            static_active_watts: default_static_active_watts(),
            static_idle_watts: default_static_idle_watts(),
            cache_weight: default_cache_weight(),
            fp_simd_scale: default_fp_simd_scale(),
            static_model: StaticModel::default(),
        }
    }
}

impl Default for PowerModelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::new(),
            library_dir: None,
            args: default_power_model_args(),
            workers: default_power_model_workers(),
            timeout: default_power_model_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.trace.as_os_str().is_empty() {
            bail!("trace is required");
        }

        if self.microarch.is_empty() {
            bail!("microarch is required");
        }

        if self.bin_size.is_zero() {
            bail!("bin_size must be positive");
        }

        if self.tsc_frequency_hz == 0 {
            bail!("tsc_frequency_hz must be positive");
        }

        if self.topology.cores == 0 {
            bail!("topology.cores must be positive");
        }

        if self.topology.threads_per_core == 0 {
            bail!("topology.threads_per_core must be positive");
        }

        let factor = self.overlap.factor;
        if !(factor > 0.0 && factor <= 1.0) {
            bail!("overlap.factor must be in (0, 1], got {factor}");
        }

        let cal = &self.calibration;
        for (name, value) in [
            ("reference_clock_hz", cal.reference_clock_hz),
            ("static_active_watts", cal.static_active_watts),
            ("static_idle_watts", cal.static_idle_watts),
            ("cache_weight", cal.cache_weight),
            ("fp_simd_scale", cal.fp_simd_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("calibration.{name} must be finite and non-negative, got {value}");
            }
        }

        if cal.reference_clock_hz == 0.0 {
            bail!("calibration.reference_clock_hz must be positive");
        }

        if cal.static_idle_watts > cal.static_active_watts {
            bail!(
                "calibration.static_idle_watts ({}) must not exceed static_active_watts ({})",
                cal.static_idle_watts,
                cal.static_active_watts
            );
        }

        if self.power_model.binary.as_os_str().is_empty() {
            bail!("power_model.binary is required");
        }

        if self.power_model.workers == 0 {
            bail!("power_model.workers must be positive");
        }

        if self.power_model.timeout.is_zero() {
            bail!("power_model.timeout must be positive");
        }

        Ok(())
    }

    /// Log filter to use: the command-line override if given, else `log_level`.
    pub fn effective_log_level<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.unwrap_or(self.log_level.as_str())
    }

    /// Total logical threads (`cores * threads_per_core`).
    pub fn hw_threads(&self) -> u32 {
        self.topology.cores * self.topology.threads_per_core
    }

    /// Bin width in seconds.
    pub fn bin_size_secs(&self) -> f64 {
        self.bin_size.as_secs_f64()
    }

    /// Path of the counter translation table for the configured microarchitecture.
    pub fn counter_list_path(&self) -> PathBuf {
        self.counter_lists_dir
            .join(format!("{}.txt", self.microarch))
    }

    /// Path of the processor topology template for the configured microarchitecture.
    pub fn processor_model_path(&self) -> PathBuf {
        self.processor_models_dir
            .join(format!("{}.xml", self.microarch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            trace: PathBuf::from("trace.csv"),
            microarch: "haswell".to_string(),
            power_model: PowerModelConfig {
                binary: PathBuf::from("/opt/mcpat/mcpat"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.bin_size, Duration::from_secs(1));
        assert_eq!(cfg.resample.tail, TailPolicy::Keep);
        assert_eq!(cfg.overlap.model, OverlapModel::ScaledSum);
        assert_eq!(cfg.overlap.factor, 0.5);
        assert_eq!(cfg.calibration.static_active_watts, 2.2);
        assert_eq!(cfg.calibration.static_idle_watts, 1.0);
        assert_eq!(cfg.calibration.fp_simd_scale, 16.0);
        assert_eq!(cfg.power_model.workers, 1);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
trace: traces/run.csv
microarch: haswell
bin_size: 100ms
tsc_frequency_hz: 3400000000
topology:
  cores: 4
  threads_per_core: 2
resample:
  tail: drop
overlap:
  model: peak_sibling
calibration:
  static_model: leakage
  cache_weight: 2.5
power_model:
  binary: /opt/mcpat/mcpat
  workers: 2
  timeout: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("yaml should parse");
        cfg.validate().expect("config should validate");

        assert_eq!(cfg.bin_size, Duration::from_millis(100));
        assert_eq!(cfg.hw_threads(), 8);
        assert_eq!(cfg.resample.tail, TailPolicy::Drop);
        assert_eq!(cfg.overlap.model, OverlapModel::PeakSibling);
        assert_eq!(cfg.calibration.static_model, StaticModel::Leakage);
        assert_eq!(cfg.calibration.cache_weight, 2.5);
        assert_eq!(cfg.power_model.timeout, Duration::from_secs(30));
        assert_eq!(cfg.power_model.args.len(), 4);
    }

    #[test]
    fn test_model_paths() {
        let cfg = Config {
            counter_lists_dir: PathBuf::from("/srv/lists"),
            processor_models_dir: PathBuf::from("/srv/models"),
            ..valid_config()
        };
        assert_eq!(
            cfg.counter_list_path(),
            PathBuf::from("/srv/lists/haswell.txt")
        );
        assert_eq!(
            cfg.processor_model_path(),
            PathBuf::from("/srv/models/haswell.xml")
        );
    }

    #[test]
    fn test_validation_missing_trace() {
        let cfg = Config {
            trace: PathBuf::new(),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("trace"));
    }

    #[test]
    fn test_validation_zero_bin_size() {
        let cfg = Config {
            bin_size: Duration::ZERO,
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bin_size"));
    }

    #[test]
    fn test_validation_zero_threads_per_core() {
        let mut cfg = valid_config();
        cfg.topology.threads_per_core = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("threads_per_core"));
    }

    #[test]
    fn test_validation_overlap_factor_range() {
        let mut cfg = valid_config();
        cfg.overlap.factor = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overlap.factor"));

        cfg.overlap.factor = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_static_points_ordered() {
        let mut cfg = valid_config();
        cfg.calibration.static_idle_watts = 3.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("static_idle_watts"));
    }

    #[test]
    fn test_validation_negative_calibration() {
        let mut cfg = valid_config();
        cfg.calibration.cache_weight = -1.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cache_weight"));
    }

    #[test]
    fn test_validation_workers_zero() {
        let mut cfg = valid_config();
        cfg.power_model.workers = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_log_level_flag_overrides_config() {
        let mut cfg = valid_config();
        cfg.log_level = "debug".to_string();
        assert_eq!(cfg.effective_log_level(None), "debug");
        assert_eq!(cfg.effective_log_level(Some("warn")), "warn");
    }
}
