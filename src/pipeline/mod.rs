//! End-to-end batch run: trace in, power stacks out.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::derive::{derive_rapl, derive_records, Capabilities, DeriveParams};
use crate::descriptor::{build_overrides, DescriptorInput, DescriptorWriter, Template};
use crate::model::{McpatModel, ModelDriver, ModelJob, PowerModel};
use crate::output::CsvOutput;
use crate::reduce::overlap::Overlap;
use crate::reduce::{PhysicalBin, Reducer};
use crate::report::parse_report;
use crate::resample::Resampler;
use crate::stack::Aggregator;
use crate::stats::{Anomaly, BinClock, CoreId, QualityStats};
use crate::trace::counter_map::CounterMap;
use crate::trace::Trace;

/// Subdirectory of the output directory receiving bin descriptors.
pub const DESCRIPTOR_DIR: &str = "descriptors";

/// What a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Bins evaluated by the power model.
    pub bins: usize,
    /// Every CSV table written, in write order.
    pub outputs: Vec<PathBuf>,
    /// Non-zero data-quality counters.
    pub anomalies: Vec<(Anomaly, u64)>,
}

/// One configured run of every stage.
pub struct Pipeline<M> {
    cfg: Config,
    model: M,
    quality: QualityStats,
}

impl Pipeline<McpatModel> {
    /// Pipeline evaluating descriptors with the configured McPAT binary.
    pub fn new(cfg: Config) -> Self {
        let model = McpatModel::from_config(&cfg.power_model);
        Self::with_model(cfg, model)
    }
}

impl<M: PowerModel> Pipeline<M> {
    pub fn with_model(cfg: Config, model: M) -> Self {
        Self {
            cfg,
            model,
            quality: QualityStats::new(),
        }
    }

    /// Runs every stage. Any structural failure aborts the run before the
    /// power tables are written.
    pub async fn run(self) -> Result<RunSummary> {
        let Self {
            cfg,
            model,
            quality,
        } = self;
        let bin_size = cfg.bin_size_secs();
        let cores = cfg.topology.cores as usize;

        // 1. Ingest the trace.
        let map = CounterMap::load(&cfg.counter_list_path())?;
        let trace = Trace::load(&cfg.trace, &map, &quality)?;
        info!(
            trace = %cfg.trace.display(),
            logical_cores = trace.cores.len(),
            start_time = trace.start_time,
            "loaded counter trace"
        );

        // 2. Resample onto fixed-width bins.
        let resampler = Resampler::new(bin_size, cfg.resample.tail)?;
        let (mut records, mut package) = resampler.resample_trace(&trace, &quality);
        if records.logical().next().is_none() {
            bail!("trace {} has no per-core samples", cfg.trace.display());
        }

        // 3. Rebuild the TOTAL pseudo-core from the resampled logical cores.
        records.rebuild_total();
        info!(
            bins = records.bin_indices().len(),
            bin_size, "resampled trace"
        );

        // 4. Derive rates and ratios.
        let caps = Capabilities::detect(&records, &package, &quality);
        let params = DeriveParams {
            bin_size_secs: bin_size,
            tsc_frequency_hz: cfg.tsc_frequency_hz as f64,
            fp_simd_scale: cfg.calibration.fp_simd_scale,
        };
        derive_records(&mut records, caps, &params, cfg.hw_threads());
        if caps.rapl {
            derive_rapl(&mut package, bin_size);
        }

        // 5. Reduce hyperthread siblings into physical cores.
        let reducer = Reducer::new(&cfg.topology, Overlap::from_config(&cfg.overlap));
        let physical = reducer.reduce(&records, &quality)?;

        // 6. Write one descriptor per bin.
        let template = Template::load(&cfg.processor_model_path())?;
        if template.core_count() < cores {
            bail!(
                "processor model {} describes {} cores, topology has {}",
                cfg.processor_model_path().display(),
                template.core_count(),
                cores
            );
        }
        if template.l2_count() < cores {
            warn!(
                l2 = template.l2_count(),
                cores, "processor model has fewer private L2 caches than cores"
            );
        }

        let total = records
            .get(CoreId::Total)
            .context("TOTAL record missing after rebuild")?;
        let writer = DescriptorWriter::create(&cfg.output_dir.join(DESCRIPTOR_DIR))?;
        let idle = PhysicalBin::default();
        let mut jobs = Vec::with_capacity(total.len());
        let mut warned_unmatched = false;

        for (index, bin) in total.iter() {
            let core_bins: Vec<&PhysicalBin> = physical
                .iter()
                .map(|r| r.bin(index).unwrap_or(&idle))
                .collect();
            let overrides = build_overrides(&DescriptorInput {
                total: bin,
                cores: &core_bins,
                caps,
                bin_size_secs: bin_size,
                tsc_frequency_hz: cfg.tsc_frequency_hz as f64,
            });
            let rendered = template
                .render(&overrides)
                .with_context(|| format!("rendering descriptor for bin {index}"))?;
            if !rendered.unmatched.is_empty() && !warned_unmatched {
                warned_unmatched = true;
                warn!(
                    count = rendered.unmatched.len(),
                    first = %rendered.unmatched[0],
                    "processor model has no slot for some descriptor fields"
                );
            }
            let descriptor = writer.write(index, &rendered)?;
            jobs.push(ModelJob {
                bin: index,
                descriptor,
            });
        }
        info!(descriptors = jobs.len(), "wrote bin descriptors");

        // 7. Evaluate every descriptor with the power model.
        let driver = ModelDriver::new(model, cfg.power_model.workers);
        let reports = driver.run(jobs).await?;

        // 8. Parse reports and aggregate power stacks.
        let aggregator = Aggregator::new(&cfg.calibration, bin_size);
        let mut power = BTreeMap::new();
        for (index, text) in &reports {
            let report = parse_report(text)
                .with_context(|| format!("parsing power model report for bin {index}"))?;
            let activity: Vec<f64> = physical
                .iter()
                .map(|r| r.bin(*index).map_or(0.0, |b| aggregator.activity(b)))
                .collect();
            let stacks = aggregator
                .aggregate(&report, &activity)
                .with_context(|| format!("aggregating power stack for bin {index}"))?;
            power.insert(*index, stacks);
        }

        // 9. Write result tables.
        let output = CsvOutput::new(&cfg.output_dir, BinClock::new(trace.start_time, bin_size))?;
        let mut outputs = Vec::new();
        for (core, record) in records.iter() {
            outputs.push(output.write_core_stats(core, record)?);
        }
        if caps.rapl {
            outputs.push(output.write_rapl(&package)?);
        }
        for core in 0..cores {
            outputs.push(output.write_core_power(core, &power)?);
        }
        outputs.push(output.write_total_power(&power)?);

        // 10. Summarize data quality.
        let anomalies = quality.snapshot();
        for (anomaly, count) in &anomalies {
            warn!(anomaly = anomaly.as_str(), count, "data quality summary");
        }

        info!(
            bins = power.len(),
            tables = outputs.len(),
            output_dir = %cfg.output_dir.display(),
            "run complete"
        );

        Ok(RunSummary {
            bins: power.len(),
            outputs,
            anomalies,
        })
    }
}
