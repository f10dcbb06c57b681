//! External power model invocation.
//!
//! Each bin descriptor is handed to the model binary and its stdout is
//! returned as the raw report. Invocations run on a bounded pool; results are
//! keyed by bin index so callers always see them in bin order, whatever order
//! the invocations finished in. The first failure aborts the remaining runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::PowerModelConfig;

/// Longest stderr excerpt quoted in a failure message.
const STDERR_EXCERPT: usize = 512;

/// A power model turning one descriptor into one textual report.
pub trait PowerModel: Send + Sync + 'static {
    /// Returns the model's name for logging.
    fn name(&self) -> &str;

    /// Evaluates one descriptor and returns the report text.
    fn evaluate(
        &self,
        descriptor: &Path,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// The McPAT binary, run as a subprocess.
#[derive(Debug, Clone)]
pub struct McpatModel {
    binary: PathBuf,
    library_dir: Option<PathBuf>,
    args: Vec<String>,
    timeout: Duration,
}

impl McpatModel {
    pub fn from_config(cfg: &PowerModelConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            library_dir: cfg.library_dir.clone(),
            args: cfg.args.clone(),
            timeout: cfg.timeout,
        }
    }

    fn command(&self, descriptor: &Path) -> Result<Command> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg("-infile")
            .arg(descriptor)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.library_dir {
            let mut paths: Vec<PathBuf> = std::env::var_os("LD_LIBRARY_PATH")
                .map(|v| std::env::split_paths(&v).collect())
                .unwrap_or_default();
            paths.push(dir.clone());
            let joined = std::env::join_paths(paths).context("building LD_LIBRARY_PATH")?;
            cmd.env("LD_LIBRARY_PATH", joined);
        }

        Ok(cmd)
    }
}

impl PowerModel for McpatModel {
    fn name(&self) -> &str {
        "mcpat"
    }

    async fn evaluate(&self, descriptor: &Path) -> Result<String> {
        let mut cmd = self.command(descriptor)?;

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} timed out after {:?}",
                    self.binary.display(),
                    self.timeout
                )
            })?
            .with_context(|| format!("spawning {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            bail!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                excerpt
            );
        }

        String::from_utf8(output.stdout).context("power model output is not UTF-8")
    }
}

/// One pending model invocation.
#[derive(Debug, Clone)]
pub struct ModelJob {
    pub bin: u64,
    pub descriptor: PathBuf,
}

/// Runs model jobs on at most `workers` concurrent invocations.
pub struct ModelDriver<M> {
    model: Arc<M>,
    workers: usize,
}

impl<M: PowerModel> ModelDriver<M> {
    pub fn new(model: M, workers: usize) -> Self {
        Self {
            model: Arc::new(model),
            workers: workers.max(1),
        }
    }

    /// Evaluates every job and returns the reports keyed by bin index.
    ///
    /// Fails on the first failed invocation, naming its bin; pending
    /// invocations are aborted.
    pub async fn run(&self, jobs: Vec<ModelJob>) -> Result<BTreeMap<u64, String>> {
        let total = jobs.len();
        info!(
            model = self.model.name(),
            jobs = total,
            workers = self.workers,
            "running power model"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();

        for job in jobs {
            let model = Arc::clone(&self.model);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("power model pool closed")?;
                debug!(bin = job.bin, descriptor = %job.descriptor.display(), "evaluating bin");
                let report = model.evaluate(&job.descriptor).await.with_context(|| {
                    format!(
                        "power model failed for bin {} ({})",
                        job.bin,
                        job.descriptor.display()
                    )
                })?;
                Ok::<_, anyhow::Error>((job.bin, report))
            });
        }

        let mut reports = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (bin, report) = joined.context("power model task panicked")??;
            reports.insert(bin, report);
            debug!(bin, done = reports.len(), total, "power model finished bin");
        }

        info!(reports = reports.len(), "power model runs complete");
        Ok(reports)
    }
}
