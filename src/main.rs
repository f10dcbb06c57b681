use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use wattstack::config::Config;
use wattstack::pipeline::Pipeline;

/// Turns hardware counter traces into per-core power stacks.
#[derive(Parser)]
#[command(name = "wattstack", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("wattstack {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cfg.effective_log_level(cli.log_level.as_deref());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        microarch = %cfg.microarch,
        "starting wattstack",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let summary = rt.block_on(Pipeline::new(cfg).run())?;

    tracing::info!(
        bins = summary.bins,
        tables = summary.outputs.len(),
        "wattstack finished"
    );

    Ok(())
}
