use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use hybrid_cache::config::Config as CacheConfig;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long = "workloads", short = 'w', value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long = "duration", short = 'd', value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable logging, sentry and metrics against local sinks, mimicking a production setup.
    ///
    /// Otherwise, these are set up as described by the configuration file.
    #[arg(long = "instrumented", short = 'i')]
    instrumented: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            hybrid_cache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let cache_config = CacheConfig::get(cli.config.as_deref())?;

    // SAFETY: the runtime has not been started yet, so we are still single-threaded.
    let mut logging_guard = unsafe {
        if cli.instrumented {
            logging::init(logging::Config {
                backtraces: true,
                sentry: true,
                tracing: true,
                metrics: true,
            })
        } else {
            logging::init_from_config(&cache_config)?
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async {
        if let Some(http_sink) = logging_guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        stresstest::perform_stresstest(cache_config, workloads, cli.duration).await
    })?;

    drop(logging_guard);
    Ok(())
}
