use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use serializator_service::config::Config;
use serializator_service::{logging, metrics};

mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    ///
    /// Without a configuration, objects are persisted in a temporary directory.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let mut service_config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    let _cache_dir = match cli.config {
        Some(_) => None,
        None => {
            let dir = tempfile::tempdir().context("failed to create cache directory")?;
            service_config.cache_dir = dir.path().to_owned();
            Some(dir)
        }
    };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: service_config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been started yet.
    unsafe { logging::init_logging(&service_config) };
    metrics::configure_statsd(&service_config.metrics)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;
    let result = runtime.block_on(perform_stresstest(service_config, workloads, cli.duration));

    if let Err(ref err) = result {
        logging::ensure_log_error(err);
    }
    result
}
