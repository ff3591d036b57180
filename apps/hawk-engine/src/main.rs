use clap::Parser;
use hawk_engine::config::Nest;
use hawk_engine::engine::Engine;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hawk-engine", version, about = "WPlace paint project change tracker")]
struct Cli {
    /// Nest root directory (overrides HAWK_NEST)
    #[arg(long, value_name = "DIR")]
    nest: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let nest = Nest::resolve(cli.nest);
    if let Err(err) = nest.ensure_dirs() {
        eprintln!("failed to prepare nest {}: {err}", nest.home().display());
        return ExitCode::from(2);
    }
    init_tracing(&nest);
    info!("pixel-hawk - WPlace paint project change tracker");
    debug!("nest: {}", nest.home().display());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(async { Engine::start(nest).await?.run().await }) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("startup failed: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(nest: &Nest) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(nest.logs_dir().join("pixel-hawk.log"));
    match log_file {
        Ok(file) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Arc::new(file)),
                )
                .try_init();
        }
        Err(err) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init();
            tracing::warn!("log file unavailable: {err}");
        }
    }
}
