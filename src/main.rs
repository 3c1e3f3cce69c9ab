use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use gemcrawl::cli::Cli;
use gemcrawl::config::Config;
use gemcrawl::engine::Engine;
use gemcrawl::error::{CrawlError, Result};
use gemcrawl::{logging, scheduler};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    let config = Config::from_cli(cli);

    if let Err(err) = logging::init(&config.log_level) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "unexpected error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("gemcrawl starting up, press Ctrl+C to exit");

    let (engine, mut fatal_rx) = Engine::initialize(config).await?;

    let jobs_tx = engine.spawn_workers();
    tokio::spawn(scheduler::run_scheduler(Arc::clone(&engine), jobs_tx));

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| CrawlError::Fatal(format!("cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| CrawlError::Fatal(format!("cannot install SIGTERM handler: {e}")))?;

    let result = tokio::select! {
        _ = sigint.recv() => {
            tracing::warn!("received SIGINT, exiting");
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::warn!("received SIGTERM, exiting");
            Ok(())
        }
        fatal = fatal_rx.recv() => match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        },
    };

    engine.shutdown().await;
    result
}
