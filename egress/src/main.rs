use clap::{Args, Parser};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod observability;

use config::{Config, ConfigError};

#[derive(Parser)]
#[command(version, about = "Relays queries to self-hosted instances over their outbound connections")]
enum CliCommand {
    /// Runs the egress router
    Run(ConfigArgs),
    /// Loads and validates a config file, then exits
    ValidateConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    EgressRouter(#[from] egress_router::EgressRouterError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(&args.config_file_path),
        CliCommand::ValidateConfig(args) => Config::from_file(&args.config_file_path)
            .map(|_| println!("{} is valid", args.config_file_path.display()))
            .map_err(CliError::from),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_file_path: &std::path::Path) -> Result<(), CliError> {
    let config = Config::from_file(config_file_path)?;

    // Sentry must be initialized before the runtime starts its threads
    let _sentry = observability::init_logging(config.common.logging.as_ref());
    observability::init_metrics(config.common.metrics.as_ref()).map_err(CliError::Metrics)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    tracing::info!("Starting egress router");
    runtime.block_on(egress_router::run(config.egress_router))?;
    Ok(())
}
