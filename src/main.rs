//! Weave node binary.
//!
//! Loads configuration, installs the tracing subscriber and runs an
//! in-process syndication simulation between several ledger agents.

mod config;
mod simulation;

use simulation::run_simulation;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> Option<String> {
    std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            std::env::var("WEAVE_CONFIG_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty())
        })
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = resolve_config_path();
    let config = match config::load_config(path.as_deref().or(Some("weave.toml"))) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("weave: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for error in config.ledger.validate().errors {
        tracing::warn!(%error, "ledger configuration");
    }
    for error in config.syndication.validate().errors {
        tracing::warn!(%error, "syndication configuration");
    }
    tracing::info!(agent = %config.agent_name, path = path.as_deref().unwrap_or("weave.toml"), "starting weave");

    match run_simulation(&config).await {
        Ok(stats) => {
            stats.print();
            if stats.converged {
                println!("\n✓ All agents converged");
                ExitCode::SUCCESS
            } else {
                println!("\n✗ Agents did not converge");
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
