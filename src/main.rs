//! rpbot CLI entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rpbot::engine::RpEngine;
use rpbot::error::{ConfigError, Error};

const LOCK_HEARTBEAT: Duration = Duration::from_secs(60);

const EXIT_MISSING_CREDENTIAL: u8 = 2;
const EXIT_LOCK_CONFLICT: u8 = 3;

#[derive(Parser)]
#[command(name = "rpbot")]
#[command(about = "Discord roleplay conversation engine")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Connect to the gateway and serve rooms (default)
    Run,
    /// Inspect runtime state; report issues as JSON
    Healthcheck {
        /// Repair what can be repaired (prune dangling index entries,
        /// clear stale locks)
        #[arg(long)]
        recover: bool,
    },
    /// Non-destructive cleanup of non-active room indexes and caches
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match rpbot::config::Config::load() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            tracing::error!(%error, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let engine = RpEngine::new(config.clone());

    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Run => run(config, engine).await,
        CliCommand::Healthcheck { recover } => healthcheck(&engine, recover),
        CliCommand::Cleanup => cleanup(&engine),
    }
}

async fn run(config: Arc<rpbot::config::Config>, engine: RpEngine) -> ExitCode {
    let token = match config.require_discord_token() {
        Ok(token) => token.to_string(),
        Err(Error::Config(ConfigError::MissingCredential(name))) => {
            tracing::error!(credential = name, "missing required credential");
            return ExitCode::from(EXIT_MISSING_CREDENTIAL);
        }
        Err(error) => {
            tracing::error!(%error, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    let pid = std::process::id();
    let fingerprint = rpbot::lock::token_fingerprint(&token);
    if let Err(error) = engine.lock().acquire(&fingerprint, pid) {
        tracing::error!(%error, "another runtime holds the lock");
        return ExitCode::from(EXIT_LOCK_CONFLICT);
    }
    tracing::info!(pid, data_dir = %config.data_dir.display(), "runtime lock acquired");

    let heartbeat = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOCK_HEARTBEAT);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = engine.lock().touch(pid) {
                    tracing::warn!(%error, "lock heartbeat failed");
                }
            }
        })
    };

    let outcome = tokio::select! {
        result = rpbot::discord::run(config, engine.clone()) => result
            .context("gateway runtime failed"),
        result = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            result.context("failed to listen for shutdown signal")
        }
    };

    heartbeat.abort();
    if let Err(error) = engine.lock().release(pid) {
        tracing::warn!(%error, "failed to release runtime lock");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "runtime exited with error");
            ExitCode::FAILURE
        }
    }
}

fn healthcheck(engine: &RpEngine, recover: bool) -> ExitCode {
    match engine.runtime_healthcheck(recover) {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(error) => {
                    tracing::error!(%error, "failed to serialize health report");
                    return ExitCode::FAILURE;
                }
            }
            if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            tracing::error!(%error, "healthcheck failed");
            ExitCode::FAILURE
        }
    }
}

fn cleanup(engine: &RpEngine) -> ExitCode {
    match engine.cleanup_non_active_rooms() {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                tracing::error!(%error, "failed to serialize cleanup report");
                ExitCode::FAILURE
            }
        },
        Err(error) => {
            tracing::error!(%error, "cleanup failed");
            ExitCode::FAILURE
        }
    }
}
