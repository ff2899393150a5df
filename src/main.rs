//! Binary entry point for the Skyforge CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skyforge::{
    BuildSession, CleanupGuard, EnvDirError, HcloudClient, ProcessCommandRunner, RunConfig,
    RunError, RunOrchestrator, apply_missing, load_env_dir, run_teardown,
};

mod cli;

use cli::Cli;

const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    EnvDir(#[from] EnvDirError),
    #[error("build run failed: {0}")]
    Run(#[from] RunError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match boot(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

/// Applies the environment directory while the process is still
/// single-threaded, then starts the runtime. Mutating the process environment
/// after the runtime's worker threads exist would race their reads.
fn boot(cli: Cli) -> Result<i32, CliError> {
    if let Some(dir) = cli.env_dir.as_deref() {
        let vars = load_env_dir(dir)?;
        apply_missing(&vars);
    }
    run_command(cli)
}

#[tokio::main]
async fn run_command(cli: Cli) -> Result<i32, CliError> {
    let mut config =
        RunConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    apply_overrides(&mut config, &cli);
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let cwd = std::env::current_dir().map_err(|err| CliError::Config(err.to_string()))?;
    let source = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Config(path.display().to_string()))?;

    let guard = Arc::new(CleanupGuard::new());
    spawn_signal_teardown(Arc::clone(&guard), &config);

    let mut session = BuildSession::new(cli.profile, &config, Utc::now());
    let orchestrator =
        RunOrchestrator::new(config, ProcessCommandRunner, Arc::clone(&guard), source);
    orchestrator.execute(&mut session).await?;

    if let Some(name) = session.artifact_name() {
        info!(artifact = %name, "build finished");
    }
    Ok(0)
}

fn apply_overrides(config: &mut RunConfig, cli: &Cli) {
    if let Some(ref instance_type) = cli.instance_type {
        config.instance_type = instance_type.clone();
    }
    if let Some(ref image) = cli.image {
        config.image = image.clone();
    }
    if let Some(ref location) = cli.location {
        config.location = location.clone();
    }
}

/// Dispatches SIGINT and SIGTERM to the cleanup guard so an interrupted run
/// still destroys its instance. The guard's latch makes this safe against the
/// normal exit path racing the handler.
fn spawn_signal_teardown(guard: Arc<CleanupGuard>, config: &RunConfig) {
    let client = HcloudClient::new(config.hcloud_bin.clone(), ProcessCommandRunner);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("interrupted, tearing down");
        run_teardown(&guard, &client);
        process::exit(SIGNAL_EXIT_CODE);
    });
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
