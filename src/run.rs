//! End-to-end build run orchestration.
//!
//! [`RunOrchestrator::execute`] drives a [`BuildSession`] through every
//! lifecycle stage: prerequisite checks, provisioning, the readiness waits,
//! the project sync, the detached launch, monitoring, and artifact retrieval.
//! The cleanup guard is drained on both the success and failure paths, so an
//! instance created by this run is destroyed exactly once regardless of where
//! the run stops.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{ArtifactError, ArtifactResolver, expected_output_path};
use crate::channel::{ChannelError, CommandRunner, ExecOptions, RemoteShell};
use crate::cloud_init::{CloudInitError, resolve_user_data_file};
use crate::config::RunConfig;
use crate::guard::{CleanupGuard, run_teardown};
use crate::hcloud::{HcloudClient, HcloudError, ProvisionRequest};
use crate::poll::{PollError, RetryPolicy, poll_until};
use crate::script::{COMPLETION_SENTINEL, ComposeError, TemplateVars, compose, interpolate};
use crate::session::{BuildSession, Stage};

/// Remote probe that holds until first-boot initialisation has finished and
/// the package manager lock is free.
const INIT_PROBE: &str = "test -f /var/lib/cloud/instance/boot-finished \
     && ! fuser /var/lib/dpkg/lock-frontend >/dev/null 2>&1";

/// Exit code `ssh` reports when the connection itself fails, as opposed to
/// the remote command's own status.
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// Result of one tolerant remote probe during monitoring.
enum ProbeStatus {
    /// The probed condition holds.
    Holds,
    /// The probe ran remotely and the condition does not hold.
    Misses,
    /// The connection dropped before the probe could run; says nothing about
    /// the condition.
    TransportLost,
}

/// Errors that abort a build run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised when the cloud-init payload is missing or invalid.
    #[error(transparent)]
    CloudInit(#[from] CloudInitError),
    /// Raised by provider CLI prerequisite checks and provisioning calls.
    #[error(transparent)]
    Provision(#[from] HcloudError),
    /// Raised when the instance never accepts an SSH connection.
    #[error("instance never became reachable over ssh: {0}")]
    Unreachable(#[source] PollError<ChannelError>),
    /// Raised when first-boot initialisation does not finish.
    #[error("first-boot initialisation did not finish: {0}")]
    InitIncomplete(#[source] PollError<ChannelError>),
    /// Raised when the project tree cannot be pushed.
    #[error("project sync failed: {0}")]
    Sync(#[source] ChannelError),
    /// Raised when a configured template cannot be interpolated.
    #[error(transparent)]
    Compose(#[from] ComposeError),
    /// Raised when submitting the remote build script fails.
    #[error("failed to launch the remote build: {0}")]
    Launch(#[source] ChannelError),
    /// Raised when a monitoring probe itself fails.
    #[error("monitoring the remote build failed: {0}")]
    Monitor(#[source] ChannelError),
    /// Raised when the detached job disappears without writing the completion
    /// sentinel or any artifact.
    #[error("the remote build crashed; last log lines:\n{log_tail}")]
    BuildCrashed {
        /// Tail of the remote build log captured at crash detection.
        log_tail: String,
    },
    /// Raised when a bounded monitoring policy is exhausted.
    #[error("build did not finish after {attempts} monitoring checks")]
    BuildTimedOut {
        /// Number of monitoring checks made before giving up.
        attempts: u32,
    },
    /// Raised while locating or retrieving the artifact.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Drives one build run from provisioning to artifact retrieval.
pub struct RunOrchestrator<R: CommandRunner + Clone> {
    config: RunConfig,
    runner: R,
    guard: Arc<CleanupGuard>,
    source: Utf8PathBuf,
    reachability: RetryPolicy,
    initialisation: RetryPolicy,
    monitor: RetryPolicy,
}

impl<R: CommandRunner + Clone> RunOrchestrator<R> {
    /// Creates an orchestrator that syncs the tree at `source`.
    ///
    /// The guard is shared with the process-level signal dispatcher, which
    /// drains it independently when the run is interrupted.
    #[must_use]
    pub fn new(
        config: RunConfig,
        runner: R,
        guard: Arc<CleanupGuard>,
        source: Utf8PathBuf,
    ) -> Self {
        let monitor_interval = Duration::from_secs(config.monitor_interval_secs);
        Self {
            config,
            runner,
            guard,
            source,
            reachability: RetryPolicy::bounded(Duration::from_secs(5), 60),
            initialisation: RetryPolicy::unbounded(Duration::from_secs(5)),
            monitor: RetryPolicy::unbounded(monitor_interval),
        }
    }

    /// Overrides the SSH reachability policy.
    #[must_use]
    pub const fn with_reachability_policy(mut self, policy: RetryPolicy) -> Self {
        self.reachability = policy;
        self
    }

    /// Overrides the first-boot initialisation policy.
    #[must_use]
    pub const fn with_initialisation_policy(mut self, policy: RetryPolicy) -> Self {
        self.initialisation = policy;
        self
    }

    /// Overrides the build monitoring policy.
    #[must_use]
    pub const fn with_monitor_policy(mut self, policy: RetryPolicy) -> Self {
        self.monitor = policy;
        self
    }

    /// Builds the provisioning client over this orchestrator's runner.
    #[must_use]
    pub fn client(&self) -> HcloudClient<R> {
        HcloudClient::new(self.config.hcloud_bin.clone(), self.runner.clone())
    }

    /// Runs the whole lifecycle, draining the cleanup guard on every exit
    /// path before the result is reported.
    ///
    /// # Errors
    ///
    /// Returns the first [`RunError`] encountered; teardown has already been
    /// attempted by the time the error is visible to the caller.
    pub async fn execute(&self, session: &mut BuildSession) -> Result<(), RunError> {
        let result = self.run_stages(session).await;
        run_teardown(&self.guard, &self.client());
        match result {
            Ok(()) => {
                session.advance(Stage::Done);
                Ok(())
            }
            Err(err) => {
                session.advance(Stage::Failed);
                Err(err)
            }
        }
    }

    async fn run_stages(&self, session: &mut BuildSession) -> Result<(), RunError> {
        let client = self.client();
        client.ensure_available()?;
        let user_data_file = resolve_user_data_file(&self.config.cloud_init_file)?;

        // Resolve everything template-shaped before paying for an instance.
        let base_vars = TemplateVars::new(&session.profile, &self.config);
        let output_template =
            expected_output_path(&self.config.artifact_for_profile, &session.profile)?;
        let output_file = interpolate(&output_template, &base_vars)?;
        let vars = base_vars.with_output_file(output_file);
        let token = std::env::var(&self.config.token_env_var)
            .ok()
            .filter(|value| !value.is_empty());
        let script = compose(&self.config, &vars, token.as_deref())?;

        let ssh_key = client.select_ssh_key(self.config.ssh_key_name.as_deref())?;

        session.advance(Stage::Provisioning);
        info!(name = %session.instance_name, "creating instance");
        let handle = client.create(&ProvisionRequest {
            name: session.instance_name.clone(),
            server_type: session.instance_type.clone(),
            image: session.image.clone(),
            location: session.location.clone(),
            ssh_key,
            user_data_file,
        })?;
        self.guard.arm(handle.clone());
        session.record_handle(handle.clone());
        info!(instance = %handle.id, address = %handle.address, "instance created");

        let shell = RemoteShell::new(self.config.channel_config(), handle.address, self.runner.clone());

        session.advance(Stage::AwaitingReady);
        poll_until(self.reachability, || {
            Ok::<_, ChannelError>(shell.execute("true", ExecOptions::tolerant())?.is_success())
        })
        .await
        .map_err(RunError::Unreachable)?;
        info!(address = %handle.address, "instance reachable, waiting for first boot to settle");
        poll_until(self.initialisation, || {
            Ok::<_, ChannelError>(shell.execute(INIT_PROBE, ExecOptions::tolerant())?.is_success())
        })
        .await
        .map_err(RunError::InitIncomplete)?;

        session.advance(Stage::Syncing);
        info!(source = %self.source, dest = %self.config.remote_project_dir, "pushing project tree");
        shell
            .push_tree(
                &self.source,
                &self.config.remote_project_dir,
                &self.config.sync_excludes,
            )
            .map_err(RunError::Sync)?;

        session.advance(Stage::BuildLaunched);
        info!(profile = %session.profile, "launching detached build");
        shell
            .execute(&script.render(), ExecOptions::strict())
            .map_err(RunError::Launch)?;

        session.advance(Stage::Monitoring);
        poll_until(self.monitor, || self.monitor_tick(&shell, &vars))
            .await
            .map_err(|err| match err {
                PollError::Probe(run_err) => run_err,
                PollError::Timeout { attempts } => RunError::BuildTimedOut { attempts },
            })?;

        session.advance(Stage::RetrievingArtifact);
        let resolver = ArtifactResolver::new(&shell, &self.config);
        let name = resolver.retrieve(&vars, Utc::now())?;
        info!(artifact = %name, dir = %self.config.local_artifact_dir, "artifact retrieved");
        session.record_artifact(name);

        Ok(())
    }

    /// One monitoring observation: sentinel first, then liveness of the build
    /// process tree, then the artifact fallback for jobs that produced output
    /// without writing the sentinel.
    ///
    /// A dropped connection proves nothing about the job, so any probe that
    /// loses transport ends the tick inconclusively and the loop tries again.
    fn monitor_tick(&self, shell: &RemoteShell<R>, vars: &TemplateVars) -> Result<bool, RunError> {
        let status_probe = format!(
            "grep -q {} {}",
            escape(COMPLETION_SENTINEL.into()),
            escape(self.config.remote_status_file.as_str().into())
        );
        match Self::probe(shell, &status_probe)? {
            ProbeStatus::Holds => {
                info!("build completed");
                return Ok(true);
            }
            ProbeStatus::TransportLost => return Self::retry_after_blip("completion check"),
            ProbeStatus::Misses => {}
        }

        let pattern = self.config.watch_processes.join("|");
        let liveness = format!("pgrep -f {}", escape(pattern.into()));
        match Self::probe(shell, &liveness)? {
            ProbeStatus::Holds => {
                let tail = format!(
                    "tail -n 3 {}",
                    escape(self.config.remote_log_path.as_str().into())
                );
                let progress = shell
                    .execute(&tail, ExecOptions::tolerant())
                    .map_err(RunError::Monitor)?;
                for line in progress.stdout.lines() {
                    info!(remote = true, "{line}");
                }
                return Ok(false);
            }
            ProbeStatus::TransportLost => return Self::retry_after_blip("liveness check"),
            ProbeStatus::Misses => {}
        }

        match Self::probe(shell, &self.candidate_probe(vars)?)? {
            ProbeStatus::Holds => {
                warn!("build process gone without completion signal, but an artifact exists");
                Ok(true)
            }
            ProbeStatus::TransportLost => Self::retry_after_blip("artifact check"),
            ProbeStatus::Misses => {
                let dump = format!(
                    "tail -n 40 {}",
                    escape(self.config.remote_log_path.as_str().into())
                );
                let log_tail = shell
                    .execute(&dump, ExecOptions::tolerant())
                    .map_err(RunError::Monitor)?
                    .stdout;
                Err(RunError::BuildCrashed { log_tail })
            }
        }
    }

    /// Single remote existence check over all candidate paths; one connection
    /// per tick instead of one per candidate.
    fn candidate_probe(&self, vars: &TemplateVars) -> Result<String, RunError> {
        let mut probes = Vec::with_capacity(self.config.artifact_candidates.len());
        for template in &self.config.artifact_candidates {
            let path = interpolate(template, vars)?;
            probes.push(format!("test -f {}", escape(path.into())));
        }
        Ok(probes.join(" || "))
    }

    fn probe(shell: &RemoteShell<R>, command: &str) -> Result<ProbeStatus, RunError> {
        let output = shell
            .execute(command, ExecOptions::tolerant())
            .map_err(RunError::Monitor)?;
        Ok(match output.exit_code {
            Some(0) => ProbeStatus::Holds,
            None | Some(SSH_TRANSPORT_EXIT_CODE) => ProbeStatus::TransportLost,
            Some(_) => ProbeStatus::Misses,
        })
    }

    fn retry_after_blip(during: &str) -> Result<bool, RunError> {
        warn!("ssh connection lost during {during}, retrying next tick");
        Ok(false)
    }
}
