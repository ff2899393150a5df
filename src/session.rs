//! Per-run session state owned by the lifecycle orchestrator.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::RunConfig;
use crate::hcloud::InstanceHandle;

/// Prefix of generated instance names.
pub const INSTANCE_NAME_PREFIX: &str = "skyforge-";

/// Lifecycle stages, strictly forward except [`Stage::Failed`], which is
/// reachable from any state and terminal.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Stage {
    /// Session constructed, nothing started.
    Idle,
    /// Instance creation in flight.
    Provisioning,
    /// Waiting for reachability and first-boot initialisation.
    AwaitingReady,
    /// Project tree transfer in flight.
    Syncing,
    /// Remote script submitted up to the detach point.
    BuildLaunched,
    /// Watching the detached job for completion or failure.
    Monitoring,
    /// Locating and fetching the artifact.
    RetrievingArtifact,
    /// Run finished and teardown triggered.
    Done,
    /// A fatal error occurred; teardown triggered.
    Failed,
}

impl Stage {
    /// Returns `true` for the two terminal stages.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Mutable state of one build run.
///
/// `handle` is `Some` exactly once a provisioning call has succeeded; the
/// cleanup guard holds its own copy, so teardown does not depend on the
/// session staying alive.
#[derive(Clone, Debug)]
pub struct BuildSession {
    /// Build variant selected by the operator; immutable after construction.
    pub profile: String,
    /// Generated instance name, unique per run.
    pub instance_name: String,
    /// Server type requested for the instance.
    pub instance_type: String,
    /// Datacentre location requested for the instance.
    pub location: String,
    /// Boot image requested for the instance.
    pub image: String,
    handle: Option<InstanceHandle>,
    artifact_name: Option<String>,
    stage: Stage,
}

impl BuildSession {
    /// Creates a session for `profile` with provisioning parameters taken
    /// from configuration and a name derived from `at`.
    #[must_use]
    pub fn new(profile: impl Into<String>, config: &RunConfig, at: DateTime<Utc>) -> Self {
        Self {
            profile: profile.into(),
            instance_name: format!("{INSTANCE_NAME_PREFIX}{}", at.format("%Y%m%d-%H%M%S")),
            instance_type: config.instance_type.clone(),
            location: config.location.clone(),
            image: config.image.clone(),
            handle: None,
            artifact_name: None,
            stage: Stage::Idle,
        }
    }

    /// Returns the current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Advances to `next` when it is a forward transition; `Failed` is
    /// accepted from any non-terminal stage. Backward transitions are
    /// ignored, keeping the machine strictly forward.
    pub fn advance(&mut self, next: Stage) {
        if self.stage.is_terminal() || next <= self.stage {
            return;
        }
        debug!(from = ?self.stage, to = ?next, "stage transition");
        self.stage = next;
    }

    /// Records the provisioned instance; write-once per session.
    pub fn record_handle(&mut self, handle: InstanceHandle) {
        if self.handle.is_none() {
            self.handle = Some(handle);
        }
    }

    /// Returns the provisioned instance, if any.
    #[must_use]
    pub const fn handle(&self) -> Option<&InstanceHandle> {
        self.handle.as_ref()
    }

    /// Records the retrieved artifact's local file name.
    pub fn record_artifact(&mut self, name: impl Into<String>) {
        self.artifact_name = Some(name.into());
    }

    /// Returns the retrieved artifact's local file name, if any.
    #[must_use]
    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact_name.as_deref()
    }
}
