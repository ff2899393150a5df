//! Core library for the Skyforge remote build tool.
//!
//! The crate drives one-shot builds on short-lived cloud instances: provision
//! a VM through the provider CLI, wait for SSH readiness, push the project
//! tree, launch a detached build job, watch it to completion, and bring the
//! artifact home — destroying the instance on every exit path.

pub mod artifact;
pub mod channel;
pub mod cloud_init;
pub mod config;
pub mod envdir;
pub mod guard;
pub mod hcloud;
pub mod poll;
pub mod run;
pub mod script;
pub mod session;
#[cfg(test)]
pub mod test_helpers;
pub mod test_support;

pub use artifact::{ArtifactError, ArtifactResolver, artifact_stamp, expected_output_path};
pub use channel::{
    ChannelConfig, ChannelError, CommandOutput, CommandRunner, ExecOptions, ProcessCommandRunner,
    RemoteCommandOutput, RemoteShell, expand_tilde,
};
pub use cloud_init::{CloudInitError, resolve_user_data_file};
pub use config::{ConfigError, ProfileMap, RunConfig};
pub use envdir::{EnvDirError, apply_missing, load_env_dir};
pub use guard::{CleanupGuard, run_teardown};
pub use hcloud::{HcloudClient, HcloudError, InstanceHandle, ProvisionRequest};
pub use poll::{PollError, RetryPolicy, poll_until};
pub use run::{RunError, RunOrchestrator};
pub use script::{
    BuildScript, COMPLETION_SENTINEL, ComposeError, Statement, TemplateVars, compose, interpolate,
};
pub use session::{BuildSession, Stage};
