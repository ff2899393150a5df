//! Run configuration loading via `ortho-config`.
//!
//! [`RunConfig`] carries everything a build run needs: provisioning defaults,
//! SSH transport settings, the remote rendezvous paths shared with the
//! detached job, and the artifact lookup tables. Values merge built-in
//! defaults, `skyforge.toml`, and `SKYFORGE_*` environment variables; a layer
//! that sets an array-valued field replaces it wholesale rather than
//! concatenating.

use std::collections::BTreeMap;
use std::str::FromStr;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelConfig;

/// Default remote directory receiving the project tree.
pub const DEFAULT_REMOTE_PROJECT_DIR: &str = "/root/project";

/// Default remote environment file sourced by the detached job.
pub const DEFAULT_REMOTE_ENV_FILE: &str = "/root/build-env.sh";

/// Default remote build log path.
pub const DEFAULT_REMOTE_LOG_PATH: &str = "/root/build.log";

/// Default remote completion sentinel path.
pub const DEFAULT_REMOTE_STATUS_FILE: &str = "/root/build-status";

/// Key in [`RunConfig::artifact_for_profile`] used when a profile has no
/// dedicated entry.
pub const DEFAULT_PROFILE_KEY: &str = "default";

fn default_sync_excludes() -> Vec<String> {
    vec![
        String::from(".git/"),
        String::from("node_modules/"),
        String::from("artifacts/"),
    ]
}

fn default_artifact_for_profile() -> ProfileMap {
    BTreeMap::from([
        (
            String::from("production"),
            String::from("${PROJECT_DIR}/build-${PROFILE}.aab"),
        ),
        (
            String::from(DEFAULT_PROFILE_KEY),
            String::from("${PROJECT_DIR}/build-output.apk"),
        ),
    ])
    .into()
}

/// Mapping from profile name to a templated remote artifact path.
///
/// Wraps the map so every layered source can produce it: structured
/// configuration files deserialise it transparently, while the flag and
/// environment layers parse a single `profile=path[,profile=path]` string.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProfileMap(BTreeMap<String, String>);

impl ProfileMap {
    /// Returns the templated path for `profile`, if mapped.
    #[must_use]
    pub fn get(&self, profile: &str) -> Option<&String> {
        self.0.get(profile)
    }

    /// Returns `true` when no profile is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ProfileMap {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }
}

impl FromStr for ProfileMap {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for pair in input.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (profile, path) = pair.split_once('=').ok_or_else(|| {
                ConfigError::Parse(format!(
                    "invalid profile mapping `{pair}`: expected profile=path"
                ))
            })?;
            entries.insert(profile.trim().to_owned(), path.trim().to_owned());
        }
        Ok(Self(entries))
    }
}

fn default_artifact_candidates() -> Vec<String> {
    vec![
        String::from("${PROJECT_DIR}/build-${PROFILE}.aab"),
        String::from("${PROJECT_DIR}/build-output.apk"),
        String::from("/root/build-output.apk"),
    ]
}

fn default_watch_processes() -> Vec<String> {
    vec![
        String::from("eas-cli"),
        String::from("gradle"),
        String::from("java"),
        String::from("node"),
    ]
}

/// Run settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SKYFORGE")]
pub struct RunConfig {
    /// Path to the `hcloud` CLI used for provisioning.
    #[ortho_config(default = "hcloud".to_owned())]
    pub hcloud_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Path to the SSH private key file for remote authentication. Supports
    /// tilde expansion (`~/.ssh/id_ed25519`). Optional; when not provided, SSH
    /// falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Name of a provider-registered SSH key to install on new instances.
    /// When absent the first key known to the account is selected.
    pub ssh_key_name: Option<String>,
    /// Keep-alive probe interval in seconds for SSH connections.
    #[ortho_config(default = 15)]
    pub keepalive_interval_secs: u64,
    /// Server type for new instances.
    #[ortho_config(default = "cpx41".to_owned())]
    pub instance_type: String,
    /// Datacentre location for new instances.
    #[ortho_config(default = "fsn1".to_owned())]
    pub location: String,
    /// Boot image for new instances.
    #[ortho_config(default = "ubuntu-24.04".to_owned())]
    pub image: String,
    /// Local cloud-init payload file that bootstraps the build toolchain on
    /// first boot. Must exist before provisioning starts.
    #[ortho_config(default = "cloud-init.yaml".to_owned())]
    pub cloud_init_file: String,
    /// Remote directory receiving the project tree.
    #[ortho_config(default = DEFAULT_REMOTE_PROJECT_DIR.to_owned())]
    pub remote_project_dir: String,
    /// Remote environment file sourced by the detached job.
    #[ortho_config(default = DEFAULT_REMOTE_ENV_FILE.to_owned())]
    pub remote_env_file: String,
    /// Remote path receiving the detached job's stdout and stderr.
    #[ortho_config(default = DEFAULT_REMOTE_LOG_PATH.to_owned())]
    pub remote_log_path: String,
    /// Remote file whose existence signals build completion.
    #[ortho_config(default = DEFAULT_REMOTE_STATUS_FILE.to_owned())]
    pub remote_status_file: String,
    /// Path patterns excluded from the project sync, in order.
    #[ortho_config(default = default_sync_excludes())]
    pub sync_excludes: Vec<String>,
    /// Shell statements written verbatim into the remote environment file.
    #[ortho_config(default = Vec::new())]
    pub env_script: Vec<String>,
    /// Templated build command run inside the detached job. May reference
    /// `${PROFILE}`, `${OUTPUT_FILE}`, `${PROJECT_DIR}`, and `${LOG_FILE}`.
    #[ortho_config(
        default = "eas build --platform android --profile ${PROFILE} --local --output ${OUTPUT_FILE}".to_owned()
    )]
    pub build_command: String,
    /// Mapping from profile name to the templated remote artifact path, plus
    /// a `default` fallback.
    #[ortho_config(default = default_artifact_for_profile())]
    pub artifact_for_profile: ProfileMap,
    /// Ordered templated remote paths checked after completion; the first one
    /// that exists wins.
    #[ortho_config(default = default_artifact_candidates())]
    pub artifact_candidates: Vec<String>,
    /// Process names the monitor checks while deciding whether the build is
    /// still progressing.
    #[ortho_config(default = default_watch_processes())]
    pub watch_processes: Vec<String>,
    /// Local directory receiving retrieved artifacts.
    #[ortho_config(default = "artifacts".to_owned())]
    pub local_artifact_dir: String,
    /// Environment variable holding the build-credential token. When set in
    /// the orchestrator's environment, its value is embedded (base64-encoded)
    /// in the remote environment file under the same name.
    #[ortho_config(default = "EXPO_TOKEN".to_owned())]
    pub token_env_var: String,
    /// Seconds between monitoring ticks while the build runs.
    #[ortho_config(default = 10)]
    pub monitor_interval_secs: u64,
}

/// Errors raised when loading or validating the run configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing {field}: set SKYFORGE_{env_suffix} or add {field} to skyforge.toml", env_suffix = field.to_uppercase())]
    MissingField {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl RunConfig {
    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("skyforge")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when any required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.hcloud_bin, "hcloud_bin")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_value(&self.instance_type, "instance_type")?;
        Self::require_value(&self.location, "location")?;
        Self::require_value(&self.image, "image")?;
        Self::require_value(&self.cloud_init_file, "cloud_init_file")?;
        Self::require_value(&self.remote_project_dir, "remote_project_dir")?;
        Self::require_value(&self.remote_env_file, "remote_env_file")?;
        Self::require_value(&self.remote_log_path, "remote_log_path")?;
        Self::require_value(&self.remote_status_file, "remote_status_file")?;
        Self::require_value(&self.build_command, "build_command")?;
        Self::require_value(&self.local_artifact_dir, "local_artifact_dir")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        Self::require_optional_value(self.ssh_key_name.as_deref(), "ssh_key_name")?;
        // An empty watch list would make the liveness probe `pgrep -f ''`,
        // which matches every process on the instance.
        Self::require_values(&self.watch_processes, "watch_processes")?;
        Self::require_values(&self.artifact_candidates, "artifact_candidates")?;
        Ok(())
    }

    /// Builds the SSH transport settings for the execution channel.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            rsync_bin: self.rsync_bin.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_identity_file: self.ssh_identity_file.clone(),
            keepalive_interval_secs: self.keepalive_interval_secs,
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        Self::require_optional_value(Some(value), field)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ConfigError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(ConfigError::MissingField {
                field: field.to_owned(),
            }),
        }
    }

    fn require_values(values: &[String], field: &str) -> Result<(), ConfigError> {
        if values.iter().any(|value| !value.trim().is_empty()) {
            Ok(())
        } else {
            Err(ConfigError::MissingField {
                field: field.to_owned(),
            })
        }
    }
}
