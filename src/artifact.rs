//! Artifact location and retrieval.
//!
//! Before the build starts, the profile mapping decides the output path the
//! remote job writes to. After the job signals completion, the configured
//! candidate paths are probed in order and the first existing one is copied
//! into the local artifact directory under a timestamped name.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::channel::{ChannelError, CommandRunner, ExecOptions, RemoteShell};
use crate::config::{DEFAULT_PROFILE_KEY, ProfileMap, RunConfig};
use crate::script::{ComposeError, TemplateVars, interpolate};

/// Prefix of locally written artifact file names.
pub const LOCAL_ARTIFACT_PREFIX: &str = "build-";

/// Errors raised while resolving or retrieving the artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Raised when neither the profile nor the `default` key has a mapping.
    #[error("no artifact path mapped for profile `{profile}` and no default entry")]
    MissingMapping {
        /// Profile that was looked up.
        profile: String,
    },
    /// Raised when no candidate path exists remotely despite the completion
    /// signal.
    #[error("no artifact found: checked {checked} candidate path(s)")]
    NotFound {
        /// Number of candidate paths probed.
        checked: usize,
    },
    /// Raised when a candidate template cannot be interpolated.
    #[error(transparent)]
    Template(#[from] ComposeError),
    /// Raised when remote probing or the transfer fails.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Raised when the local artifact directory cannot be created.
    #[error("failed to prepare local artifact directory `{dir}`: {message}")]
    LocalDir {
        /// Directory that could not be created.
        dir: String,
        /// Operating system error string.
        message: String,
    },
}

/// Returns the templated remote output path for `profile`, falling back to
/// the `default` entry.
///
/// # Errors
///
/// Returns [`ArtifactError::MissingMapping`] when neither entry exists.
pub fn expected_output_path(mapping: &ProfileMap, profile: &str) -> Result<String, ArtifactError> {
    mapping
        .get(profile)
        .or_else(|| mapping.get(DEFAULT_PROFILE_KEY))
        .cloned()
        .ok_or_else(|| ArtifactError::MissingMapping {
            profile: profile.to_owned(),
        })
}

/// Formats the timestamp component of a local artifact name: the RFC 3339
/// millisecond form with every colon and period replaced by a hyphen and the
/// time-zone suffix stripped.
#[must_use]
pub fn artifact_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .trim_end_matches('Z')
        .chars()
        .map(|ch| match ch {
            ':' | '.' | 'T' => '-',
            other => other,
        })
        .collect()
}

/// Locates the build output among the configured candidates and copies it to
/// the local artifact directory.
#[derive(Debug)]
pub struct ArtifactResolver<'a, R: CommandRunner> {
    shell: &'a RemoteShell<R>,
    config: &'a RunConfig,
}

impl<'a, R: CommandRunner> ArtifactResolver<'a, R> {
    /// Creates a resolver over the given channel and configuration.
    #[must_use]
    pub const fn new(shell: &'a RemoteShell<R>, config: &'a RunConfig) -> Self {
        Self { shell, config }
    }

    /// Probes the candidates in configured order and fetches the first hit
    /// into the local artifact directory.
    ///
    /// The local name combines [`LOCAL_ARTIFACT_PREFIX`], the timestamp for
    /// `at`, and the candidate's original extension.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] when no candidate exists remotely.
    pub fn retrieve(
        &self,
        vars: &TemplateVars,
        at: DateTime<Utc>,
    ) -> Result<String, ArtifactError> {
        let Some(remote_path) = self.first_existing_candidate(vars)? else {
            return Err(ArtifactError::NotFound {
                checked: self.config.artifact_candidates.len(),
            });
        };

        let file_name = local_artifact_name(&remote_path, at);
        let local_dir = Utf8PathBuf::from(&self.config.local_artifact_dir);
        std::fs::create_dir_all(&local_dir).map_err(|err| ArtifactError::LocalDir {
            dir: local_dir.to_string(),
            message: err.to_string(),
        })?;

        let local_path = local_dir.join(&file_name);
        info!(remote = %remote_path, local = %local_path, "fetching artifact");
        self.shell.fetch(&remote_path, &local_path)?;
        Ok(file_name)
    }

    fn first_existing_candidate(
        &self,
        vars: &TemplateVars,
    ) -> Result<Option<String>, ArtifactError> {
        for template in &self.config.artifact_candidates {
            let path = interpolate(template, vars)?;
            let probe = format!("test -f {}", escape(path.as_str().into()));
            if self
                .shell
                .execute(&probe, ExecOptions::tolerant())?
                .is_success()
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

fn local_artifact_name(remote_path: &str, at: DateTime<Utc>) -> String {
    let stamp = artifact_stamp(at);
    Utf8Path::new(remote_path)
        .extension()
        .map_or_else(
            || format!("{LOCAL_ARTIFACT_PREFIX}{stamp}"),
            |ext| format!("{LOCAL_ARTIFACT_PREFIX}{stamp}.{ext}"),
        )
}
