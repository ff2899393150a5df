//! Error types for the Hetzner Cloud provisioning client.

use thiserror::Error;

use crate::channel::ChannelError;

/// Errors raised by the provisioning client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HcloudError {
    /// Raised before any remote side effect when the provider CLI is absent.
    #[error("required tool `{tool}` is not available: {message}")]
    PrerequisiteMissing {
        /// Binary that could not be executed.
        tool: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when no SSH key is configured and the account holds none.
    #[error("no SSH key available: configure ssh_key_name or register a key with the provider")]
    NoSshKeyAvailable,
    /// Raised when the creation response lacks an expected field; proceeding
    /// with a null identifier or address would only fail later and leak the
    /// instance.
    #[error("provisioning response missing `{field}`")]
    ResponseInvalid {
        /// JSON path of the absent field.
        field: String,
    },
    /// Raised when the provider CLI exits non-zero.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when JSON output from the CLI cannot be parsed.
    #[error("failed to parse {what} output: {message}")]
    Parse {
        /// Operation whose output failed to parse.
        what: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when command execution fails locally.
    #[error(transparent)]
    Runner(#[from] ChannelError),
}
