//! Hetzner Cloud provisioning client.
//!
//! Instances are created and destroyed by shelling out to the `hcloud` CLI
//! with JSON output, through the same [`CommandRunner`] abstraction used by
//! the execution channel so tests can script provider behaviour.

mod error;
mod types;

use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;

use crate::channel::{ChannelError, CommandOutput, CommandRunner};
use types::{CreateServerResponse, SshKeyInfo};

pub use error::HcloudError;

/// Handle for a provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider-assigned instance identifier.
    pub id: String,
    /// Public IPv4 address reachable over SSH.
    pub address: IpAddr,
}

/// Parameters for creating a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionRequest {
    /// Instance name, unique per run.
    pub name: String,
    /// Server type (for example `cpx41`).
    pub server_type: String,
    /// Boot image (for example `ubuntu-24.04`).
    pub image: String,
    /// Datacentre location (for example `fsn1`).
    pub location: String,
    /// Name of the provider-registered SSH key to install.
    pub ssh_key: String,
    /// Local cloud-init payload file applied on first boot.
    pub user_data_file: String,
}

/// Client for the Hetzner Cloud control plane CLI.
#[derive(Clone, Debug)]
pub struct HcloudClient<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> HcloudClient<R> {
    /// Creates a client that invokes the given `hcloud` binary.
    #[must_use]
    pub const fn new(bin: String, runner: R) -> Self {
        Self { bin, runner }
    }

    /// Verifies the provider CLI can be executed at all.
    ///
    /// Runs before any remote side effect so a missing tool surfaces as a
    /// prerequisite failure rather than mid-provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`HcloudError::PrerequisiteMissing`] when the binary cannot be
    /// spawned.
    pub fn ensure_available(&self) -> Result<(), HcloudError> {
        match self.runner.run(&self.bin, &[OsString::from("version")]) {
            Ok(_) => Ok(()),
            Err(ChannelError::Spawn { message, .. }) => Err(HcloudError::PrerequisiteMissing {
                tool: self.bin.clone(),
                message,
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Selects the SSH key to install on new instances.
    ///
    /// An explicitly configured key name wins; otherwise the first key known
    /// to the provider account is used.
    ///
    /// # Errors
    ///
    /// Returns [`HcloudError::NoSshKeyAvailable`] when no key is configured
    /// and the account holds none, or the usual CLI/parse failures.
    pub fn select_ssh_key(&self, configured: Option<&str>) -> Result<String, HcloudError> {
        if let Some(name) = configured {
            return Ok(name.to_owned());
        }

        let args = [
            OsString::from("ssh-key"),
            OsString::from("list"),
            OsString::from("-o"),
            OsString::from("json"),
        ];
        let stdout = self.run_json(&args, "ssh-key list")?;
        let keys: Vec<SshKeyInfo> =
            serde_json::from_str(&stdout).map_err(|err| HcloudError::Parse {
                what: String::from("ssh-key list"),
                message: err.to_string(),
            })?;

        keys.into_iter()
            .map(|key| key.name)
            .next()
            .ok_or(HcloudError::NoSshKeyAvailable)
    }

    /// Creates an instance and returns its identifier and public address.
    ///
    /// # Errors
    ///
    /// Returns [`HcloudError::ResponseInvalid`] when the creation response
    /// lacks the identifier or IPv4 address, or the usual CLI/parse failures.
    pub fn create(&self, request: &ProvisionRequest) -> Result<InstanceHandle, HcloudError> {
        let args = [
            OsString::from("server"),
            OsString::from("create"),
            OsString::from("--name"),
            OsString::from(&request.name),
            OsString::from("--type"),
            OsString::from(&request.server_type),
            OsString::from("--image"),
            OsString::from(&request.image),
            OsString::from("--location"),
            OsString::from(&request.location),
            OsString::from("--ssh-key"),
            OsString::from(&request.ssh_key),
            OsString::from("--user-data-from-file"),
            OsString::from(&request.user_data_file),
            OsString::from("-o"),
            OsString::from("json"),
        ];
        let stdout = self.run_json(&args, "server create")?;
        let response: CreateServerResponse =
            serde_json::from_str(&stdout).map_err(|err| HcloudError::Parse {
                what: String::from("server create"),
                message: err.to_string(),
            })?;

        let server = response.server.ok_or_else(|| HcloudError::ResponseInvalid {
            field: String::from("server"),
        })?;
        let id = server.id.ok_or_else(|| HcloudError::ResponseInvalid {
            field: String::from("server.id"),
        })?;
        let ip_text = server
            .public_net
            .and_then(|net| net.ipv4)
            .and_then(|ipv4| ipv4.ip)
            .ok_or_else(|| HcloudError::ResponseInvalid {
                field: String::from("server.public_net.ipv4.ip"),
            })?;
        let address =
            IpAddr::from_str(&ip_text).map_err(|_| HcloudError::ResponseInvalid {
                field: String::from("server.public_net.ipv4.ip"),
            })?;

        Ok(InstanceHandle {
            id: id.to_string(),
            address,
        })
    }

    /// Deletes the instance.
    ///
    /// Callers on teardown paths log failures instead of escalating them,
    /// since raising there would mask the original error or interrupt exit.
    ///
    /// # Errors
    ///
    /// Returns [`HcloudError::CommandFailure`] when the CLI exits non-zero.
    pub fn destroy(&self, handle: &InstanceHandle) -> Result<(), HcloudError> {
        let args = [
            OsString::from("server"),
            OsString::from("delete"),
            OsString::from(&handle.id),
        ];
        let output = self.runner.run(&self.bin, &args)?;
        self.check_output(output, "server delete").map(|_| ())
    }

    fn run_json(&self, args: &[OsString], what: &str) -> Result<String, HcloudError> {
        let output = self.runner.run(&self.bin, args)?;
        self.check_output(output, what).map(|out| out.stdout)
    }

    fn check_output(
        &self,
        output: CommandOutput,
        what: &str,
    ) -> Result<CommandOutput, HcloudError> {
        if output.is_success() {
            return Ok(output);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(HcloudError::CommandFailure {
            program: self.bin.clone(),
            status: output.code,
            status_text,
            stderr: format!("{what}: {}", output.stderr),
        })
    }
}
