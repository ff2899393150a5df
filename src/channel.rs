//! Remote execution channel built on the system `ssh`, `scp`, and `rsync`
//! clients.
//!
//! Every remote interaction in the crate flows through [`RemoteShell`]: ad-hoc
//! commands, the project tree push, and artifact retrieval. Command spawning is
//! abstracted behind [`CommandRunner`] so tests can substitute scripted
//! outcomes without touching the network.

use std::ffi::OsString;
use std::net::IpAddr;
use std::process::{Command, Stdio};

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the input is returned
/// unchanged. Callers that need a different fallback should handle the
/// unexpanded form themselves.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output (empty when the command was streamed).
    pub stdout: String,
    /// Captured standard error (empty when the command was streamed).
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ChannelError>;

    /// Runs `program` with stdout and stderr forwarded to the operator's
    /// terminal instead of being captured. Used where live progress matters
    /// (tree sync, artifact transfer).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] if the command cannot be started.
    fn run_streaming(&self, program: &str, args: &[OsString])
    -> Result<CommandOutput, ChannelError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ChannelError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ChannelError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_streaming(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, ChannelError> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| ChannelError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Errors surfaced by the execution channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ChannelError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote command exits non-zero and the caller did not
    /// tolerate failure.
    #[error("remote command `{command}` exited with status {status_text}: {stderr}")]
    RemoteCommandFailed {
        /// Command that was executed remotely.
        command: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the remote side.
        stderr: String,
    },
    /// Raised when a local tree push is attempted from a missing directory.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be synchronised.
        path: String,
    },
}

/// Per-call execution options.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecOptions {
    /// When `true`, a non-zero remote exit status is returned to the caller
    /// instead of raising [`ChannelError::RemoteCommandFailed`].
    pub allow_failure: bool,
    /// When `true`, output is forwarded live instead of captured.
    pub stream_output: bool,
}

impl ExecOptions {
    /// Strict options: failure raises, output is captured.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            allow_failure: false,
            stream_output: false,
        }
    }

    /// Tolerant options: the caller inspects the exit status itself.
    #[must_use]
    pub const fn tolerant() -> Self {
        Self {
            allow_failure: true,
            stream_output: false,
        }
    }

    /// Streaming options: failure raises, output is forwarded live.
    #[must_use]
    pub const fn streaming() -> Self {
        Self {
            allow_failure: false,
            stream_output: true,
        }
    }
}

/// Output of a remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote process, if available.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// SSH transport settings shared by every channel operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelConfig {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Remote user to connect as.
    pub ssh_user: String,
    /// Path to the SSH private key file; supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Keep-alive probe interval in seconds so idle long-running commands are
    /// not silently dropped.
    pub keepalive_interval_secs: u64,
}

/// Executes commands and transfers on a single remote host over SSH.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    config: ChannelConfig,
    host: IpAddr,
    runner: R,
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a shell bound to the given host address.
    #[must_use]
    pub const fn new(config: ChannelConfig, host: IpAddr, runner: R) -> Self {
        Self {
            config,
            host,
            runner,
        }
    }

    /// Returns the address this shell is bound to.
    #[must_use]
    pub const fn host(&self) -> IpAddr {
        self.host
    }

    /// Executes `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] when the SSH client cannot be started,
    /// or [`ChannelError::RemoteCommandFailed`] when the remote exit status is
    /// non-zero and `options.allow_failure` is `false`.
    pub fn execute(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<RemoteCommandOutput, ChannelError> {
        let mut args = self.common_ssh_options();
        args.push(OsString::from(self.user_at_host()));
        args.push(OsString::from(command));

        let output = if options.stream_output {
            self.runner.run_streaming(&self.config.ssh_bin, &args)?
        } else {
            self.runner.run(&self.config.ssh_bin, &args)?
        };

        let remote = RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !options.allow_failure && !remote.is_success() {
            return Err(ChannelError::RemoteCommandFailed {
                command: command.to_owned(),
                status_text: status_text(remote.exit_code),
                stderr: remote.stderr,
            });
        }

        Ok(remote)
    }

    /// Pushes the local tree at `source` to `remote_dir`, excluding the given
    /// patterns, with progress streamed to the operator.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::MissingSource`] when `source` is not a
    /// directory, or the usual spawn/exit failures from `rsync`.
    pub fn push_tree(
        &self,
        source: &Utf8Path,
        remote_dir: &str,
        excludes: &[String],
    ) -> Result<(), ChannelError> {
        if !source.is_dir() {
            return Err(ChannelError::MissingSource {
                path: source.to_string(),
            });
        }

        let mut args = vec![OsString::from("-az"), OsString::from("--delete")];
        for pattern in excludes {
            args.push(OsString::from("--exclude"));
            args.push(OsString::from(pattern));
        }
        args.push(OsString::from("--rsh"));
        args.push(OsString::from(self.remote_shell_command()));
        args.push(OsString::from(format!("{source}/")));
        args.push(OsString::from(format!(
            "{}:{remote_dir}",
            self.user_at_host()
        )));

        let output = self.runner.run_streaming(&self.config.rsync_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }

        Err(ChannelError::RemoteCommandFailed {
            command: format!("{} {source}/ -> {remote_dir}", self.config.rsync_bin),
            status_text: status_text(output.code),
            stderr: output.stderr,
        })
    }

    /// Copies `remote_path` from the host to `local_path`, with progress
    /// streamed to the operator.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] when `scp` cannot be started or
    /// [`ChannelError::RemoteCommandFailed`] when the transfer fails.
    pub fn fetch(&self, remote_path: &str, local_path: &Utf8Path) -> Result<(), ChannelError> {
        let mut args = self.common_ssh_options();
        args.push(OsString::from(format!(
            "{}:{remote_path}",
            self.user_at_host()
        )));
        args.push(OsString::from(local_path.as_str()));

        let output = self.runner.run_streaming(&self.config.scp_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }

        Err(ChannelError::RemoteCommandFailed {
            command: format!("{} {remote_path} -> {local_path}", self.config.scp_bin),
            status_text: status_text(output.code),
            stderr: output.stderr,
        })
    }

    fn user_at_host(&self) -> String {
        format!("{}@{}", self.config.ssh_user, self.host)
    }

    /// Fixed connection options applied to every `ssh` and `scp` invocation:
    /// batch mode, no host-key confirmation, no persistent host-key storage,
    /// and keep-alive probing.
    fn common_ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from(format!(
                "ServerAliveInterval={}",
                self.config.keepalive_interval_secs
            )),
            OsString::from("-o"),
            OsString::from("ServerAliveCountMax=4"),
        ];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        args
    }

    /// Renders the transport for rsync's `--rsh` flag. Rsync word-splits this
    /// string itself, so every argument is shell-quoted to keep paths with
    /// spaces intact.
    fn remote_shell_command(&self) -> String {
        let mut parts = vec![escape(self.config.ssh_bin.as_str().into()).into_owned()];
        for arg in self.common_ssh_options() {
            parts.push(escape(arg.to_string_lossy()).into_owned());
        }
        parts.join(" ")
    }
}

fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use std::net::Ipv4Addr;

    fn config() -> ChannelConfig {
        ChannelConfig {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            rsync_bin: String::from("rsync"),
            ssh_user: String::from("root"),
            ssh_identity_file: Some(String::from("/keys/id_ed25519")),
            keepalive_interval_secs: 15,
        }
    }

    fn shell(runner: ScriptedRunner) -> RemoteShell<ScriptedRunner> {
        RemoteShell::new(config(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), runner)
    }

    #[test]
    fn execute_builds_expected_ssh_invocation() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let output = shell(runner.clone())
            .execute("echo hi", ExecOptions::strict())
            .expect("scripted success");

        assert!(output.is_success());
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        let rendered = invocations[0].command_string();
        assert!(rendered.starts_with("ssh -o BatchMode=yes"), "{rendered}");
        assert!(rendered.contains("StrictHostKeyChecking=no"), "{rendered}");
        assert!(rendered.contains("UserKnownHostsFile=/dev/null"), "{rendered}");
        assert!(rendered.contains("ServerAliveInterval=15"), "{rendered}");
        assert!(rendered.contains("-i /keys/id_ed25519"), "{rendered}");
        assert!(rendered.ends_with("root@203.0.113.9 echo hi"), "{rendered}");
    }

    #[test]
    fn execute_raises_on_failure_by_default() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(12), "", "remote boom");
        let err = shell(runner)
            .execute("false", ExecOptions::strict())
            .expect_err("non-zero status should raise");

        assert!(matches!(
            err,
            ChannelError::RemoteCommandFailed { ref stderr, ref status_text, .. }
                if stderr == "remote boom" && status_text == "12"
        ));
    }

    #[test]
    fn execute_tolerates_failure_when_asked() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(1);
        let output = shell(runner)
            .execute("test -f /x", ExecOptions::tolerant())
            .expect("tolerated failure");

        assert_eq!(output.exit_code, Some(1));
    }

    #[test]
    fn push_tree_rejects_missing_source() {
        let runner = ScriptedRunner::new();
        let err = shell(runner)
            .push_tree(Utf8Path::new("/definitely/not/here"), "/root/project", &[])
            .expect_err("missing source should fail");

        assert!(matches!(err, ChannelError::MissingSource { .. }));
    }

    #[test]
    fn push_tree_passes_excludes_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");
        let runner = ScriptedRunner::new();
        runner.push_success();

        shell(runner.clone())
            .push_tree(
                source,
                "/root/project",
                &[String::from(".git/"), String::from("node_modules/")],
            )
            .expect("scripted success");

        let rendered = runner.invocations()[0].command_string();
        let git_at = rendered.find(".git/").expect(".git exclude present");
        let modules_at = rendered
            .find("node_modules/")
            .expect("node_modules exclude present");
        assert!(git_at < modules_at, "{rendered}");
        assert!(rendered.contains("root@203.0.113.9:/root/project"), "{rendered}");
    }

    #[test]
    fn rsync_transport_quotes_identity_paths_with_spaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");
        let mut config = config();
        config.ssh_identity_file = Some(String::from("/keys/build key"));
        let runner = ScriptedRunner::new();
        runner.push_success();

        RemoteShell::new(config, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), runner.clone())
            .push_tree(source, "/root/project", &[])
            .expect("scripted success");

        let invocation = &runner.invocations()[0];
        let rsh_at = invocation
            .args
            .iter()
            .position(|arg| arg.to_string_lossy() == "--rsh")
            .expect("--rsh present");
        let transport = invocation.args[rsh_at + 1].to_string_lossy();
        assert!(transport.contains("-i '/keys/build key'"), "{transport}");
    }

    #[test]
    fn fetch_targets_remote_path() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        shell(runner.clone())
            .fetch("/root/build-output.apk", Utf8Path::new("artifacts/build.apk"))
            .expect("scripted success");

        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.starts_with("scp "), "{rendered}");
        assert!(
            rendered.contains("root@203.0.113.9:/root/build-output.apk"),
            "{rendered}"
        );
        assert!(rendered.ends_with("artifacts/build.apk"), "{rendered}");
    }

    #[test]
    fn expand_tilde_expands_home_prefix() {
        let home = std::env::var("HOME").expect("HOME should be set");
        assert_eq!(expand_tilde("~/.ssh/key"), format!("{home}/.ssh/key"));
        assert_eq!(expand_tilde("/absolute"), "/absolute");
    }
}
