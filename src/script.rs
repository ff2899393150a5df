//! Remote build script composition.
//!
//! The script that runs on the instance is modelled as an ordered list of
//! typed [`Statement`]s rendered by [`BuildScript::render`], rather than ad-hoc
//! string concatenation. This keeps the escaping and secret-handling rules in
//! one place: paths are shell-escaped at render time, the credential token is
//! base64-encoded at construction time, and the configured environment lines
//! pass through a quoted heredoc untouched.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::RunConfig;

/// Line written into the status file when the detached job succeeds. Its
/// presence is the sole positive completion signal available to the
/// orchestrator.
pub const COMPLETION_SENTINEL: &str = "BUILD_COMPLETE";

/// Remote path of the generated job script started by the detached launcher.
pub const REMOTE_JOB_SCRIPT: &str = "/root/build-job.sh";

/// Name under which the selected profile is exported to the remote job.
pub const PROFILE_EXPORT_NAME: &str = "BUILD_PROFILE";

const ENV_HEREDOC_TAG: &str = "SKYFORGE_ENV";
const JOB_HEREDOC_TAG: &str = "SKYFORGE_JOB";

/// Errors raised while composing the remote script.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComposeError {
    /// Raised when a template still contains a placeholder token after
    /// interpolation.
    #[error("unresolved placeholder `${{{token}}}` after interpolation")]
    UnresolvedPlaceholder {
        /// Placeholder name that could not be resolved.
        token: String,
    },
}

/// Values substituted into configuration templates.
///
/// Exactly four placeholders exist: `${PROFILE}`, `${OUTPUT_FILE}`,
/// `${PROJECT_DIR}`, and `${LOG_FILE}`. Interpolation is total: any other
/// `${...}` token is an error rather than silently passed through.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateVars {
    /// Selected build profile.
    pub profile: String,
    /// Remote project directory.
    pub project_dir: String,
    /// Remote build log path.
    pub log_file: String,
    /// Resolved remote output path; `None` until the profile mapping has been
    /// consulted, at which point templates may not yet reference it.
    pub output_file: Option<String>,
}

impl TemplateVars {
    /// Builds the variable set available before the output path is known.
    #[must_use]
    pub fn new(profile: &str, config: &RunConfig) -> Self {
        Self {
            profile: profile.to_owned(),
            project_dir: config.remote_project_dir.clone(),
            log_file: config.remote_log_path.clone(),
            output_file: None,
        }
    }

    /// Returns a copy with the resolved output path filled in.
    #[must_use]
    pub fn with_output_file(mut self, output_file: impl Into<String>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }
}

/// Substitutes the known placeholders into `template`.
///
/// # Errors
///
/// Returns [`ComposeError::UnresolvedPlaceholder`] when any `${...}` token
/// remains after substitution, including `${OUTPUT_FILE}` while the output
/// path is still unknown.
pub fn interpolate(template: &str, vars: &TemplateVars) -> Result<String, ComposeError> {
    let mut result = template
        .replace("${PROFILE}", &vars.profile)
        .replace("${PROJECT_DIR}", &vars.project_dir)
        .replace("${LOG_FILE}", &vars.log_file);
    if let Some(ref output_file) = vars.output_file {
        result = result.replace("${OUTPUT_FILE}", output_file);
    }

    if let Some(token) = leftover_placeholder(&result) {
        return Err(ComposeError::UnresolvedPlaceholder { token });
    }

    Ok(result)
}

fn leftover_placeholder(rendered: &str) -> Option<String> {
    rendered
        .split("${")
        .nth(1)
        .and_then(|rest| rest.split('}').next())
        .map(str::to_owned)
}

/// One typed step of the remote script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Statement {
    /// Writes `lines` verbatim to `path` through a quoted heredoc.
    WriteFile {
        /// Remote file to create.
        path: String,
        /// Lines written without any shell expansion.
        lines: Vec<String>,
    },
    /// Appends an export of a base64-encoded value that is decoded only at
    /// the point of export inside the environment file. The encoding is
    /// transport-safety against shell quoting, not secrecy: anyone able to
    /// read the remote file can recover the value.
    ExportEncoded {
        /// Environment file to append to.
        file: String,
        /// Variable name exported to the job.
        name: String,
        /// Base64-encoded value.
        encoded: String,
    },
    /// Appends a plain export to the environment file.
    AppendExport {
        /// Environment file to append to.
        file: String,
        /// Variable name exported to the job.
        name: String,
        /// Literal value.
        value: String,
    },
    /// Initialises a git repository at `dir` and commits the synced tree; the
    /// build tool may refuse to run outside a repository.
    InitRepo {
        /// Remote project directory.
        dir: String,
    },
    /// Starts the build as a background process disassociated from the
    /// invoking shell, so channel disconnects do not terminate it. On success
    /// the job writes [`COMPLETION_SENTINEL`] into `status_file`.
    LaunchDetached {
        /// Environment file sourced by the job.
        env_file: String,
        /// Working directory of the job.
        dir: String,
        /// Fully interpolated build command.
        command: String,
        /// File receiving the job's stdout and stderr.
        log_file: String,
        /// Completion sentinel path.
        status_file: String,
    },
}

impl Statement {
    fn render(&self, out: &mut String) {
        match self {
            Self::WriteFile { path, lines } => {
                let target = escape(path.as_str().into());
                out.push_str(&format!("cat > {target} <<'{ENV_HEREDOC_TAG}'\n"));
                for line in lines {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str(ENV_HEREDOC_TAG);
                out.push('\n');
            }
            Self::ExportEncoded {
                file,
                name,
                encoded,
            } => {
                let target = escape(file.as_str().into());
                out.push_str(&format!(
                    "echo 'export {name}=\"$(echo {encoded} | base64 -d)\"' >> {target}\n"
                ));
            }
            Self::AppendExport { file, name, value } => {
                let target = escape(file.as_str().into());
                let escaped_value = escape(value.as_str().into());
                out.push_str(&format!(
                    "printf 'export %s=%s\\n' {name} {escaped_value} >> {target}\n"
                ));
            }
            Self::InitRepo { dir } => {
                let target = escape(dir.as_str().into());
                out.push_str(&format!("cd {target}\n"));
                out.push_str("if [ ! -d .git ]; then git init -q; fi\n");
                out.push_str("git add -A\n");
                out.push_str(concat!(
                    "git -c user.name=skyforge -c user.email=skyforge@localhost ",
                    "commit -qm 'imported workspace' >/dev/null 2>&1 || true\n"
                ));
            }
            Self::LaunchDetached {
                env_file,
                dir,
                command,
                log_file,
                status_file,
            } => {
                let job = escape(REMOTE_JOB_SCRIPT.into());
                let env = escape(env_file.as_str().into());
                let workdir = escape(dir.as_str().into());
                let log = escape(log_file.as_str().into());
                let status = escape(status_file.as_str().into());
                out.push_str(&format!("cat > {job} <<'{JOB_HEREDOC_TAG}'\n"));
                out.push_str("#!/bin/sh\nset -eu\n");
                out.push_str(&format!(". {env}\n"));
                out.push_str(&format!("cd {workdir}\n"));
                out.push_str(command);
                out.push('\n');
                out.push_str(&format!(
                    "printf '%s\\n' '{COMPLETION_SENTINEL}' > {status}\n"
                ));
                out.push_str(JOB_HEREDOC_TAG);
                out.push('\n');
                out.push_str(&format!("rm -f {status}\n"));
                out.push_str(&format!(": > {log}\n"));
                out.push_str(&format!(
                    "nohup setsid sh {job} >> {log} 2>&1 < /dev/null &\n"
                ));
            }
        }
    }
}

/// The composed remote script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildScript {
    statements: Vec<Statement>,
}

impl BuildScript {
    /// Returns the typed statements in execution order.
    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Renders the exact script text submitted to the remote host.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("set -eu\n");
        for statement in &self.statements {
            statement.render(&mut out);
        }
        out
    }
}

/// Composes the remote build script for the given profile and resolved
/// output path.
///
/// The credential token, when present, is embedded base64-encoded and decoded
/// only at the point of export inside the remote environment file.
///
/// # Errors
///
/// Returns [`ComposeError::UnresolvedPlaceholder`] when the configured build
/// command references an unknown placeholder.
pub fn compose(
    config: &RunConfig,
    vars: &TemplateVars,
    token: Option<&str>,
) -> Result<BuildScript, ComposeError> {
    let command = interpolate(&config.build_command, vars)?;

    let mut statements = vec![Statement::WriteFile {
        path: config.remote_env_file.clone(),
        lines: config.env_script.clone(),
    }];

    if let Some(secret) = token {
        statements.push(Statement::ExportEncoded {
            file: config.remote_env_file.clone(),
            name: config.token_env_var.clone(),
            encoded: BASE64.encode(secret),
        });
    }

    statements.push(Statement::AppendExport {
        file: config.remote_env_file.clone(),
        name: PROFILE_EXPORT_NAME.to_owned(),
        value: vars.profile.clone(),
    });
    statements.push(Statement::InitRepo {
        dir: config.remote_project_dir.clone(),
    });
    statements.push(Statement::LaunchDetached {
        env_file: config.remote_env_file.clone(),
        dir: config.remote_project_dir.clone(),
        command,
        log_file: config.remote_log_path.clone(),
        status_file: config.remote_status_file.clone(),
    });

    Ok(BuildScript { statements })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_config;
    use rstest::rstest;

    fn vars_with_output(profile: &str) -> TemplateVars {
        TemplateVars::new(profile, &test_config()).with_output_file("/root/project/out.apk")
    }

    #[rstest]
    #[case("${PROFILE}", "production")]
    #[case("${PROJECT_DIR}/x", "/root/project/x")]
    #[case("tail ${LOG_FILE}", "tail /root/build.log")]
    #[case("cp ${OUTPUT_FILE} .", "cp /root/project/out.apk .")]
    fn interpolate_resolves_known_placeholders(#[case] template: &str, #[case] expected: &str) {
        let rendered =
            interpolate(template, &vars_with_output("production")).expect("known placeholders");
        assert_eq!(rendered, expected);
    }

    #[test]
    fn interpolate_rejects_unknown_placeholder() {
        let err = interpolate("echo ${MYSTERY}", &vars_with_output("preview"))
            .expect_err("unknown placeholder should fail");
        assert_eq!(
            err,
            ComposeError::UnresolvedPlaceholder {
                token: String::from("MYSTERY")
            }
        );
    }

    #[test]
    fn interpolate_rejects_output_file_before_resolution() {
        let vars = TemplateVars::new("preview", &test_config());
        let err = interpolate("cp ${OUTPUT_FILE} .", &vars)
            .expect_err("output file is not yet resolved");
        assert!(matches!(err, ComposeError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn compose_writes_env_lines_verbatim() {
        let mut config = test_config();
        config.env_script = vec![
            String::from("export NODE_OPTIONS=\"--max-old-space-size=4096\""),
            String::from("ulimit -n 65536"),
        ];
        let script = compose(&config, &vars_with_output("preview"), None)
            .expect("compose")
            .render();

        assert!(script.contains("<<'SKYFORGE_ENV'\n"), "{script}");
        assert!(
            script.contains("export NODE_OPTIONS=\"--max-old-space-size=4096\"\n"),
            "{script}"
        );
        assert!(script.contains("ulimit -n 65536\n"), "{script}");
    }

    #[test]
    fn compose_never_embeds_the_raw_token() {
        let token = "secret'; rm -rf / #";
        let script = compose(&test_config(), &vars_with_output("preview"), Some(token))
            .expect("compose")
            .render();

        assert!(!script.contains(token), "raw token leaked: {script}");
        assert!(script.contains("base64 -d"), "{script}");
        assert!(script.contains(&BASE64.encode(token)), "{script}");
    }

    #[test]
    fn compose_without_token_skips_the_encoded_export() {
        let script = compose(&test_config(), &vars_with_output("preview"), None)
            .expect("compose");
        assert!(
            !script
                .statements()
                .iter()
                .any(|s| matches!(s, Statement::ExportEncoded { .. }))
        );
    }

    #[test]
    fn compose_appends_profile_and_inits_repo() {
        let script = compose(&test_config(), &vars_with_output("production"), None)
            .expect("compose")
            .render();

        assert!(
            script.contains("printf 'export %s=%s\\n' BUILD_PROFILE production"),
            "{script}"
        );
        assert!(script.contains("git init -q"), "{script}");
        assert!(script.contains("git add -A"), "{script}");
    }

    #[test]
    fn compose_detaches_the_build_and_writes_the_sentinel() {
        let script = compose(&test_config(), &vars_with_output("preview"), None)
            .expect("compose")
            .render();

        assert!(
            script.contains("nohup setsid sh /root/build-job.sh >> /root/build.log 2>&1 < /dev/null &"),
            "{script}"
        );
        assert!(
            script.contains("printf '%s\\n' 'BUILD_COMPLETE' > /root/build-status"),
            "{script}"
        );
        // A stale sentinel from a previous run must never signal completion.
        assert!(script.contains("rm -f /root/build-status"), "{script}");
    }

    #[test]
    fn compose_interpolates_the_build_command() {
        let script = compose(&test_config(), &vars_with_output("production"), None)
            .expect("compose")
            .render();

        assert!(
            script.contains("--profile production --local --output /root/project/out.apk"),
            "{script}"
        );
        assert!(!script.contains("${"), "{script}");
    }
}
