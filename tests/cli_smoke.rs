//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_help_describes_the_tool() {
    let mut cmd = cargo_bin_cmd!("skyforge");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("throwaway cloud VM"))
        .stdout(contains("--env-dir"));
}

#[test]
fn cli_rejects_missing_env_dir_before_touching_the_network() {
    let mut cmd = cargo_bin_cmd!("skyforge");
    cmd.args(["preview", "--env-dir", "/definitely/not/here"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("does not exist or is not a directory"));
}
