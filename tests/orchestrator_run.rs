//! Behavioural tests for the full build-run lifecycle against a scripted
//! command runner.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use skyforge::test_support::ScriptedRunner;
use skyforge::{
    BuildSession, CleanupGuard, RetryPolicy, RunConfig, RunError, RunOrchestrator, Stage,
};
use tempfile::TempDir;

struct Fixture {
    config: RunConfig,
    source: TempDir,
    _artifacts: TempDir,
    _cloud_init: TempDir,
}

fn fixture() -> Fixture {
    let cloud_init = tempfile::tempdir().expect("tempdir");
    let payload = cloud_init.path().join("cloud-init.yaml");
    std::fs::write(&payload, "#cloud-config\npackages:\n  - git\n").expect("write payload");
    let artifacts = tempfile::tempdir().expect("tempdir");
    let source = tempfile::tempdir().expect("tempdir");

    let mut config = RunConfig::load_without_cli_args().expect("defaults load");
    config.ssh_key_name = Some(String::from("ci"));
    config.cloud_init_file = payload.to_string_lossy().into_owned();
    config.local_artifact_dir = artifacts.path().to_string_lossy().into_owned();

    Fixture {
        config,
        source,
        _artifacts: artifacts,
        _cloud_init: cloud_init,
    }
}

fn orchestrator(
    config: RunConfig,
    runner: ScriptedRunner,
    guard: Arc<CleanupGuard>,
    source: &TempDir,
) -> RunOrchestrator<ScriptedRunner> {
    let source_path =
        Utf8PathBuf::from_path_buf(source.path().to_path_buf()).expect("utf8 tempdir");
    RunOrchestrator::new(config, runner, guard, source_path)
        .with_reachability_policy(RetryPolicy::bounded(Duration::from_millis(1), 3))
        .with_initialisation_policy(RetryPolicy::bounded(Duration::from_millis(1), 3))
        .with_monitor_policy(RetryPolicy::bounded(Duration::from_millis(1), 10))
}

fn delete_invocations(runner: &ScriptedRunner) -> usize {
    runner
        .invocations()
        .iter()
        .filter(|inv| inv.command_string().starts_with("hcloud server delete"))
        .count()
}

#[tokio::test]
async fn happy_path_retrieves_artifact_and_destroys_instance() {
    let fx = fixture();
    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version
    runner.push_output(
        Some(0),
        skyforge::test_support::json_server_created(4242, "203.0.113.9"),
        "",
    ); // server create
    runner.push_success(); // ssh reachability
    runner.push_success(); // first-boot probe
    runner.push_success(); // rsync tree push
    runner.push_success(); // build script launch
    runner.push_success(); // sentinel present
    runner.push_exit_code(1); // first candidate missing
    runner.push_success(); // second candidate exists
    runner.push_success(); // scp fetch
    runner.push_success(); // server delete

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(fx.config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &fx.config, Utc::now());

    orch.execute(&mut session).await.expect("run succeeds");

    assert_eq!(session.stage(), Stage::Done);
    let artifact = session.artifact_name().expect("artifact recorded");
    assert!(artifact.starts_with("build-"), "{artifact}");
    assert!(artifact.ends_with(".apk"), "{artifact}");

    assert_eq!(delete_invocations(&runner), 1);
    assert!(!guard.is_armed());

    let launch = runner.invocations()[5].command_string();
    assert!(launch.contains("nohup setsid sh /root/build-job.sh"), "{launch}");
    assert!(launch.contains("rm -f /root/build-status"), "{launch}");
    assert!(launch.contains("--profile preview"), "{launch}");
}

#[tokio::test]
async fn crashed_build_surfaces_log_tail_and_still_destroys_instance() {
    let fx = fixture();
    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version
    runner.push_output(
        Some(0),
        skyforge::test_support::json_server_created(7, "203.0.113.7"),
        "",
    ); // server create
    runner.push_success(); // ssh reachability
    runner.push_success(); // first-boot probe
    runner.push_success(); // rsync tree push
    runner.push_success(); // build script launch
    runner.push_exit_code(1); // no sentinel
    runner.push_exit_code(1); // no build process
    runner.push_exit_code(1); // no candidate exists
    runner.push_output(Some(0), "FATAL: out of memory\n", ""); // log dump
    runner.push_success(); // server delete

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(fx.config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &fx.config, Utc::now());

    let err = orch.execute(&mut session).await.expect_err("build crashed");
    assert!(matches!(
        err,
        RunError::BuildCrashed { ref log_tail } if log_tail.contains("out of memory")
    ));
    assert_eq!(session.stage(), Stage::Failed);
    assert_eq!(delete_invocations(&runner), 1);
}

#[tokio::test]
async fn ssh_outage_during_monitoring_is_retried_until_the_build_finishes() {
    let fx = fixture();
    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version
    runner.push_output(
        Some(0),
        skyforge::test_support::json_server_created(11, "203.0.113.11"),
        "",
    ); // server create
    runner.push_success(); // ssh reachability
    runner.push_success(); // first-boot probe
    runner.push_success(); // rsync tree push
    runner.push_success(); // build script launch
    runner.push_exit_code(255); // connection drops mid-build
    runner.push_exit_code(255); // still unreachable next tick
    runner.push_success(); // connection back, sentinel present
    runner.push_success(); // first candidate exists
    runner.push_success(); // scp fetch
    runner.push_success(); // server delete

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(fx.config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &fx.config, Utc::now());

    orch.execute(&mut session).await.expect("run survives the outage");

    assert_eq!(session.stage(), Stage::Done);
    assert!(session.artifact_name().is_some());
    assert_eq!(delete_invocations(&runner), 1);
}

#[tokio::test]
async fn provisioning_failure_never_attempts_teardown() {
    let fx = fixture();
    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version
    runner.push_output(Some(1), "", "quota exceeded"); // server create fails

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(fx.config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &fx.config, Utc::now());

    let err = orch.execute(&mut session).await.expect_err("create failed");
    assert!(matches!(err, RunError::Provision(_)));
    assert_eq!(session.stage(), Stage::Failed);
    assert_eq!(delete_invocations(&runner), 0);
    assert!(session.handle().is_none());
}

#[tokio::test]
async fn missing_cloud_init_fails_before_any_provisioning_call() {
    let fx = fixture();
    let mut config = fx.config.clone();
    config.cloud_init_file = String::from("/definitely/not/here.yaml");

    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &config, Utc::now());

    let err = orch.execute(&mut session).await.expect_err("missing payload");
    assert!(matches!(err, RunError::CloudInit(_)));
    assert_eq!(runner.invocations().len(), 1, "only the version probe ran");
}

#[tokio::test]
async fn unreachable_instance_times_out_and_destroys_it() {
    let fx = fixture();
    let runner = ScriptedRunner::new();
    runner.push_success(); // hcloud version
    runner.push_output(
        Some(0),
        skyforge::test_support::json_server_created(9, "203.0.113.9"),
        "",
    ); // server create
    runner.push_exit_code(255); // ssh attempt 1
    runner.push_exit_code(255); // ssh attempt 2
    runner.push_exit_code(255); // ssh attempt 3
    runner.push_success(); // server delete

    let guard = Arc::new(CleanupGuard::new());
    let orch = orchestrator(fx.config.clone(), runner.clone(), Arc::clone(&guard), &fx.source);
    let mut session = BuildSession::new("preview", &fx.config, Utc::now());

    let err = orch.execute(&mut session).await.expect_err("never reachable");
    assert!(matches!(err, RunError::Unreachable(_)));
    assert_eq!(delete_invocations(&runner), 1);
}
