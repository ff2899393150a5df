//! Shared fixtures for unit tests inside the crate.

use std::collections::BTreeMap;

use crate::config::RunConfig;

/// Returns a fully populated configuration mirroring the built-in defaults.
///
/// Unit tests mutate individual fields rather than loading layered sources,
/// which keeps them independent of the host environment.
#[must_use]
pub fn test_config() -> RunConfig {
    RunConfig {
        hcloud_bin: String::from("hcloud"),
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        rsync_bin: String::from("rsync"),
        ssh_user: String::from("root"),
        ssh_identity_file: None,
        ssh_key_name: None,
        keepalive_interval_secs: 15,
        instance_type: String::from("cpx41"),
        location: String::from("fsn1"),
        image: String::from("ubuntu-24.04"),
        cloud_init_file: String::from("cloud-init.yaml"),
        remote_project_dir: String::from("/root/project"),
        remote_env_file: String::from("/root/build-env.sh"),
        remote_log_path: String::from("/root/build.log"),
        remote_status_file: String::from("/root/build-status"),
        sync_excludes: vec![
            String::from(".git/"),
            String::from("node_modules/"),
            String::from("artifacts/"),
        ],
        env_script: Vec::new(),
        build_command: String::from(
            "eas build --platform android --profile ${PROFILE} --local --output ${OUTPUT_FILE}",
        ),
        artifact_for_profile: BTreeMap::from([
            (
                String::from("production"),
                String::from("${PROJECT_DIR}/build-${PROFILE}.aab"),
            ),
            (
                String::from("default"),
                String::from("${PROJECT_DIR}/build-output.apk"),
            ),
        ])
        .into(),
        artifact_candidates: vec![
            String::from("${PROJECT_DIR}/build-${PROFILE}.aab"),
            String::from("${PROJECT_DIR}/build-output.apk"),
            String::from("/root/build-output.apk"),
        ],
        watch_processes: vec![
            String::from("eas-cli"),
            String::from("gradle"),
            String::from("java"),
            String::from("node"),
        ],
        local_artifact_dir: String::from("artifacts"),
        token_env_var: String::from("EXPO_TOKEN"),
        monitor_interval_secs: 10,
    }
}
