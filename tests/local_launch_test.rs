//! Local launch tests using throwaway shell scripts as workers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudrunner::node::local::spawn_local;
use cloudrunner::node::{LaunchMode, LivenessPhase, NodeSpec};
use cloudrunner::{ClusterConfig, ClusterError, Sandbox};

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("local-launch-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn spec_for(dir: &Path, worker_bin: PathBuf) -> NodeSpec {
    NodeSpec {
        node_id: 0,
        addr: "127.0.0.1".to_string(),
        port: 20000,
        cluster_name: "launch-test".to_string(),
        mode: LaunchMode::Local,
        worker_bin,
        flatfile: dir.join("flatfile"),
        scratch_dir: dir.join("scratch"),
        heap_min_mb: None,
        heap_max_mb: None,
        assertions: false,
        credentials_path: None,
        extra_flags: Vec::new(),
        capture_output: true,
    }
}

#[tokio::test]
async fn test_long_running_worker_is_alive_until_terminated() {
    let dir = temp_dir();
    let logger = test_logger();
    let sandbox = Sandbox::new(dir.join("sandbox"), logger.clone()).unwrap();
    // ignores its arguments and just stays up
    let bin = write_script(&dir, "sleep 30");

    let mut node = spawn_local(spec_for(&dir, bin), &sandbox, &logger)
        .await
        .unwrap();
    assert!(node.is_alive(LivenessPhase::Startup, &logger).await);

    node.terminate(&logger).await;
    assert!(!node.is_alive(LivenessPhase::Steady, &logger).await);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_output_is_drained_into_sandbox_logs() {
    let dir = temp_dir();
    let logger = test_logger();
    let sandbox = Sandbox::new(dir.join("sandbox"), logger.clone()).unwrap();
    let bin = write_script(&dir, "echo booted; echo warming up 1>&2; exit 0");

    let mut node = spawn_local(spec_for(&dir, bin), &sandbox, &logger)
        .await
        .unwrap();
    // terminate awaits the drains, so the files are complete afterwards
    node.terminate(&logger).await;

    let (stdout_path, stderr_path) = sandbox.node_log_paths("local", 0);
    assert_eq!(std::fs::read_to_string(stdout_path).unwrap(), "booted\n");
    assert_eq!(std::fs::read_to_string(stderr_path).unwrap(), "warming up\n");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_exited_worker_reads_as_dead() {
    let dir = temp_dir();
    let logger = test_logger();
    let sandbox = Sandbox::new(dir.join("sandbox"), logger.clone()).unwrap();
    let bin = write_script(&dir, "exit 3");

    let mut node = spawn_local(spec_for(&dir, bin), &sandbox, &logger)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!node.is_alive(LivenessPhase::Steady, &logger).await);
    // terminating an already-exited node is quick and quiet
    node.terminate(&logger).await;

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_missing_worker_binary_fails_the_build_cleanly() {
    let dir = temp_dir();
    let config = ClusterConfig::local(2, dir.join("no-such-worker"))
        .with_base_port(20000)
        .with_cluster_name("launch-test")
        .with_sandbox_dir(dir.join("sandbox"))
        .with_stabilize_timeout(Duration::from_secs(1));

    let err = cloudrunner::build_cloud(&config, test_logger())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Launch(_)));

    // the flatfile was still written before the spawn attempt
    let flatfile = std::fs::read_to_string(dir.join("sandbox/flatfile")).unwrap();
    assert_eq!(flatfile, "127.0.0.1:20000\n127.0.0.1:20002\n");

    std::fs::remove_dir_all(&dir).unwrap();
}
