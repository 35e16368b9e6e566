//! Remote launch over ssh.
//!
//! Artifacts (worker binary, flatfile, credentials) are staged under
//! content-addressed paths, so re-launching with unchanged artifacts skips
//! the copy entirely. The worker itself runs inside a spawned `ssh`
//! session whose output is drained like a local child's.

use sha2::{Digest, Sha256};
use slog::{debug, info, Logger};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::args::worker_args;
use super::local::start_drains;
use super::{LaunchMode, Node, NodeError, NodeSpec};
use crate::config::RemoteHostConfig;
use crate::sandbox::Sandbox;

/// Content-addressed staging path: `/tmp/<sha256(content)>-<name>`.
/// Identical content always lands at the identical path, which is what
/// makes the skip-if-present check sound.
pub fn artifact_dest(local: &Path) -> Result<String, NodeError> {
    let content = std::fs::read(local)?;
    let digest = Sha256::digest(&content);
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    Ok(format!("/tmp/{:x}-{}", digest, name))
}

fn ssh_options(host: &RemoteHostConfig, port_flag: &str) -> Vec<String> {
    let mut opts = vec![
        port_flag.to_string(),
        host.ssh_port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if let Some(key) = &host.ssh_key {
        opts.push("-i".to_string());
        opts.push(key.display().to_string());
    }
    opts
}

async fn run_ssh(host: &RemoteHostConfig, remote_command: &[&str]) -> Result<bool, NodeError> {
    let mut command = Command::new("ssh");
    command
        .args(ssh_options(host, "-p"))
        .arg(host.destination())
        .args(remote_command)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let status = command.status().await.map_err(|source| NodeError::Spawn {
        bin: PathBuf::from("ssh"),
        source,
    })?;
    Ok(status.success())
}

async fn remote_file_exists(host: &RemoteHostConfig, path: &str) -> Result<bool, NodeError> {
    run_ssh(host, &["test", "-f", path]).await
}

/// Stage one file on `host`, skipping the copy when the content-addressed
/// destination already exists. Returns the remote path.
pub async fn upload_artifact(
    host: &RemoteHostConfig,
    local: &Path,
    executable: bool,
    logger: &Logger,
) -> Result<String, NodeError> {
    let dest = artifact_dest(local)?;

    if remote_file_exists(host, &dest).await? {
        debug!(logger, "artifact already staged";
            "host" => &host.addr, "dest" => &dest);
        return Ok(dest);
    }

    info!(logger, "uploading artifact";
        "host" => &host.addr, "local" => %local.display(), "dest" => &dest);

    let mut command = Command::new("scp");
    command
        .args(ssh_options(host, "-P"))
        .arg(local)
        .arg(format!("{}:{}", host.destination(), dest))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let status = command.status().await.map_err(|source| NodeError::Spawn {
        bin: PathBuf::from("scp"),
        source,
    })?;
    if !status.success() {
        return Err(NodeError::Upload {
            path: local.to_path_buf(),
            detail: format!("scp to {} exited with {}", host.destination(), status),
        });
    }

    if executable && !run_ssh(host, &["chmod", "+x", &dest]).await? {
        return Err(NodeError::RemoteCommand {
            command: format!("chmod +x {}", dest),
            detail: "exited nonzero".to_string(),
        });
    }

    Ok(dest)
}

/// Spawn one worker on the remote host named in `spec.mode`. Artifacts are
/// staged first and the launch paths are rewritten to their remote
/// locations before the command line is assembled.
pub async fn spawn_remote(
    spec: NodeSpec,
    sandbox: &Sandbox,
    logger: &Logger,
) -> Result<Node, NodeError> {
    let host = match &spec.mode {
        LaunchMode::Remote { host } => host.clone(),
        _ => {
            return Err(NodeError::RemoteCommand {
                command: "spawn_remote".to_string(),
                detail: "spec is not a remote launch".to_string(),
            })
        }
    };

    let remote_bin = upload_artifact(&host, &spec.worker_bin, true, logger).await?;
    let remote_flatfile = upload_artifact(&host, &spec.flatfile, false, logger).await?;
    let remote_credentials = match &spec.credentials_path {
        Some(path) => Some(upload_artifact(&host, path, false, logger).await?),
        None => None,
    };

    let mut remote_spec = spec.clone();
    remote_spec.worker_bin = PathBuf::from(&remote_bin);
    remote_spec.flatfile = PathBuf::from(&remote_flatfile);
    remote_spec.credentials_path = remote_credentials.map(PathBuf::from);
    remote_spec.scratch_dir =
        PathBuf::from(format!("/tmp/{}-scratch-{}", spec.cluster_name, spec.node_id));

    if !run_ssh(&host, &["mkdir", "-p", &remote_spec.scratch_dir.display().to_string()]).await? {
        return Err(NodeError::RemoteCommand {
            command: format!("mkdir -p {}", remote_spec.scratch_dir.display()),
            detail: "exited nonzero".to_string(),
        });
    }

    let args = worker_args(&remote_spec);
    info!(logger, "spawning remote node";
        "node_id" => spec.node_id,
        "host" => &host.addr,
        "port" => spec.port);

    // -t so the remote worker dies with the ssh session.
    let mut command = Command::new("ssh");
    command
        .args(ssh_options(&host, "-p"))
        .arg("-t")
        .arg(host.destination())
        .arg(&remote_bin)
        .args(&args)
        .kill_on_drop(true);

    if spec.capture_output {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    let mut child = command.spawn().map_err(|source| NodeError::Spawn {
        bin: PathBuf::from("ssh"),
        source,
    })?;

    let drains = if spec.capture_output {
        let (stdout_path, stderr_path) = sandbox.node_log_paths("remote", spec.node_id);
        start_drains(&mut child, &stdout_path, &stderr_path, spec.node_id, logger).await?
    } else {
        Vec::new()
    };

    Ok(Node::Remote { spec, child, drains })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_dest_is_content_addressed() {
        let dir = std::env::temp_dir().join(format!("artifact-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let a = dir.join("worker");
        let b = dir.join("other-name");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let dest_a = artifact_dest(&a).unwrap();
        let dest_b = artifact_dest(&b).unwrap();
        assert!(dest_a.starts_with("/tmp/"));
        assert!(dest_a.ends_with("-worker"));
        // same digest prefix, different name suffix
        assert_eq!(
            dest_a.trim_end_matches("worker"),
            dest_b.trim_end_matches("other-name")
        );

        std::fs::write(&a, b"different bytes").unwrap();
        assert_ne!(artifact_dest(&a).unwrap(), dest_a);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_ssh_options_include_key_when_set() {
        let mut host = RemoteHostConfig::new("10.0.0.1", "u");
        assert!(!ssh_options(&host, "-p").contains(&"-i".to_string()));
        host.ssh_key = Some(PathBuf::from("/home/u/.ssh/id_ed25519"));
        let opts = ssh_options(&host, "-p");
        let i = opts.iter().position(|o| o == "-i").unwrap();
        assert_eq!(opts[i + 1], "/home/u/.ssh/id_ed25519");
    }
}
