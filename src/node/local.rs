//! Local launch: one worker child per node, output drained into the
//! sandbox.

use slog::{info, warn, Logger};
use std::process::Stdio;
use std::path::Path;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::args::worker_args;
use super::{Node, NodeError, NodeSpec};
use crate::sandbox::Sandbox;

/// Spawn one local worker. The flatfile must already be on disk.
pub async fn spawn_local(
    spec: NodeSpec,
    sandbox: &Sandbox,
    logger: &Logger,
) -> Result<Node, NodeError> {
    std::fs::create_dir_all(&spec.scratch_dir)?;

    let args = worker_args(&spec);
    info!(logger, "spawning local node";
        "node_id" => spec.node_id,
        "port" => spec.port,
        "bin" => %spec.worker_bin.display());

    let mut command = Command::new(&spec.worker_bin);
    command.args(&args).kill_on_drop(true);

    if spec.capture_output {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    let mut child = command.spawn().map_err(|source| NodeError::Spawn {
        bin: spec.worker_bin.clone(),
        source,
    })?;

    let drains = if spec.capture_output {
        let (stdout_path, stderr_path) = sandbox.node_log_paths("local", spec.node_id);
        start_drains(&mut child, &stdout_path, &stderr_path, spec.node_id, logger).await?
    } else {
        Vec::new()
    };

    Ok(Node::Local { spec, child, drains })
}

/// Copy the child's stdout/stderr into log files until EOF. The handles
/// are awaited at terminate so the files are complete before the node is
/// declared down. A failed copy is reported: a truncated log would let a
/// later sandbox scan call a crashed node clean.
pub(super) async fn start_drains(
    child: &mut Child,
    stdout_path: &Path,
    stderr_path: &Path,
    node_id: usize,
    logger: &Logger,
) -> Result<Vec<JoinHandle<()>>, NodeError> {
    let mut drains = Vec::new();

    if let Some(mut stdout) = child.stdout.take() {
        let mut file = tokio::fs::File::create(stdout_path).await?;
        let logger = logger.clone();
        drains.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdout, &mut file).await {
                warn!(logger, "stdout drain failed, log may be incomplete";
                    "node_id" => node_id, "error" => %e);
            }
        }));
    }
    if let Some(mut stderr) = child.stderr.take() {
        let mut file = tokio::fs::File::create(stderr_path).await?;
        let logger = logger.clone();
        drains.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stderr, &mut file).await {
                warn!(logger, "stderr drain failed, log may be incomplete";
                    "node_id" => node_id, "error" => %e);
            }
        }));
    }

    Ok(drains)
}
