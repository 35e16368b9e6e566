//! Worker node handles and launch strategies.
//!
//! A `Node` is one worker the orchestrator knows about. Local and remote
//! nodes own a child process (the worker itself, or the ssh session that
//! runs it) plus the tasks draining its output into the sandbox; foreign
//! nodes are addresses read from a descriptor and own nothing.

pub mod args;
pub mod foreign;
pub mod local;
pub mod remote;

use slog::{debug, warn, Logger};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::config::RemoteHostConfig;

/// How long terminate waits for a clean exit before killing, and how long
/// it waits for the output drains afterwards.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Where a worker process runs.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    Local,
    Remote { host: RemoteHostConfig },
    Foreign,
}

/// Everything needed to start (and later address) one worker. Immutable
/// once the process is spawned.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub node_id: usize,
    pub addr: String,
    pub port: u16,
    pub cluster_name: String,
    pub mode: LaunchMode,
    pub worker_bin: PathBuf,
    pub flatfile: PathBuf,
    /// Per-node scratch directory the worker spills to (`-ice_root`)
    pub scratch_dir: PathBuf,
    pub heap_min_mb: Option<u32>,
    pub heap_max_mb: Option<u32>,
    pub assertions: bool,
    pub credentials_path: Option<PathBuf>,
    pub extra_flags: Vec<String>,
    pub capture_output: bool,
}

/// Lifecycle phase a liveness probe runs in. During startup a refused
/// connection means "not up yet"; afterwards it means the node died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    Startup,
    Steady,
}

/// A running (or foreign) worker.
pub enum Node {
    Local {
        spec: NodeSpec,
        child: Child,
        drains: Vec<JoinHandle<()>>,
    },
    Remote {
        spec: NodeSpec,
        /// The ssh session running the worker; killing it drops the
        /// remote process with it (ssh -t allocates a tty for that).
        child: Child,
        drains: Vec<JoinHandle<()>>,
    },
    Foreign {
        spec: NodeSpec,
    },
}

impl Node {
    pub fn spec(&self) -> &NodeSpec {
        match self {
            Node::Local { spec, .. } => spec,
            Node::Remote { spec, .. } => spec,
            Node::Foreign { spec } => spec,
        }
    }

    pub fn addr(&self) -> &str {
        &self.spec().addr
    }

    pub fn port(&self) -> u16 {
        self.spec().port
    }

    /// Probe whether the worker still answers. Never errors: failure to
    /// reach the node IS the answer.
    pub async fn is_alive(&mut self, phase: LivenessPhase, logger: &Logger) -> bool {
        match self {
            Node::Local { spec, child, .. } => {
                // A local child that has exited is dead no matter what the
                // port says (another process may have grabbed it).
                match child.try_wait() {
                    Ok(Some(status)) => {
                        if phase == LivenessPhase::Steady {
                            warn!(logger, "local node exited";
                                "node_id" => spec.node_id, "status" => %status);
                        }
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        warn!(logger, "could not poll local node";
                            "node_id" => spec.node_id, "error" => %e);
                        false
                    }
                }
            }
            Node::Remote { spec, .. } | Node::Foreign { spec } => {
                let target = format!("{}:{}", spec.addr, spec.port);
                let connect = tokio::net::TcpStream::connect(&target);
                match tokio::time::timeout(Duration::from_secs(2), connect).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        match phase {
                            LivenessPhase::Startup => {
                                debug!(logger, "node not accepting connections yet";
                                    "node_id" => spec.node_id, "error" => %e);
                            }
                            LivenessPhase::Steady => {
                                warn!(logger, "node unreachable";
                                    "node_id" => spec.node_id, "target" => &target,
                                    "error" => %e);
                            }
                        }
                        false
                    }
                    Err(_) => false,
                }
            }
        }
    }

    /// Stop the worker. Best effort by design: a graceful REST shutdown
    /// should already have been issued at the cloud level, so this waits
    /// briefly for a clean exit, kills if needed, and then awaits the
    /// output drains so the sandbox logs are complete.
    pub async fn terminate(&mut self, logger: &Logger) {
        match self {
            Node::Local { spec, child, drains } | Node::Remote { spec, child, drains } => {
                let node_id = spec.node_id;
                match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(logger, "node exited"; "node_id" => node_id, "status" => %status);
                    }
                    Ok(Err(e)) => {
                        warn!(logger, "wait on node failed"; "node_id" => node_id, "error" => %e);
                    }
                    Err(_) => {
                        warn!(logger, "node did not exit in time, killing"; "node_id" => node_id);
                        if let Err(e) = child.kill().await {
                            warn!(logger, "kill failed"; "node_id" => node_id, "error" => %e);
                        }
                    }
                }
                for drain in drains.drain(..) {
                    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                        warn!(logger, "output drain did not finish"; "node_id" => node_id);
                    }
                }
            }
            Node::Foreign { spec } => {
                // Nothing to kill: the process belongs to whoever built it.
                debug!(logger, "foreign node, skipping process terminate";
                    "node_id" => spec.node_id);
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, spec) = match self {
            Node::Local { spec, .. } => ("Local", spec),
            Node::Remote { spec, .. } => ("Remote", spec),
            Node::Foreign { spec } => ("Foreign", spec),
        };
        write!(f, "Node::{}({}:{})", kind, spec.addr, spec.port)
    }
}

/// Errors from launching a worker
#[derive(Debug)]
pub enum NodeError {
    /// The worker (or ssh/scp) process could not be started
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    /// An artifact could not be staged on a remote host
    Upload { path: PathBuf, detail: String },

    /// A remote helper command (ssh/scp) exited nonzero
    RemoteCommand { command: String, detail: String },

    Io(std::io::Error),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Spawn { bin, source } => {
                write!(f, "failed to spawn {}: {}", bin.display(), source)
            }
            NodeError::Upload { path, detail } => {
                write!(f, "failed to upload {}: {}", path.display(), detail)
            }
            NodeError::RemoteCommand { command, detail } => {
                write!(f, "remote command `{}` failed: {}", command, detail)
            }
            NodeError::Io(e) => write!(f, "node io error: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e)
    }
}
