//! Cloud lifecycle: build, verify, use, tear down.
//!
//! `build_cloud` walks one cluster through
//! UNBUILT -> LAUNCHING -> STABILIZING -> VERIFIED -> READY and hands back
//! a `Cluster` handle owning the nodes and their clients. Any failure
//! after the first spawn terminates every started node before the error
//! propagates, so a failed build never leaves orphans behind.

pub mod stabilize;
pub mod verify;

pub use stabilize::{stabilize_cloud, wait_for_accepting_connections};
pub use verify::{verify_cloud, VerifyExpectations};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ClusterConfig, ConfigError};
use crate::flatfile;
use crate::node::foreign::{ClusterDescriptor, DescriptorNode};
use crate::node::local::spawn_local;
use crate::node::remote::spawn_remote;
use crate::node::{LaunchMode, LivenessPhase, Node, NodeError, NodeSpec};
use crate::rest::{ParamValue, RequestError, RestClient};
use crate::sandbox::{Sandbox, SandboxError};

/// Grace between the REST shutdown broadcast and force-termination.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One node's view of the cloud, from `GET /cloud`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudStatus {
    pub cloud_name: String,
    pub cloud_size: usize,
    pub consensus: bool,
    pub locked: bool,
    pub version: String,
    #[serde(default = "default_true")]
    pub cloud_healthy: bool,
    #[serde(default)]
    pub nodes: Vec<CloudMember>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMember {
    pub name: String,
    pub healthy: bool,
}

/// Where a cluster is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unbuilt,
    Launching,
    Stabilizing,
    Verified,
    Ready,
    TearingDown,
    Down,
}

/// Errors from cluster lifecycle operations
#[derive(Debug)]
pub enum ClusterError {
    Config(ConfigError),
    Launch(NodeError),
    Request(RequestError),
    Sandbox(SandboxError),

    /// The node never started answering HTTP
    ConnectTimeout { url: String, elapsed: Duration },

    /// More members than we launched: the cloud merged with leftovers of
    /// an earlier run under the same name
    OversizedCloud {
        expected: usize,
        actual: usize,
        cloud_name: String,
    },

    /// The cloud never reached the expected size with consensus
    StabilizeTimeout {
        expected: usize,
        last_size: Option<usize>,
        elapsed: Duration,
        retries: u32,
    },

    /// A node reported a version string in no recognizable format
    VersionFormat { node_id: usize, version: String },

    /// Nodes disagree about the software version
    VersionMismatch {
        node_id: usize,
        expected: String,
        found: String,
    },

    /// A node's view of the cloud identity differs from what was expected
    IdentityMismatch {
        node_id: usize,
        field: &'static str,
        expected: String,
        found: String,
    },

    /// A node reported an unhealthy member in strict-health mode
    UnhealthyNode { node_id: usize, member: String },

    Io(std::io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Config(e) => write!(f, "invalid configuration: {}", e),
            ClusterError::Launch(e) => write!(f, "node launch failed: {}", e),
            ClusterError::Request(e) => write!(f, "control request failed: {}", e),
            ClusterError::Sandbox(e) => write!(f, "{}", e),
            ClusterError::ConnectTimeout { url, elapsed } => write!(
                f,
                "node at {} never accepted connections ({}ms)",
                url,
                elapsed.as_millis()
            ),
            ClusterError::OversizedCloud {
                expected,
                actual,
                cloud_name,
            } => write!(
                f,
                "cloud {} has {} members but only {} were launched; \
                 a leftover cloud with the same name is still running",
                cloud_name, actual, expected
            ),
            ClusterError::StabilizeTimeout {
                expected,
                last_size,
                elapsed,
                retries,
            } => write!(
                f,
                "cloud never stabilized at size {} (last seen {:?}, {}ms, {} polls)",
                expected,
                last_size,
                elapsed.as_millis(),
                retries
            ),
            ClusterError::VersionFormat { node_id, version } => write!(
                f,
                "node {} reported unrecognizable version {:?}",
                node_id, version
            ),
            ClusterError::VersionMismatch {
                node_id,
                expected,
                found,
            } => write!(
                f,
                "node {} runs version {} but node 0 runs {}",
                node_id, found, expected
            ),
            ClusterError::IdentityMismatch {
                node_id,
                field,
                expected,
                found,
            } => write!(
                f,
                "node {} reports {} = {} (expected {})",
                node_id, field, found, expected
            ),
            ClusterError::UnhealthyNode { node_id, member } => {
                write!(f, "node {} reports {} unhealthy", node_id, member)
            }
            ClusterError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<ConfigError> for ClusterError {
    fn from(e: ConfigError) -> Self {
        ClusterError::Config(e)
    }
}

impl From<NodeError> for ClusterError {
    fn from(e: NodeError) -> Self {
        ClusterError::Launch(e)
    }
}

impl From<RequestError> for ClusterError {
    fn from(e: RequestError) -> Self {
        ClusterError::Request(e)
    }
}

impl From<SandboxError> for ClusterError {
    fn from(e: SandboxError) -> Self {
        ClusterError::Sandbox(e)
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e)
    }
}

/// A built (or attached) cloud: the nodes, one client per node, and the
/// identity observed at verification. Dropping the handle does NOT tear
/// the cloud down; call `teardown`.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Node>,
    clients: Vec<RestClient>,
    pub name: String,
    pub size: usize,
    pub version: String,
    pub locked: bool,
    phase: Phase,
    sandbox: Sandbox,
    delete_resources_at_teardown: bool,
    logger: Logger,
}

/// Launch every worker, wait for the cloud to form, and verify it.
pub async fn build_cloud(config: &ClusterConfig, logger: Logger) -> Result<Cluster, ClusterError> {
    config.validate()?;

    let sandbox = Sandbox::new(config.sandbox_dir.clone(), logger.clone())?;
    sandbox.clean()?;

    let flatfile_path = config.sandbox_dir.join("flatfile");
    let entries = flatfile::peer_list(config);
    flatfile::write_flatfile(&flatfile_path, &entries, config.shuffle)?;

    info!(logger, "building cloud";
        "cloud_name" => &config.cluster_name,
        "nodes" => config.total_nodes(),
        "base_port" => config.effective_base_port(),
        "remote" => !config.hosts.is_empty());

    let mut specs = node_specs(config, &flatfile_path);
    if config.shuffle {
        specs.shuffle(&mut rand::thread_rng());
    }

    let mut nodes: Vec<Node> = Vec::new();
    match launch_and_verify(config, specs, &sandbox, &logger, &mut nodes).await {
        Ok((clients, status)) => Ok(Cluster {
            nodes,
            clients,
            name: status.cloud_name,
            size: status.cloud_size,
            version: status.version,
            locked: status.locked,
            phase: Phase::Ready,
            sandbox,
            delete_resources_at_teardown: config.delete_resources_at_teardown,
            logger,
        }),
        Err(e) => {
            warn!(logger, "cloud build failed, terminating started nodes";
                "started" => nodes.len(), "error" => %e);
            for node in nodes.iter_mut() {
                node.terminate(&logger).await;
            }
            Err(e)
        }
    }
}

/// The spawn/stabilize/verify middle of `build_cloud`. Started nodes are
/// pushed into `nodes` as they come up so the caller can clean up on
/// failure.
async fn launch_and_verify(
    config: &ClusterConfig,
    specs: Vec<NodeSpec>,
    sandbox: &Sandbox,
    logger: &Logger,
    nodes: &mut Vec<Node>,
) -> Result<(Vec<RestClient>, CloudStatus), ClusterError> {
    for spec in specs {
        let node = match &spec.mode {
            LaunchMode::Local => spawn_local(spec, sandbox, logger).await?,
            LaunchMode::Remote { .. } => spawn_remote(spec, sandbox, logger).await?,
            LaunchMode::Foreign => unreachable!("build_cloud never produces foreign specs"),
        };
        nodes.push(node);
    }
    // Launch order may be shuffled; clients must line up with node ids.
    nodes.sort_by_key(|n| n.spec().node_id);

    let clients: Vec<RestClient> = nodes
        .iter()
        .map(|n| RestClient::new(n.addr(), n.port(), sandbox.clone(), logger.clone()))
        .collect();

    let expected = config.total_nodes();
    let stabilize_targets: &[RestClient] = if config.conservative {
        &clients[..]
    } else {
        &clients[..1]
    };
    for client in stabilize_targets {
        stabilize_cloud(
            client,
            expected,
            config.stabilize_timeout,
            config.retry_delay,
            logger,
        )
        .await?;
    }

    let expectations = VerifyExpectations {
        cloud_name: Some(config.cluster_name.clone()),
        cloud_size: expected,
        locked: None,
        strict_health: config.strict_health,
    };
    let status = verify_cloud(&clients, &expectations, logger).await?;

    let marker = format!("cloud {} built with {} nodes", status.cloud_name, expected);
    if let Err(e) = post_marker(&clients[0], &marker).await {
        warn!(logger, "could not write build marker"; "error" => %e);
    }

    Ok((clients, status))
}

fn node_specs(config: &ClusterConfig, flatfile_path: &Path) -> Vec<NodeSpec> {
    let ports = flatfile::port_list(config);
    let mut specs = Vec::new();

    let mut push = |node_id: usize, addr: &str, port: u16, mode: LaunchMode| {
        specs.push(NodeSpec {
            node_id,
            addr: addr.to_string(),
            port,
            cluster_name: config.cluster_name.clone(),
            mode,
            worker_bin: config.worker_bin.clone(),
            flatfile: flatfile_path.to_path_buf(),
            scratch_dir: std::env::temp_dir()
                .join(format!("{}-scratch-{}", config.cluster_name, node_id)),
            heap_min_mb: config.heap_min_mb,
            heap_max_mb: config.heap_max_mb,
            assertions: config.assertions,
            credentials_path: config.credentials_path.clone(),
            extra_flags: config.extra_flags.clone(),
            capture_output: config.capture_output,
        });
    };

    if config.hosts.is_empty() {
        for (i, port) in ports.iter().enumerate() {
            push(i, &config.bind_addr, *port, LaunchMode::Local);
        }
    } else {
        let mut node_id = 0;
        for host in &config.hosts {
            for port in &ports {
                push(
                    node_id,
                    &host.addr,
                    *port,
                    LaunchMode::Remote { host: host.clone() },
                );
                node_id += 1;
            }
        }
    }

    specs
}

async fn post_marker(client: &RestClient, message: &str) -> Result<(), RequestError> {
    client
        .post("log-echo", &[("message", ParamValue::Str(message.to_string()))])
        .await
        .map(|_| ())
}

impl Cluster {
    /// Attach to an already-running cloud described by a descriptor file.
    /// Size and version consistency are re-verified; name and lock state
    /// are not, since an existing cloud may be locked by now.
    pub async fn from_descriptor(
        path: &Path,
        sandbox_dir: impl Into<PathBuf>,
        logger: Logger,
    ) -> Result<Cluster, ClusterError> {
        let descriptor = ClusterDescriptor::read(path)?;
        let sandbox = Sandbox::new(sandbox_dir, logger.clone())?;
        let nodes = descriptor.into_nodes();

        let clients: Vec<RestClient> = nodes
            .iter()
            .map(|n| RestClient::new(n.addr(), n.port(), sandbox.clone(), logger.clone()))
            .collect();

        let expectations = VerifyExpectations {
            cloud_name: None,
            cloud_size: nodes.len(),
            locked: None,
            strict_health: false,
        };
        let status = verify_cloud(&clients, &expectations, &logger).await?;

        info!(logger, "attached to existing cloud";
            "cloud_name" => &status.cloud_name, "size" => status.cloud_size);

        Ok(Cluster {
            nodes,
            clients,
            name: status.cloud_name,
            size: status.cloud_size,
            version: status.version,
            locked: status.locked,
            phase: Phase::Ready,
            sandbox,
            delete_resources_at_teardown: false,
            logger,
        })
    }

    /// The conventional control target, node 0.
    pub fn client(&self) -> &RestClient {
        &self.clients[0]
    }

    pub fn client_for(&self, node_id: usize) -> Option<&RestClient> {
        self.clients.get(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Write a descriptor so a later run can attach to this cloud.
    pub fn create_descriptor(&self, path: &Path) -> Result<(), ClusterError> {
        let descriptor = ClusterDescriptor {
            cluster_name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| DescriptorNode {
                    addr: n.addr().to_string(),
                    port: n.port(),
                })
                .collect(),
        };
        descriptor.write(path)?;
        Ok(())
    }

    /// Liveness sweep across all nodes; returns the number still alive.
    pub async fn touch(&mut self) -> usize {
        let mut alive = 0;
        for node in self.nodes.iter_mut() {
            if node.is_alive(LivenessPhase::Steady, &self.logger).await {
                alive += 1;
            }
        }
        alive
    }

    /// Echo a marker line into the cluster logs, so sandbox output can be
    /// correlated with the run that produced it.
    pub async fn log_marker(&self, message: &str) -> Result<(), RequestError> {
        post_marker(self.client(), message).await
    }

    /// Bring the cloud down. Best effort at every step so it is safe to
    /// call on a half-broken cluster: REST failures are logged and
    /// swallowed, and only the final sandbox sweep can error.
    pub async fn teardown(&mut self) -> Result<(), ClusterError> {
        if self.phase == Phase::Down {
            return Ok(());
        }
        self.phase = Phase::TearingDown;
        info!(self.logger, "tearing down cloud"; "cloud_name" => &self.name);

        if self.delete_resources_at_teardown {
            for path in ["frames", "models"] {
                if let Err(e) = self.client().delete(path, &[]).await {
                    warn!(self.logger, "resource cleanup failed";
                        "path" => path, "error" => %e);
                }
            }
        }

        if let Err(e) = self.client().post("shutdown", &[]).await {
            warn!(self.logger, "shutdown broadcast failed"; "error" => %e);
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        for node in self.nodes.iter_mut() {
            node.terminate(&self.logger).await;
        }
        self.phase = Phase::Down;
        info!(self.logger, "cloud is down"; "cloud_name" => &self.name);

        self.sandbox.scan_for_errors().map_err(ClusterError::Sandbox)
    }
}
