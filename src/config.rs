//! Configuration for building a worker cloud

use std::path::PathBuf;
use std::time::Duration;

/// Description of a host that workers can be launched on over ssh.
#[derive(Debug, Clone)]
pub struct RemoteHostConfig {
    /// Address to ssh to and to bind workers on (e.g., "192.168.1.20")
    pub addr: String,

    /// Login user on the remote host
    pub user: String,

    /// ssh port (default 22)
    pub ssh_port: u16,

    /// Optional identity file passed as `ssh -i`
    pub ssh_key: Option<PathBuf>,
}

impl RemoteHostConfig {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            ssh_port: 22,
            ssh_key: None,
        }
    }

    /// The `user@addr` ssh destination string.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.addr)
    }
}

/// Configuration for building one cloud of worker processes.
///
/// `node_count` is the number of workers per host when `hosts` is set,
/// otherwise the total number of local workers.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of worker processes (per host, if remote hosts are given)
    pub node_count: usize,

    /// First port assigned; each node reserves two consecutive ports
    pub base_port: u16,

    /// Deterministic shift added to base_port so multiple orchestrators can
    /// share hosts without port collisions
    pub port_offset: u16,

    /// Address local workers bind and are addressed on
    pub bind_addr: String,

    /// Cloud name every worker joins under
    pub cluster_name: String,

    /// Path to the worker binary (local path; uploaded for remote launch)
    pub worker_bin: PathBuf,

    /// Worker heap floor in MB, if set
    pub heap_min_mb: Option<u32>,

    /// Worker heap ceiling in MB, if set
    pub heap_max_mb: Option<u32>,

    /// Extra flags appended verbatim to the worker command line
    pub extra_flags: Vec<String>,

    /// Opaque credential file handed to every worker
    pub credentials_path: Option<PathBuf>,

    /// Run workers with assertions enabled
    pub assertions: bool,

    /// Capture worker stdout/stderr into per-node sandbox log files
    pub capture_output: bool,

    /// Shuffle the peer list and the launch order (join-order variation)
    pub shuffle: bool,

    /// Stabilize against every node, not just the designated one
    pub conservative: bool,

    /// Raise (instead of warn) when a node reports an unhealthy peer
    pub strict_health: bool,

    /// Issue best-effort delete-all-resources calls before shutdown
    pub delete_resources_at_teardown: bool,

    /// How long to wait for the cloud to reach the expected size
    pub stabilize_timeout: Duration,

    /// Delay between stabilization / liveness polls
    pub retry_delay: Duration,

    /// Directory for node logs, the command log and scan markers
    pub sandbox_dir: PathBuf,

    /// Remote hosts; empty means local launch
    pub hosts: Vec<RemoteHostConfig>,
}

impl ClusterConfig {
    /// Create a configuration for a local cloud of `node_count` workers.
    pub fn local(node_count: usize, worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            node_count,
            base_port: 54321,
            port_offset: 0,
            bind_addr: "127.0.0.1".to_string(),
            cluster_name: default_cluster_name(),
            worker_bin: worker_bin.into(),
            heap_min_mb: None,
            heap_max_mb: None,
            extra_flags: Vec::new(),
            credentials_path: None,
            assertions: true,
            capture_output: true,
            shuffle: false,
            conservative: false,
            strict_health: false,
            delete_resources_at_teardown: false,
            stabilize_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(250),
            sandbox_dir: PathBuf::from("sandbox"),
            hosts: Vec::new(),
        }
    }

    /// Create a configuration launching `node_count` workers on each host.
    pub fn remote(
        node_count: usize,
        worker_bin: impl Into<PathBuf>,
        hosts: Vec<RemoteHostConfig>,
    ) -> Self {
        let mut config = Self::local(node_count, worker_bin);
        config.hosts = hosts;
        config
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn with_port_offset(mut self, port_offset: u16) -> Self {
        self.port_offset = port_offset;
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_heap_mb(mut self, min_mb: u32, max_mb: u32) -> Self {
        self.heap_min_mb = Some(min_mb);
        self.heap_max_mb = Some(max_mb);
        self
    }

    pub fn with_extra_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    pub fn with_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_conservative(mut self, conservative: bool) -> Self {
        self.conservative = conservative;
        self
    }

    pub fn with_stabilize_timeout(mut self, timeout: Duration) -> Self {
        self.stabilize_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_sandbox_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sandbox_dir = dir.into();
        self
    }

    /// Total number of workers across all hosts.
    pub fn total_nodes(&self) -> usize {
        if self.hosts.is_empty() {
            self.node_count
        } else {
            self.node_count * self.hosts.len()
        }
    }

    /// The effective first port after the offset shift.
    pub fn effective_base_port(&self) -> u16 {
        self.base_port + self.port_offset
    }

    /// Check bounds before any process is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::NoNodes);
        }
        // Two consecutive ports per node; a gap of at least 8 between offset
        // steps keeps parallel runs apart.
        if self.port_offset != 0 && (self.port_offset < 8 || self.port_offset > 500) {
            return Err(ConfigError::PortOffsetOutOfRange {
                offset: self.port_offset,
            });
        }
        if self.base_port < 1024 {
            return Err(ConfigError::BasePortOutOfRange {
                port: self.base_port,
            });
        }
        // Last port used: base + offset + 2*node_count - 1. Checked in u64
        // so the validation itself cannot overflow.
        let last_port = self.base_port as u64
            + self.port_offset as u64
            + 2 * self.node_count as u64
            - 1;
        if last_port > u16::MAX as u64 {
            return Err(ConfigError::PortSpanOverflow {
                base_port: self.base_port,
                port_offset: self.port_offset,
                node_count: self.node_count,
            });
        }
        for heap in [self.heap_min_mb, self.heap_max_mb].into_iter().flatten() {
            if heap < 1 || heap > 262_144 {
                return Err(ConfigError::HeapOutOfRange { mb: heap });
            }
        }
        if let (Some(min), Some(max)) = (self.heap_min_mb, self.heap_max_mb) {
            if min > max {
                return Err(ConfigError::HeapMinAboveMax { min, max });
            }
        }
        Ok(())
    }
}

/// Default cloud name, unique per user and process.
pub fn default_cluster_name() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("cloudrunner-{}-{}", user, std::process::id())
}

/// Errors from configuration validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// node_count was zero
    NoNodes,

    /// Port offset outside the 8..=500 window
    PortOffsetOutOfRange { offset: u16 },

    /// Base port in the privileged range
    BasePortOutOfRange { port: u16 },

    /// Two ports per node starting at base + offset runs past 65535
    PortSpanOverflow {
        base_port: u16,
        port_offset: u16,
        node_count: usize,
    },

    /// Heap size outside 1..=262144 MB
    HeapOutOfRange { mb: u32 },

    /// Heap floor above heap ceiling
    HeapMinAboveMax { min: u32, max: u32 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoNodes => write!(f, "node_count must be at least 1"),
            ConfigError::PortOffsetOutOfRange { offset } => {
                write!(f, "port_offset {} should be 0 or between 8 and 500", offset)
            }
            ConfigError::BasePortOutOfRange { port } => {
                write!(f, "base_port {} is below 1024", port)
            }
            ConfigError::PortSpanOverflow {
                base_port,
                port_offset,
                node_count,
            } => write!(
                f,
                "{} nodes at two ports each starting from {} + offset {} run past port 65535",
                node_count, base_port, port_offset
            ),
            ConfigError::HeapOutOfRange { mb } => {
                write!(f, "heap size {} MB outside 1..=262144", mb)
            }
            ConfigError::HeapMinAboveMax { min, max } => {
                write!(f, "heap_min_mb {} above heap_max_mb {}", min, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_defaults() {
        let config = ClusterConfig::local(3, "worker");
        assert_eq!(config.node_count, 3);
        assert_eq!(config.base_port, 54321);
        assert_eq!(config.total_nodes(), 3);
        assert!(config.assertions);
        assert!(!config.shuffle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_total_nodes_is_per_host() {
        let hosts = vec![
            RemoteHostConfig::new("10.0.0.1", "node"),
            RemoteHostConfig::new("10.0.0.2", "node"),
        ];
        let config = ClusterConfig::remote(3, "worker", hosts);
        assert_eq!(config.total_nodes(), 6);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let config = ClusterConfig::local(0, "worker");
        assert_eq!(config.validate(), Err(ConfigError::NoNodes));
    }

    #[test]
    fn test_port_offset_bounds() {
        let config = ClusterConfig::local(1, "worker").with_port_offset(4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortOffsetOutOfRange { offset: 4 })
        ));

        let config = ClusterConfig::local(1, "worker").with_port_offset(16);
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_base_port(), 54337);
    }

    #[test]
    fn test_port_span_must_stay_within_u16() {
        // 10000 nodes from the default base port would wrap past 65535
        let config = ClusterConfig::local(10000, "worker");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortSpanOverflow {
                base_port: 54321,
                node_count: 10000,
                ..
            })
        ));

        // last port exactly 65534: fits
        let config = ClusterConfig::local(5607, "worker");
        assert!(config.validate().is_ok());
        // one more node would need port 65536
        let config = ClusterConfig::local(5608, "worker");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortSpanOverflow { .. })
        ));

        // the offset counts against the span too
        let config = ClusterConfig::local(5607, "worker").with_port_offset(8);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortSpanOverflow { .. })
        ));
    }

    #[test]
    fn test_heap_bounds() {
        let config = ClusterConfig::local(1, "worker").with_heap_mb(0, 1024);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeapOutOfRange { mb: 0 })
        ));

        let config = ClusterConfig::local(1, "worker").with_heap_mb(2048, 1024);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeapMinAboveMax { .. })
        ));
    }

    #[test]
    fn test_default_cluster_name_unique_per_process() {
        let name = default_cluster_name();
        assert!(name.starts_with("cloudrunner-"));
        assert!(name.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_remote_host_destination() {
        let host = RemoteHostConfig::new("192.168.1.20", "deploy");
        assert_eq!(host.destination(), "deploy@192.168.1.20");
    }
}
