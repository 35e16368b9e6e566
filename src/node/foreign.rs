//! Foreign clusters: workers someone else started.
//!
//! A descriptor file written at build time lets a later run attach to the
//! same cloud without owning any processes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{LaunchMode, Node, NodeError, NodeSpec};

/// On-disk description of an already-running cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub cluster_name: String,
    pub nodes: Vec<DescriptorNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorNode {
    pub addr: String,
    pub port: u16,
}

impl ClusterDescriptor {
    pub fn read(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)?;
        let descriptor: ClusterDescriptor =
            serde_json::from_str(&content).map_err(|e| NodeError::Upload {
                path: path.to_path_buf(),
                detail: format!("descriptor parse failed: {}", e),
            })?;
        // A cloud with no nodes cannot be attached to.
        if descriptor.nodes.is_empty() {
            return Err(NodeError::Upload {
                path: path.to_path_buf(),
                detail: "descriptor names no nodes".to_string(),
            });
        }
        Ok(descriptor)
    }

    pub fn write(&self, path: &Path) -> Result<(), NodeError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| NodeError::Upload {
            path: path.to_path_buf(),
            detail: format!("descriptor encode failed: {}", e),
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Turn the descriptor into foreign node handles, in file order.
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
            .into_iter()
            .enumerate()
            .map(|(node_id, n)| {
                let spec = NodeSpec {
                    node_id,
                    addr: n.addr,
                    port: n.port,
                    cluster_name: self.cluster_name.clone(),
                    mode: LaunchMode::Foreign,
                    worker_bin: PathBuf::new(),
                    flatfile: PathBuf::new(),
                    scratch_dir: PathBuf::new(),
                    heap_min_mb: None,
                    heap_max_mb: None,
                    assertions: false,
                    credentials_path: None,
                    extra_flags: Vec::new(),
                    capture_output: false,
                };
                Node::Foreign { spec }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip() {
        let dir = std::env::temp_dir().join(format!("descriptor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cloud.json");

        let descriptor = ClusterDescriptor {
            cluster_name: "shared-cloud".to_string(),
            nodes: vec![
                DescriptorNode {
                    addr: "10.0.0.1".to_string(),
                    port: 54321,
                },
                DescriptorNode {
                    addr: "10.0.0.2".to_string(),
                    port: 54321,
                },
            ],
        };
        descriptor.write(&path).unwrap();

        let read = ClusterDescriptor::read(&path).unwrap();
        assert_eq!(read.cluster_name, "shared-cloud");
        assert_eq!(read.nodes.len(), 2);
        assert_eq!(read.nodes[1].addr, "10.0.0.2");

        let nodes = read.into_nodes();
        assert_eq!(nodes[0].spec().node_id, 0);
        assert_eq!(nodes[1].port(), 54321);
        assert!(matches!(nodes[0], Node::Foreign { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_descriptor_read_rejects_empty_node_list() {
        let dir = std::env::temp_dir().join(format!("descriptor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cloud.json");
        std::fs::write(&path, r#"{"cluster_name":"x","nodes":[]}"#).unwrap();
        match ClusterDescriptor::read(&path) {
            Err(NodeError::Upload { detail, .. }) => assert!(detail.contains("no nodes")),
            other => panic!("expected empty descriptor to be rejected, got {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_descriptor_read_rejects_bad_json() {
        let dir = std::env::temp_dir().join(format!("descriptor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cloud.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(ClusterDescriptor::read(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
