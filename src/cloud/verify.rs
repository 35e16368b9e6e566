//! Post-stabilization verification: every node must tell the same story.

use regex::Regex;
use slog::{info, warn, Logger};

use super::{CloudStatus, ClusterError};
use crate::rest::{RequestOptions, RestClient};

/// What the verified cloud is expected to look like. `None` fields are
/// not checked (attaching to an existing cloud cannot assume its name or
/// lock state).
#[derive(Debug, Clone, Default)]
pub struct VerifyExpectations {
    pub cloud_name: Option<String>,
    pub cloud_size: usize,
    pub locked: Option<bool>,
    /// Raise instead of warn on an unhealthy node report
    pub strict_health: bool,
}

/// A version string we can trust starts `major.minor`; anything else means
/// we are talking to something that is not a worker.
fn version_format() -> Regex {
    Regex::new(r"^\d+\.\d+").unwrap()
}

/// Ask every node for its view of the cloud and cross-check identity:
/// same version (in a recognizable format), same name, same size, same
/// lock state. Returns node 0's status on success. The caller owns
/// teardown on failure.
pub async fn verify_cloud(
    clients: &[RestClient],
    expectations: &VerifyExpectations,
    logger: &Logger,
) -> Result<CloudStatus, ClusterError> {
    let version_re = version_format();
    let mut reference: Option<CloudStatus> = None;

    for (node_id, client) in clients.iter().enumerate() {
        let status = super::stabilize::fetch_cloud_status(client, RequestOptions::default())
            .await
            .map_err(ClusterError::Request)?;

        if !version_re.is_match(&status.version) {
            return Err(ClusterError::VersionFormat {
                node_id,
                version: status.version,
            });
        }

        if let Some(reference) = &reference {
            if status.version != reference.version {
                return Err(ClusterError::VersionMismatch {
                    node_id,
                    expected: reference.version.clone(),
                    found: status.version,
                });
            }
        }

        if status.cloud_size != expectations.cloud_size {
            return Err(ClusterError::IdentityMismatch {
                node_id,
                field: "cloud_size",
                expected: expectations.cloud_size.to_string(),
                found: status.cloud_size.to_string(),
            });
        }
        if let Some(name) = &expectations.cloud_name {
            if &status.cloud_name != name {
                return Err(ClusterError::IdentityMismatch {
                    node_id,
                    field: "cloud_name",
                    expected: name.clone(),
                    found: status.cloud_name,
                });
            }
        }
        if let Some(locked) = expectations.locked {
            if status.locked != locked {
                return Err(ClusterError::IdentityMismatch {
                    node_id,
                    field: "locked",
                    expected: locked.to_string(),
                    found: status.locked.to_string(),
                });
            }
        }

        for member in &status.nodes {
            if !member.healthy {
                if expectations.strict_health {
                    return Err(ClusterError::UnhealthyNode {
                        node_id,
                        member: member.name.clone(),
                    });
                }
                warn!(logger, "node reports unhealthy peer";
                    "node_id" => node_id, "member" => &member.name);
            }
        }
        if !status.cloud_healthy {
            if expectations.strict_health {
                return Err(ClusterError::UnhealthyNode {
                    node_id,
                    member: "cloud".to_string(),
                });
            }
            warn!(logger, "node reports unhealthy cloud"; "node_id" => node_id);
        }

        if reference.is_none() {
            reference = Some(status);
        }
    }

    let status = reference.expect("verify_cloud called with no clients");
    info!(logger, "cloud verified";
        "cloud_name" => &status.cloud_name,
        "size" => status.cloud_size,
        "version" => &status.version,
        "nodes_checked" => clients.len());
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format_accepts_major_minor() {
        let re = version_format();
        assert!(re.is_match("3.46.0.1"));
        assert!(re.is_match("0.1"));
        assert!(re.is_match("10.2-snapshot"));
    }

    #[test]
    fn test_version_format_rejects_garbage() {
        let re = version_format();
        assert!(!re.is_match("unknown"));
        assert!(!re.is_match("v3.46"));
        assert!(!re.is_match(""));
        assert!(!re.is_match("3"));
    }
}
