//! Cloudrunner: bootstrap a cloud of worker processes and drive it over
//! its REST control plane.
//!
//! The flow is: describe the cloud with a [`config::ClusterConfig`],
//! build it with [`cloud::build_cloud`] (launch, stabilize, verify), run
//! resource operations through [`ops::OpsClient`], and finally
//! [`cloud::Cluster::teardown`]. Everything a run produces on disk lands
//! in the [`sandbox::Sandbox`]: per-node logs, the command log, and the
//! scan markers.

pub mod cloud;
pub mod config;
pub mod flatfile;
pub mod jobs;
pub mod node;
pub mod ops;
pub mod rest;
pub mod retry;
pub mod sandbox;

pub use cloud::{build_cloud, Cluster, ClusterError, Phase};
pub use config::{ClusterConfig, ConfigError, RemoteHostConfig};
pub use jobs::{poll_job, Job, JobStatus};
pub use ops::{OpsClient, OpsError, ResourceKind, ResourceRef};
pub use rest::{ParamValue, RequestError, RestClient};
pub use sandbox::{Sandbox, SandboxError};
