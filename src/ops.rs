//! Resource lifecycle operations against a ready cloud.
//!
//! Every mutating operation follows the same shape: check that the
//! resources it reads actually exist (a missing input is a precondition
//! failure, and no mutating call goes out), issue the POST, poll the job
//! the response carries, and hand back a typed reference to what was
//! created.

use regex::Regex;
use serde_json::Value;
use slog::{debug, info, Logger};
use std::fmt;
use std::time::Duration;

use crate::jobs::{self, Job, JobStatus};
use crate::rest::{ParamValue, RequestError, RequestOptions, RequestResult, RestClient};

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Frame,
    Model,
    Grid,
}

impl ResourceKind {
    /// Path segment and identity field for this kind.
    fn path(&self) -> &'static str {
        match self {
            ResourceKind::Frame => "frames",
            ResourceKind::Model => "models",
            ResourceKind::Grid => "grids",
        }
    }

    fn id_field(&self) -> &'static str {
        match self {
            ResourceKind::Frame => "frame_id",
            ResourceKind::Model => "model_id",
            ResourceKind::Grid => "grid_id",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Frame => write!(f, "frame"),
            ResourceKind::Model => write!(f, "model"),
            ResourceKind::Grid => write!(f, "grid"),
        }
    }
}

/// Reference to a resource a completed operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub key: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Errors from resource operations
#[derive(Debug)]
pub enum OpsError {
    Request(RequestError),

    /// An input resource the operation reads does not exist; nothing was
    /// submitted
    MissingResource { kind: ResourceKind, key: String },

    /// An algorithm name that is not a safe path fragment
    BadAlgoSelector { selector: String },

    /// The operation's job passed the deadline still running
    JobTimeout { key: String },

    /// The operation's job ended in a failure status
    JobFailed {
        key: String,
        status: JobStatus,
        exception: Option<String>,
    },

    /// A completed operation named no destination resource
    NoDestination { url: String },
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsError::Request(e) => write!(f, "{}", e),
            OpsError::MissingResource { kind, key } => {
                write!(f, "{} {} does not exist; operation not submitted", kind, key)
            }
            OpsError::BadAlgoSelector { selector } => {
                write!(f, "algorithm selector {:?} is not a valid path fragment", selector)
            }
            OpsError::JobTimeout { key } => {
                write!(f, "job {} did not finish before the deadline", key)
            }
            OpsError::JobFailed {
                key,
                status,
                exception,
            } => write!(
                f,
                "job {} ended {:?}: {}",
                key,
                status,
                exception.as_deref().unwrap_or("no exception reported")
            ),
            OpsError::NoDestination { url } => {
                write!(f, "response from {} named no destination resource", url)
            }
        }
    }
}

impl std::error::Error for OpsError {}

impl From<RequestError> for OpsError {
    fn from(e: RequestError) -> Self {
        OpsError::Request(e)
    }
}

/// Only lowercase identifiers may be spliced into a builder/grid path.
fn algo_selector() -> Regex {
    Regex::new(r"^[a-z][a-z0-9_]*$").unwrap()
}

fn check_algo(selector: &str) -> Result<(), OpsError> {
    if algo_selector().is_match(selector) {
        Ok(())
    } else {
        Err(OpsError::BadAlgoSelector {
            selector: selector.to_string(),
        })
    }
}

/// Operations client bound to one cloud's control node.
pub struct OpsClient {
    client: RestClient,
    job_timeout: Duration,
    retry_delay: Duration,
    logger: Logger,
}

impl OpsClient {
    pub fn new(client: RestClient, logger: Logger) -> Self {
        OpsClient {
            client,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            logger,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    // ---- frames ----

    pub async fn frames(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("frames", &[]).await?.json)
    }

    pub async fn frame(&self, id: &str) -> Result<Value, OpsError> {
        self.require(ResourceKind::Frame, id).await?;
        Ok(self
            .client
            .get(&format!("frames/{}", id), &[])
            .await?
            .json)
    }

    pub async fn delete_frame(&self, id: &str) -> Result<(), OpsError> {
        self.require(ResourceKind::Frame, id).await?;
        self.client.delete(&format!("frames/{}", id), &[]).await?;
        Ok(())
    }

    pub async fn delete_frames(&self) -> Result<(), OpsError> {
        self.client.delete("frames", &[]).await?;
        Ok(())
    }

    /// Make files visible to the cluster. Synchronous server-side; returns
    /// the raw key the importer assigned.
    pub async fn import_files(&self, path: &str) -> Result<ResourceRef, OpsError> {
        let params = [("path", ParamValue::Str(path.to_string()))];
        self.submit("import-files", &params, ResourceKind::Frame)
            .await
    }

    /// Two-step parse: the setup probe echoes the parser's guesses, which
    /// are then submitted back with the caller's destination.
    pub async fn parse(&self, source: &str, dest: &str) -> Result<ResourceRef, OpsError> {
        let setup = self
            .client
            .post(
                "parse-setup",
                &[(
                    "source_frames",
                    ParamValue::List(vec![ParamValue::Str(source.to_string())]),
                )],
            )
            .await?;

        let mut params = vec![
            (
                "source_frames",
                ParamValue::List(vec![ParamValue::Str(source.to_string())]),
            ),
            ("destination_frame", ParamValue::Str(dest.to_string())),
        ];
        // Echo back whichever suggestions the setup probe made.
        for field in ["parse_type", "separator", "check_header", "number_columns"] {
            if let Some(value) = setup.json.get(field) {
                let encoded = match value {
                    Value::String(s) => ParamValue::Str(s.clone()),
                    Value::Number(n) if n.is_i64() => {
                        ParamValue::Int(n.as_i64().unwrap_or_default())
                    }
                    Value::Bool(b) => ParamValue::Bool(*b),
                    _ => continue,
                };
                params.push((field, encoded));
            }
        }

        self.submit("parse", &params, ResourceKind::Frame).await
    }

    pub async fn create_frame(
        &self,
        dest: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<ResourceRef, OpsError> {
        let mut all = vec![("dest", ParamValue::Str(dest.to_string()))];
        all.extend(params.iter().cloned());
        self.submit("create-frame", &all, ResourceKind::Frame).await
    }

    pub async fn split_frame(
        &self,
        source: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<ResourceRef, OpsError> {
        self.require(ResourceKind::Frame, source).await?;
        let mut all = vec![("dataset", ParamValue::Str(source.to_string()))];
        all.extend(params.iter().cloned());
        self.submit("split-frame", &all, ResourceKind::Frame).await
    }

    // ---- models ----

    pub async fn model_builders(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("model-builders", &[]).await?.json)
    }

    pub async fn model_builder(&self, algo: &str) -> Result<Value, OpsError> {
        check_algo(algo)?;
        Ok(self
            .client
            .get(&format!("model-builders/{}", algo), &[])
            .await?
            .json)
    }

    /// Probe parameter validity without building anything. Embedded errors
    /// are the expected outcome here, so they come back in the result
    /// (`error_count`) instead of failing the call.
    pub async fn validate_model_parameters(
        &self,
        algo: &str,
        frame: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<RequestResult, OpsError> {
        check_algo(algo)?;
        self.require(ResourceKind::Frame, frame).await?;

        let mut all = vec![("training_frame", ParamValue::Str(frame.to_string()))];
        all.extend(params.iter().cloned());
        let result = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("model-builders/{}/parameters", algo),
                &all,
                RequestOptions {
                    ignore_server_error: true,
                    ..Default::default()
                },
            )
            .await?;
        debug!(self.logger, "parameter validation probe";
            "algo" => algo, "error_count" => result.error_count);
        Ok(result)
    }

    pub async fn build_model(
        &self,
        algo: &str,
        frame: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<ResourceRef, OpsError> {
        check_algo(algo)?;
        self.require(ResourceKind::Frame, frame).await?;

        let mut all = vec![("training_frame", ParamValue::Str(frame.to_string()))];
        all.extend(params.iter().cloned());
        self.submit(
            &format!("model-builders/{}", algo),
            &all,
            ResourceKind::Model,
        )
        .await
    }

    pub async fn models(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("models", &[]).await?.json)
    }

    pub async fn model(&self, id: &str) -> Result<Value, OpsError> {
        self.require(ResourceKind::Model, id).await?;
        Ok(self
            .client
            .get(&format!("models/{}", id), &[])
            .await?
            .json)
    }

    pub async fn delete_model(&self, id: &str) -> Result<(), OpsError> {
        self.require(ResourceKind::Model, id).await?;
        self.client.delete(&format!("models/{}", id), &[]).await?;
        Ok(())
    }

    pub async fn delete_models(&self) -> Result<(), OpsError> {
        self.client.delete("models", &[]).await?;
        Ok(())
    }

    // ---- grids ----

    pub async fn build_grid(
        &self,
        algo: &str,
        frame: &str,
        params: &[(&str, ParamValue)],
        hyper_params: Vec<(String, ParamValue)>,
        grid_id: &str,
    ) -> Result<ResourceRef, OpsError> {
        check_algo(algo)?;
        self.require(ResourceKind::Frame, frame).await?;

        let mut all = vec![
            ("training_frame", ParamValue::Str(frame.to_string())),
            ("grid_id", ParamValue::Str(grid_id.to_string())),
            ("hyper_parameters", ParamValue::Map(hyper_params)),
        ];
        all.extend(params.iter().cloned());
        self.submit(&format!("grid/{}", algo), &all, ResourceKind::Grid)
            .await
    }

    pub async fn grids(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("grids", &[]).await?.json)
    }

    pub async fn grid(&self, id: &str) -> Result<Value, OpsError> {
        self.require(ResourceKind::Grid, id).await?;
        Ok(self.client.get(&format!("grids/{}", id), &[]).await?.json)
    }

    // ---- metrics and predictions ----

    pub async fn model_metrics(&self, model: &str, frame: &str) -> Result<Value, OpsError> {
        self.require(ResourceKind::Model, model).await?;
        self.require(ResourceKind::Frame, frame).await?;
        Ok(self
            .client
            .get(&format!("model-metrics/{}/{}", model, frame), &[])
            .await?
            .json)
    }

    pub async fn compute_model_metrics(
        &self,
        model: &str,
        frame: &str,
    ) -> Result<Value, OpsError> {
        self.require(ResourceKind::Model, model).await?;
        self.require(ResourceKind::Frame, frame).await?;
        Ok(self
            .client
            .post(&format!("model-metrics/{}/{}", model, frame), &[])
            .await?
            .json)
    }

    pub async fn predict(
        &self,
        model: &str,
        frame: &str,
        dest: &str,
    ) -> Result<ResourceRef, OpsError> {
        self.require(ResourceKind::Model, model).await?;
        self.require(ResourceKind::Frame, frame).await?;

        let params = [("dest", ParamValue::Str(dest.to_string()))];
        self.submit(
            &format!("predictions/models/{}/frames/{}", model, frame),
            &params,
            ResourceKind::Frame,
        )
        .await
    }

    // ---- introspection ----

    pub async fn endpoints(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("endpoints", &[]).await?.json)
    }

    pub async fn schemas(&self) -> Result<Value, OpsError> {
        Ok(self.client.get("schemas", &[]).await?.json)
    }

    pub async fn schema(&self, name: &str) -> Result<Value, OpsError> {
        Ok(self
            .client
            .get(&format!("schemas/{}", name), &[])
            .await?
            .json)
    }

    // ---- the shared template ----

    /// Existence + identity precondition: a 404 or a mismatched identity
    /// field is a `MissingResource`, and the caller's mutating request is
    /// never issued.
    async fn require(&self, kind: ResourceKind, key: &str) -> Result<(), OpsError> {
        let path = format!("{}/{}", kind.path(), key);
        match self.client.get(&path, &[]).await {
            Ok(result) => {
                if let Some(found) = result.json.get(kind.id_field()).and_then(Value::as_str) {
                    if found != key {
                        return Err(OpsError::MissingResource {
                            kind,
                            key: key.to_string(),
                        });
                    }
                }
                Ok(())
            }
            Err(RequestError::Status { status: 404, .. }) => Err(OpsError::MissingResource {
                kind,
                key: key.to_string(),
            }),
            Err(e) => Err(OpsError::Request(e)),
        }
    }

    /// POST, then poll the job the response carries (if any), then resolve
    /// the destination resource.
    async fn submit(
        &self,
        path: &str,
        params: &[(&str, ParamValue)],
        kind: ResourceKind,
    ) -> Result<ResourceRef, OpsError> {
        let result = self.client.post(path, params).await?;

        let mut dest = result
            .json
            .get("dest")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(job_value) = result.json.get("job").filter(|v| !v.is_null()) {
            let job: Job =
                serde_json::from_value(job_value.clone()).map_err(|e| RequestError::Decode {
                    url: result.url.clone(),
                    detail: e.to_string(),
                })?;

            let finished = if job.status.is_terminal() {
                job
            } else {
                jobs::poll_job(
                    &self.client,
                    &job.key,
                    self.job_timeout,
                    self.retry_delay,
                    &self.logger,
                )
                .await?
                .ok_or(OpsError::JobTimeout {
                    key: job.key.clone(),
                })?
            };

            if finished.status != JobStatus::Done {
                return Err(OpsError::JobFailed {
                    key: finished.key,
                    status: finished.status,
                    exception: finished.exception,
                });
            }
            if finished.dest.is_some() {
                dest = finished.dest;
            }
        }

        let key = dest.ok_or(OpsError::NoDestination {
            url: result.url.clone(),
        })?;
        info!(self.logger, "operation complete";
            "path" => path, "kind" => %kind, "dest" => &key);
        Ok(ResourceRef { kind, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algo_selector_accepts_lowercase_identifiers() {
        for algo in ["gbm", "deeplearning", "glm", "naive_bayes", "xgboost3"] {
            assert!(check_algo(algo).is_ok(), "{}", algo);
        }
    }

    #[test]
    fn test_algo_selector_rejects_path_tricks() {
        for algo in ["", "GBM", "3gbm", "gbm/../jobs", "gbm model", "gbm?x=1", "_gbm"] {
            assert!(
                matches!(check_algo(algo), Err(OpsError::BadAlgoSelector { .. })),
                "{}",
                algo
            );
        }
    }

    #[test]
    fn test_resource_ref_display() {
        let r = ResourceRef {
            kind: ResourceKind::Model,
            key: "gbm-1".to_string(),
        };
        assert_eq!(r.to_string(), "model gbm-1");
    }

    #[test]
    fn test_kind_paths() {
        assert_eq!(ResourceKind::Frame.path(), "frames");
        assert_eq!(ResourceKind::Grid.id_field(), "grid_id");
    }
}
