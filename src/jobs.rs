//! Asynchronous job tracking.
//!
//! Long-running server work returns a job key; `poll_job` watches it until
//! a terminal status or the deadline. Timing out is NOT an error: the job
//! may well still finish server-side, so the caller gets `None` and
//! decides what that means.

use serde::{Deserialize, Serialize};
use slog::{debug, warn, Logger};
use std::time::Duration;

use crate::rest::{RequestError, RestClient};
use crate::retry::{retry_until, RetryOutcome};
use crate::sandbox::SandboxError;

/// How often (in retries) the sandbox is swept during a poll, so a slow
/// job cannot mask a crashed node.
const SCAN_EVERY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Running,
    Done,
    Cancelled,
    Failed,
}

impl JobStatus {
    /// Terminal statuses never change again; the server only moves a job
    /// RUNNING -> one of these.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    pub status: JobStatus,
    #[serde(default)]
    pub dest: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub exception: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobList {
    jobs: Vec<Job>,
}

/// Fetch one job's current state.
pub async fn fetch_job(client: &RestClient, key: &str) -> Result<Job, RequestError> {
    let result = client.get(&format!("jobs/{}", key), &[]).await?;
    serde_json::from_value(result.json).map_err(|e| RequestError::Decode {
        url: result.url,
        detail: e.to_string(),
    })
}

/// List every job the cluster knows about.
pub async fn list_jobs(client: &RestClient) -> Result<Vec<Job>, RequestError> {
    let result = client.get("jobs", &[]).await?;
    let list: JobList = serde_json::from_value(result.json).map_err(|e| RequestError::Decode {
        url: result.url,
        detail: e.to_string(),
    })?;
    Ok(list.jobs)
}

/// Poll `key` until it reaches a terminal status or `timeout` elapses.
///
/// Terminal within the deadline returns the full payload, whatever the
/// status: a FAILED job is an answer, not a polling error. `None` means
/// the deadline passed with the job still running.
pub async fn poll_job(
    client: &RestClient,
    key: &str,
    timeout: Duration,
    retry_delay: Duration,
    logger: &Logger,
) -> Result<Option<Job>, RequestError> {
    let outcome = retry_until(
        |retries| async move {
            if retries > 0 && retries % SCAN_EVERY == 0 {
                if let Err(e @ SandboxError::FatalLines { .. }) =
                    client.sandbox().scan_for_errors()
                {
                    return Some(Err(RequestError::FatalLogLines(e)));
                }
            }
            match fetch_job(client, key).await {
                Ok(job) if job.status.is_terminal() => Some(Ok(job)),
                Ok(job) => {
                    debug!(logger, "job still running";
                        "key" => key, "progress" => job.progress);
                    None
                }
                Err(e) => Some(Err(e)),
            }
        },
        retry_delay,
        timeout,
    )
    .await;

    match outcome {
        RetryOutcome::Complete(Ok(job)) => {
            debug!(logger, "job reached terminal status";
                "key" => key, "status" => format!("{:?}", job.status));
            Ok(Some(job))
        }
        RetryOutcome::Complete(Err(e)) => Err(e),
        RetryOutcome::TimedOut { elapsed, retries } => {
            warn!(logger, "job poll timed out, job may still be running";
                "key" => key, "elapsed_ms" => elapsed.as_millis() as u64,
                "retries" => retries);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_payload_decodes() {
        let job: Job = serde_json::from_value(json!({
            "key": "job-17",
            "status": "DONE",
            "dest": "frame-17",
            "progress": 1.0,
            "exception": null
        }))
        .unwrap();
        assert_eq!(job.key, "job-17");
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.dest.as_deref(), Some("frame-17"));
    }

    #[test]
    fn test_job_payload_optional_fields_default() {
        let job: Job = serde_json::from_value(json!({
            "key": "job-3",
            "status": "RUNNING"
        }))
        .unwrap();
        assert!(job.dest.is_none());
        assert!(job.progress.is_none());
        assert!(job.exception.is_none());
    }
}
