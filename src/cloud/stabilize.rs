//! Cloud stabilization: wait until the workers have found each other.

use serde_json::Value;
use slog::{debug, info, Logger};
use std::cell::Cell;
use std::time::Duration;

use super::{CloudStatus, ClusterError};
use crate::rest::{RequestError, RequestOptions, RestClient};
use crate::retry::{retry_until, RetryOutcome};
use crate::sandbox::SandboxError;

/// Sweep the sandbox every this many stabilization polls.
const SCAN_EVERY: u32 = 50;

pub(super) async fn fetch_cloud_status(
    client: &RestClient,
    opts: RequestOptions,
) -> Result<CloudStatus, RequestError> {
    let result = client
        .request(reqwest::Method::GET, "cloud", &[], opts)
        .await?;
    decode_cloud_status(result.json, &result.url)
}

pub(super) fn decode_cloud_status(json: Value, url: &str) -> Result<CloudStatus, RequestError> {
    serde_json::from_value(json).map_err(|e| RequestError::Decode {
        url: url.to_string(),
        detail: e.to_string(),
    })
}

/// Wait until the node answers HTTP at all. A refused connection just means
/// the process is still booting, so transport failures are retried without
/// the usual sandbox sweep; any real response, including a rejection,
/// ends the wait.
pub async fn wait_for_accepting_connections(
    client: &RestClient,
    timeout: Duration,
    retry_delay: Duration,
    logger: &Logger,
) -> Result<(), ClusterError> {
    let opts = RequestOptions {
        skip_fault_scan: true,
        ..Default::default()
    };

    let outcome = retry_until(
        |retries| async move {
            match fetch_cloud_status(client, opts).await {
                Ok(_) => Some(Ok(())),
                Err(RequestError::Transport { .. }) => {
                    if retries % 10 == 0 {
                        debug!(logger, "node not answering yet";
                            "url" => client.base_url(), "retries" => retries);
                    }
                    None
                }
                // The node answered; a malformed or rejected response is a
                // real problem, not a boot delay.
                Err(e) => Some(Err(e)),
            }
        },
        retry_delay,
        timeout,
    )
    .await;

    match outcome {
        RetryOutcome::Complete(Ok(())) => Ok(()),
        RetryOutcome::Complete(Err(e)) => Err(ClusterError::Request(e)),
        RetryOutcome::TimedOut { elapsed, .. } => Err(ClusterError::ConnectTimeout {
            url: client.base_url().to_string(),
            elapsed,
        }),
    }
}

/// Poll one node until it reports the expected cloud size with consensus.
///
/// A node reporting MORE members than we launched means it merged with
/// leftovers of an earlier cloud under the same name. That never heals by
/// waiting, so it fails immediately instead of burning the whole timeout.
pub async fn stabilize_cloud(
    client: &RestClient,
    expected_size: usize,
    timeout: Duration,
    retry_delay: Duration,
    logger: &Logger,
) -> Result<CloudStatus, ClusterError> {
    wait_for_accepting_connections(client, timeout, retry_delay, logger).await?;

    let last_size: Cell<Option<usize>> = Cell::new(None);
    let last_size_ref = &last_size;

    let outcome = retry_until(
        |retries| async move {
            if retries > 0 && retries % SCAN_EVERY == 0 {
                if let Err(e @ SandboxError::FatalLines { .. }) =
                    client.sandbox().scan_for_errors()
                {
                    return Some(Err(ClusterError::Sandbox(e)));
                }
            }

            let status = match fetch_cloud_status(client, RequestOptions::default()).await {
                Ok(s) => s,
                Err(e) => return Some(Err(ClusterError::Request(e))),
            };
            last_size_ref.set(Some(status.cloud_size));

            if status.cloud_size > expected_size {
                return Some(Err(ClusterError::OversizedCloud {
                    expected: expected_size,
                    actual: status.cloud_size,
                    cloud_name: status.cloud_name,
                }));
            }
            if status.cloud_size == expected_size && status.consensus {
                return Some(Ok(status));
            }

            debug!(logger, "cloud still forming";
                "size" => status.cloud_size,
                "expected" => expected_size,
                "consensus" => status.consensus);
            None
        },
        retry_delay,
        timeout,
    )
    .await;

    match outcome {
        RetryOutcome::Complete(Ok(status)) => {
            info!(logger, "cloud stabilized";
                "cloud_name" => &status.cloud_name,
                "size" => status.cloud_size,
                "version" => &status.version);
            Ok(status)
        }
        RetryOutcome::Complete(Err(e)) => Err(e),
        RetryOutcome::TimedOut { elapsed, retries } => Err(ClusterError::StabilizeTimeout {
            expected: expected_size,
            last_size: last_size.get(),
            elapsed,
            retries,
        }),
    }
}
