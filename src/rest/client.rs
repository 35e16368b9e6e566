//! The REST client every higher layer goes through.
//!
//! Besides moving JSON, it carries the diagnostic duties: every resolved
//! URL lands in the shared history and the sandbox command log, embedded
//! error/warning fields are scanned out of every response, and a transport
//! failure triggers a sandbox sweep so a crashed node surfaces as the
//! crash, not as a connection error.

use reqwest::Method;
use serde_json::Value;
use slog::{debug, warn, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::params::{normalize, ParamValue};
use super::RequestError;
use crate::sandbox::{Sandbox, SandboxError};

const ERROR_KEYS: [&str; 4] = ["error", "Error", "errors", "Errors"];
const WARNING_KEYS: [&str; 4] = ["warning", "Warning", "warnings", "Warnings"];
const HISTORY_LIMIT: usize = 100;
const FAULT_SCAN_DELAY: Duration = Duration::from_secs(2);

/// Per-request behavior toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Return the payload instead of raising when it carries an embedded
    /// error field. Used by validation probes where errors are the point.
    pub ignore_server_error: bool,

    /// Skip the sandbox sweep on transport failure. Used while polling a
    /// node that is still starting up.
    pub skip_fault_scan: bool,
}

#[derive(Debug, Clone)]
pub struct RequestResult {
    pub json: Value,
    pub status: u16,
    pub url: String,
    /// Number of embedded error fields found (nonzero only in
    /// `ignore_server_error` mode).
    pub error_count: usize,
}

/// Control client for one node.
#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    http: reqwest::Client,
    sandbox: Sandbox,
    history: Arc<Mutex<Vec<String>>>,
    logger: Logger,
}

impl RestClient {
    pub fn new(addr: &str, port: u16, sandbox: Sandbox, logger: Logger) -> Self {
        RestClient {
            base_url: format!("http://{}:{}", addr, port),
            http: reqwest::Client::new(),
            sandbox,
            history: Arc::new(Mutex::new(Vec::new())),
            logger,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// The most recently issued URLs, oldest first.
    pub fn url_history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub async fn get(
        &self,
        path: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<RequestResult, RequestError> {
        self.request(Method::GET, path, params, RequestOptions::default())
            .await
    }

    pub async fn post(
        &self,
        path: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<RequestResult, RequestError> {
        self.request(Method::POST, path, params, RequestOptions::default())
            .await
    }

    pub async fn delete(
        &self,
        path: &str,
        params: &[(&str, ParamValue)],
    ) -> Result<RequestResult, RequestError> {
        self.request(Method::DELETE, path, params, RequestOptions::default())
            .await
    }

    /// Issue one request. Parameters ride as query fields on GET/DELETE
    /// and as form fields otherwise, after normalization.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, ParamValue)],
        opts: RequestOptions,
    ) -> Result<RequestResult, RequestError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let fields = normalize(params);

        let mut builder = self.http.request(method.clone(), &url);
        builder = if method == Method::GET || method == Method::DELETE {
            builder.query(&fields)
        } else {
            builder.form(&fields)
        };

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_url(&url);
                if opts.skip_fault_scan {
                    return Err(RequestError::Transport {
                        url,
                        detail: e.to_string(),
                    });
                }
                return Err(self.trace_transport_failure(url, e).await);
            }
        };

        let resolved = response.url().to_string();
        self.record_url(&resolved);
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Err(RequestError::Status {
                url: resolved,
                status,
            });
        }

        let json: Value = response.json().await.map_err(|e| RequestError::Decode {
            url: resolved.clone(),
            detail: e.to_string(),
        })?;

        for (field, message) in embedded_warnings(&json) {
            warn!(self.logger, "server warning in response";
                "url" => &resolved, "field" => field, "message" => message);
        }

        let errors = embedded_errors(&json);
        if let Some((field, message)) = errors.first() {
            if !opts.ignore_server_error {
                return Err(RequestError::ServerError {
                    url: resolved,
                    status,
                    field: field.clone(),
                    message: message.clone(),
                });
            }
            debug!(self.logger, "server error ignored by request";
                "url" => &resolved, "field" => field.as_str(), "message" => message.as_str());
        }

        Ok(RequestResult {
            json,
            status,
            url: resolved,
            error_count: errors.len(),
        })
    }

    /// A transport failure often means a node just died. Give the log
    /// drains a moment, sweep the sandbox, and report fatal log lines as
    /// the error when they exist; otherwise hand back the transport error.
    async fn trace_transport_failure(&self, url: String, cause: reqwest::Error) -> RequestError {
        warn!(self.logger, "transport failure, sweeping sandbox";
            "url" => &url, "error" => %cause);
        tokio::time::sleep(FAULT_SCAN_DELAY).await;
        match self.sandbox.scan_for_errors() {
            Err(e @ SandboxError::FatalLines { .. }) => RequestError::FatalLogLines(e),
            _ => RequestError::Transport {
                url,
                detail: cause.to_string(),
            },
        }
    }

    fn record_url(&self, url: &str) {
        let mut history = self.history.lock().unwrap();
        history.push(url.to_string());
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
        if let Err(e) = self.sandbox.log_command(url) {
            debug!(self.logger, "could not append to command log"; "error" => %e);
        }
    }
}

/// A field counts as an error/warning only when it actually says
/// something: null, empty strings, empty containers and zero are routine.
fn non_trivial(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::Bool(b) => *b,
    }
}

fn scan_keys(json: &Value, keys: &[&str]) -> Vec<(String, String)> {
    let mut found = Vec::new();
    if let Value::Object(map) = json {
        for key in keys {
            if let Some(value) = map.get(*key) {
                if non_trivial(value) {
                    let message = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    found.push((key.to_string(), message));
                }
            }
        }
    }
    found
}

fn embedded_errors(json: &Value) -> Vec<(String, String)> {
    scan_keys(json, &ERROR_KEYS)
}

fn embedded_warnings(json: &Value) -> Vec<(String, String)> {
    scan_keys(json, &WARNING_KEYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedded_error_found_under_any_casing() {
        for key in ERROR_KEYS {
            let payload = json!({ key: "water meter disagrees" });
            let errors = embedded_errors(&payload);
            assert_eq!(errors.len(), 1, "key {}", key);
            assert_eq!(errors[0].1, "water meter disagrees");
        }
    }

    #[test]
    fn test_trivial_error_fields_pass() {
        for payload in [
            json!({ "error": null }),
            json!({ "errors": [] }),
            json!({ "error": "" }),
            json!({ "error_count": 3 }),
            json!({ "status": "ok" }),
        ] {
            assert!(embedded_errors(&payload).is_empty(), "{}", payload);
        }
    }

    #[test]
    fn test_structured_error_is_stringified() {
        let payload = json!({ "errors": [{ "field": "ntrees", "message": "must be > 0" }] });
        let errors = embedded_errors(&payload);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.contains("ntrees"));
    }

    #[test]
    fn test_warnings_scanned_separately() {
        let payload = json!({ "warnings": ["heap below recommended"], "error": null });
        assert!(embedded_errors(&payload).is_empty());
        let warnings = embedded_warnings(&payload);
        assert_eq!(warnings.len(), 1);
    }
}
