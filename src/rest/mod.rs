//! HTTP control client for the worker REST surface.

pub mod client;
pub mod params;

pub use client::{RequestOptions, RequestResult, RestClient};
pub use params::ParamValue;

use std::fmt;

use crate::sandbox::SandboxError;

/// Errors from one control-plane request
#[derive(Debug)]
pub enum RequestError {
    /// The request never produced a response
    Transport { url: String, detail: String },

    /// The server answered with a non-success status
    Status { url: String, status: u16 },

    /// The response body was not the JSON we expect
    Decode { url: String, detail: String },

    /// The response carried an embedded error field
    ServerError {
        url: String,
        status: u16,
        field: String,
        message: String,
    },

    /// A transport failure was traced back to fatal lines in a node log;
    /// the root cause is surfaced instead of the connection error
    FatalLogLines(SandboxError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Transport { url, detail } => {
                write!(f, "request to {} failed: {}", url, detail)
            }
            RequestError::Status { url, status } => {
                write!(f, "request to {} returned status {}", url, status)
            }
            RequestError::Decode { url, detail } => {
                write!(f, "response from {} was not valid json: {}", url, detail)
            }
            RequestError::ServerError {
                url,
                status,
                field,
                message,
            } => write!(
                f,
                "server error from {} (status {}, key {}): {}",
                url, status, field, message
            ),
            RequestError::FatalLogLines(e) => write!(f, "node log has fatal lines: {}", e),
        }
    }
}

impl std::error::Error for RequestError {}
