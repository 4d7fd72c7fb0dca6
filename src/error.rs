//! Error types for lattice-netcore
//!
//! Errors carry enough context (resource names, task keys, the last observed
//! failure) to be actionable when they surface in operator startup logs.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// HTTP status codes the API server returns for requests that will never
/// succeed by waiting: bad request, unauthorized, forbidden.
const PERMANENT_API_CODES: &[u16] = &[400, 401, 403];

/// Main error type for lattice-netcore operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested resource type is not (yet) known to the API server
    #[error("resource type {name} not found")]
    ResourceNotFound {
        /// Name of the resource type, e.g. "ciliumnodes.cilium.io"
        name: String,
    },

    /// A deadline expired before the awaited condition was met
    #[error("timed out after {timeout:?} waiting for {operation}{}", last_error_suffix(.last_error))]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The deadline that was exceeded
        timeout: Duration,
        /// The most recent failure observed before the deadline, if any
        #[source]
        last_error: Option<Arc<Error>>,
    },

    /// A change event violates the cache notification protocol
    #[error("invalid change event: {message}")]
    InvalidEvent {
        /// Description of the violation
        message: String,
    },

    /// A network prefix could not be parsed
    #[error("invalid prefix {input:?}: {message}")]
    InvalidPrefix {
        /// The rejected input
        input: String,
        /// Why it was rejected
        message: String,
    },

    /// No recurring task is registered under the key
    #[error("no task registered under key {key}")]
    TaskNotFound {
        /// The task key
        key: String,
    },

    /// A recurring task stopped on a permanent failure before succeeding
    #[error("task {key} aborted: {message}")]
    TaskAborted {
        /// The task key
        key: String,
        /// The failure that stopped the task
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },
}

fn last_error_suffix(last_error: &Option<Arc<Error>>) -> String {
    match last_error {
        Some(e) => format!(": {}", e),
        None => String::new(),
    }
}

impl Error {
    /// Create a not-found error for a resource type
    pub fn resource_not_found(name: impl Into<String>) -> Self {
        Self::ResourceNotFound { name: name.into() }
    }

    /// Create a timeout error
    pub fn timeout(
        operation: impl Into<String>,
        timeout: Duration,
        last_error: Option<Arc<Error>>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
            last_error,
        }
    }

    /// Create a protocol violation error for a change event
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent {
            message: msg.into(),
        }
    }

    /// Create a prefix parse error
    pub fn invalid_prefix(input: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            input: input.into(),
            message: msg.into(),
        }
    }

    /// Create a task-not-found error
    pub fn task_not_found(key: impl Into<String>) -> Self {
        Self::TaskNotFound { key: key.into() }
    }

    /// Create a task-aborted error
    pub fn task_aborted(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TaskAborted {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether retrying the failed operation can never help.
    ///
    /// Only API responses that reject the request itself (bad request,
    /// unauthorized, forbidden) are permanent. Not-found, transport failures
    /// and server-side errors may clear up on their own.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(resp),
            } => PERMANENT_API_CODES.contains(&resp.code),
            Error::InvalidPrefix { .. } | Error::InvalidEvent { .. } | Error::Config { .. } => {
                true
            }
            _ => false,
        }
    }
}
