//! Blocking waits for CRD availability
//!
//! Components that consume a CRD (their own or a third party's) must not
//! start their watches before the API server serves that type. The waiter
//! polls the registry on a fixed interval until the type shows up or the
//! deadline passes.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::registry::ResourceTypeRegistry;
use crate::controller::{TaskManager, TaskParams};
use crate::{Error, Result};

/// Default interval between registry lookups
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default time to wait for a resource type before giving up
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

const TASK_KEY_PREFIX: &str = "wait-for-crd-";

/// Task key under which waits for `name` are registered.
///
/// The same name always maps to the same key, so concurrent waits for one
/// resource type share a single poller.
pub fn task_key(name: &str) -> String {
    format!("{}{}", TASK_KEY_PREFIX, name)
}

/// Polling configuration for [`ReadinessWaiter`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Interval between lookups
    pub poll_interval: Duration,
    /// Deadline for the whole wait
    pub timeout: Duration,
    /// Abort immediately on errors that waiting cannot fix (e.g. RBAC
    /// denials) instead of retrying until the deadline
    pub fail_fast: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
            fail_fast: false,
        }
    }
}

impl ReadinessConfig {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the wait timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable fail-fast on permanent errors
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Reject intervals and timeouts of zero
    pub fn validate(&self) -> Result<()> {
        validate_timing(self.poll_interval, self.timeout)
    }
}

fn validate_timing(interval: Duration, timeout: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::config("poll interval must be greater than zero"));
    }
    if timeout.is_zero() {
        return Err(Error::config("wait timeout must be greater than zero"));
    }
    Ok(())
}

/// Lifecycle of a single readiness wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessStatus {
    /// Still polling
    Pending,
    /// The resource type was found
    Succeeded,
    /// The deadline passed without a successful lookup
    TimedOut,
    /// Polling stopped on a permanent error (fail-fast only)
    Aborted,
    /// The wait could not be carried out, e.g. invalid timing or a poller
    /// that was deregistered underneath the caller
    Failed,
}

impl ReadinessStatus {
    /// Classify the outcome of a finished wait
    pub fn from_outcome(outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) => Self::Succeeded,
            Err(Error::Timeout { .. }) => Self::TimedOut,
            Err(Error::TaskAborted { .. }) => Self::Aborted,
            Err(_) => Self::Failed,
        }
    }
}

/// Waits for resource types to become available at the API server
pub struct ReadinessWaiter {
    registry: Arc<dyn ResourceTypeRegistry>,
    tasks: Arc<TaskManager>,
    config: ReadinessConfig,
    span: Span,
}

impl ReadinessWaiter {
    /// Create a waiter with default configuration.
    ///
    /// Waiters sharing a `TaskManager` also share pollers for the same name.
    pub fn new(registry: Arc<dyn ResourceTypeRegistry>, tasks: Arc<TaskManager>) -> Self {
        Self {
            registry,
            tasks,
            config: ReadinessConfig::default(),
            span: info_span!("crd_readiness"),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: ReadinessConfig) -> Self {
        self.config = config;
        self
    }

    /// Log inside `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// `Pending` while a wait for `name` is polling. Finished waits are
    /// deregistered, so their outcome is only known to the caller.
    pub fn status(&self, name: &str) -> Option<ReadinessStatus> {
        self.tasks
            .contains(&task_key(name))
            .then_some(ReadinessStatus::Pending)
    }

    /// Check once whether the registry knows `name`
    pub async fn lookup_once(&self, name: &str) -> Result<()> {
        lookup(self.registry.as_ref(), name)
            .instrument(self.span.clone())
            .await
    }

    /// Wait for `name` using the configured interval and timeout
    pub async fn wait_for_ready(&self, name: &str) -> Result<()> {
        self.wait_for_ready_with(name, self.config.poll_interval, self.config.timeout)
            .await
    }

    /// Wait for `name`, polling every `interval` for at most `timeout`.
    ///
    /// Returns as soon as one lookup succeeds. Failed lookups are logged and
    /// retried; only the deadline (or, with fail-fast, a permanent error)
    /// ends the wait with an error.
    pub async fn wait_for_ready_with(
        &self,
        name: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        validate_timing(interval, timeout)?;

        let key = task_key(name);
        let registry = self.registry.clone();
        let resource = name.to_string();
        let span = self.span.clone();

        let params = TaskParams::new(interval, move || {
            let registry = registry.clone();
            let resource = resource.clone();
            let span = span.clone();
            async move { lookup(registry.as_ref(), &resource).instrument(span).await }
        })
        .stop_on_permanent_error(self.config.fail_fast);

        info!(parent: &self.span, crd = %name, ?interval, ?timeout, "Waiting for CRD");
        self.tasks.upsert_task(&key, params);

        let outcome = match self.tasks.remove_on_success_and_wait(&key, timeout).await {
            Ok(()) => Ok(()),
            Err(Error::Timeout { last_error, .. }) => Err(Error::timeout(
                format!("resource type {}", name),
                timeout,
                last_error,
            )),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => info!(parent: &self.span, crd = %name, "CRD is available"),
            Err(e) => warn!(
                parent: &self.span,
                crd = %name,
                status = ?ReadinessStatus::from_outcome(&outcome),
                error = %e,
                "Could not wait for CRD"
            ),
        }
        outcome
    }

    /// Wait for several resource types concurrently with the configured
    /// defaults, returning each name's outcome in input order.
    pub async fn wait_for_all(&self, names: &[String]) -> Vec<(String, Result<()>)> {
        let waits = names.iter().map(|name| async move {
            let outcome = self.wait_for_ready(name).await;
            (name.clone(), outcome)
        });
        join_all(waits).await
    }
}

async fn lookup(registry: &dyn ResourceTypeRegistry, name: &str) -> Result<()> {
    debug!(crd = %name, "Looking up CRD");
    match registry.get(name).await {
        Ok(()) => {
            debug!(crd = %name, "CRD found");
            Ok(())
        }
        Err(e) => {
            debug!(crd = %name, error = %e, "CRD lookup failed");
            Err(e)
        }
    }
}
