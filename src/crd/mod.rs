//! Resource type (CRD) availability
//!
//! - [`registry`] - Lookup of declared resource types at the API server
//! - [`readiness`] - Fixed-interval waits until a resource type is served

pub mod readiness;
pub mod registry;

pub use readiness::{
    task_key, ReadinessConfig, ReadinessStatus, ReadinessWaiter, DEFAULT_POLL_INTERVAL,
    DEFAULT_WAIT_TIMEOUT,
};
pub use registry::{KubeCrdRegistry, ResourceTypeRegistry};
