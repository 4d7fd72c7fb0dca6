//! lattice-netcore - control-plane primitives for cluster networking
//!
//! Two independent building blocks used while bringing up the networking
//! control plane:
//!
//! - Waiting, with a fixed poll interval and a deadline, until a CRD is
//!   served by the API server before starting the components that use it.
//! - The contract between the prefix → identity cache and the components
//!   that follow its changes.
//!
//! # Modules
//!
//! - [`crd`] - CRD lookups and readiness waits
//! - [`controller`] - Keyed recurring tasks backing the readiness waits
//! - [`ipcache`] - Change events, listeners and a reconciled identity view
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod ipcache;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
