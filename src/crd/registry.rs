//! Resource type registry lookups
//!
//! Abstracts "does the API server know this CRD yet?" behind a trait so the
//! readiness logic can be tested without a cluster.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Registry of resource types declared at the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceTypeRegistry: Send + Sync {
    /// Look up a resource type by its full name (e.g. "ciliumnodes.cilium.io").
    ///
    /// Returns `Ok(())` if the type exists. Any failure, including transport
    /// errors, is reported as an error.
    async fn get(&self, name: &str) -> Result<()>;
}

/// Registry backed by the apiextensions `CustomResourceDefinition` API
#[derive(Clone)]
pub struct KubeCrdRegistry {
    client: Client,
}

impl KubeCrdRegistry {
    /// Create a registry using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceTypeRegistry for KubeCrdRegistry {
    async fn get(&self, name: &str) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        match crds.get(name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::resource_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }
}
