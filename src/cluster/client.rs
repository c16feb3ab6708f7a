//! Storage accessor for the objects Compass Manager reads and writes
//!
//! All cluster access goes through [`KubeClient`] so the reconciler can be
//! exercised without an API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::ObjectKey;
use crate::crd::{CompassManagerMapping, Kyma};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations used by the cluster view
///
/// Lookups report a missing object as [`Error::NotFound`], everything else
/// is surfaced as-is so the caller can add context.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Kyma resource by key
    async fn get_kyma(&self, key: &ObjectKey) -> Result<Kyma, Error>;

    /// List mappings in a namespace matching a label selector
    async fn list_mappings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CompassManagerMapping>, Error>;

    /// List secrets in a namespace matching a label selector
    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error>;

    /// Create a mapping, returning the stored object
    async fn create_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error>;

    /// Replace an existing mapping, returning the stored object
    async fn update_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error>;

    /// Write the status subresource of a mapping, returning the stored object
    async fn update_mapping_status(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error>;

    /// Delete a mapping; deleting an absent mapping succeeds
    async fn delete_mapping(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn mappings(&self, namespace: &str) -> Api<CompassManagerMapping> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(mapping: &CompassManagerMapping) -> Result<String, Error> {
    mapping
        .namespace()
        .ok_or_else(|| Error::storage(format!("mapping {} has no namespace", mapping.name_any())))
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_kyma(&self, key: &ObjectKey) -> Result<Kyma, Error> {
        let api: Api<Kyma> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.get(&key.name).await {
            Ok(kyma) => Ok(kyma),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(Error::not_found("Kyma", key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_mappings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CompassManagerMapping>, Error> {
        let list = self
            .mappings(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let namespace = namespace_of(mapping)?;
        let created = self
            .mappings(&namespace)
            .create(&PostParams::default(), mapping)
            .await?;
        debug!(mapping = %created.name_any(), "created compass manager mapping");
        Ok(created)
    }

    async fn update_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let namespace = namespace_of(mapping)?;
        let updated = self
            .mappings(&namespace)
            .replace(&mapping.name_any(), &PostParams::default(), mapping)
            .await?;
        Ok(updated)
    }

    async fn update_mapping_status(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let namespace = namespace_of(mapping)?;
        let status_patch = serde_json::json!({
            "status": mapping.status
        });

        let updated = self
            .mappings(&namespace)
            .patch_status(
                &mapping.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(updated)
    }

    async fn delete_mapping(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .mappings(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
