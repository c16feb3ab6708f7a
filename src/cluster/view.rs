//! Per-reconcile view of the cluster state behind one Kyma resource
//!
//! A [`ClusterView`] memoizes the Kyma resource, its mapping and its
//! kubeconfig for the lifetime of a single reconcile. Every cached entry is
//! stored together with the key it was fetched for, so a lookup for another
//! key always goes back to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::{KubeClient, ObjectKey};
use crate::crd::{
    mapping_labels, CompassManagerMapping, CompassManagerMappingSpec, CompassManagerMappingStatus,
    Kyma,
};
use crate::{Error, KUBECONFIG_KEY, LABEL_KYMA_NAME};

#[derive(Default)]
struct ClusterCache {
    kyma: Option<(ObjectKey, Kyma)>,
    mapping: Option<(ObjectKey, CompassManagerMapping)>,
    kubeconfig: Option<(ObjectKey, Vec<u8>)>,
}

fn cached<'a, T>(entry: &'a Option<(ObjectKey, T)>, key: &ObjectKey) -> Option<&'a T> {
    entry.as_ref().filter(|(k, _)| k == key).map(|(_, v)| v)
}

/// Keeps NotFound intact and adds context to anything else
fn with_context(err: Error, context: impl std::fmt::Display) -> Error {
    if err.is_not_found() {
        err
    } else {
        Error::storage(format!("{context}: {err}"))
    }
}

fn kyma_selector(key: &ObjectKey) -> String {
    format!("{}={}", LABEL_KYMA_NAME, key.name)
}

/// Cached accessor for the Kyma, mapping and kubeconfig of a resource
///
/// Create one per reconcile and drop it afterwards. It is not meant to be
/// shared between reconciles or tasks.
pub struct ClusterView<'a> {
    kube: &'a dyn KubeClient,
    cache: ClusterCache,
}

impl<'a> ClusterView<'a> {
    /// Create an empty view backed by the given client
    pub fn new(kube: &'a dyn KubeClient) -> Self {
        Self {
            kube,
            cache: ClusterCache::default(),
        }
    }

    /// Get the Kyma resource for `key`
    ///
    /// Returns [`Error::NotFound`] if the resource is gone. Missing label and
    /// annotation maps are normalized to empty maps.
    pub async fn get_kyma(&mut self, key: &ObjectKey) -> Result<Kyma, Error> {
        if let Some(kyma) = cached(&self.cache.kyma, key) {
            return Ok(kyma.clone());
        }

        let mut kyma = self
            .kube
            .get_kyma(key)
            .await
            .map_err(|e| with_context(e, format_args!("failed to get Kyma {key}")))?;

        kyma.metadata.labels.get_or_insert_with(BTreeMap::new);
        kyma.metadata.annotations.get_or_insert_with(BTreeMap::new);

        self.cache.kyma = Some((key.clone(), kyma.clone()));
        Ok(kyma)
    }

    /// Get the mapping for `key`, `None` if the resource was never registered
    ///
    /// Mappings are found by the Kyma name label, not by their own name.
    pub async fn get_mapping(
        &mut self,
        key: &ObjectKey,
    ) -> Result<Option<CompassManagerMapping>, Error> {
        if let Some(mapping) = cached(&self.cache.mapping, key) {
            return Ok(Some(mapping.clone()));
        }

        let mappings = self
            .kube
            .list_mappings(&key.namespace, &kyma_selector(key))
            .await
            .map_err(|e| with_context(e, format_args!("failed to list mappings for {key}")))?;

        if mappings.len() > 1 {
            warn!(kyma = %key, count = mappings.len(), "multiple mappings found, using the first");
        }

        let Some(mut mapping) = mappings.into_iter().next() else {
            return Ok(None);
        };

        mapping.metadata.labels.get_or_insert_with(BTreeMap::new);
        mapping.metadata.annotations.get_or_insert_with(BTreeMap::new);

        self.cache.mapping = Some((key.clone(), mapping.clone()));
        Ok(Some(mapping))
    }

    /// Get the kubeconfig of the runtime behind `key`
    ///
    /// `None` means the secret does not exist yet or carries no kubeconfig,
    /// which is expected while the cluster is still being provisioned.
    pub async fn get_kubeconfig(&mut self, key: &ObjectKey) -> Result<Option<Vec<u8>>, Error> {
        if let Some(kubeconfig) = cached(&self.cache.kubeconfig, key) {
            return Ok(Some(kubeconfig.clone()));
        }

        let secrets = self
            .kube
            .list_secrets(&key.namespace, &kyma_selector(key))
            .await
            .map_err(|e| with_context(e, format_args!("failed to list secrets for {key}")))?;

        let Some(kubeconfig) = secrets.first().and_then(kubeconfig_from_secret) else {
            return Ok(None);
        };

        self.cache.kubeconfig = Some((key.clone(), kubeconfig.clone()));
        Ok(Some(kubeconfig))
    }

    /// Runtime ID recorded for `key`, empty if there is none
    pub async fn get_compass_runtime_id(&mut self, key: &ObjectKey) -> Result<String, Error> {
        Ok(self
            .get_mapping(key)
            .await?
            .map(|m| m.compass_runtime_id().to_string())
            .unwrap_or_default())
    }

    /// Create or overwrite the mapping for `key` with the given runtime ID
    ///
    /// An empty runtime ID records a failed registration attempt.
    pub async fn upsert_mapping(
        &mut self,
        key: &ObjectKey,
        compass_runtime_id: &str,
    ) -> Result<(), Error> {
        let kyma = self.get_kyma(key).await?;
        let labels = mapping_labels(&key.name, compass_runtime_id, kyma.labels());

        let stored = match self.get_mapping(key).await? {
            None => {
                let mut mapping =
                    CompassManagerMapping::new(&key.name, CompassManagerMappingSpec::default());
                mapping.metadata.namespace = Some(key.namespace.clone());
                mapping.metadata.labels = Some(labels);

                self.kube
                    .create_mapping(&mapping)
                    .await
                    .map_err(|e| with_context(e, format_args!("failed to create mapping for {key}")))?
            }
            Some(mut existing) => {
                existing.metadata.labels = Some(labels);

                self.kube
                    .update_mapping(&existing)
                    .await
                    .map_err(|e| with_context(e, format_args!("failed to update mapping for {key}")))?
            }
        };

        debug!(kyma = %key, runtime_id = %compass_runtime_id, "mapping upserted");
        self.cache.mapping = Some((key.clone(), stored));
        Ok(())
    }

    /// Record the registration/configuration outcome on the mapping
    ///
    /// Best effort: failures are logged and never returned. Writing a status
    /// equal to the stored one is skipped.
    pub async fn set_mapping_status(&mut self, key: &ObjectKey, registered: bool, configured: bool) {
        let mut mapping = match self.get_mapping(key).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                warn!(kyma = %key, "no mapping to update status on");
                return;
            }
            Err(e) => {
                warn!(kyma = %key, error = %e, "failed to get mapping for status update");
                return;
            }
        };

        let status = CompassManagerMappingStatus::new(registered, configured);
        if mapping.status == Some(status) {
            debug!(kyma = %key, ?status, "mapping status unchanged");
            return;
        }
        mapping.status = Some(status);

        match self.kube.update_mapping_status(&mapping).await {
            Ok(stored) => self.cache.mapping = Some((key.clone(), stored)),
            Err(e) => warn!(kyma = %key, error = %e, "failed to update mapping status"),
        }
    }

    /// Delete the mapping for `key`; succeeds if there is none
    pub async fn delete_mapping(&mut self, key: &ObjectKey) -> Result<(), Error> {
        let Some(mapping) = self.get_mapping(key).await? else {
            return Ok(());
        };

        let namespace = mapping
            .namespace()
            .unwrap_or_else(|| key.namespace.clone());
        self.kube
            .delete_mapping(&namespace, &mapping.name_any())
            .await
            .map_err(|e| with_context(e, format_args!("failed to delete mapping for {key}")))?;

        self.cache.mapping = None;
        Ok(())
    }

    /// Forget everything fetched so far
    pub fn clear_cache(&mut self) {
        self.cache = ClusterCache::default();
    }
}

fn kubeconfig_from_secret(secret: &Secret) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_KEY))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{kubeconfig_secret, kyma, FakeCluster};
    use crate::cluster::MockKubeClient;
    use crate::{LABEL_COMPASS_ID, LABEL_GLOBAL_ACCOUNT_ID};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("kcp-system", name)
    }

    #[tokio::test]
    async fn test_kyma_is_fetched_once_per_key() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_kyma()
            .times(1)
            .returning(|k| Ok(kyma(&k.name, &[], &[])));

        let mut view = ClusterView::new(&mock);
        let first = view.get_kyma(&key("kyma-1")).await.unwrap();
        let second = view.get_kyma(&key("kyma-1")).await.unwrap();

        assert_eq!(first.name_any(), second.name_any());
        assert!(first.metadata.labels.is_some());
        assert!(first.metadata.annotations.is_some());
    }

    /// Story: the cache never answers for a different resource
    ///
    /// A view that already holds kyma-1 must fetch kyma-2 (and its mapping)
    /// instead of handing back kyma-1's state.
    #[tokio::test]
    async fn story_cache_does_not_bleed_across_keys() {
        let fake = FakeCluster::new()
            .with_kyma(kyma("kyma-1", &[], &[]))
            .with_kyma(kyma("kyma-2", &[], &[]))
            .with_mapping("kyma-1", "rt-1");

        let mut view = ClusterView::new(&fake);
        assert_eq!(view.get_compass_runtime_id(&key("kyma-1")).await.unwrap(), "rt-1");
        assert_eq!(view.get_compass_runtime_id(&key("kyma-2")).await.unwrap(), "");

        let kyma_2 = view.get_kyma(&key("kyma-2")).await.unwrap();
        assert_eq!(kyma_2.name_any(), "kyma-2");
    }

    #[tokio::test]
    async fn test_missing_kyma_is_not_found() {
        let fake = FakeCluster::new();
        let mut view = ClusterView::new(&fake);

        let err = view.get_kyma(&key("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_storage_failures_gain_context() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_mappings()
            .returning(|_, _| Err(Error::storage("connection reset")));

        let mut view = ClusterView::new(&mock);
        let err = view.get_mapping(&key("kyma-1")).await.unwrap_err();

        assert!(!err.is_not_found());
        assert!(err.to_string().contains("kcp-system/kyma-1"));
    }

    #[tokio::test]
    async fn test_mapping_is_looked_up_by_kyma_name_label() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_mappings()
            .times(1)
            .returning(|ns, selector| {
                assert_eq!(ns, "kcp-system");
                assert_eq!(selector, "operator.kyma-project.io/kyma-name=kyma-1");
                Ok(vec![])
            });

        let mut view = ClusterView::new(&mock);
        assert!(view.get_mapping(&key("kyma-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kubeconfig_absent_or_empty_is_none() {
        let fake = FakeCluster::new().with_secret(kubeconfig_secret("kyma-1", ""));
        let mut view = ClusterView::new(&fake);

        assert!(view.get_kubeconfig(&key("kyma-1")).await.unwrap().is_none());
        assert!(view.get_kubeconfig(&key("kyma-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kubeconfig_is_read_from_config_key() {
        let fake = FakeCluster::new().with_secret(kubeconfig_secret("kyma-1", "apiVersion: v1"));
        let mut view = ClusterView::new(&fake);

        let kubeconfig = view.get_kubeconfig(&key("kyma-1")).await.unwrap();
        assert_eq!(kubeconfig.as_deref(), Some("apiVersion: v1".as_bytes()));
    }

    #[tokio::test]
    async fn test_upsert_creates_then_overwrites() {
        let fake = FakeCluster::new().with_kyma(kyma(
            "kyma-1",
            &[(LABEL_GLOBAL_ACCOUNT_ID, "ga-1")],
            &[],
        ));
        let mut view = ClusterView::new(&fake);

        view.upsert_mapping(&key("kyma-1"), "").await.unwrap();
        let created = fake.mapping("kyma-1").expect("mapping created");
        assert_eq!(created.compass_runtime_id(), "");
        assert_eq!(created.global_account_id(), "ga-1");

        view.upsert_mapping(&key("kyma-1"), "rt-9").await.unwrap();
        let updated = fake.mapping("kyma-1").expect("mapping kept");
        assert_eq!(updated.labels()[LABEL_COMPASS_ID], "rt-9");
        assert_eq!(fake.mapping_count(), 1);
    }

    #[tokio::test]
    async fn test_status_update_failure_is_swallowed() {
        let fake = FakeCluster::new()
            .with_kyma(kyma("kyma-1", &[], &[]))
            .with_mapping("kyma-1", "rt-1")
            .failing_status_updates();
        let mut view = ClusterView::new(&fake);

        view.set_mapping_status(&key("kyma-1"), true, true).await;

        assert_eq!(fake.mapping("kyma-1").unwrap().status, None);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let fake = FakeCluster::new()
            .with_kyma(kyma("kyma-1", &[], &[]))
            .with_mapping("kyma-1", "rt-1");
        let mut view = ClusterView::new(&fake);

        view.set_mapping_status(&key("kyma-1"), true, false).await;
        let writes = fake.mapping_writes();
        view.set_mapping_status(&key("kyma-1"), true, false).await;

        assert_eq!(fake.mapping_writes(), writes);
    }

    #[tokio::test]
    async fn test_delete_mapping_is_idempotent() {
        let fake = FakeCluster::new()
            .with_kyma(kyma("kyma-1", &[], &[]))
            .with_mapping("kyma-1", "rt-1");
        let mut view = ClusterView::new(&fake);

        view.delete_mapping(&key("kyma-1")).await.unwrap();
        assert!(fake.mapping("kyma-1").is_none());

        view.delete_mapping(&key("kyma-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_kyma()
            .times(2)
            .returning(|k| Ok(kyma(&k.name, &[], &[])));

        let mut view = ClusterView::new(&mock);
        view.get_kyma(&key("kyma-1")).await.unwrap();
        view.clear_cache();
        view.get_kyma(&key("kyma-1")).await.unwrap();
    }
}
