//! In-memory [`KubeClient`] for tests that need state to persist across calls

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use super::{KubeClient, ObjectKey};
use crate::crd::{
    mapping_labels, CompassManagerMapping, CompassManagerMappingSpec, CompassManagerMappingStatus,
    Kyma, KymaSpec, Module,
};
use crate::{Error, APPLICATION_CONNECTOR_MODULE_NAME, KUBECONFIG_KEY, LABEL_KYMA_NAME};

pub const NAMESPACE: &str = "kcp-system";

/// Build a Kyma in the test namespace with the connector module enabled
pub fn kyma(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Kyma {
    let to_map = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    };

    let mut kyma = Kyma::new(
        name,
        KymaSpec {
            channel: Some("regular".to_string()),
            modules: vec![Module::new(APPLICATION_CONNECTOR_MODULE_NAME)],
        },
    );
    kyma.metadata.namespace = Some(NAMESPACE.to_string());
    if !labels.is_empty() {
        kyma.metadata.labels = Some(to_map(labels));
    }
    if !annotations.is_empty() {
        kyma.metadata.annotations = Some(to_map(annotations));
    }
    kyma
}

/// Build the broker-created kubeconfig secret for a Kyma
pub fn kubeconfig_secret(kyma_name: &str, kubeconfig: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("kubeconfig-{kyma_name}")),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_KYMA_NAME.to_string(),
                kyma_name.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(kubeconfig.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

#[derive(Default)]
struct FakeState {
    kymas: BTreeMap<String, Kyma>,
    secrets: Vec<Secret>,
    mappings: BTreeMap<String, CompassManagerMapping>,
    mapping_writes: usize,
    resource_version: u64,
    fail_status_updates: bool,
}

impl FakeState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// Single-namespace fake API server
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kyma(self, kyma: Kyma) -> Self {
        self.state
            .lock()
            .unwrap()
            .kymas
            .insert(kyma.name_any(), kyma);
        self
    }

    pub fn with_secret(self, secret: Secret) -> Self {
        self.state.lock().unwrap().secrets.push(secret);
        self
    }

    /// Seed a mapping as an earlier reconcile would have left it
    pub fn with_mapping(self, kyma_name: &str, compass_runtime_id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let mut mapping =
                CompassManagerMapping::new(kyma_name, CompassManagerMappingSpec::default());
            mapping.metadata.namespace = Some(NAMESPACE.to_string());
            mapping.metadata.labels = Some(mapping_labels(
                kyma_name,
                compass_runtime_id,
                &BTreeMap::new(),
            ));
            mapping.metadata.resource_version = Some(state.next_version());
            state.mappings.insert(kyma_name.to_string(), mapping);
        }
        self
    }

    pub fn failing_status_updates(self) -> Self {
        self.state.lock().unwrap().fail_status_updates = true;
        self
    }

    pub fn remove_kyma(&self, name: &str) {
        self.state.lock().unwrap().kymas.remove(name);
    }

    pub fn set_mapping_labels(&self, name: &str, labels: BTreeMap<String, String>) {
        if let Some(mapping) = self.state.lock().unwrap().mappings.get_mut(name) {
            mapping.metadata.labels = Some(labels);
        }
    }

    pub fn set_mapping_status(&self, name: &str, status: CompassManagerMappingStatus) {
        if let Some(mapping) = self.state.lock().unwrap().mappings.get_mut(name) {
            mapping.status = Some(status);
        }
    }

    pub fn mapping(&self, name: &str) -> Option<CompassManagerMapping> {
        self.state.lock().unwrap().mappings.get(name).cloned()
    }

    pub fn mapping_count(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    /// Number of create/update/status/delete calls that changed a mapping
    pub fn mapping_writes(&self) -> usize {
        self.state.lock().unwrap().mapping_writes
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_kyma(&self, key: &ObjectKey) -> Result<Kyma, Error> {
        self.state
            .lock()
            .unwrap()
            .kymas
            .get(&key.name)
            .cloned()
            .ok_or_else(|| Error::not_found("Kyma", key.to_string()))
    }

    async fn list_mappings(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<CompassManagerMapping>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .mappings
            .values()
            .filter(|m| matches_selector(m.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn list_secrets(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .iter()
            .filter(|s| matches_selector(s.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let mut state = self.state.lock().unwrap();
        let name = mapping.name_any();
        if state.mappings.contains_key(&name) {
            return Err(Error::storage(format!("mapping {name} already exists")));
        }

        let mut stored = mapping.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.mappings.insert(name, stored.clone());
        state.mapping_writes += 1;
        Ok(stored)
    }

    async fn update_mapping(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let mut state = self.state.lock().unwrap();
        let name = mapping.name_any();
        let Some(existing_status) = state.mappings.get(&name).map(|m| m.status) else {
            return Err(Error::not_found("CompassManagerMapping", name));
        };

        // Replace ignores status, like the real main resource endpoint
        let mut stored = mapping.clone();
        stored.status = existing_status;
        stored.metadata.resource_version = Some(state.next_version());
        state.mappings.insert(name, stored.clone());
        state.mapping_writes += 1;
        Ok(stored)
    }

    async fn update_mapping_status(
        &self,
        mapping: &CompassManagerMapping,
    ) -> Result<CompassManagerMapping, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_status_updates {
            return Err(Error::storage("status subresource unavailable"));
        }

        let name = mapping.name_any();
        let version = state.next_version();
        let Some(stored) = state.mappings.get_mut(&name) else {
            return Err(Error::not_found("CompassManagerMapping", name));
        };
        stored.status = mapping.status;
        stored.metadata.resource_version = Some(version);
        let stored = stored.clone();
        state.mapping_writes += 1;
        Ok(stored)
    }

    async fn delete_mapping(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.mappings.remove(name).is_some() {
            state.mapping_writes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matching() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);

        assert!(matches_selector(&labels, "a=1"));
        assert!(matches_selector(&labels, "a=1,b=2"));
        assert!(matches_selector(&labels, "b"));
        assert!(!matches_selector(&labels, "a=2"));
        assert!(!matches_selector(&labels, "c"));
    }
}
