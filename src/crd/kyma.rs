//! Kyma Custom Resource (read-only view)
//!
//! The Kyma CRD is owned by the Kyma lifecycle manager. This operator never
//! creates or mutates Kyma resources, so only the fields it reads are modelled;
//! everything else in the object is ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a Kyma runtime as far as Compass Manager is concerned
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Kyma",
    plural = "kymas",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KymaSpec {
    /// Release channel of the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Modules enabled on the runtime, in declaration order
    #[serde(default)]
    pub modules: Vec<Module>,
}

/// A module enabled on a Kyma runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Module name, e.g. `applicationconnector`
    pub name: String,

    /// Channel override for this module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Module {
    /// Create a module entry with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
        }
    }
}

impl KymaSpec {
    /// Returns true if a module with the given name is enabled
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name == name)
    }
}

impl Kyma {
    /// Returns true once the lifecycle manager started deleting this resource
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserializes_lifecycle_manager_object() {
        let json = serde_json::json!({
            "apiVersion": "operator.kyma-project.io/v1beta2",
            "kind": "Kyma",
            "metadata": {
                "name": "kyma-1",
                "namespace": "kcp-system",
                "labels": {"kyma-project.io/global-account-id": "ga-1"}
            },
            "spec": {
                "channel": "regular",
                "modules": [
                    {"name": "istio", "customResourcePolicy": "CreateAndDelete"},
                    {"name": "applicationconnector"}
                ],
                "sync": {"enabled": true}
            },
            "status": {"state": "Ready"}
        });

        let kyma: Kyma = serde_json::from_value(json).expect("kyma should deserialize");
        assert_eq!(kyma.spec.channel.as_deref(), Some("regular"));
        assert_eq!(kyma.spec.modules.len(), 2);
        assert!(kyma.spec.has_module("applicationconnector"));
        assert!(!kyma.spec.has_module("serverless"));
        assert!(!kyma.is_being_deleted());
    }

    #[test]
    fn test_missing_modules_default_to_empty() {
        let json = serde_json::json!({
            "apiVersion": "operator.kyma-project.io/v1beta2",
            "kind": "Kyma",
            "metadata": {"name": "kyma-2", "namespace": "kcp-system"},
            "spec": {}
        });

        let kyma: Kyma = serde_json::from_value(json).expect("kyma should deserialize");
        assert!(kyma.spec.modules.is_empty());
    }
}
