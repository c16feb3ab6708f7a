//! CompassManagerMapping Custom Resource Definition
//!
//! A mapping correlates one Kyma resource with its runtime in Compass. The
//! runtime ID lives in the `kyma-project.io/compass-runtime-id` label and is
//! authoritative; the status only reports what the last reconcile achieved.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    LABEL_COMPASS_ID, LABEL_GLOBAL_ACCOUNT_ID, LABEL_KYMA_NAME, LABEL_MANAGED_BY,
    LABEL_SUBACCOUNT_ID, MANAGED_BY,
};

/// Specification for a CompassManagerMapping
///
/// All protocol data is carried in labels; the resource has no desired state of its own.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta1",
    kind = "CompassManagerMapping",
    plural = "compassmanagermappings",
    status = "CompassManagerMappingStatus",
    namespaced,
    printcolumn = r#"{"name":"Registered","type":"boolean","jsonPath":".status.registered"}"#,
    printcolumn = r#"{"name":"Configured","type":"boolean","jsonPath":".status.configured"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct CompassManagerMappingSpec {}

/// Outcome of the last reconcile for a mapping
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CompassManagerMappingStatus {
    /// Runtime is registered in Compass
    #[serde(default)]
    pub registered: bool,

    /// Compass Runtime Agent received its configuration
    #[serde(default)]
    pub configured: bool,
}

impl CompassManagerMappingStatus {
    /// Create a status with the given flags
    pub fn new(registered: bool, configured: bool) -> Self {
        Self {
            registered,
            configured,
        }
    }
}

/// Build the label set of a mapping
///
/// Identity labels are copied from the Kyma labels; missing ones become empty
/// strings so the label set always has the same shape.
pub fn mapping_labels(
    kyma_name: &str,
    compass_runtime_id: &str,
    kyma_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let copied = |key: &str| kyma_labels.get(key).cloned().unwrap_or_default();

    BTreeMap::from([
        (LABEL_KYMA_NAME.to_string(), kyma_name.to_string()),
        (LABEL_COMPASS_ID.to_string(), compass_runtime_id.to_string()),
        (
            LABEL_GLOBAL_ACCOUNT_ID.to_string(),
            copied(LABEL_GLOBAL_ACCOUNT_ID),
        ),
        (LABEL_SUBACCOUNT_ID.to_string(), copied(LABEL_SUBACCOUNT_ID)),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

impl CompassManagerMapping {
    /// Runtime ID recorded on this mapping, empty if registration never succeeded
    pub fn compass_runtime_id(&self) -> &str {
        self.label(LABEL_COMPASS_ID)
    }

    /// Global account recorded on this mapping
    pub fn global_account_id(&self) -> &str {
        self.label(LABEL_GLOBAL_ACCOUNT_ID)
    }

    /// Current status, defaulting to nothing done
    pub fn current_status(&self) -> CompassManagerMappingStatus {
        self.status.unwrap_or_default()
    }

    fn label(&self, key: &str) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_labels_copy_identity_and_fill_gaps() {
        let kyma_labels = BTreeMap::from([
            (LABEL_GLOBAL_ACCOUNT_ID.to_string(), "ga-1".to_string()),
            ("unrelated".to_string(), "x".to_string()),
        ]);

        let labels = mapping_labels("kyma-1", "rt-1", &kyma_labels);

        assert_eq!(labels.len(), 5);
        assert_eq!(labels[LABEL_KYMA_NAME], "kyma-1");
        assert_eq!(labels[LABEL_COMPASS_ID], "rt-1");
        assert_eq!(labels[LABEL_GLOBAL_ACCOUNT_ID], "ga-1");
        assert_eq!(labels[LABEL_SUBACCOUNT_ID], "");
        assert_eq!(labels[LABEL_MANAGED_BY], MANAGED_BY);
        assert!(!labels.contains_key("unrelated"));
    }

    #[test]
    fn test_accessors_tolerate_missing_labels_and_status() {
        let mapping = CompassManagerMapping::new("kyma-1", CompassManagerMappingSpec::default());

        assert_eq!(mapping.compass_runtime_id(), "");
        assert_eq!(mapping.global_account_id(), "");
        assert_eq!(mapping.current_status(), CompassManagerMappingStatus::default());
    }

    #[test]
    fn test_crd_has_status_subresource() {
        let crd = CompassManagerMapping::crd();
        assert_eq!(crd.spec.group, "operator.kyma-project.io");
        assert_eq!(crd.spec.names.kind, "CompassManagerMapping");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1beta1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
