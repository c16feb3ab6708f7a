//! Mapping of Kyma labels to Compass runtime labels

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    LABEL_BROKER_INSTANCE_ID, LABEL_BROKER_PLAN_ID, LABEL_BROKER_PLAN_NAME,
    LABEL_GLOBAL_ACCOUNT_ID, LABEL_SHOOT_NAME, LABEL_SUBACCOUNT_ID, MANAGED_BY,
};

/// Labels attached to a runtime in Compass
pub type RuntimeLabels = BTreeMap<String, Value>;

/// Runtime label naming the component that owns the Director connection
pub const MANAGED_BY_RUNTIME_LABEL: &str = "director_connection_managed_by";

/// Runtime label name for each Kyma label that is forwarded
const FORWARDED: [(&str, &str); 6] = [
    ("broker_instance_id", LABEL_BROKER_INSTANCE_ID),
    ("gardenerClusterName", LABEL_SHOOT_NAME),
    ("subaccount_id", LABEL_SUBACCOUNT_ID),
    ("global_account_id", LABEL_GLOBAL_ACCOUNT_ID),
    ("broker_plan_id", LABEL_BROKER_PLAN_ID),
    ("broker_plan_name", LABEL_BROKER_PLAN_NAME),
];

/// Build the runtime labels for a Kyma resource
///
/// Every forwarded label is present; missing Kyma labels become empty strings.
pub fn create_compass_runtime_labels(kyma_labels: &BTreeMap<String, String>) -> RuntimeLabels {
    let mut labels: RuntimeLabels = FORWARDED
        .iter()
        .map(|(runtime_key, kyma_key)| {
            let value = kyma_labels.get(*kyma_key).cloned().unwrap_or_default();
            (runtime_key.to_string(), Value::String(value))
        })
        .collect();

    labels.insert(
        MANAGED_BY_RUNTIME_LABEL.to_string(),
        Value::String(MANAGED_BY.to_string()),
    );
    labels
}
