//! Admission filter for Kyma change notifications
//!
//! Decides from the watch stream alone whether a reconcile is worth running.
//! Mapping status writes never touch the Kyma, but the lifecycle manager
//! updates Kyma status constantly; those updates must not wake the
//! reconciler.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::crd::Kyma;
use crate::APPLICATION_CONNECTOR_MODULE_NAME;

/// The parts of a Kyma the admission filter compares between events
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KymaSnapshot {
    /// `metadata.resourceVersion`
    pub resource_version: Option<String>,
    /// `metadata.generation`, bumped on spec changes only
    pub generation: Option<i64>,
    /// `metadata.labels`
    pub labels: BTreeMap<String, String>,
    /// `metadata.annotations`
    pub annotations: BTreeMap<String, String>,
    /// Whether the application connector module is enabled
    pub has_connector_module: bool,
}

impl KymaSnapshot {
    /// Take a snapshot of a watched Kyma
    pub fn of(kyma: &Kyma) -> Self {
        Self {
            resource_version: kyma.resource_version(),
            generation: kyma.metadata.generation,
            labels: kyma.labels().clone(),
            annotations: kyma.annotations().clone(),
            has_connector_module: kyma.spec.has_module(APPLICATION_CONNECTOR_MODULE_NAME),
        }
    }

    /// True if only the status (or nothing at all) differs from `old`
    fn is_status_only_change(&self, old: &Self) -> bool {
        self.resource_version == old.resource_version
            || (self.generation == old.generation
                && self.labels == old.labels
                && self.annotations == old.annotations)
    }
}

/// A change notification for one Kyma
#[derive(Clone, Copy, Debug)]
pub enum KymaEvent<'a> {
    /// First sighting of the Kyma (including the initial list after a restart)
    Created(&'a KymaSnapshot),
    /// The Kyma changed since the last sighting
    Updated {
        /// Snapshot from the previous event
        old: &'a KymaSnapshot,
        /// Snapshot from this event
        new: &'a KymaSnapshot,
    },
    /// The Kyma is gone
    Deleted(&'a KymaSnapshot),
}

/// Whether an event should trigger a reconcile
///
/// Creations and updates need the connector module; updates additionally
/// need a generation, label or annotation change. Deletions always pass so
/// cleanup is attempted even after the module was removed.
pub fn admit(event: &KymaEvent<'_>) -> bool {
    match event {
        KymaEvent::Created(kyma) => kyma.has_connector_module,
        KymaEvent::Updated { old, new } => {
            new.has_connector_module && !new.is_status_only_change(old)
        }
        KymaEvent::Deleted(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::kyma;
    use crate::crd::KymaSpec;

    fn snapshot(version: &str, generation: i64) -> KymaSnapshot {
        let mut kyma = kyma("kyma-1", &[("a", "1")], &[]);
        kyma.metadata.resource_version = Some(version.to_string());
        kyma.metadata.generation = Some(generation);
        KymaSnapshot::of(&kyma)
    }

    fn without_module(mut snapshot: KymaSnapshot) -> KymaSnapshot {
        snapshot.has_connector_module = false;
        snapshot
    }

    #[test]
    fn test_snapshot_detects_connector_module() {
        assert!(snapshot("1", 1).has_connector_module);
        assert!(!KymaSnapshot::of(&Kyma::new("bare", KymaSpec::default())).has_connector_module);
    }

    /// Story: Kymas without the application connector are none of our business
    #[test]
    fn story_kyma_without_connector_module_is_ignored() {
        let old = without_module(snapshot("1", 1));
        let new = without_module(snapshot("2", 2));

        assert!(!admit(&KymaEvent::Created(&new)));
        assert!(!admit(&KymaEvent::Updated { old: &old, new: &new }));
    }

    #[test]
    fn test_creation_with_connector_module_is_admitted() {
        assert!(admit(&KymaEvent::Created(&snapshot("1", 1))));
    }

    /// Story: deleting a Kyma always triggers cleanup
    ///
    /// Even when the module was disabled before deletion the runtime may
    /// still be registered in Compass.
    #[test]
    fn story_deletion_is_always_admitted() {
        assert!(admit(&KymaEvent::Deleted(&without_module(snapshot("1", 1)))));
        assert!(admit(&KymaEvent::Deleted(&snapshot("1", 1))));
    }

    #[test]
    fn test_status_only_update_is_dropped() {
        let old = snapshot("1", 1);
        let new = snapshot("2", 1);

        assert!(!admit(&KymaEvent::Updated { old: &old, new: &new }));
    }

    #[test]
    fn test_unchanged_resource_version_is_dropped() {
        let old = snapshot("1", 1);
        let mut new = snapshot("1", 2);
        new.labels.insert("b".to_string(), "2".to_string());

        assert!(!admit(&KymaEvent::Updated { old: &old, new: &new }));
    }

    #[rstest::rstest]
    #[case::generation(|s: &mut KymaSnapshot| s.generation = Some(2))]
    #[case::label(|s: &mut KymaSnapshot| { s.labels.insert("b".to_string(), "2".to_string()); })]
    #[case::annotation(|s: &mut KymaSnapshot| {
        s.annotations.insert("compass-runtime-id-for-migration".to_string(), "rt-1".to_string());
    })]
    fn test_meaningful_update_is_admitted(#[case] change: fn(&mut KymaSnapshot)) {
        let old = snapshot("1", 1);
        let mut new = snapshot("2", 1);
        change(&mut new);

        assert!(admit(&KymaEvent::Updated { old: &old, new: &new }));
    }

    #[test]
    fn test_update_removing_connector_module_is_dropped() {
        let old = snapshot("1", 1);
        let new = without_module(snapshot("2", 2));

        assert!(!admit(&KymaEvent::Updated { old: &old, new: &new }));
    }
}
