//! Kyma reconciliation state machine
//!
//! The state of a Kyma is never stored as such. It is inferred on every run
//! from three observations: whether the Kyma still exists, whether its
//! kubeconfig is available and which runtime ID its mapping carries. The
//! runtime ID label is authoritative; the mapping status only reports what
//! happened.
//!
//! Callers must not run two reconciles for the same key at once. The work
//! queue in [`crate::runner`] guarantees this.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::{Action, Context};
use crate::cluster::{ClusterView, ObjectKey};
use crate::compass::create_compass_runtime_labels;
use crate::crd::Kyma;
use crate::{Error, ANNOTATION_ID_FOR_MIGRATION, LABEL_GLOBAL_ACCOUNT_ID};

/// Requeue delay for errors that are not collaborator failures
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Runtime ID a Kyma was registered under before this operator took over
fn migration_runtime_id(kyma: &Kyma) -> Option<&str> {
    kyma.annotations()
        .get(ANNOTATION_ID_FOR_MIGRATION)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
}

/// Reconcile the Kyma behind `key`
///
/// Registers the runtime in Compass, configures its agent and records the
/// outcome on the mapping. A vanished Kyma is deregistered instead.
#[instrument(skip(key, ctx), fields(kyma = %key))]
pub async fn reconcile(key: ObjectKey, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling kyma");

    // Fresh per run, so nothing cached survives into another key's reconcile
    let mut view = ClusterView::new(ctx.kube.as_ref());

    let kyma = match view.get_kyma(&key).await {
        Ok(kyma) => kyma,
        Err(e) if e.is_not_found() => return handle_kyma_deletion(&key, &mut view, &ctx).await,
        Err(e) => return Err(e),
    };

    let Some(kubeconfig) = view.get_kubeconfig(&key).await? else {
        info!("kubeconfig not available yet");
        return Ok(Action::requeue(ctx.requeue_interval));
    };

    let mut compass_runtime_id = view.get_compass_runtime_id(&key).await?;

    if compass_runtime_id.is_empty() {
        if let Some(migrated_id) = migration_runtime_id(&kyma) {
            info!(runtime_id = %migrated_id, "adopting runtime registered before migration");
            view.upsert_mapping(&key, migrated_id).await?;
            view.set_mapping_status(&key, true, true).await;
            return Ok(Action::await_change());
        }

        if kyma.is_being_deleted() {
            debug!("kyma is being deleted, skipping registration");
            return Ok(Action::await_change());
        }

        let labels = create_compass_runtime_labels(kyma.labels());
        match ctx.registrant.register_in_compass(&labels).await {
            Ok(id) => {
                view.upsert_mapping(&key, &id).await?;
                view.set_mapping_status(&key, true, false).await;
                info!(runtime_id = %id, "runtime registered in compass");
                compass_runtime_id = id;
            }
            Err(e) => {
                warn!(error = %e, "failed to register runtime in compass");
                view.upsert_mapping(&key, "").await?;
                view.set_mapping_status(&key, false, false).await;
                return Ok(Action::requeue(ctx.requeue_interval));
            }
        }
    } else if view
        .get_mapping(&key)
        .await?
        .is_some_and(|m| m.current_status().configured)
    {
        debug!(runtime_id = %compass_runtime_id, "runtime already configured");
        return Ok(Action::await_change());
    }

    let kubeconfig = match String::from_utf8(kubeconfig) {
        Ok(kubeconfig) => kubeconfig,
        Err(e) => {
            warn!(error = %e, "kubeconfig is not valid UTF-8");
            view.set_mapping_status(&key, true, false).await;
            return Err(Error::configuration(format!("kubeconfig is not valid UTF-8: {e}")));
        }
    };

    // Same label the registration tenant is derived from
    let global_account = kyma
        .labels()
        .get(LABEL_GLOBAL_ACCOUNT_ID)
        .map(String::as_str)
        .unwrap_or_default();

    if let Err(e) = ctx
        .configurator
        .configure_compass_runtime_agent(&kubeconfig, &compass_runtime_id, global_account)
        .await
    {
        warn!(runtime_id = %compass_runtime_id, error = %e, "failed to configure compass runtime agent");
        view.set_mapping_status(&key, true, false).await;
        return Err(if matches!(e, Error::Configuration(_) | Error::Director(_)) {
            e
        } else {
            Error::configuration(e.to_string())
        });
    }

    view.set_mapping_status(&key, true, true).await;
    info!(runtime_id = %compass_runtime_id, "compass runtime agent configured");
    Ok(Action::await_change())
}

/// Deregister the runtime of a Kyma that no longer exists
///
/// The mapping is deleted only after Compass confirmed the deregistration,
/// so a failed attempt keeps the runtime ID for the next try.
async fn handle_kyma_deletion(
    key: &ObjectKey,
    view: &mut ClusterView<'_>,
    ctx: &Context,
) -> Result<Action, Error> {
    let Some(mapping) = view.get_mapping(key).await? else {
        info!("no mapping found, nothing to deregister");
        return Ok(Action::await_change());
    };

    let runtime_id = mapping.compass_runtime_id().to_string();
    if runtime_id.is_empty() {
        info!("runtime was never registered in compass, nothing to deregister");
        return Ok(Action::await_change());
    }

    let global_account = mapping.global_account_id().to_string();
    if global_account.is_empty() {
        warn!(runtime_id = %runtime_id, "mapping carries no global account");
    }

    info!(runtime_id = %runtime_id, "deregistering runtime from compass");
    match ctx
        .registrant
        .deregister_from_compass(&runtime_id, &global_account)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_director() => {
            warn!(runtime_id = %runtime_id, error = %e, "failed to deregister runtime from compass");
            return Ok(Action::requeue(ctx.requeue_interval));
        }
        Err(e) => return Err(e),
    }

    view.delete_mapping(key).await?;
    info!(runtime_id = %runtime_id, "runtime deregistered from compass");
    Ok(Action::await_change())
}

/// Decide when to retry a failed reconcile
///
/// Collaborator failures come back after the regular requeue interval,
/// anything else (storage hiccups mostly) after [`ERROR_REQUEUE`].
pub fn error_policy(key: &ObjectKey, error: &Error, ctx: &Context) -> Action {
    error!(?error, kyma = %key, "reconciliation failed");

    match error {
        Error::Director(_) | Error::Configuration(_) => Action::requeue(ctx.requeue_interval),
        _ => Action::requeue(ERROR_REQUEUE),
    }
}
