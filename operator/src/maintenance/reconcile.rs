use chrono::Utc;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::ListParams, client::Client, runtime::controller::Action, runtime::Controller, Api,
    Resource, ResourceExt,
};
use node_maintenance_types::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "metrics")]
use super::metrics::{
    DRAIN_DURATION_HISTOGRAM, MAINTENANCE_ACTION_COUNTER, MAINTENANCE_OUTCOME_COUNTER,
    MAINTENANCE_RECONCILE_COUNTER, MAINTENANCE_WRITE_HISTOGRAM,
};

use super::{actions, finalizer};
use crate::cluster::{is_not_found, ClusterClient, KubeCluster};
use crate::config::Config;
use crate::drain::{DrainError, Drainer};
use crate::lease::{LeaseManager, OwnershipRegistry};
use crate::quorum;
use crate::taint;
use crate::util::{contains_string, messages, Error, MAX_OWNED_LEASE_ERRORS};

/// First delay of the error backoff.
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Longest delay of the error backoff.
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Entrypoint for the `NodeMaintenance` controller.
pub async fn run(client: Client, config: Config) -> Result<(), Error> {
    info!(?config, "Starting NodeMaintenance controller...");

    // Preparation of resources used by the `kube_runtime::Controller`
    let crd_api: Api<NodeMaintenance> = Api::all(client.clone());
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client));
    let context: Arc<ContextData> = Arc::new(ContextData::new(cluster, config));

    // The controller comes from the `kube_runtime` crate and manages the reconciliation process.
    // It requires the following information:
    // - `kube::Api<T>` this controller "owns". In this case, `T = NodeMaintenance`,
    // - `kube::api::ListParams` to select the `NodeMaintenance` resources with,
    // - `reconcile` function with reconciliation logic to be called each time a resource of `NodeMaintenance` kind is created/updated/deleted,
    // - `on_error` function to call whenever reconciliation fails.
    Controller::new(crd_api, ListParams::default())
        .run(reconcile, on_error, context)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok((object, _action)) => debug!(name = %object.name, "reconciled"),
                Err(reconciliation_err) => {
                    warn!(error = %reconciliation_err, "reconciliation error")
                }
            }
        })
        .await;
    Ok(())
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub struct ContextData {
    /// Cluster to read nodes, pods and leases from and to write changes to.
    cluster: Arc<dyn ClusterClient>,

    config: Config,

    leases: LeaseManager,

    drainer: Drainer,

    /// Nodes whose lease this process has held since their maintenance started.
    registry: OwnershipRegistry,

    /// Consecutive failed reconciliations per `NodeMaintenance`, driving the
    /// error backoff.
    failures: Mutex<HashMap<String, u32>>,
}

impl ContextData {
    /// Constructs a new instance of ContextData.
    ///
    /// # Arguments:
    /// - `cluster`: The cluster the maintenance happens in.
    /// - `config`: Lease, drain and quorum settings.
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Config) -> Self {
        let leases = LeaseManager::new(
            cluster.clone(),
            config.lease_namespace.clone(),
            config.holder_identity.clone(),
            config.lease_duration,
            config.drain_timeout,
        );
        let drainer = Drainer::new(cluster.clone(), config.drain_timeout);
        ContextData {
            cluster,
            config,
            leases,
            drainer,
            registry: OwnershipRegistry::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    /// Counts a failed reconciliation and returns how long to wait before
    /// the next attempt.
    fn next_backoff(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(name.to_owned()).or_insert(0);
        let delay = ERROR_BACKOFF_BASE.saturating_mul(1 << (*count).min(16));
        *count = count.saturating_add(1);
        delay.min(ERROR_BACKOFF_MAX)
    }

    fn forget_failures(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// Action to be taken upon a `NodeMaintenance` resource during reconciliation
#[derive(Debug, PartialEq)]
enum MaintenanceAction {
    /// Adds the finalizer, then proceeds with the maintenance.
    AddFinalizer,

    /// The resource is being deleted: take the node out of maintenance and
    /// remove the finalizer.
    Cleanup,

    /// Put the node into maintenance, or keep it there.
    Maintain,

    /// The resource is being deleted and holds none of our finalizers.
    NoOp,
}

impl From<&MaintenanceAction> for &'static str {
    fn from(action: &MaintenanceAction) -> Self {
        match action {
            MaintenanceAction::AddFinalizer => "AddFinalizer",
            MaintenanceAction::Cleanup => "Cleanup",
            MaintenanceAction::Maintain => "Maintain",
            MaintenanceAction::NoOp => "NoOp",
        }
    }
}

fn has_finalizer(instance: &NodeMaintenance) -> bool {
    contains_string(instance.finalizers(), FINALIZER_NAME)
}

/// Resources arrive into the reconciliation queue in a certain state. This
/// function looks at the state of the given `NodeMaintenance` resource and
/// decides which action needs to be performed.
fn determine_action(instance: &NodeMaintenance) -> MaintenanceAction {
    if instance.meta().deletion_timestamp.is_some() {
        return if has_finalizer(instance) {
            MaintenanceAction::Cleanup
        } else {
            MaintenanceAction::NoOp
        };
    }
    if !has_finalizer(instance) {
        return MaintenanceAction::AddFinalizer;
    }
    MaintenanceAction::Maintain
}

/// Reconciliation function for the `NodeMaintenance` resource.
pub(crate) async fn reconcile(
    instance: Arc<NodeMaintenance>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    MAINTENANCE_RECONCILE_COUNTER
        .with_label_values(&[&name])
        .inc();

    // The cached copy may be stale and status writes need the latest
    // resource version.
    let instance = match context.cluster.get_maintenance(&name).await {
        Ok(instance) => instance,
        Err(e) if is_not_found(&e) => {
            debug!(%name, "NodeMaintenance is gone, nothing to do");
            context.forget_failures(&name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let action = determine_action(&instance);

    if action != MaintenanceAction::NoOp {
        info!(%name, ?action, "ACTION");
    }

    #[cfg(feature = "metrics")]
    MAINTENANCE_ACTION_COUNTER
        .with_label_values(&[&name, (&action).into()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = MAINTENANCE_WRITE_HISTOGRAM
        .with_label_values(&[&name, (&action).into()])
        .start_timer();

    // Performs action as decided by the `determine_action` function.
    // This is the write phase of reconciliation.
    let result = match action {
        MaintenanceAction::AddFinalizer => {
            match finalizer::add(context.cluster.as_ref(), &instance).await {
                Ok(instance) => maintain(&context, instance).await,
                Err(e) => fail(&context, instance, e, None).await,
            }
        }
        MaintenanceAction::Cleanup => cleanup(&context, instance).await,
        MaintenanceAction::Maintain => maintain(&context, instance).await,
        // Nothing left to clean up and no reason to look again.
        MaintenanceAction::NoOp => Ok(Action::await_change()),
    };

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    if result.is_ok() {
        context.forget_failures(&name);
    }
    result
}

/// Puts the node into maintenance and keeps it there, renewing the lease.
#[instrument(skip_all, fields(name = %instance.name_any(), node = %instance.spec.node_name))]
async fn maintain(context: &ContextData, mut instance: NodeMaintenance) -> Result<Action, Error> {
    let cluster = context.cluster.as_ref();
    let node_name = instance.spec.node_name.clone();
    if node_name.is_empty() {
        let error = Error::UserInputError("spec.nodeName must not be empty".to_owned());
        return fail(context, instance, error, None).await;
    }

    let node = match cluster.get_node(&node_name).await {
        Ok(node) => node,
        Err(e) if is_not_found(&e) => {
            warn!("node cannot be found");
            return fail(context, instance, Error::NodeNotFound(node_name), None).await;
        }
        Err(e) => return fail(context, instance, e.into(), None).await,
    };

    let ownership = context.registry.entry(&node_name);
    {
        let mut state = ownership.state.lock().await;
        let now = Utc::now();
        match context.leases.acquire_or_renew(&node, now).await {
            Ok(_) => state.owned = true,
            Err(e) => {
                let previously_owned = state.owned
                    || matches!(
                        instance.phase(),
                        Some(MaintenancePhase::Running) | Some(MaintenancePhase::Succeeded)
                    );
                drop(state);
                return lease_failure(context, instance, &node, e, previously_owned).await;
            }
        }
    }

    match advance(context, &mut instance, &node).await {
        Ok(()) => {}
        Err(
            e @ Error::Drain {
                source: DrainError::Timeout(_) | DrainError::Aggregate(_),
            },
        ) => {
            info!(error = %e, "not all pods evicted");
            let requeue = context.config.drain_error_requeue;
            return fail(context, instance, e, Some(requeue)).await;
        }
        Err(e) => return fail(context, instance, e, None).await,
    }

    info!("all pods evicted");
    let succeeded = actions::update_status(cluster, &instance, |status| {
        status.phase = Some(MaintenancePhase::Succeeded);
        status.pending_pods.clear();
        status.last_error = None;
    })
    .await;
    if let Err(e) = succeeded {
        return fail(context, instance, e, None).await;
    }

    #[cfg(feature = "metrics")]
    MAINTENANCE_OUTCOME_COUNTER
        .with_label_values(&[&instance.name_any(), "Succeeded"])
        .inc();

    // Look again before the lease needs renewing.
    Ok(Action::requeue(context.config.renewal_interval()))
}

/// Steps taken once the lease is ours: record the start, reference the
/// node, check the quorum, taint and drain.
async fn advance(
    context: &ContextData,
    instance: &mut NodeMaintenance,
    node: &Node,
) -> Result<(), Error> {
    let cluster = context.cluster.as_ref();
    match instance.phase() {
        None => *instance = actions::start(cluster, instance).await?,
        phase if phase == Some(MaintenancePhase::Failed) || lease_errors(instance) != 0 => {
            *instance = actions::update_status(cluster, instance, |status| {
                if status.phase == Some(MaintenancePhase::Failed) {
                    status.phase = Some(MaintenancePhase::Running);
                }
                status.error_on_lease_count = 0;
            })
            .await?
        }
        _ => {}
    }

    *instance = actions::add_owner_reference(cluster, instance, node).await?;

    // Once the node carries the taints the quorum was already checked and
    // its own members may have left.
    if !taint::is_marked(node)
        && !quorum::may_drain(cluster, node, context.config.quorum_policy).await?
    {
        return Err(Error::QuorumViolation(node.name_any()));
    }

    taint::set_maintenance_marking(cluster, node, true).await?;

    #[cfg(feature = "metrics")]
    let timer = DRAIN_DURATION_HISTOGRAM
        .with_label_values(&[&node.name_any()])
        .start_timer();

    let drained = context.drainer.drain(&node.name_any()).await;

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    Ok(drained?)
}

fn lease_errors(instance: &NodeMaintenance) -> usize {
    instance
        .status
        .as_ref()
        .map_or(0, |status| status.error_on_lease_count)
}

/// Handles a failed attempt to acquire or renew the node's lease.
async fn lease_failure(
    context: &ContextData,
    mut instance: NodeMaintenance,
    node: &Node,
    error: Error,
    previously_owned: bool,
) -> Result<Action, Error> {
    match error {
        Error::LeaseHeldByOther { .. } if previously_owned => {
            // Another controller holds the node now. Its change of
            // leadership will bring us back here.
            match abort_maintenance(context, &instance, node, &error).await {
                Ok(()) => Ok(Action::await_change()),
                Err(e) => fail(context, instance, e, None).await,
            }
        }
        error if error.ownership_failed() => {
            let status = instance.mut_status();
            status.error_on_lease_count += 1;
            let count = status.error_on_lease_count;
            if count > MAX_OWNED_LEASE_ERRORS {
                warn!(count, "can't extend owned lease, uncordoning for now");
                return match abort_maintenance(context, &instance, node, &error).await {
                    Ok(()) => Err(error),
                    Err(e) => fail(context, instance, e, None).await,
                };
            }
            fail(context, instance, error, None).await
        }
        error => {
            instance.mut_status().error_on_lease_count = 0;
            fail(context, instance, error, None).await
        }
    }
}

/// Gives up on the node: removes the taints, uncordons it, forgets our
/// ownership and marks the request `Failed`. The lease is left alone, it
/// is not ours to clear.
async fn abort_maintenance(
    context: &ContextData,
    instance: &NodeMaintenance,
    node: &Node,
    error: &Error,
) -> Result<(), Error> {
    let cluster = context.cluster.as_ref();
    warn!(error = %error, "{}", messages::LEASE_LOST);
    taint::set_maintenance_marking(cluster, node, false).await?;
    context.registry.release(&node.name_any());
    let message = format!("{}: {}", messages::LEASE_LOST, error);
    actions::update_status(cluster, instance, |status| {
        status.phase = Some(MaintenancePhase::Failed);
        status.last_error = Some(message);
    })
    .await?;

    #[cfg(feature = "metrics")]
    MAINTENANCE_OUTCOME_COUNTER
        .with_label_values(&[&instance.name_any(), "Failed"])
        .inc();

    Ok(())
}

/// Takes the node out of maintenance and lets the resource go.
#[instrument(skip_all, fields(name = %instance.name_any(), node = %instance.spec.node_name))]
async fn cleanup(context: &ContextData, instance: NodeMaintenance) -> Result<Action, Error> {
    let cluster = context.cluster.as_ref();
    let node_name = instance.spec.node_name.clone();
    if !node_name.is_empty() {
        if let Err(e) =
            actions::stop_maintenance_on_deletion(cluster, &context.leases, &node_name).await
        {
            return fail(context, instance, e, None).await;
        }
        context.registry.release(&node_name);
    }
    if let Err(e) = finalizer::delete(cluster, &instance).await {
        return fail(context, instance, e, None).await;
    }
    info!("maintenance ended");

    // No need to requeue as the resource is being deleted.
    Ok(Action::await_change())
}

/// Records a failed reconciliation in the status, together with the pods
/// still on the node. With a fixed `requeue` the request is looked at again
/// after that long; otherwise the error goes to `on_error` and the
/// exponential backoff.
async fn fail(
    context: &ContextData,
    instance: NodeMaintenance,
    error: Error,
    requeue: Option<Duration>,
) -> Result<Action, Error> {
    let node_name = &instance.spec.node_name;
    let pending = if node_name.is_empty() {
        None
    } else {
        actions::pending_snapshot(&context.drainer, node_name).await
    };
    let message = error.to_string();
    let recorded = actions::update_status(context.cluster.as_ref(), &instance, |status| {
        status.last_error = Some(message);
        if let Some(pending) = pending {
            status.pending_pods = pending;
        }
    })
    .await;
    if let Err(e) = recorded {
        warn!(name = %instance.name_any(), error = %e, "failed to record error in status");
    }

    #[cfg(feature = "metrics")]
    MAINTENANCE_OUTCOME_COUNTER
        .with_label_values(&[&instance.name_any(), "Error"])
        .inc();

    match requeue {
        Some(after) => {
            info!(name = %instance.name_any(), ?after, "{}", messages::FIXED_DURATION_REQUEUE);
            Ok(Action::requeue(after))
        }
        None => {
            info!(name = %instance.name_any(), "{}", messages::EXPONENTIAL_REQUEUE);
            Err(error)
        }
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Logs the error and requeues the resource with a delay that doubles with
/// every consecutive failure.
///
/// # Arguments
/// - `instance`: The erroneous resource.
/// - `error`: A reference to the `Error` that occurred during reconciliation.
/// - `context`: Holds the failure counts.
pub(crate) fn on_error(
    instance: Arc<NodeMaintenance>,
    error: &Error,
    context: Arc<ContextData>,
) -> Action {
    let name = instance.name_any();
    let delay = context.next_backoff(&name);
    warn!(%name, error = %error, retry_in = ?delay, "reconciliation failed");
    Action::requeue(delay)
}
