use k8s_openapi::{
    api::core::v1::Node, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};
use node_maintenance_types::*;
use tracing::{info, warn};

use crate::cluster::{is_not_found, ClusterClient};
use crate::drain::{pod_names, pods_for_deletion, Drainer};
use crate::lease::LeaseManager;
use crate::taint;
use crate::util::Error;

/// Writes the status of the `NodeMaintenance` after `f` has edited it.
/// Returns the resource as stored, with its new resource version.
pub async fn update_status(
    cluster: &dyn ClusterClient,
    instance: &NodeMaintenance,
    f: impl FnOnce(&mut NodeMaintenanceStatus),
) -> Result<NodeMaintenance, Error> {
    let mut instance = instance.clone();
    f(instance.mut_status());
    Ok(cluster.replace_maintenance_status(&instance).await?)
}

/// Records the pods on the node as maintenance starts. The counts are
/// taken once and never updated afterwards.
pub async fn start(
    cluster: &dyn ClusterClient,
    instance: &NodeMaintenance,
) -> Result<NodeMaintenance, Error> {
    let pods = cluster.list_pods_on_node(&instance.spec.node_name).await?;
    let total = pods.len();
    let pending = pod_names(&pods_for_deletion(pods));
    info!(
        name = %instance.name_any(),
        node = %instance.spec.node_name,
        total_pods = total,
        eviction_pods = pending.len(),
        "starting maintenance"
    );
    update_status(cluster, instance, |status| {
        status.phase = Some(MaintenancePhase::Running);
        status.eviction_pods = pending.len();
        status.total_pods = total;
        status.pending_pods = pending;
        status.error_on_lease_count = 0;
    })
    .await
}

/// Adds a non-controlling owner reference to the node, unless an
/// identical one is already present.
pub async fn add_owner_reference(
    cluster: &dyn ClusterClient,
    instance: &NodeMaintenance,
    node: &Node,
) -> Result<NodeMaintenance, Error> {
    let reference = OwnerReference {
        api_version: Node::api_version(&()).into_owned(),
        kind: Node::kind(&()).into_owned(),
        name: node.name_any(),
        uid: node.uid().unwrap_or_default(),
        block_owner_deletion: Some(false),
        controller: Some(false),
    };
    let present = instance.owner_references().iter().any(|existing| {
        existing.api_version == reference.api_version
            && existing.kind == reference.kind
            && existing.name == reference.name
            && existing.uid == reference.uid
    });
    if present {
        return Ok(instance.clone());
    }
    info!(name = %instance.name_any(), node = %reference.name, "setting owner reference to node");
    let mut instance = instance.clone();
    instance
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(reference);
    Ok(cluster.replace_maintenance(&instance).await?)
}

/// Pods still on the node, for the status. Listing errors only cost the
/// snapshot, never the status write they accompany.
pub async fn pending_snapshot(drainer: &Drainer, node_name: &str) -> Option<Vec<String>> {
    match drainer.pending_pods(node_name).await {
        Ok(pending) => Some(pending),
        Err(e) => {
            warn!(node = %node_name, error = %e, "failed to list pending pods");
            None
        }
    }
}

/// Takes the node out of maintenance: removes the taints, uncordons it
/// and releases its lease.
pub async fn stop_maintenance(
    cluster: &dyn ClusterClient,
    leases: &LeaseManager,
    node: &Node,
) -> Result<(), Error> {
    taint::set_maintenance_marking(cluster, node, false).await?;
    leases.invalidate(&node.name_any()).await
}

/// Reverts the node when its `NodeMaintenance` is deleted. A node that
/// no longer exists only needs its lease released.
pub async fn stop_maintenance_on_deletion(
    cluster: &dyn ClusterClient,
    leases: &LeaseManager,
    node_name: &str,
) -> Result<(), Error> {
    match cluster.get_node(node_name).await {
        Ok(node) => stop_maintenance(cluster, leases, &node).await,
        Err(e) if is_not_found(&e) => {
            info!(node = %node_name, "node already gone, releasing lease only");
            leases.invalidate(node_name).await
        }
        Err(e) => Err(e.into()),
    }
}
