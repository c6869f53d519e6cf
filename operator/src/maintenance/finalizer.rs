use node_maintenance_types::*;

use crate::cluster::ClusterClient;
use crate::util::{contains_string, remove_string, Error};

/// Adds the finalizer to a `NodeMaintenance` resource. If the finalizer
/// already exists, this action has no effect.
///
/// # Arguments:
/// - `cluster` - cluster to modify the `NodeMaintenance` resource in.
/// - `instance` - the latest copy of the resource.
pub async fn add(
    cluster: &dyn ClusterClient,
    instance: &NodeMaintenance,
) -> Result<NodeMaintenance, Error> {
    let finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
    if contains_string(&finalizers, FINALIZER_NAME) {
        return Ok(instance.clone());
    }
    let mut instance = instance.clone();
    instance
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER_NAME.to_owned());
    Ok(cluster.replace_maintenance(&instance).await?)
}

/// Removes our finalizer from a `NodeMaintenance` resource, leaving any
/// other finalizer in place. Once no finalizers remain the API server
/// completes the deletion.
pub async fn delete(
    cluster: &dyn ClusterClient,
    instance: &NodeMaintenance,
) -> Result<NodeMaintenance, Error> {
    let mut instance = instance.clone();
    let finalizers = instance.metadata.finalizers.take().unwrap_or_default();
    instance.metadata.finalizers = Some(remove_string(&finalizers, FINALIZER_NAME));
    Ok(cluster.replace_maintenance(&instance).await?)
}
