//! Admission checks for [`NodeMaintenance`] requests, independent of how
//! the admission review reaches the process.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use node_maintenance_types::NodeMaintenance;
use tracing::info;

use crate::cluster::{is_not_found, ClusterClient};
use crate::quorum::{is_control_plane, ETCD_QUORUM_PDB_NAME, ETCD_QUORUM_PDB_NAMESPACE};

/// Reasons a request is rejected at admission.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid nodeName, no node with name {0} found")]
    NodeNotExists(String),

    #[error("invalid nodeName, a NodeMaintenance for node {0} already exists")]
    NodeMaintenanceExists(String),

    #[error("updating spec.NodeName isn't allowed")]
    NodeNameUpdateForbidden,

    #[error("can not put master node into maintenance at this moment, it would violate the master quorum")]
    MasterQuorumViolation,

    /// The cluster could not be asked; the client should try again.
    #[error("could not {action}, please try again: {source}")]
    Unavailable {
        action: &'static str,
        #[source]
        source: kube::Error,
    },
}

async fn get_node(client: &dyn ClusterClient, name: &str) -> Result<Option<Node>, kube::Error> {
    match client.get_node(name).await {
        Ok(node) => Ok(Some(node)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Checks a request about to be created: the node exists, no other
/// request targets it, and a control-plane node can be spared. A request
/// that already exists is not counted against itself.
pub async fn validate_create(
    client: &dyn ClusterClient,
    instance: &NodeMaintenance,
) -> Result<(), ValidationError> {
    let node_name = &instance.spec.node_name;
    info!(name = %instance.name_any(), node = %node_name, "validating NodeMaintenance creation");

    let node = get_node(client, node_name)
        .await
        .map_err(|source| ValidationError::Unavailable {
            action: "get node for validating spec.NodeName",
            source,
        })?
        .ok_or_else(|| ValidationError::NodeNotExists(node_name.clone()))?;

    let existing = client
        .list_maintenances()
        .await
        .map_err(|source| ValidationError::Unavailable {
            action: "list NodeMaintenances for validating spec.NodeName",
            source,
        })?;
    let duplicate = existing
        .iter()
        .any(|nm| &nm.spec.node_name == node_name && nm.name_any() != instance.name_any());
    if duplicate {
        return Err(ValidationError::NodeMaintenanceExists(node_name.clone()));
    }

    if is_control_plane(&node) {
        match client
            .get_disruption_budget(ETCD_QUORUM_PDB_NAMESPACE, ETCD_QUORUM_PDB_NAME)
            .await
        {
            Ok(pdb) => {
                let allowed = pdb.status.map_or(0, |status| status.disruptions_allowed);
                if allowed == 0 {
                    return Err(ValidationError::MasterQuorumViolation);
                }
            }
            Err(e) if is_not_found(&e) => {
                info!("etcd-quorum-guard PDB not found, skipping master quorum validation")
            }
            Err(source) => {
                return Err(ValidationError::Unavailable {
                    action: "get etcd-quorum-guard PDB for master quorum validation",
                    source,
                })
            }
        }
    }
    Ok(())
}

/// Checks an update: the target node can't change.
pub fn validate_update(
    new: &NodeMaintenance,
    old: &NodeMaintenance,
) -> Result<(), ValidationError> {
    if new.spec.node_name != old.spec.node_name {
        return Err(ValidationError::NodeNameUpdateForbidden);
    }
    Ok(())
}

/// Runs the checks admission would run for `instance`. With
/// `previous_node` the request is treated as an update of one that
/// targeted that node, otherwise as a creation.
pub async fn validate(
    client: &dyn ClusterClient,
    instance: &NodeMaintenance,
    previous_node: Option<&str>,
) -> Result<(), ValidationError> {
    match previous_node {
        Some(previous) => {
            let mut old = instance.clone();
            old.spec.node_name = previous.to_owned();
            validate_update(instance, &old)
        }
        None => validate_create(client, instance).await,
    }
}
