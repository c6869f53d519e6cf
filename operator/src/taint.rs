use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::{is_conflict, is_invalid, ClusterClient};
use crate::util::Error;

/// Taint key the scheduler itself uses for cordoned nodes.
pub const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";

/// Taint key telling other controllers the node is being drained.
pub const DRAIN_TAINT_KEY: &str = "kubevirt.io/drain";

const NO_SCHEDULE: &str = "NoSchedule";

/// Number of times the taint patch is recomputed after losing a race
/// with another writer.
const MAX_TAINT_ATTEMPTS: usize = 5;

/// The taints carried by a node in maintenance, in the order they are applied.
pub fn maintenance_taints() -> Vec<Taint> {
    [UNSCHEDULABLE_TAINT_KEY, DRAIN_TAINT_KEY]
        .into_iter()
        .map(|key| Taint {
            key: key.to_owned(),
            effect: NO_SCHEDULE.to_owned(),
            ..Default::default()
        })
        .collect()
}

fn same_taint(a: &Taint, b: &Taint) -> bool {
    a.key == b.key && a.effect == b.effect
}

fn node_taints(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.clone())
        .unwrap_or_default()
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Computes the taint list a node should carry, or `None` if `existing`
/// is already right. Enabling puts the maintenance taints in front of
/// every unrelated taint; disabling drops them. Taints are matched by
/// key and effect only.
pub fn desired_taints(existing: &[Taint], enabled: bool) -> Option<Vec<Taint>> {
    let markers = maintenance_taints();
    let unrelated = existing
        .iter()
        .filter(|taint| !markers.iter().any(|m| same_taint(m, taint)))
        .cloned();
    let desired: Vec<Taint> = if enabled {
        markers.iter().cloned().chain(unrelated).collect()
    } else {
        unrelated.collect()
    };
    if desired.len() == existing.len() {
        None
    } else {
        Some(desired)
    }
}

/// Returns true if the node already carries every maintenance taint.
pub fn is_marked(node: &Node) -> bool {
    desired_taints(&node_taints(node), true).is_none()
}

/// Adds (or removes) the maintenance taints and cordons (or uncordons)
/// the node.
///
/// The taint write is conditional on the taints read from the node. When
/// another writer gets there first, the node is fetched again and the
/// desired list recomputed from the fresh copy.
///
/// # Arguments
/// - `client`: cluster to write to.
/// - `node`: the most recent copy of the node.
/// - `enabled`: true to put the node into maintenance, false to take it out.
pub async fn set_maintenance_marking(
    client: &dyn ClusterClient,
    node: &Node,
    enabled: bool,
) -> Result<(), Error> {
    let name = node.name_any();
    let mut node = node.clone();
    let mut attempt = 1;
    while let Some(desired) = desired_taints(&node_taints(&node), enabled) {
        match client.patch_node_taints(&node, &desired).await {
            Ok(updated) => {
                info!(node = %name, enabled, "updated maintenance taints");
                node = updated;
            }
            Err(e) if (is_conflict(&e) || is_invalid(&e)) && attempt < MAX_TAINT_ATTEMPTS => {
                debug!(node = %name, attempt, "taints changed concurrently, retrying");
                attempt += 1;
                node = client.get_node(&name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if is_unschedulable(&node) != enabled {
        client.set_unschedulable(&name, enabled).await?;
        info!(node = %name, unschedulable = enabled, "updated node schedulability");
    }
    Ok(())
}
