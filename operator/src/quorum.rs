use k8s_openapi::{
    api::{core::v1::Node, policy::v1::PodDisruptionBudget},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::cluster::{is_not_found, ClusterClient};
use crate::util::Error;

/// Namespace of the disruption budget guarding the etcd quorum.
pub const ETCD_QUORUM_PDB_NAMESPACE: &str = "openshift-etcd";

/// Name of the disruption budget guarding the etcd quorum.
pub const ETCD_QUORUM_PDB_NAME: &str = "etcd-quorum-guard";

/// Role labels identifying control-plane nodes.
const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// How a missing quorum budget is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumPolicy {
    /// A missing budget means the guard isn't installed; draining is allowed.
    #[default]
    Lenient,

    /// The budget must exist and allow at least one more disruption.
    Strict,
}

/// Returns true if the node carries a control-plane role label.
pub fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| labels.contains_key(*label))
}

/// Resolves `minAvailable` to a pod count. Percentages are taken of the
/// expected pod count and rounded up.
fn min_available(pdb: &PodDisruptionBudget, expected_pods: i32) -> Option<i32> {
    match pdb.spec.as_ref()?.min_available.as_ref()? {
        IntOrString::Int(count) => Some(*count),
        IntOrString::String(value) => {
            let percent: i64 = value.trim_end_matches('%').parse().ok()?;
            let scaled = percent * i64::from(expected_pods);
            Some(((scaled + 99) / 100) as i32)
        }
    }
}

/// Returns true if one more healthy member can be taken away without
/// dropping below the budget's minimum.
pub fn budget_allows_drain(pdb: &PodDisruptionBudget) -> bool {
    let status = match pdb.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    match min_available(pdb, status.expected_pods) {
        Some(min) => {
            let disrupted = status
                .disrupted_pods
                .as_ref()
                .map_or(0, |pods| pods.len() as i32);
            min <= status.current_healthy - disrupted - 1
        }
        None => status.disruptions_allowed >= 1,
    }
}

/// Decides whether the node may be drained without breaking the etcd
/// quorum. Worker nodes are always allowed.
pub async fn may_drain(
    client: &dyn ClusterClient,
    node: &Node,
    policy: QuorumPolicy,
) -> Result<bool, Error> {
    if !is_control_plane(node) {
        return Ok(true);
    }
    let pdb = match client
        .get_disruption_budget(ETCD_QUORUM_PDB_NAMESPACE, ETCD_QUORUM_PDB_NAME)
        .await
    {
        Ok(pdb) => pdb,
        Err(e) if is_not_found(&e) => {
            return match policy {
                QuorumPolicy::Lenient => {
                    debug!(node = %node.name_any(), "etcd quorum guard not installed");
                    Ok(true)
                }
                QuorumPolicy::Strict => {
                    warn!(node = %node.name_any(), "etcd quorum guard required but missing");
                    Ok(false)
                }
            }
        }
        Err(e) => return Err(e.into()),
    };
    Ok(match policy {
        QuorumPolicy::Lenient => budget_allows_drain(&pdb),
        QuorumPolicy::Strict => pdb
            .status
            .as_ref()
            .map_or(false, |status| status.disruptions_allowed >= 1),
    })
}
