use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Finalizer that keeps a [`NodeMaintenance`] around until the node has
/// been uncordoned and its lease released.
pub const FINALIZER_NAME: &str = "foregroundDeleteNodeMaintenance";

/// [`NodeMaintenanceSpec`] is the request to put a single node into
/// maintenance. The controller cordons and taints the node, then evicts
/// every evictable pod from it. Deleting the resource reverses the
/// scheduling changes.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "nodemaintenance.kubevirt.io",
    version = "v1beta1",
    kind = "NodeMaintenance",
    plural = "nodemaintenances",
    shortname = "nm",
    derive = "PartialEq",
    status = "NodeMaintenanceStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.nodeName\", \"name\": \"NODE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastError\", \"name\": \"LAST ERROR\", \"type\": \"string\", \"priority\": 1 }"
)]
pub struct NodeMaintenanceSpec {
    /// Name of the [`Node`](k8s_openapi::api::core::v1::Node) to put
    /// into maintenance. Cannot be changed after creation.
    #[serde(rename = "nodeName")]
    pub node_name: String,

    /// Free-text reason for the maintenance, for humans only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Status object for the [`NodeMaintenance`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeMaintenanceStatus {
    /// Progress of the maintenance. Absent until the first reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MaintenancePhase>,

    /// Error of the most recent failed reconcile. Empty when healthy.
    #[serde(rename = "lastError", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Pods that are still waiting to be evicted, in `namespace/name` form.
    #[serde(rename = "pendingPods", default, skip_serializing_if = "Vec::is_empty")]
    pub pending_pods: Vec<String>,

    /// Number of pods on the node when maintenance started.
    #[serde(rename = "totalpods", default)]
    pub total_pods: usize,

    /// Number of pods that had to be evicted when maintenance started.
    #[serde(rename = "evictionPods", default)]
    pub eviction_pods: usize,

    /// Consecutive failures to renew a lease the controller already held.
    #[serde(rename = "errorOnLeaseCount", default)]
    pub error_on_lease_count: usize,
}

/// A short description of the [`NodeMaintenance`] resource's current state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MaintenancePhase {
    /// The node is cordoned and its pods are being evicted.
    Running,

    /// Every evictable pod has left the node.
    Succeeded,

    /// Maintenance was aborted, usually because the node's lease was lost.
    Failed,
}

impl FromStr for MaintenancePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(MaintenancePhase::Running),
            "Succeeded" => Ok(MaintenancePhase::Succeeded),
            "Failed" => Ok(MaintenancePhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MaintenancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenancePhase::Running => write!(f, "Running"),
            MaintenancePhase::Succeeded => write!(f, "Succeeded"),
            MaintenancePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl NodeMaintenance {
    /// Returns the current phase, or `None` before the first reconcile.
    pub fn phase(&self) -> Option<MaintenancePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
