//! The narrow slice of the Kubernetes API the maintenance controller uses.
//!
//! Every component talks to the cluster through [`ClusterClient`] so the
//! reconcile logic can run against the real API server in production and
//! against an in-memory cluster in tests. Errors stay [`kube::Error`] so
//! callers can tell "not found", "conflict" and "throttled" apart by their
//! HTTP status, exactly as they would with a plain `kube::Api`.

use async_trait::async_trait;
use k8s_openapi::api::{
    coordination::v1::Lease,
    core::v1::{Node, Pod, Taint},
    policy::v1::PodDisruptionBudget,
};
use node_maintenance_types::NodeMaintenance;

mod kube_cluster;

#[cfg(test)]
pub mod fake;

pub use kube_cluster::KubeCluster;

/// Cluster operations needed to put a node into maintenance.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a node by name.
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;

    /// Replaces the node's taints with `desired`, but only if they still
    /// match the taints of `node`. A concurrent change makes the write fail.
    async fn patch_node_taints(&self, node: &Node, desired: &[Taint])
        -> Result<Node, kube::Error>;

    /// Sets `spec.unschedulable` on the node.
    async fn set_unschedulable(&self, name: &str, unschedulable: bool)
        -> Result<Node, kube::Error>;

    /// Lists every pod bound to the node.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, kube::Error>;

    /// Fetches a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;

    /// Requests a graceful eviction of the pod. A disruption budget that
    /// can't afford the eviction answers with 429.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Deletes the pod without consulting disruption budgets.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Returns true if the API server serves the `pods/eviction` subresource.
    async fn eviction_supported(&self) -> Result<bool, kube::Error>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error>;

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error>;

    /// Replaces the lease. The write is conditional on the lease's
    /// `resourceVersion`, so a stale copy is rejected with 409.
    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error>;

    async fn get_disruption_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodDisruptionBudget, kube::Error>;

    async fn list_maintenances(&self) -> Result<Vec<NodeMaintenance>, kube::Error>;

    async fn get_maintenance(&self, name: &str) -> Result<NodeMaintenance, kube::Error>;

    /// Replaces metadata and spec (finalizers, owner references).
    async fn replace_maintenance(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error>;

    /// Replaces the status subresource.
    async fn replace_maintenance_status(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error>;
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// The object does not exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    api_code(err) == Some(404)
}

/// Optimistic concurrency failure, or a create that lost a race.
pub fn is_conflict(err: &kube::Error) -> bool {
    api_code(err) == Some(409)
}

/// A create found the object already there.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// The request was throttled, e.g. an eviction blocked by a disruption budget.
pub fn is_too_many_requests(err: &kube::Error) -> bool {
    api_code(err) == Some(429)
}

/// The request was rejected as invalid, which is how a failed JSON patch
/// `test` operation is reported.
pub fn is_invalid(err: &kube::Error) -> bool {
    api_code(err) == Some(422)
}
