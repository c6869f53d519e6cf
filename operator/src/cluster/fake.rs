//! In-memory [`ClusterClient`] used by the unit and scenario tests.
//!
//! It behaves like a small API server: every write bumps the object's
//! `resourceVersion`, replaces carrying a stale version fail with 409, a
//! taint patch whose expected list no longer matches fails with 409, and
//! missing objects answer 404. Evictions can be scripted to be throttled
//! (429), to fail (500) or to be accepted without the pod ever going away.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::{
    coordination::v1::Lease,
    core::v1::{Node, Pod, Taint},
    policy::v1::PodDisruptionBudget,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{core::ErrorResponse, ResourceExt};
use node_maintenance_types::NodeMaintenance;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::ClusterClient;

type Key = (String, String);

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    leases: BTreeMap<Key, Lease>,
    budgets: BTreeMap<Key, PodDisruptionBudget>,
    maintenances: BTreeMap<String, NodeMaintenance>,
    version: u64,
    eviction_unsupported: bool,
    discovery_unavailable: bool,
    stuck_pods: BTreeSet<Key>,
    throttled_evictions: BTreeMap<Key, usize>,
    rejected_evictions: BTreeSet<Key>,
    lease_write_conflicts: usize,
    racing_leases: Vec<Lease>,
    writes: Vec<String>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// An API server in a mutex.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: message.into(),
        reason: reason.to_owned(),
        code,
    })
}

fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, name))
}

fn conflict(kind: &str, name: &str) -> kube::Error {
    api_error(
        409,
        "Conflict",
        format!(
            "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
            kind, name
        ),
    )
}

fn key_of(obj: &impl ResourceExt) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn taints_of(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

impl FakeCluster {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, mut node: Node) {
        let mut state = self.lock();
        node.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(node.name_any(), node);
    }

    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.remove(name);
    }

    pub fn add_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        pod.metadata.resource_version = Some(state.next_version());
        state.pods.insert(key_of(&pod), pod);
    }

    pub fn add_lease(&self, mut lease: Lease) {
        let mut state = self.lock();
        lease.metadata.resource_version = Some(state.next_version());
        state.leases.insert(key_of(&lease), lease);
    }

    pub fn add_budget(&self, mut pdb: PodDisruptionBudget) {
        let mut state = self.lock();
        pdb.metadata.resource_version = Some(state.next_version());
        state.budgets.insert(key_of(&pdb), pdb);
    }

    pub fn add_maintenance(&self, mut nm: NodeMaintenance) -> NodeMaintenance {
        let mut state = self.lock();
        nm.metadata.resource_version = Some(state.next_version());
        if nm.metadata.uid.is_none() {
            nm.metadata.uid = Some(format!("uid-{}", nm.name_any()));
        }
        state.maintenances.insert(nm.name_any(), nm.clone());
        nm
    }

    /// Marks a maintenance as deleted, as the API server does when the
    /// object still carries finalizers.
    pub fn mark_maintenance_deleted(&self, name: &str) -> NodeMaintenance {
        let mut state = self.lock();
        let version = state.next_version();
        let nm = state.maintenances.get_mut(name).unwrap();
        nm.metadata.deletion_timestamp = Some(Time(Utc::now()));
        nm.metadata.resource_version = Some(version);
        nm.clone()
    }

    /// Overwrites the node's taints behind the controller's back.
    pub fn set_node_taints(&self, name: &str, taints: Vec<Taint>) {
        let mut state = self.lock();
        let version = state.next_version();
        let node = state.nodes.get_mut(name).unwrap();
        node.spec.get_or_insert_with(Default::default).taints = Some(taints);
        node.metadata.resource_version = Some(version);
    }

    pub fn disable_eviction(&self) {
        self.lock().eviction_unsupported = true;
    }

    /// API discovery answers 503.
    pub fn break_discovery(&self) {
        self.lock().discovery_unavailable = true;
    }

    /// Evictions of this pod succeed but the pod never disappears.
    pub fn make_pod_stuck(&self, namespace: &str, name: &str) {
        self.lock()
            .stuck_pods
            .insert((namespace.to_owned(), name.to_owned()));
    }

    /// The next `times` evictions of this pod answer 429.
    pub fn throttle_eviction(&self, namespace: &str, name: &str, times: usize) {
        self.lock()
            .throttled_evictions
            .insert((namespace.to_owned(), name.to_owned()), times);
    }

    /// Every eviction of this pod answers 500.
    pub fn reject_eviction(&self, namespace: &str, name: &str) {
        self.lock()
            .rejected_evictions
            .insert((namespace.to_owned(), name.to_owned()));
    }

    /// The next `times` lease replaces fail with 409.
    pub fn fail_lease_writes(&self, times: usize) {
        self.lock().lease_write_conflicts = times;
    }

    /// Another writer creates this lease right before our next create.
    pub fn race_lease_creation(&self, lease: Lease) {
        self.lock().racing_leases.push(lease);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn node_taints(&self, name: &str) -> Vec<Taint> {
        self.node(name).map(|n| taints_of(&n)).unwrap_or_default()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn pod_exists(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .pods
            .contains_key(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn maintenance(&self, name: &str) -> Option<NodeMaintenance> {
        self.lock().maintenances.get(name).cloned()
    }

    /// Every write performed so far, e.g. `replace lease node-maintenance/worker-0`.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn writes_matching(&self, prefix: &str) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|w| w.starts_with(prefix))
            .collect()
    }

    fn remove_pod(state: &mut State, key: &Key) {
        if state.stuck_pods.contains(key) {
            let version = state.next_version();
            if let Some(pod) = state.pods.get_mut(key) {
                pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
                pod.metadata.resource_version = Some(version);
            }
        } else {
            state.pods.remove(key);
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.node(name).ok_or_else(|| not_found("nodes", name))
    }

    async fn patch_node_taints(&self, node: &Node, desired: &[Taint]) -> Result<Node, kube::Error> {
        let mut state = self.lock();
        let name = node.name_any();
        let version = state.next_version();
        let stored = state
            .nodes
            .get_mut(&name)
            .ok_or_else(|| not_found("nodes", &name))?;
        if taints_of(stored) != taints_of(node) {
            return Err(conflict("nodes", &name));
        }
        stored.spec.get_or_insert_with(Default::default).taints = Some(desired.to_vec());
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.writes.push(format!("patch taints {}", name));
        Ok(updated)
    }

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<Node, kube::Error> {
        let mut state = self.lock();
        let version = state.next_version();
        let stored = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| not_found("nodes", name))?;
        stored.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state
            .writes
            .push(format!("set unschedulable={} {}", unschedulable, name));
        Ok(updated)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, kube::Error> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        self.lock()
            .pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| not_found("pods", name))
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.lock();
        let key = (namespace.to_owned(), name.to_owned());
        if !state.pods.contains_key(&key) {
            return Err(not_found("pods", name));
        }
        if state.rejected_evictions.contains(&key) {
            return Err(api_error(500, "InternalError", "eviction rejected"));
        }
        if let Some(remaining) = state.throttled_evictions.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(api_error(
                    429,
                    "TooManyRequests",
                    "Cannot evict pod as it would violate the pod's disruption budget.",
                ));
            }
        }
        Self::remove_pod(&mut state, &key);
        state.writes.push(format!("evict pod {}/{}", namespace, name));
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.lock();
        let key = (namespace.to_owned(), name.to_owned());
        if !state.pods.contains_key(&key) {
            return Err(not_found("pods", name));
        }
        Self::remove_pod(&mut state, &key);
        state.writes.push(format!("delete pod {}/{}", namespace, name));
        Ok(())
    }

    async fn eviction_supported(&self) -> Result<bool, kube::Error> {
        let state = self.lock();
        if state.discovery_unavailable {
            return Err(api_error(
                503,
                "ServiceUnavailable",
                "the server is currently unable to handle the request",
            ));
        }
        Ok(!state.eviction_unsupported)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error> {
        self.lease(namespace, name)
            .ok_or_else(|| not_found("leases.coordination.k8s.io", name))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        let mut state = self.lock();
        let key = key_of(lease);
        for mut racing in std::mem::take(&mut state.racing_leases) {
            racing.metadata.resource_version = Some(state.next_version());
            state.leases.insert(key_of(&racing), racing);
        }
        if state.leases.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("leases.coordination.k8s.io \"{}\" already exists", key.1),
            ));
        }
        let mut created = lease.clone();
        created.metadata.resource_version = Some(state.next_version());
        state.leases.insert(key.clone(), created.clone());
        state
            .writes
            .push(format!("create lease {}/{}", key.0, key.1));
        Ok(created)
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        let mut state = self.lock();
        let key = key_of(lease);
        let stored = state
            .leases
            .get(&key)
            .ok_or_else(|| not_found("leases.coordination.k8s.io", &key.1))?;
        if state.lease_write_conflicts > 0 {
            state.lease_write_conflicts -= 1;
            return Err(conflict("leases.coordination.k8s.io", &key.1));
        }
        if stored.metadata.resource_version != lease.metadata.resource_version {
            return Err(conflict("leases.coordination.k8s.io", &key.1));
        }
        let mut replaced = lease.clone();
        replaced.metadata.resource_version = Some(state.next_version());
        state.leases.insert(key.clone(), replaced.clone());
        state
            .writes
            .push(format!("replace lease {}/{}", key.0, key.1));
        Ok(replaced)
    }

    async fn get_disruption_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodDisruptionBudget, kube::Error> {
        self.lock()
            .budgets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| not_found("poddisruptionbudgets.policy", name))
    }

    async fn list_maintenances(&self) -> Result<Vec<NodeMaintenance>, kube::Error> {
        Ok(self.lock().maintenances.values().cloned().collect())
    }

    async fn get_maintenance(&self, name: &str) -> Result<NodeMaintenance, kube::Error> {
        self.maintenance(name)
            .ok_or_else(|| not_found("nodemaintenances.nodemaintenance.kubevirt.io", name))
    }

    async fn replace_maintenance(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error> {
        let mut state = self.lock();
        let name = instance.name_any();
        let kind = "nodemaintenances.nodemaintenance.kubevirt.io";
        let stored = state
            .maintenances
            .get(&name)
            .cloned()
            .ok_or_else(|| not_found(kind, &name))?;
        if stored.metadata.resource_version != instance.metadata.resource_version {
            return Err(conflict(kind, &name));
        }
        // The status subresource is not writable through the main resource.
        let mut replaced = instance.clone();
        replaced.status = stored.status;
        replaced.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        replaced.metadata.resource_version = Some(state.next_version());
        state.writes.push(format!("replace maintenance {}", name));
        let finalized = replaced.metadata.deletion_timestamp.is_some()
            && replaced.finalizers().is_empty();
        if finalized {
            state.maintenances.remove(&name);
        } else {
            state.maintenances.insert(name, replaced.clone());
        }
        Ok(replaced)
    }

    async fn replace_maintenance_status(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error> {
        let mut state = self.lock();
        let name = instance.name_any();
        let kind = "nodemaintenances.nodemaintenance.kubevirt.io";
        let mut stored = state
            .maintenances
            .get(&name)
            .cloned()
            .ok_or_else(|| not_found(kind, &name))?;
        if stored.metadata.resource_version != instance.metadata.resource_version {
            return Err(conflict(kind, &name));
        }
        stored.status = instance.status.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.maintenances.insert(name.clone(), stored.clone());
        state
            .writes
            .push(format!("replace maintenance status {}", name));
        Ok(stored)
    }
}
