use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::{
    api::{
        coordination::v1::{Lease, LeaseSpec},
        core::v1::{Node, NodeSpec, Pod, PodSpec},
    },
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, runtime::controller::Action};
use node_maintenance_types::*;
use std::{collections::BTreeMap, sync::Arc};

use crate::cluster::fake::FakeCluster;
use crate::config::Config;
use crate::maintenance::{reconcile, ContextData};
use crate::taint::{DRAIN_TAINT_KEY, UNSCHEDULABLE_TAINT_KEY};

/// Node every scenario puts into maintenance.
pub const NODE_NAME: &str = "worker-0";

/// Name of the test NodeMaintenance resource.
pub const REQUEST_NAME: &str = "nm-worker-0";

/// Namespace of the pods placed on the test node.
pub const POD_NAMESPACE: &str = "default";

/// Holder identity of a controller competing for the node.
pub const OTHER_HOLDER: &str = "other-controller";

/// All errors possible to occur during testing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// A reconciliation that was expected to succeed failed.
    #[error("Reconciliation failed: {source}")]
    Reconcile {
        #[from]
        source: crate::util::Error,
    },

    #[error("Error: {0}")]
    Other(String),
}

/// A fake cluster and a controller context bound to it.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub context: Arc<ContextData>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let context = Arc::new(ContextData::new(cluster.clone(), config.clone()));
        Harness {
            cluster,
            context,
            config,
        }
    }

    /// Runs a single reconciliation of the test request, as the controller
    /// would after a watch event.
    pub async fn reconcile(&self) -> Result<Action, crate::util::Error> {
        let instance = self.cluster.maintenance(REQUEST_NAME).ok_or_else(|| {
            crate::util::Error::UserInputError(format!("{} does not exist", REQUEST_NAME))
        })?;
        reconcile(Arc::new(instance), self.context.clone()).await
    }

    /// Status of the test request, or an empty one if it has none yet.
    pub fn status(&self) -> NodeMaintenanceStatus {
        self.cluster
            .maintenance(REQUEST_NAME)
            .and_then(|nm| nm.status)
            .unwrap_or_default()
    }

    pub fn node_lease(&self) -> Option<Lease> {
        self.cluster.lease(&self.config.lease_namespace, NODE_NAME)
    }

    /// Returns true if the test node carries both maintenance taints and
    /// is cordoned.
    pub fn node_in_maintenance(&self) -> bool {
        let taints = self.cluster.node_taints(NODE_NAME);
        let tainted = [UNSCHEDULABLE_TAINT_KEY, DRAIN_TAINT_KEY]
            .iter()
            .all(|key| taints.iter().any(|t| t.key == *key));
        tainted && unschedulable(&self.cluster)
    }

    /// Returns true if the test node carries neither maintenance taint
    /// and is schedulable.
    pub fn node_released(&self) -> bool {
        let taints = self.cluster.node_taints(NODE_NAME);
        let untainted = !taints
            .iter()
            .any(|t| t.key == UNSCHEDULABLE_TAINT_KEY || t.key == DRAIN_TAINT_KEY);
        untainted && !unschedulable(&self.cluster)
    }
}

fn unschedulable(cluster: &FakeCluster) -> bool {
    cluster
        .node(NODE_NAME)
        .and_then(|node| node.spec)
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

pub fn worker_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            uid: Some(format!("uid-{}", name)),
            labels: Some(BTreeMap::from([(
                "kubernetes.io/hostname".to_owned(),
                name.to_owned(),
            )])),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        ..Default::default()
    }
}

pub fn master_node(name: &str) -> Node {
    let mut node = worker_node(name);
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert("node-role.kubernetes.io/master".to_owned(), String::new());
    node
}

pub fn test_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(POD_NAMESPACE.to_owned()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(NODE_NAME.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn terminating_pod(name: &str) -> Pod {
    let mut pod = test_pod(name);
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    pod
}

pub fn test_maintenance() -> NodeMaintenance {
    let mut nm = NodeMaintenance::new(
        REQUEST_NAME,
        NodeMaintenanceSpec {
            node_name: NODE_NAME.to_owned(),
            reason: Some("kernel upgrade".to_owned()),
        },
    );
    nm.metadata.uid = Some(format!("uid-{}", REQUEST_NAME));
    nm
}

/// A lease left behind by an earlier maintenance of ours: right holder,
/// no temporal fields.
pub fn placeholder_lease(config: &Config) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(NODE_NAME.to_owned()),
            namespace: Some(config.lease_namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.holder_identity.clone()),
            ..Default::default()
        }),
    }
}

/// A lease on the test node held by `holder`, renewed `age` ago.
pub fn lease_held_by(config: &Config, holder: &str, age: ChronoDuration) -> Lease {
    let renewed = Utc::now() - age;
    Lease {
        metadata: ObjectMeta {
            name: Some(NODE_NAME.to_owned()),
            namespace: Some(config.lease_namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_owned()),
            lease_duration_seconds: Some(3600),
            acquire_time: Some(MicroTime(renewed)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(1),
        }),
    }
}

/// Seeds a worker node, the test request and nothing else.
pub fn seed_worker(harness: &Harness) {
    harness.cluster.add_node(worker_node(NODE_NAME));
    harness.cluster.add_maintenance(test_maintenance());
}

/// Reconciles the request until it reports `Succeeded`.
pub async fn run_to_success(harness: &Harness) -> Result<(), Error> {
    for _ in 0..3 {
        harness.reconcile().await?;
        if harness.status().phase == Some(MaintenancePhase::Succeeded) {
            return Ok(());
        }
    }
    Err(Error::Other(format!(
        "maintenance did not succeed, status: {:?}",
        harness.status()
    )))
}
