use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::{sync::Arc, time::Duration};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::cluster::{is_not_found, is_too_many_requests, ClusterClient};

/// Wait between evictions refused because of a disruption budget.
pub const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Wait between checks whether an evicted pod is gone.
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Annotation the kubelet puts on mirror pods of static manifests.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Errors possible while draining a node.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("drain did not complete within {0:?}")]
    Timeout(Duration),

    #[error("error when evicting pod {pod}: {source}")]
    Evict {
        pod: String,
        #[source]
        source: kube::Error,
    },

    #[error("error when waiting for pod {pod} to terminate: {source}")]
    Wait {
        pod: String,
        #[source]
        source: kube::Error,
    },

    #[error("pod removal task failed: {0}")]
    Task(#[from] JoinError),

    /// One error per pod that could not be removed.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<DrainError>),

    #[error("Kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),
}

fn join_errors(errors: &[DrainError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet")
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
}

/// Pods that only go away together with the node itself.
fn is_removable(pod: &Pod) -> bool {
    !is_daemon_set_pod(pod) && !is_mirror_pod(pod)
}

/// Returns true if the drain should evict this pod.
pub fn is_evictable(pod: &Pod) -> bool {
    is_removable(pod) && !is_terminating(pod)
}

/// The pods the drain should evict.
pub fn pods_for_deletion(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter().filter(is_evictable).collect()
}

/// Identifies pods as `namespace/name`.
pub fn pod_names<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> Vec<String> {
    pods.into_iter()
        .map(|pod| format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()))
        .collect()
}

/// Evicts every evictable pod from a node within a fixed time budget.
pub struct Drainer {
    client: Arc<dyn ClusterClient>,
    timeout: Duration,
}

impl Drainer {
    pub fn new(client: Arc<dyn ClusterClient>, timeout: Duration) -> Self {
        Drainer { client, timeout }
    }

    /// Pods still waiting to leave the node, including those already
    /// terminating.
    pub async fn pending_pods(&self, node_name: &str) -> Result<Vec<String>, kube::Error> {
        let pods = self.client.list_pods_on_node(node_name).await?;
        Ok(pod_names(pods.iter().filter(|pod| is_removable(pod))))
    }

    /// Removes all evictable pods from the node, one task per pod, and
    /// waits until they are gone.
    ///
    /// Evictions blocked by a disruption budget are retried until the
    /// timeout. When the timeout fires, the outstanding tasks are aborted.
    pub async fn drain(&self, node_name: &str) -> Result<(), DrainError> {
        let pods = pods_for_deletion(self.client.list_pods_on_node(node_name).await?);
        if pods.is_empty() {
            debug!(node = %node_name, "no pods to evict");
            return Ok(());
        }
        let use_eviction = self.client.eviction_supported().await?;
        info!(node = %node_name, pods = pods.len(), use_eviction, "draining node");

        let mut tasks = JoinSet::new();
        for pod in pods {
            tasks.spawn(remove_pod(self.client.clone(), pod, use_eviction));
        }
        // Dropping the set on timeout aborts every task still running.
        let results = async move {
            let mut failures = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(e) => failures.push(e.into()),
                }
            }
            failures
        };
        match tokio::time::timeout(self.timeout, results).await {
            Ok(failures) if failures.is_empty() => {
                info!(node = %node_name, "drain complete");
                Ok(())
            }
            Ok(failures) => Err(DrainError::Aggregate(failures)),
            Err(_) => {
                warn!(node = %node_name, timeout = ?self.timeout, "drain timed out");
                Err(DrainError::Timeout(self.timeout))
            }
        }
    }
}

/// Evicts (or deletes) one pod and waits for it to disappear.
async fn remove_pod(
    client: Arc<dyn ClusterClient>,
    pod: Pod,
    use_eviction: bool,
) -> Result<(), DrainError> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    loop {
        let result = if use_eviction {
            client.evict_pod(&namespace, &name).await
        } else {
            client.delete_pod(&namespace, &name).await
        };
        match result {
            Ok(()) => break,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) if is_too_many_requests(&e) => {
                debug!(pod = %name, namespace = %namespace, "eviction throttled, retrying");
                tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
            }
            Err(source) => {
                return Err(DrainError::Evict {
                    pod: format!("{}/{}", namespace, name),
                    source,
                })
            }
        }
    }
    wait_for_deletion(client.as_ref(), &namespace, &name, pod.uid()).await
}

/// Polls until the pod is gone, or replaced by a pod with another UID.
async fn wait_for_deletion(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    uid: Option<String>,
) -> Result<(), DrainError> {
    loop {
        match client.get_pod(namespace, name).await {
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(source) => {
                return Err(DrainError::Wait {
                    pod: format!("{}/{}", namespace, name),
                    source,
                })
            }
            Ok(current) if current.uid() != uid => return Ok(()),
            Ok(_) => tokio::time::sleep(DELETION_POLL_INTERVAL).await,
        }
    }
}
