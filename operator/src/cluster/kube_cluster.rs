use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, TestOperation};
use k8s_openapi::api::{
    coordination::v1::Lease,
    core::v1::{Node, Pod, Taint},
    policy::v1::PodDisruptionBudget,
};
use kube::{
    api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use node_maintenance_types::NodeMaintenance;
use serde_json::json;

use super::ClusterClient;
use crate::util::MANAGER_NAME;

/// [`ClusterClient`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER_NAME.to_owned()),
            ..Default::default()
        }
    }

    fn namespace_of(obj: &impl ResourceExt) -> String {
        obj.namespace().unwrap_or_default()
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        Api::<Node>::all(self.client.clone()).get(name).await
    }

    async fn patch_node_taints(&self, node: &Node, desired: &[Taint]) -> Result<Node, kube::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        // Nodes without a taint list can't be tested on `/spec/taints`,
        // so fall back to guarding the write with the resource version.
        let test = match node.spec.as_ref().and_then(|s| s.taints.as_ref()) {
            Some(taints) => TestOperation {
                path: "/spec/taints".to_owned(),
                value: serde_json::to_value(taints).map_err(kube::Error::SerdeError)?,
            },
            None => TestOperation {
                path: "/metadata/resourceVersion".to_owned(),
                value: json!(node.resource_version()),
            },
        };
        let add = AddOperation {
            path: "/spec/taints".to_owned(),
            value: serde_json::to_value(desired).map_err(kube::Error::SerdeError)?,
        };
        let patch = json_patch::Patch(vec![PatchOperation::Test(test), PatchOperation::Add(add)]);
        api.patch(&node.name_any(), &Self::patch_params(), &Patch::Json::<()>(patch))
            .await
    }

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<Node, kube::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "spec": {
                "unschedulable": unschedulable
            }
        });
        api.patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        Ok(api.list(&lp).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .evict(name, &EvictParams::default())
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn eviction_supported(&self) -> Result<bool, kube::Error> {
        let resources = self.client.list_core_api_resources("v1").await?;
        Ok(resources
            .resources
            .iter()
            .any(|r| r.name == "pods/eviction"))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, kube::Error> {
        Api::<Lease>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        Api::<Lease>::namespaced(self.client.clone(), &Self::namespace_of(lease))
            .create(&PostParams::default(), lease)
            .await
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        Api::<Lease>::namespaced(self.client.clone(), &Self::namespace_of(lease))
            .replace(&lease.name_any(), &PostParams::default(), lease)
            .await
    }

    async fn get_disruption_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodDisruptionBudget, kube::Error> {
        Api::<PodDisruptionBudget>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }

    async fn list_maintenances(&self) -> Result<Vec<NodeMaintenance>, kube::Error> {
        let api: Api<NodeMaintenance> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_maintenance(&self, name: &str) -> Result<NodeMaintenance, kube::Error> {
        Api::<NodeMaintenance>::all(self.client.clone())
            .get(name)
            .await
    }

    async fn replace_maintenance(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error> {
        Api::<NodeMaintenance>::all(self.client.clone())
            .replace(&instance.name_any(), &PostParams::default(), instance)
            .await
    }

    async fn replace_maintenance_status(
        &self,
        instance: &NodeMaintenance,
    ) -> Result<NodeMaintenance, kube::Error> {
        // A full replace, rather than a merge patch, so that emptied
        // fields such as `pendingPods` are actually cleared.
        let data = serde_json::to_vec(instance).map_err(kube::Error::SerdeError)?;
        Api::<NodeMaintenance>::all(self.client.clone())
            .replace_status(&instance.name_any(), &PostParams::default(), data)
            .await
    }
}
