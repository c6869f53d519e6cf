use std::fs;
use kube::CustomResourceExt;
use node_maintenance_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/nodemaintenance.kubevirt.io_nodemaintenances_crd.yaml",
        serde_yaml::to_string(&NodeMaintenance::crd()).unwrap(),
    )
    .unwrap();
}
