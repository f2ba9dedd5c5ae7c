use kube::core::CustomResourceExt;
use oprc_rollout::crd::{
    ClusterObjectDeployment, ClusterObjectSet, ClusterObjectSetPhase, ObjectDeployment,
    ObjectSet, ObjectSetPhase,
};

fn main() {
    let crds = [
        ObjectDeployment::crd(),
        ClusterObjectDeployment::crd(),
        ObjectSet::crd(),
        ClusterObjectSet::crd(),
        ObjectSetPhase::crd(),
        ClusterObjectSetPhase::crd(),
    ];
    let docs: Vec<String> = crds
        .iter()
        .map(|crd| serde_yaml::to_string(crd).expect("serialize CRD to YAML"))
        .collect();
    println!("{}", docs.join("---\n"));
}
