use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    Condition, DependencyRef, LifecycleState, ObjectSetProbe,
    ObjectSetTemplatePhase, PausedObject,
};

/// One immutable revision of an ObjectDeployment template.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ObjectSet",
    plural = "objectsets",
    shortname = "os",
    namespaced,
    status = "ObjectSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetSpec {
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Member objects this revision must leave untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paused_for: Vec<PausedObject>,
    #[serde(default)]
    pub phases: Vec<ObjectSetTemplatePhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
}

/// Cluster-scoped twin of [`ObjectSet`].
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ClusterObjectSet",
    plural = "clusterobjectsets",
    shortname = "cos",
    status = "ObjectSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectSetSpec {
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paused_for: Vec<PausedObject>,
    #[serde(default)]
    pub phases: Vec<ObjectSetTemplatePhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
}

// Status fields are always serialized: status is written with merge patches,
// where an omitted field would keep its stale value.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Paused-for list this revision has honoured in its latest pass.
    #[serde(default)]
    pub paused_for: Vec<PausedObject>,
    #[serde(default)]
    pub revision: Option<i64>,
}
