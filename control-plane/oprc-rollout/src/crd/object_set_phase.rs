use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    Condition, ObjectSetProbe, ObjectSetTemplatePhase, PausedObject,
};

/// A single phase of an ObjectSet handed to a class-specific controller.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ObjectSetPhase",
    plural = "objectsetphases",
    namespaced,
    status = "ObjectSetPhaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetPhaseSpec {
    /// Set while the owning ObjectSet is paused; objects are only probed.
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paused_for: Vec<PausedObject>,
    #[serde(default)]
    pub revision: i64,
    pub phase: ObjectSetTemplatePhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ClusterObjectSetPhase",
    plural = "clusterobjectsetphases",
    status = "ObjectSetPhaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectSetPhaseSpec {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paused_for: Vec<PausedObject>,
    #[serde(default)]
    pub revision: i64,
    pub phase: ObjectSetTemplatePhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetPhaseStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}
