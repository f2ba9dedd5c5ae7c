use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, ObjectSetTemplate};

/// User-facing desired state; owns a lineage of ObjectSet revisions.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ObjectDeployment",
    plural = "objectdeployments",
    shortname = "od",
    namespaced,
    status = "ObjectDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentSpec {
    /// Outdated revisions kept (archived) before the oldest are deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    pub selector: LabelSelector,
    pub template: ObjectSetTemplate,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "rollout.oaas.io",
    version = "v1alpha1",
    kind = "ClusterObjectDeployment",
    plural = "clusterobjectdeployments",
    shortname = "cod",
    status = "ObjectDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectDeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    pub selector: LabelSelector,
    pub template: ObjectSetTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Salt mixed into the template hash after a naming collision.
    #[serde(default)]
    pub collision_count: Option<i32>,
    #[serde(default)]
    pub template_hash: Option<String>,
}
