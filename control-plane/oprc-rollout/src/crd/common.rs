use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "rollout.oaas.io/v1alpha1";

/// Revision ordinal of an ObjectSet, monotonically increasing per deployment.
pub const REVISION_ANNOTATION: &str = "rollout.oaas.io/revision";
/// Template hash an ObjectSet was materialized from.
pub const TEMPLATE_HASH_ANNOTATION: &str = "rollout.oaas.io/template-hash";
/// Stamped on every member object with the name of its owner.
pub const OWNER_LABEL: &str = "rollout.oaas.io/owner";
pub const TEARDOWN_FINALIZER: &str = "rollout.oaas.io/teardown";

pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 5;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: ObjectSetTemplateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplateSpec {
    /// Ordered phases; a phase only starts once every earlier phase is available.
    #[serde(default)]
    pub phases: Vec<ObjectSetTemplatePhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    /// API kinds that must be served by the cluster before anything is applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplatePhase {
    pub name: String,
    /// Delegates the phase to an ObjectSetPhase object reconciled by the
    /// controller registered for this class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default)]
    pub objects: Vec<ObjectSetObject>,
}

impl ObjectSetTemplatePhase {
    pub fn delegated_class(&self) -> Option<&str> {
        self.class.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ObjectSetObject {
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub object: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetProbe {
    #[serde(default)]
    pub selector: ProbeSelector,
    #[serde(default)]
    pub probes: Vec<Probe>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProbeKindSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ProbeKindSpec {
    /// Empty for the core API group.
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_equal: Option<FieldsEqualProbeSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ConditionProbeSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldsEqualProbeSpec {
    /// Dotted field path, e.g. `.status.updatedReplicas`.
    pub field_a: String,
    pub field_b: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct DependencyRef {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(
    Deserialize,
    Serialize,
    Clone,
    Debug,
    JsonSchema,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub struct PausedObject {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq,
)]
#[serde(rename_all = "PascalCase")]
pub enum LifecycleState {
    #[default]
    Active,
    Paused,
    Archived,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Condition types written by this operator. Types written by other
/// controllers are kept verbatim in `Other`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    Available,
    Progressing,
    Succeeded,
    Archived,
    Paused,
    Other(String),
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Available" => ConditionType::Available,
            "Progressing" => ConditionType::Progressing,
            "Succeeded" => ConditionType::Succeeded,
            "Archived" => ConditionType::Archived,
            "Paused" => ConditionType::Paused,
            _ => ConditionType::Other(value),
        }
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::Available => "Available".into(),
            ConditionType::Progressing => "Progressing".into(),
            ConditionType::Succeeded => "Succeeded".into(),
            ConditionType::Archived => "Archived".into(),
            ConditionType::Paused => "Paused".into(),
            ConditionType::Other(other) => other,
        }
    }
}

impl JsonSchema for ConditionType {
    fn schema_name() -> String {
        "ConditionType".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".into(),
        Value::Bool(true),
    );
    Schema::Object(obj)
}
