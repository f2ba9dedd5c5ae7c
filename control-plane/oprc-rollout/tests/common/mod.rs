#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{GroupVersionKind, Resource};
use kube::runtime::controller::Action;
use oprc_rollout::config::RolloutConfig;
use oprc_rollout::controller::{
    ControllerContext, ReconcileErr, object_deployment, object_set, object_set_phase,
};
use oprc_rollout::crd::{
    Condition, ConditionProbeSpec, ConditionType, ObjectDeployment, ObjectDeploymentSpec,
    ObjectSet, ObjectSetObject, ObjectSetPhase, ObjectSetProbe, ObjectSetSpec,
    ObjectSetTemplate, ObjectSetTemplatePhase, ObjectSetTemplateSpec, Probe, ProbeKindSpec,
    ProbeSelector, TemplateMetadata,
};
use oprc_rollout::store::{
    ClusterStore, MemoryStore, ObjectKey, from_dynamic, get_as, to_dynamic,
};
use oprc_rollout::watch::{DynamicWatcher, OwnerEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const NS: &str = "default";

pub struct Harness {
    pub store: MemoryStore,
    pub ctx: Arc<ControllerContext>,
    pub watcher: Arc<DynamicWatcher>,
    pub events: mpsc::UnboundedReceiver<OwnerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RolloutConfig::default())
    }

    pub fn with_config(cfg: RolloutConfig) -> Self {
        let store = MemoryStore::new();
        let (watcher, events) = DynamicWatcher::new(Arc::new(store.clone()));
        let watcher = Arc::new(watcher);
        let ctx = Arc::new(ControllerContext::new(
            Arc::new(store.clone()),
            watcher.clone(),
            cfg,
        ));
        Self {
            store,
            ctx,
            watcher,
            events,
        }
    }

    pub async fn create<K>(&self, obj: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let created = self
            .store
            .create(&to_dynamic(obj).expect("to dynamic"))
            .await
            .expect("create");
        from_dynamic(&created).expect("from dynamic")
    }

    pub async fn fetch<K>(&self, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        get_as::<K>(&self.store, Some(NS), name).await.expect("get")
    }

    pub async fn must_fetch<K>(&self, name: &str) -> K
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.fetch(name).await.unwrap_or_else(|| panic!("{name} missing"))
    }

    pub async fn reconcile_set(&self, name: &str) -> Result<Action, ReconcileErr> {
        let set: ObjectSet = self.must_fetch(name).await;
        object_set::reconcile(Arc::new(set), self.ctx.clone()).await
    }

    pub async fn reconcile_phase(&self, name: &str) -> Result<Action, ReconcileErr> {
        let phase: ObjectSetPhase = self.must_fetch(name).await;
        object_set_phase::reconcile(Arc::new(phase), self.ctx.clone()).await
    }

    pub async fn reconcile_deployment(&self, name: &str) -> Result<Action, ReconcileErr> {
        let dep: ObjectDeployment = self.must_fetch(name).await;
        object_deployment::reconcile(Arc::new(dep), self.ctx.clone()).await
    }

    pub async fn member(&self, key: &ObjectKey) -> Option<Value> {
        self.store
            .get(key)
            .await
            .expect("get")
            .map(|o| serde_json::to_value(o).expect("json"))
    }

    /// Report `Ready=<status>` on a member, as its own controller would.
    pub async fn set_ready(&self, key: &ObjectKey, status: &str) {
        self.store
            .patch_status(
                key,
                &json!({"status": {"conditions": [{"type": "Ready", "status": status}]}}),
            )
            .await
            .expect("patch status");
    }

    pub async fn deleted_keys(&self) -> Vec<ObjectKey> {
        self.store
            .journal()
            .await
            .into_iter()
            .filter(|r| r.op == oprc_rollout::store::memory::WriteOp::Delete)
            .map(|r| r.key)
            .collect()
    }
}

pub fn config_map(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": {"owner": name}
    })
}

pub fn widget(name: &str, size: i64) -> Value {
    json!({
        "apiVersion": "example.io/v1",
        "kind": "Widget",
        "metadata": {"name": name},
        "spec": {"size": size}
    })
}

pub fn cm_key(name: &str) -> ObjectKey {
    ObjectKey::new(&GroupVersionKind::gvk("", "v1", "ConfigMap"), Some(NS), name)
}

pub fn set_key(name: &str) -> ObjectKey {
    ObjectKey::of::<ObjectSet>(Some(NS), name)
}

pub fn widget_key(name: &str) -> ObjectKey {
    ObjectKey::new(
        &GroupVersionKind::gvk("example.io", "v1", "Widget"),
        Some(NS),
        name,
    )
}

pub fn phase(name: &str, objects: Vec<Value>) -> ObjectSetTemplatePhase {
    ObjectSetTemplatePhase {
        name: name.to_string(),
        class: None,
        objects: objects
            .into_iter()
            .map(|object| ObjectSetObject { object })
            .collect(),
    }
}

/// `Ready=True` required on every object of `group`/`kind`.
pub fn ready_probe(group: &str, kind: &str) -> ObjectSetProbe {
    ObjectSetProbe {
        selector: ProbeSelector {
            kind: Some(ProbeKindSpec {
                group: group.to_string(),
                kind: kind.to_string(),
            }),
            label_selector: None,
        },
        probes: vec![Probe {
            condition: Some(ConditionProbeSpec {
                type_: "Ready".into(),
                status: "True".into(),
            }),
            fields_equal: None,
        }],
    }
}

pub fn object_set(
    name: &str,
    phases: Vec<ObjectSetTemplatePhase>,
    probes: Vec<ObjectSetProbe>,
) -> ObjectSet {
    let mut set = ObjectSet::new(
        name,
        ObjectSetSpec {
            phases,
            availability_probes: probes,
            ..Default::default()
        },
    );
    set.metadata.namespace = Some(NS.to_string());
    set
}

pub fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

pub fn template(
    app: &str,
    phases: Vec<ObjectSetTemplatePhase>,
    probes: Vec<ObjectSetProbe>,
) -> ObjectSetTemplate {
    ObjectSetTemplate {
        metadata: TemplateMetadata {
            labels: app_labels(app),
            annotations: BTreeMap::new(),
        },
        spec: ObjectSetTemplateSpec {
            phases,
            availability_probes: probes,
            dependencies: Vec::new(),
        },
    }
}

pub fn deployment(name: &str, template: ObjectSetTemplate) -> ObjectDeployment {
    let mut dep = ObjectDeployment::new(
        name,
        ObjectDeploymentSpec {
            revision_history_limit: None,
            selector: LabelSelector {
                match_labels: Some(app_labels(name)),
                match_expressions: None,
            },
            template,
        },
    );
    dep.metadata.namespace = Some(NS.to_string());
    dep
}

pub fn condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn set_conditions(set: &ObjectSet) -> Vec<Condition> {
    set.status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}

pub fn deployment_conditions(dep: &ObjectDeployment) -> Vec<Condition> {
    dep.status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}

pub fn reason(conditions: &[Condition], type_: ConditionType) -> Option<String> {
    condition(conditions, type_).and_then(|c| c.reason.clone())
}

pub fn controllers_of(obj: &Value) -> Vec<String> {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter(|r| r.get("controller").and_then(Value::as_bool) == Some(true))
                .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
