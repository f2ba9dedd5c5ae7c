pub mod adapters;
pub mod applier;
pub mod conditions;
pub mod hash;
pub mod object_deployment;
pub mod object_set;
pub mod object_set_phase;
pub mod phases;
pub mod status;

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::ObjectMeta,
    core::ParseExpressionError,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::ObjectRef,
        watcher::{self, Config},
    },
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::RolloutConfig;
use crate::crd::{
    API_VERSION, ClusterObjectDeployment, ClusterObjectSet, ClusterObjectSetPhase,
    DependencyRef, ObjectDeployment, ObjectSet, ObjectSetPhase, REVISION_ANNOTATION,
    TEARDOWN_FINALIZER,
};
use crate::store::{ClusterStore, KubeStore, ObjectKey, StoreError};
use crate::watch::{DynamicWatcher, OwnerEvent};

use adapters::Managed;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub(crate) fn invalid_selector(e: ParseExpressionError) -> ReconcileErr {
    ReconcileErr::InvalidObject(format!("invalid label selector: {e}"))
}

#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn ClusterStore>,
    pub watcher: Arc<DynamicWatcher>,
    pub cfg: RolloutConfig,
}

impl ControllerContext {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        watcher: Arc<DynamicWatcher>,
        cfg: RolloutConfig,
    ) -> Self {
        Self {
            store,
            watcher,
            cfg,
        }
    }
}

pub fn error_policy<K>(
    _obj: Arc<K>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    warn!(error = %err, "reconcile failed, requeueing");
    Action::requeue(ctx.cfg.error_requeue())
}

pub(crate) fn key_of<K: Managed>(obj: &K) -> ObjectKey {
    ObjectKey::of::<K>(obj.meta().namespace.as_deref(), &obj.name_any())
}

pub(crate) fn controller_ref<K: Managed>(obj: &K) -> Result<OwnerReference, ReconcileErr> {
    obj.controller_owner_ref(&()).ok_or_else(|| {
        ReconcileErr::InvalidObject(format!("{} has no uid yet", obj.name_any()))
    })
}

pub(crate) fn revision_annotation(meta: &ObjectMeta) -> Option<i64> {
    meta.annotations
        .as_ref()?
        .get(REVISION_ANNOTATION)?
        .parse()
        .ok()
}

fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == TEARDOWN_FINALIZER))
        .unwrap_or(false)
}

pub(crate) async fn ensure_finalizer<K: Managed>(
    store: &dyn ClusterStore,
    obj: &K,
) -> Result<(), ReconcileErr> {
    if has_finalizer(obj.meta()) {
        return Ok(());
    }
    let mut finals = obj.meta().finalizers.clone().unwrap_or_default();
    finals.push(TEARDOWN_FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finals}});
    store.patch(&key_of(obj), &patch).await?;
    debug!(name = %obj.name_any(), "finalizer added");
    Ok(())
}

pub(crate) async fn remove_finalizer<K: Managed>(
    store: &dyn ClusterStore,
    obj: &K,
) -> Result<(), ReconcileErr> {
    if !has_finalizer(obj.meta()) {
        return Ok(());
    }
    let finals: Vec<String> = obj
        .meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| f.as_str() != TEARDOWN_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finals}});
    match store.patch(&key_of(obj), &patch).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!(name = %obj.name_any(), "finalizer removed");
    Ok(())
}

pub(crate) async fn write_status<K: Managed, S: Serialize>(
    store: &dyn ClusterStore,
    obj: &K,
    status: &S,
) -> Result<(), ReconcileErr> {
    let patch = json!({ "status": status });
    store.patch_status(&key_of(obj), &patch).await?;
    Ok(())
}

/// Names of declared dependency kinds the cluster does not serve.
pub(crate) async fn missing_dependencies(
    store: &dyn ClusterStore,
    deps: &[DependencyRef],
) -> Result<Vec<String>, ReconcileErr> {
    let mut missing = Vec::new();
    for dep in deps {
        let gvk = kube::core::GroupVersionKind::gvk(&dep.group, &dep.version, &dep.kind);
        if !store.has_kind(&gvk).await? {
            missing.push(if dep.group.is_empty() {
                format!("{}/{}", dep.version, dep.kind)
            } else {
                format!("{}/{}/{}", dep.group, dep.version, dep.kind)
            });
        }
    }
    Ok(missing)
}

type Triggers<K> = mpsc::UnboundedSender<ObjectRef<K>>;

struct Router {
    object_sets: Triggers<ObjectSet>,
    cluster_object_sets: Triggers<ClusterObjectSet>,
    phases: Triggers<ObjectSetPhase>,
    cluster_phases: Triggers<ClusterObjectSetPhase>,
}

impl Router {
    /// Map a member change to a reconcile of its owner.
    fn dispatch(&self, event: OwnerEvent) {
        let owner = event.owner;
        if owner.api_version != API_VERSION {
            return;
        }
        let ns = owner.namespace.as_deref().unwrap_or_default();
        let sent = match owner.kind.as_str() {
            "ObjectSet" => self
                .object_sets
                .send(ObjectRef::new(&owner.name).within(ns))
                .is_ok(),
            "ClusterObjectSet" => self
                .cluster_object_sets
                .send(ObjectRef::new(&owner.name))
                .is_ok(),
            "ObjectSetPhase" => self
                .phases
                .send(ObjectRef::new(&owner.name).within(ns))
                .is_ok(),
            "ClusterObjectSetPhase" => self
                .cluster_phases
                .send(ObjectRef::new(&owner.name))
                .is_ok(),
            _ => true,
        };
        if !sent {
            debug!(kind = %owner.kind, name = %owner.name, "controller gone, dropping trigger");
        }
    }
}

async fn log_result<K: Resource>(
    res: Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, watcher::Error>>,
) {
    match res {
        Ok((obj_ref, action)) => debug!(object = %obj_ref, ?action, "reconciled"),
        Err(e) => warn!(error = %e, "reconcile error"),
    }
}

pub async fn run_controllers(client: Client, cfg: RolloutConfig) -> anyhow::Result<()> {
    let store: Arc<dyn ClusterStore> =
        Arc::new(KubeStore::new(client.clone(), cfg.field_manager.clone()));
    let (watcher, mut owner_events) = DynamicWatcher::new(store.clone());
    let watcher = Arc::new(watcher);
    let ctx = Arc::new(ControllerContext::new(store, watcher.clone(), cfg));

    let (os_tx, os_rx) = mpsc::unbounded_channel();
    let (cos_tx, cos_rx) = mpsc::unbounded_channel();
    let (osp_tx, osp_rx) = mpsc::unbounded_channel();
    let (cosp_tx, cosp_rx) = mpsc::unbounded_channel();
    let router = Router {
        object_sets: os_tx,
        cluster_object_sets: cos_tx,
        phases: osp_tx,
        cluster_phases: cosp_tx,
    };
    let routing = tokio::spawn(async move {
        while let Some(event) = owner_events.recv().await {
            router.dispatch(event);
        }
    });

    let deployments = Controller::new(Api::<ObjectDeployment>::all(client.clone()), Config::default())
        .owns(Api::<ObjectSet>::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(
            object_deployment::reconcile::<ObjectDeployment>,
            error_policy,
            ctx.clone(),
        )
        .for_each(log_result);

    let cluster_deployments = Controller::new(
        Api::<ClusterObjectDeployment>::all(client.clone()),
        Config::default(),
    )
    .owns(Api::<ClusterObjectSet>::all(client.clone()), Config::default())
    .shutdown_on_signal()
    .run(
        object_deployment::reconcile::<ClusterObjectDeployment>,
        error_policy,
        ctx.clone(),
    )
    .for_each(log_result);

    let object_sets = Controller::new(Api::<ObjectSet>::all(client.clone()), Config::default())
        .owns(Api::<ObjectSetPhase>::all(client.clone()), Config::default())
        .reconcile_on(UnboundedReceiverStream::new(os_rx))
        .shutdown_on_signal()
        .run(object_set::reconcile::<ObjectSet>, error_policy, ctx.clone())
        .for_each(log_result);

    let cluster_object_sets =
        Controller::new(Api::<ClusterObjectSet>::all(client.clone()), Config::default())
            .owns(
                Api::<ClusterObjectSetPhase>::all(client.clone()),
                Config::default(),
            )
            .reconcile_on(UnboundedReceiverStream::new(cos_rx))
            .shutdown_on_signal()
            .run(
                object_set::reconcile::<ClusterObjectSet>,
                error_policy,
                ctx.clone(),
            )
            .for_each(log_result);

    let phases = Controller::new(Api::<ObjectSetPhase>::all(client.clone()), Config::default())
        .reconcile_on(UnboundedReceiverStream::new(osp_rx))
        .shutdown_on_signal()
        .run(
            object_set_phase::reconcile::<ObjectSetPhase>,
            error_policy,
            ctx.clone(),
        )
        .for_each(log_result);

    let cluster_phases =
        Controller::new(Api::<ClusterObjectSetPhase>::all(client), Config::default())
            .reconcile_on(UnboundedReceiverStream::new(cosp_rx))
            .shutdown_on_signal()
            .run(
                object_set_phase::reconcile::<ClusterObjectSetPhase>,
                error_policy,
                ctx.clone(),
            )
            .for_each(log_result);

    info!("controllers started");
    tokio::join!(
        deployments,
        cluster_deployments,
        object_sets,
        cluster_object_sets,
        phases,
        cluster_phases
    );

    routing.abort();
    watcher.shutdown().await;
    info!("controllers stopped");
    Ok(())
}
