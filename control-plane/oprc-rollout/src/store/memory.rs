//! In-process [`ClusterStore`] used by tests and local runs.
//!
//! Mirrors the API server behaviour the engine relies on: resource versions
//! with conditional writes, generation bumps on spec changes, finalizer-gated
//! deletion, merge patches, label-selector listing and watch fan-out.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, GroupVersionKind, Selector, SelectorExt};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::{ClusterStore, ObjectKey, StoreError, StoreResult, WatchEvent};

const EVENT_BUFFER: usize = 1024;
const CLOCK_BASE_SECS: i64 = 1_700_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Patch,
    PatchStatus,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub key: ObjectKey,
}

type StoredKey = (String, String, String, String);

fn stored_key(key: &ObjectKey) -> StoredKey {
    (
        key.group.clone(),
        key.kind.clone(),
        key.namespace.clone().unwrap_or_default(),
        key.name.clone(),
    )
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoredKey, DynamicObject>,
    resource_version: u64,
    uid_seq: u64,
    created: i64,
    journal: Vec<WriteRecord>,
    installed: Option<HashSet<(String, String)>>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<(ObjectKey, WatchEvent)>,
    active_watches: Arc<AtomicUsize>,
    opened_watches: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            events,
            active_watches: Arc::new(AtomicUsize::new(0)),
            opened_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Limit `has_kind` to the given kinds. By default every kind is served.
    pub async fn restrict_kinds(&self, kinds: &[GroupVersionKind]) {
        let mut state = self.state.write().await;
        state.installed = Some(
            kinds
                .iter()
                .map(|gvk| (gvk.group.clone(), gvk.kind.clone()))
                .collect(),
        );
    }

    pub async fn install_kind(&self, gvk: &GroupVersionKind) {
        let mut state = self.state.write().await;
        if let Some(installed) = state.installed.as_mut() {
            installed.insert((gvk.group.clone(), gvk.kind.clone()));
        }
    }

    pub async fn journal(&self) -> Vec<WriteRecord> {
        self.state.read().await.journal.clone()
    }

    pub async fn write_count(&self) -> usize {
        self.state.read().await.journal.len()
    }

    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    /// Watch streams currently alive.
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    /// Watch streams opened over the lifetime of the store.
    pub fn opened_watches(&self) -> usize {
        self.opened_watches.load(Ordering::SeqCst)
    }

    fn publish(&self, key: ObjectKey, event: WatchEvent) {
        // no receivers is fine
        let _ = self.events.send((key, event));
    }

    async fn apply_patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        status_only: bool,
    ) -> StoreResult<DynamicObject> {
        let mut state = self.state.write().await;
        let skey = stored_key(key);
        let current = state
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(key.to_string()));
            }
        }

        let effective = scoped_patch(patch, status_only);
        let before = serde_json::to_value(&current)?;
        let mut after = before.clone();
        json_patch::merge(&mut after, &effective);
        let mut updated: DynamicObject = serde_json::from_value(after)
            .map_err(|e| StoreError::Invalid(format!("{key}: {e}")))?;

        // identity and server-owned metadata are not patchable
        updated.types = current.types.clone();
        updated.metadata.name = current.metadata.name.clone();
        updated.metadata.namespace = current.metadata.namespace.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        updated.metadata.generation = current.metadata.generation;
        updated.metadata.resource_version = current.metadata.resource_version.clone();

        if serde_json::to_value(&updated)? == before {
            state.journal.push(WriteRecord {
                op: if status_only { WriteOp::PatchStatus } else { WriteOp::Patch },
                key: key.clone(),
            });
            return Ok(current);
        }

        if spec_content(&updated) != spec_content(&current) {
            updated.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
        }
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.journal.push(WriteRecord {
            op: if status_only { WriteOp::PatchStatus } else { WriteOp::Patch },
            key: key.clone(),
        });

        let finalized = updated.metadata.deletion_timestamp.is_some()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        if finalized {
            state.objects.remove(&skey);
            drop(state);
            trace!(%key, "finalizers cleared, object removed");
            self.publish(key.clone(), WatchEvent::Deleted(updated.clone()));
        } else {
            state.objects.insert(skey, updated.clone());
            drop(state);
            self.publish(key.clone(), WatchEvent::Applied(updated.clone()));
        }
        Ok(updated)
    }
}

/// The merge patch restricted to what the endpoint may change: status for the
/// status endpoint, everything else for the main one.
fn scoped_patch(patch: &Value, status_only: bool) -> Value {
    let Some(map) = patch.as_object() else {
        return patch.clone();
    };
    let mut scoped = Map::new();
    for (k, v) in map {
        let is_status = k == "status";
        if is_status == status_only {
            scoped.insert(k.clone(), v.clone());
        }
    }
    Value::Object(scoped)
}

fn spec_content(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

fn object_key(obj: &DynamicObject) -> StoreResult<ObjectKey> {
    ObjectKey::from_object(obj).ok_or_else(|| {
        StoreError::Invalid("object needs apiVersion, kind and metadata.name".into())
    })
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        Ok(self.state.read().await.objects.get(&stored_key(key)).cloned())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let empty = BTreeMap::new();
        let state = self.state.read().await;
        Ok(state
            .objects
            .iter()
            .filter(|((group, kind, ns, _), _)| {
                group == &gvk.group
                    && kind == &gvk.kind
                    && namespace.map(|n| n == ns.as_str()).unwrap_or(true)
            })
            .map(|(_, obj)| obj)
            .filter(|obj| {
                selector
                    .map(|s| s.matches(obj.metadata.labels.as_ref().unwrap_or(&empty)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = object_key(obj)?;
        let mut state = self.state.write().await;
        let skey = stored_key(&key);
        if state.objects.contains_key(&skey) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let mut created = obj.clone();
        state.uid_seq += 1;
        state.created += 1;
        created.metadata.uid = Some(format!("uid-{}", state.uid_seq));
        created.metadata.generation = Some(1);
        created.metadata.resource_version = Some(state.next_resource_version());
        created.metadata.creation_timestamp = Some(Time(
            DateTime::<Utc>::from_timestamp(CLOCK_BASE_SECS + state.created, 0)
                .unwrap_or_default(),
        ));
        created.metadata.deletion_timestamp = None;
        state.objects.insert(skey, created.clone());
        state.journal.push(WriteRecord {
            op: WriteOp::Create,
            key: key.clone(),
        });
        drop(state);
        self.publish(key, WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<DynamicObject> {
        self.apply_patch(key, patch, false).await
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> StoreResult<DynamicObject> {
        self.apply_patch(key, patch, true).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let skey = stored_key(key);
        let Some(mut current) = state.objects.get(&skey).cloned() else {
            return Ok(());
        };
        state.journal.push(WriteRecord {
            op: WriteOp::Delete,
            key: key.clone(),
        });
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if !has_finalizers {
            state.objects.remove(&skey);
            drop(state);
            self.publish(key.clone(), WatchEvent::Deleted(current));
            return Ok(());
        }
        if current.metadata.deletion_timestamp.is_none() {
            let now = current
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_default();
            current.metadata.deletion_timestamp = Some(Time(now));
            current.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(skey, current.clone());
            drop(state);
            self.publish(key.clone(), WatchEvent::Applied(current));
        }
        Ok(())
    }

    fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent>> {
        let receiver = self.events.subscribe();
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        self.opened_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.active_watches.clone());
        let group = gvk.group.clone();
        let kind = gvk.kind.clone();
        let namespace = namespace.map(str::to_string);
        BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let _alive = &guard;
                let out = match item {
                    Ok((key, event)) => {
                        let wanted = key.group == group
                            && key.kind == kind
                            && (namespace.is_none() || key.namespace == namespace);
                        wanted.then_some(Ok(event))
                    }
                    Err(e) => Some(Err(StoreError::Backend(e.to_string()))),
                };
                future::ready(out)
            })
            .boxed()
    }

    async fn has_kind(&self, gvk: &GroupVersionKind) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .installed
            .as_ref()
            .map(|set| set.contains(&(gvk.group.clone(), gvk.kind.clone())))
            .unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement,
    };
    use serde_json::json;

    fn config_map(name: &str, labels: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": labels},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn cm_key(name: &str) -> ObjectKey {
        ObjectKey::new(&GroupVersionKind::gvk("", "v1", "ConfigMap"), Some("ns"), name)
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", json!({}))).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.uid.is_some());
        let err = store.create(&config_map("a", json!({}))).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", json!({}))).await.unwrap();
        let rv = created.metadata.resource_version.clone().unwrap();
        store
            .patch(&cm_key("a"), &json!({"data": {"k": "w"}}))
            .await
            .unwrap();
        let err = store
            .patch(
                &cm_key("a"),
                &json!({"metadata": {"resourceVersion": rv}, "data": {"k": "x"}}),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn generation_only_moves_on_spec_changes() {
        let store = MemoryStore::new();
        store.create(&config_map("a", json!({}))).await.unwrap();
        let patched = store
            .patch(&cm_key("a"), &json!({"metadata": {"labels": {"x": "1"}}}))
            .await
            .unwrap();
        assert_eq!(patched.metadata.generation, Some(1));
        let patched = store
            .patch_status(&cm_key("a"), &json!({"status": {"ready": true}}))
            .await
            .unwrap();
        assert_eq!(patched.metadata.generation, Some(1));
        assert_eq!(patched.data["status"]["ready"], true);
        let patched = store
            .patch(&cm_key("a"), &json!({"data": {"k": "changed"}}))
            .await
            .unwrap();
        assert_eq!(patched.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion() {
        let store = MemoryStore::new();
        let mut cm = config_map("a", json!({}));
        cm.metadata.finalizers = Some(vec!["test/hold".into()]);
        store.create(&cm).await.unwrap();
        store.delete(&cm_key("a")).await.unwrap();
        let held = store.get(&cm_key("a")).await.unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());
        store
            .patch(&cm_key("a"), &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(store.get(&cm_key("a")).await.unwrap().is_none());
        // deleting an absent object is not an error
        store.delete(&cm_key("a")).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_selector() {
        let store = MemoryStore::new();
        store.create(&config_map("a", json!({"app": "x"}))).await.unwrap();
        store.create(&config_map("b", json!({"app": "y"}))).await.unwrap();
        store
            .create(&config_map("c", json!({"app": "x", "legacy": "1"})))
            .await
            .unwrap();
        let selector = Selector::try_from(LabelSelector {
            match_labels: Some([("app".to_string(), "x".to_string())].into()),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "legacy".into(),
                operator: "DoesNotExist".into(),
                values: None,
            }]),
        })
        .unwrap();
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let found = store.list(&gvk, Some("ns"), Some(&selector)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
        let all = store
            .list(&gvk, Some("ns"), Some(&Selector::default()))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(store.list(&gvk, Some("other"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_streams_matching_events_and_tracks_liveness() {
        let store = MemoryStore::new();
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let mut stream = store.watch(&gvk, Some("ns"));
        assert_eq!(store.active_watches(), 1);
        store.create(&config_map("a", json!({}))).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, WatchEvent::Applied(_)));
        drop(stream);
        assert_eq!(store.active_watches(), 0);
        assert_eq!(store.opened_watches(), 1);
    }
}
