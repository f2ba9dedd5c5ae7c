//! Cluster store seam.
//!
//! The engine only ever talks to the cluster through [`ClusterStore`]: a
//! transactional object store keyed by group/version/kind/namespace/name with
//! resource-version based optimistic concurrency.

pub mod kube;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use ::kube::core::{DynamicObject, GroupVersionKind, Resource, Selector, TypeMeta};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::document::split_api_version;

pub use self::kube::KubeStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("conflicting write on {0}")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn of<K>(namespace: Option<&str>, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(&gvk_for::<K>(), namespace, name)
    }

    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        let (group, version) = split_api_version(&types.api_version);
        Some(Self {
            group,
            version,
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "core" } else { &self.group };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", group, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", group, self.kind, self.name),
        }
    }
}

#[derive(Clone, Debug)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

impl WatchEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<DynamicObject>>;

    /// `namespace = None` lists across all namespaces (or a cluster-scoped kind).
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> StoreResult<Vec<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// JSON merge patch of everything but status. A `metadata.resourceVersion`
    /// inside the patch turns it into a conditional write.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<DynamicObject>;

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> StoreResult<DynamicObject>;

    /// Requests deletion. An absent object counts as deleted.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to changes of one kind, optionally scoped to a namespace.
    /// The subscription is established before this returns.
    fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent>>;

    async fn has_kind(&self, gvk: &GroupVersionKind) -> StoreResult<bool>;
}

pub fn gvk_for<K>() -> GroupVersionKind
where
    K: Resource<DynamicType = ()>,
{
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

pub fn to_dynamic<K>(obj: &K) -> StoreResult<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), K::api_version(&()).into_owned().into());
        map.insert("kind".into(), K::kind(&()).into_owned().into());
    }
    let mut dynamic: DynamicObject = serde_json::from_value(value)?;
    dynamic.types = Some(TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    });
    Ok(dynamic)
}

pub fn from_dynamic<K>(obj: &DynamicObject) -> StoreResult<K>
where
    K: DeserializeOwned,
{
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_as<K>(
    store: &dyn ClusterStore,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match store.get(&ObjectKey::of::<K>(namespace, name)).await? {
        Some(obj) => Ok(Some(from_dynamic(&obj)?)),
        None => Ok(None),
    }
}

pub async fn list_as<K>(
    store: &dyn ClusterStore,
    namespace: Option<&str>,
    selector: Option<&Selector>,
) -> StoreResult<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&gvk_for::<K>(), namespace, selector)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}
