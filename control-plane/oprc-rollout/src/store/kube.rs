use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use kube::{
    Client,
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind, Selector},
    discovery::{self, ApiCapabilities, ApiResource, Scope},
    runtime::{WatchStreamExt, watcher},
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClusterStore, ObjectKey, StoreError, StoreResult, WatchEvent};

/// [`ClusterStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
    resources: Arc<RwLock<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>>,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn resolve(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, ApiCapabilities), kube::Error> {
        if let Some(found) = self.resources.read().await.get(gvk) {
            return Ok(found.clone());
        }
        let resolved = discovery::pinned_kind(&self.client, gvk).await?;
        debug!(group = %gvk.group, kind = %gvk.kind, "resolved api resource");
        self.resources
            .write()
            .await
            .insert(gvk.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> StoreResult<Api<DynamicObject>> {
        let (resource, caps) = self
            .resolve(gvk)
            .await
            .map_err(|e| classify(e, &gvk.kind))?;
        Ok(match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn classify(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            StoreError::NotFound(what.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict(format!("{what}: {}", resp.message))
        }
        kube::Error::Api(resp) if resp.code == 422 => {
            StoreError::Invalid(format!("{what}: {}", resp.message))
        }
        kube::Error::SerdeError(e) => StoreError::Serialization(e),
        other => StoreError::Backend(other.to_string()),
    }
}

fn name_of(key: &ObjectKey) -> String {
    key.to_string()
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        let api = self.api(&key.gvk(), key.namespace.as_deref()).await?;
        api.get_opt(&key.name)
            .await
            .map_err(|e| classify(e, &name_of(key)))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let api = self.api(gvk, namespace).await?;
        let mut params = ListParams::default();
        if let Some(sel) = selector.filter(|s| !s.selects_all()) {
            params = params.labels_from(sel);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| classify(e, &gvk.kind))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::from_object(obj).ok_or_else(|| {
            StoreError::Invalid("object needs apiVersion, kind and metadata.name".into())
        })?;
        let api = self.api(&key.gvk(), key.namespace.as_deref()).await?;
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        api.create(&params, obj)
            .await
            .map_err(|e| classify(e, &name_of(&key)))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<DynamicObject> {
        let api = self.api(&key.gvk(), key.namespace.as_deref()).await?;
        api.patch(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &name_of(key)))
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> StoreResult<DynamicObject> {
        let api = self.api(&key.gvk(), key.namespace.as_deref()).await?;
        api.patch_status(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &name_of(key)))
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let api = self.api(&key.gvk(), key.namespace.as_deref()).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, &name_of(key)) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, StoreResult<WatchEvent>> {
        let this = self.clone();
        let gvk = gvk.clone();
        let namespace = namespace.map(str::to_string);
        stream::once(async move { this.api(&gvk, namespace.as_deref()).await })
            .map(|api| match api {
                Ok(api) => watcher(api, watcher::Config::default())
                    .default_backoff()
                    .map_err(|e| StoreError::Backend(e.to_string()))
                    .try_filter_map(|event| async move {
                        Ok(match event {
                            watcher::Event::Apply(obj)
                            | watcher::Event::InitApply(obj) => {
                                Some(WatchEvent::Applied(obj))
                            }
                            watcher::Event::Delete(obj) => Some(WatchEvent::Deleted(obj)),
                            watcher::Event::Init | watcher::Event::InitDone => None,
                        })
                    })
                    .boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }

    async fn has_kind(&self, gvk: &GroupVersionKind) -> StoreResult<bool> {
        match self.resolve(gvk).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Discovery(_)) => Ok(false),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(classify(e, &gvk.kind)),
        }
    }
}
