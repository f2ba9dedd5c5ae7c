//! Reference-counted watch multiplexer.
//!
//! Many owners register interest in many dynamically typed kinds. At most one
//! store subscription exists per (kind, namespace); change events are routed
//! back to the owning object through the member's controller reference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use kube::core::GroupVersionKind;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::controller_of;
use crate::store::{ClusterStore, ObjectKey, StoreResult, WatchEvent};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
}

impl WatchKey {
    pub fn new(gvk: &GroupVersionKind, namespace: Option<&str>) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
        }
    }

    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

/// The controlling owner of a changed member object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerHandle {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Namespace the owner registered with; `None` for cluster-scoped owners.
    pub namespace: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OwnerEvent {
    pub owner: OwnerHandle,
    pub object: ObjectKey,
}

type OwnerNamespaces = Arc<RwLock<HashMap<String, Option<String>>>>;

struct Registration {
    owners: HashSet<String>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DynamicWatcher {
    store: Arc<dyn ClusterStore>,
    events: mpsc::UnboundedSender<OwnerEvent>,
    registrations: Mutex<HashMap<WatchKey, Registration>>,
    owner_namespaces: OwnerNamespaces,
    token: CancellationToken,
}

impl DynamicWatcher {
    pub fn new(
        store: Arc<dyn ClusterStore>,
    ) -> (Self, mpsc::UnboundedReceiver<OwnerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                events,
                registrations: Mutex::new(HashMap::new()),
                owner_namespaces: Arc::new(RwLock::new(HashMap::new())),
                token: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Register `owner_uid` (living in `owner_namespace`) for changes of `gvk`
    /// in `namespace`, starting a subscription if none exists for that key yet.
    pub async fn watch(
        &self,
        owner_uid: &str,
        owner_namespace: Option<&str>,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) {
        self.owner_namespaces
            .write()
            .await
            .insert(owner_uid.to_string(), owner_namespace.map(str::to_string));
        let key = WatchKey::new(gvk, namespace);
        let mut registrations = self.registrations.lock().await;
        if let Some(reg) = registrations.get_mut(&key) {
            reg.owners.insert(owner_uid.to_string());
            return;
        }
        if self.token.is_cancelled() {
            return;
        }
        let token = self.token.child_token();
        let stream = self.store.watch(&key.gvk(), namespace);
        let task = tokio::spawn(forward(
            stream,
            self.events.clone(),
            self.owner_namespaces.clone(),
            token.clone(),
            key.clone(),
        ));
        debug!(group = %key.group, kind = %key.kind, ns = ?key.namespace, "started watch");
        registrations.insert(
            key,
            Registration {
                owners: HashSet::from([owner_uid.to_string()]),
                token,
                task,
            },
        );
    }

    /// Drop every registration of `owner_uid`; subscriptions left without
    /// owners are stopped.
    pub async fn free(&self, owner_uid: &str) {
        self.owner_namespaces.write().await.remove(owner_uid);
        let mut registrations = self.registrations.lock().await;
        registrations.retain(|key, reg| {
            reg.owners.remove(owner_uid);
            if reg.owners.is_empty() {
                reg.token.cancel();
                debug!(group = %key.group, kind = %key.kind, ns = ?key.namespace, "stopped watch");
                false
            } else {
                true
            }
        });
    }

    pub async fn active_watches(&self) -> usize {
        self.registrations.lock().await.len()
    }

    pub async fn owners_of(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> HashSet<String> {
        self.registrations
            .lock()
            .await
            .get(&WatchKey::new(gvk, namespace))
            .map(|reg| reg.owners.clone())
            .unwrap_or_default()
    }

    /// Stop all subscriptions and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let drained: Vec<Registration> = {
            let mut registrations = self.registrations.lock().await;
            registrations.drain().map(|(_, reg)| reg).collect()
        };
        for reg in drained {
            if let Err(e) = reg.task.await {
                warn!(error = %e, "watch task ended abnormally");
            }
        }
        info!("watch multiplexer stopped");
    }
}

async fn forward(
    mut stream: BoxStream<'static, StoreResult<WatchEvent>>,
    events: mpsc::UnboundedSender<OwnerEvent>,
    owners: OwnerNamespaces,
    token: CancellationToken,
    key: WatchKey,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    let routed = route(&event, &*owners.read().await);
                    let Some(routed) = routed else { continue };
                    if events.send(routed).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(group = %key.group, kind = %key.kind, error = %e, "watch error");
                }
                None => break,
            }
        }
    }
}

/// Changes to members whose controller never registered are dropped.
fn route(
    event: &WatchEvent,
    owners: &HashMap<String, Option<String>>,
) -> Option<OwnerEvent> {
    let obj = event.object();
    let owner = controller_of(&obj.metadata)?;
    let namespace = owners.get(&owner.uid)?.clone();
    Some(OwnerEvent {
        owner: OwnerHandle {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            namespace,
        },
        object: ObjectKey::from_object(obj)?,
    })
}
