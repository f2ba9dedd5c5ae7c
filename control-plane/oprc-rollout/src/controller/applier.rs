use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::{Value, json};
use tracing::{debug, info, trace};

use crate::crd::{OWNER_LABEL, PausedObject};
use crate::document::{
    controller_of, describe, is_satisfied_by, managed_fields, paused_ref_of,
    with_controller,
};
use crate::store::{ClusterStore, ObjectKey};
use crate::watch::DynamicWatcher;

use super::ReconcileErr;

const LABEL_VALUE_MAX: usize = 63;

/// The object a phase is reconciled on behalf of.
#[derive(Clone, Debug)]
pub struct PhaseOwner {
    /// Controller reference stamped onto every member.
    pub reference: OwnerReference,
    pub namespace: Option<String>,
    /// Revision ordinal, handed down to delegated phase objects.
    pub revision: i64,
    /// The whole owner is paused: members are only observed.
    pub paused: bool,
    pub paused_for: Vec<PausedObject>,
}

impl PhaseOwner {
    pub fn uid(&self) -> &str {
        &self.reference.uid
    }

    pub fn is_paused(&self, obj: &DynamicObject) -> bool {
        self.paused
            || paused_ref_of(obj)
                .map(|r| self.paused_for.contains(&r))
                .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Adopted,
    Patched,
    Unchanged,
    Paused,
}

#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    /// Live state after the apply, used for probing.
    pub object: DynamicObject,
    pub action: ApplyAction,
}

/// Label-safe owner name; long names keep a crc32 suffix to stay unique.
pub fn owner_label_value(name: &str) -> String {
    if name.len() <= LABEL_VALUE_MAX {
        return name.to_string();
    }
    let prefix = name.get(..LABEL_VALUE_MAX - 9).unwrap_or(name);
    format!("{}-{:08x}", prefix, crc32fast::hash(name.as_bytes()))
}

pub struct ObjectApplier<'a> {
    pub store: &'a dyn ClusterStore,
    pub watcher: &'a DynamicWatcher,
}

impl ObjectApplier<'_> {
    pub async fn apply(
        &self,
        owner: &PhaseOwner,
        desired: DynamicObject,
    ) -> Result<ApplyOutcome, ReconcileErr> {
        let mut obj = desired;
        obj.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(OWNER_LABEL.into(), owner_label_value(&owner.reference.name));
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = owner.namespace.clone();
        }
        obj.metadata.owner_references = Some(with_controller(
            obj.metadata.owner_references.as_ref(),
            &owner.reference,
        ));
        let key = ObjectKey::from_object(&obj).ok_or_else(|| {
            ReconcileErr::InvalidObject(format!("{} has no identity", describe(&obj)))
        })?;

        self.watcher
            .watch(
                owner.uid(),
                owner.namespace.as_deref(),
                &key.gvk(),
                key.namespace.as_deref(),
            )
            .await;

        let live = self.store.get(&key).await?;

        if owner.is_paused(&obj) {
            trace!(%key, "paused, observing only");
            return Ok(ApplyOutcome {
                object: live.unwrap_or(obj),
                action: ApplyAction::Paused,
            });
        }

        let Some(mut live) = live else {
            let created = self.store.create(&obj).await?;
            info!(%key, "created");
            return Ok(ApplyOutcome {
                object: created,
                action: ApplyAction::Created,
            });
        };

        let mut action = ApplyAction::Unchanged;
        let current_controller = controller_of(&live.metadata).map(|r| r.uid.clone());
        if current_controller.as_deref() != Some(owner.uid()) {
            // owner references only, guarded by the observed resourceVersion
            let refs =
                with_controller(live.metadata.owner_references.as_ref(), &owner.reference);
            let patch = json!({
                "metadata": {
                    "ownerReferences": refs,
                    "resourceVersion": live.metadata.resource_version,
                }
            });
            live = self.store.patch(&key, &patch).await?;
            info!(%key, "took over control");
            action = ApplyAction::Adopted;
        }

        let desired_fields = managed_fields(&obj)
            .map_err(|e| ReconcileErr::InvalidObject(format!("{key}: {e}")))?;
        let live_value = serde_json::to_value(&live)?;
        if !is_satisfied_by(&desired_fields, &live_value) {
            let mut patch = desired_fields;
            if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert(
                    "resourceVersion".into(),
                    json!(live.metadata.resource_version),
                );
            }
            live = self.store.patch(&key, &patch).await?;
            debug!(%key, "patched drift");
            if action == ApplyAction::Unchanged {
                action = ApplyAction::Patched;
            }
        } else {
            trace!(%key, "up to date");
        }

        Ok(ApplyOutcome {
            object: live,
            action,
        })
    }
}
