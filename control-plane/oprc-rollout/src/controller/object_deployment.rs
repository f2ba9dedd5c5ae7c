//! Rollout controller: turns a deployment template into a lineage of
//! ObjectSet revisions and hands member objects from old revisions to new.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::core::Selector;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{Span, debug, info, instrument, warn};

use crate::crd::{
    ConditionStatus, ConditionType, LifecycleState, ObjectDeploymentStatus,
    ObjectSetSpec, ObjectSetTemplate, ObjectSetTemplatePhase, PausedObject,
    REVISION_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
};
use crate::document::{is_controlled_by, parse_object, paused_ref_of};
use crate::store::{ClusterStore, StoreError, from_dynamic, get_as, list_as, to_dynamic};

use super::adapters::{DeploymentLike, ObjectSetLike};
use super::conditions::{is_true_at_generation, new_condition, set_condition};
use super::hash::compute_hash;
use super::status::should_patch_status;
use super::{
    ControllerContext, ReconcileErr, controller_ref, invalid_selector, key_of,
    revision_annotation, write_status,
};

/// Name of the revision materializing a template hash.
pub fn revision_name(deployment: &str, hash: &str) -> String {
    format!("{deployment}-{hash}")
}

/// Oldest first: unannotated revisions by creation time, then annotated ones
/// by ordinal, with creation time and name breaking ties.
pub fn sort_revisions<S: ObjectSetLike>(sets: &mut [S]) {
    sets.sort_by_cached_key(|s| {
        (
            revision_annotation(s.meta()),
            s.meta().creation_timestamp.as_ref().map(|t| t.0),
            s.name_any(),
        )
    });
}

/// Member identities declared by a set of phases.
pub fn object_refs(phases: &[ObjectSetTemplatePhase]) -> BTreeSet<PausedObject> {
    phases
        .iter()
        .flat_map(|p| &p.objects)
        .filter_map(|o| parse_object(&o.object).ok())
        .filter_map(|o| paused_ref_of(&o))
        .collect()
}

fn is_archived<S: ObjectSetLike>(set: &S) -> bool {
    set.lifecycle_state() == LifecycleState::Archived
}

fn is_deleting<S: ObjectSetLike>(set: &S) -> bool {
    set.meta().deletion_timestamp.is_some()
}

fn is_available<S: ObjectSetLike>(set: &S) -> bool {
    set.set_status()
        .map(|s| {
            is_true_at_generation(&s.conditions, ConditionType::Available, set.meta().generation)
        })
        .unwrap_or(false)
}

/// The revision reported, for its latest spec, that it leaves `desired` alone.
fn acknowledged<S: ObjectSetLike>(set: &S, desired: &BTreeSet<PausedObject>) -> bool {
    if desired.is_empty() {
        return true;
    }
    let Some(status) = set.set_status() else {
        return false;
    };
    status.observed_generation == set.meta().generation
        && desired.iter().all(|p| status.paused_for.contains(p))
}

fn spec_from_template(template: &ObjectSetTemplate) -> ObjectSetSpec {
    ObjectSetSpec {
        lifecycle_state: LifecycleState::Active,
        paused_for: Vec::new(),
        phases: template.spec.phases.clone(),
        availability_probes: template.spec.availability_probes.clone(),
        dependencies: template.spec.dependencies.clone(),
    }
}

async fn set_paused_for<S: ObjectSetLike>(
    store: &dyn ClusterStore,
    set: &S,
    paused: &BTreeSet<PausedObject>,
) -> Result<(), ReconcileErr> {
    let current: BTreeSet<PausedObject> = set.paused_for().iter().cloned().collect();
    if current == *paused {
        return Ok(());
    }
    let list: Vec<&PausedObject> = paused.iter().collect();
    store
        .patch(&key_of(set), &json!({"spec": {"pausedFor": list}}))
        .await?;
    debug!(revision = %set.name_any(), paused = list.len(), "updated paused objects");
    Ok(())
}

enum Created<S> {
    Revision(S),
    Collision,
}

async fn create_revision<D: DeploymentLike>(
    store: &dyn ClusterStore,
    deployment: &D,
    name: &str,
    hash: &str,
    ordinal: i64,
) -> Result<Created<D::ObjectSet>, ReconcileErr> {
    let template = deployment.template();
    let mut annotations = template.metadata.annotations.clone();
    annotations.insert(REVISION_ANNOTATION.to_string(), ordinal.to_string());
    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash.to_string());
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: deployment.meta().namespace.clone(),
        labels: (!template.metadata.labels.is_empty()).then(|| template.metadata.labels.clone()),
        annotations: Some(annotations),
        owner_references: Some(vec![controller_ref(deployment)?]),
        ..Default::default()
    };
    let revision = D::ObjectSet::build(meta, spec_from_template(template));
    match store.create(&to_dynamic(&revision)?).await {
        Ok(created) => {
            info!(revision = name, ordinal, "created revision");
            Ok(Created::Revision(from_dynamic(&created)?))
        }
        Err(e @ StoreError::AlreadyExists(_)) => {
            let ns = deployment.meta().namespace.as_deref();
            let Some(existing) = get_as::<D::ObjectSet>(store, ns, name).await? else {
                // vanished between create and get; the next pass retries
                return Err(e.into());
            };
            let uid = deployment.meta().uid.as_deref().unwrap_or_default();
            if is_controlled_by(existing.meta(), uid)
                && existing.phases() == template.spec.phases.as_slice()
                && !is_archived(&existing)
            {
                debug!(revision = name, "revision already exists, adopting as current");
                Ok(Created::Revision(existing))
            } else {
                Ok(Created::Collision)
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[instrument(skip_all, fields(ns, name))]
pub async fn reconcile<D: DeploymentLike>(
    obj: Arc<D>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let name = obj.name_any();
    let ns = obj.namespace();
    Span::current().record("name", name.as_str());
    Span::current().record("ns", ns.as_deref().unwrap_or(""));

    if obj.meta().deletion_timestamp.is_some() {
        // revisions are garbage collected through their owner references
        return Ok(Action::await_change());
    }

    let store = &*ctx.store;
    let uid = controller_ref(&*obj)?.uid;
    let current_status = obj.deployment_status().cloned();
    let mut status = current_status.clone().unwrap_or_default();
    let generation = obj.meta().generation;
    status.observed_generation = generation;

    let hash = compute_hash(obj.template(), status.collision_count)?;
    status.template_hash = Some(hash.clone());

    let selector = Selector::try_from(obj.selector().clone()).map_err(invalid_selector)?;
    let mut revisions: Vec<D::ObjectSet> =
        list_as::<D::ObjectSet>(store, ns.as_deref(), Some(&selector))
            .await?
            .into_iter()
            .filter(|s| is_controlled_by(s.meta(), &uid))
            .collect();
    sort_revisions(&mut revisions);

    let current_idx = revisions.iter().rposition(|s| {
        s.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
            .map(|h| *h == hash)
            .unwrap_or(false)
            && !is_archived(s)
            && !is_deleting(s)
    });
    let mut current = current_idx.map(|i| revisions.remove(i));
    let outdated = revisions;

    // hand shared members over before the current revision may touch them
    let target = match &current {
        Some(c) => object_refs(c.phases()),
        None => object_refs(&obj.template().spec.phases),
    };
    let mut waiting = Vec::new();
    for set in outdated.iter().filter(|s| !is_archived(*s) && !is_deleting(*s)) {
        let desired: BTreeSet<PausedObject> = object_refs(set.phases())
            .intersection(&target)
            .cloned()
            .collect();
        set_paused_for(store, set, &desired).await?;
        if !acknowledged(set, &desired) {
            waiting.push(set.name_any());
        }
    }
    if !waiting.is_empty() {
        debug!(waiting = ?waiting, "waiting for outdated revisions to release objects");
        set_condition(
            &mut status.conditions,
            new_condition(
                ConditionType::Progressing,
                ConditionStatus::True,
                "HandingOver",
                format!("Waiting for {} to release objects", waiting.join(", ")),
                generation,
            ),
        );
        publish(store, &*obj, current_status.as_ref(), &status).await?;
        return Ok(Action::requeue(ctx.cfg.requeue()));
    }

    if let Some(c) = &current {
        set_paused_for(store, c, &BTreeSet::new()).await?;
    }

    if current.is_none() {
        let next_ordinal = outdated
            .iter()
            .filter_map(|s| revision_annotation(s.meta()))
            .max()
            .unwrap_or(0)
            + 1;
        let target_name = revision_name(&name, &hash);
        match create_revision(store, &*obj, &target_name, &hash, next_ordinal).await? {
            Created::Revision(set) => current = Some(set),
            Created::Collision => {
                let count = status.collision_count.unwrap_or(0);
                if count >= ctx.cfg.max_collision_retries {
                    warn!(count, "giving up on revision name collisions");
                    set_condition(
                        &mut status.conditions,
                        new_condition(
                            ConditionType::Progressing,
                            ConditionStatus::False,
                            "CollisionLimitReached",
                            format!("Revision name {target_name} collided {count} times"),
                            generation,
                        ),
                    );
                    publish(store, &*obj, current_status.as_ref(), &status).await?;
                    return Ok(Action::await_change());
                }
                info!(revision = %target_name, collision_count = count + 1, "revision name collision");
                status.collision_count = Some(count + 1);
                publish(store, &*obj, current_status.as_ref(), &status).await?;
                return Ok(Action::requeue(ctx.cfg.requeue()));
            }
        }
    }

    let current_available = current.as_ref().map(is_available).unwrap_or(false);
    let outdated_available = outdated
        .iter()
        .filter(|s| !is_archived(*s) && !is_deleting(*s))
        .any(is_available);

    set_condition(
        &mut status.conditions,
        if current_available {
            new_condition(
                ConditionType::Available,
                ConditionStatus::True,
                "Available",
                "Latest revision is available",
                generation,
            )
        } else if outdated_available {
            new_condition(
                ConditionType::Available,
                ConditionStatus::True,
                "OutdatedAvailable",
                "An outdated revision is still serving",
                generation,
            )
        } else {
            new_condition(
                ConditionType::Available,
                ConditionStatus::False,
                "Unavailable",
                "No revision is available",
                generation,
            )
        },
    );
    set_condition(
        &mut status.conditions,
        if current_available {
            new_condition(
                ConditionType::Progressing,
                ConditionStatus::False,
                "RolloutComplete",
                "Latest revision is available",
                generation,
            )
        } else {
            new_condition(
                ConditionType::Progressing,
                ConditionStatus::True,
                "RollingOut",
                "Waiting for latest revision to become available",
                generation,
            )
        },
    );

    if current_available {
        let limit = obj
            .revision_history_limit()
            .unwrap_or(ctx.cfg.revision_history_limit)
            .max(0) as usize;
        let candidates: Vec<&D::ObjectSet> =
            outdated.iter().filter(|s| !is_deleting(*s)).collect();
        let excess = candidates.len().saturating_sub(limit);
        for (i, set) in candidates.into_iter().enumerate() {
            if i < excess {
                store.delete(&key_of(set)).await?;
                info!(revision = %set.name_any(), "deleted outdated revision");
            } else if !is_archived(set) {
                store
                    .patch(
                        &key_of(set),
                        &json!({"spec": {"lifecycleState": LifecycleState::Archived}}),
                    )
                    .await?;
                info!(revision = %set.name_any(), "archived outdated revision");
            }
        }
    }

    publish(store, &*obj, current_status.as_ref(), &status).await?;
    Ok(if current_available {
        Action::await_change()
    } else {
        Action::requeue(ctx.cfg.requeue())
    })
}

async fn publish<D: DeploymentLike>(
    store: &dyn ClusterStore,
    obj: &D,
    current: Option<&ObjectDeploymentStatus>,
    desired: &ObjectDeploymentStatus,
) -> Result<(), ReconcileErr> {
    if should_patch_status(current, desired) {
        write_status(store, obj, desired).await?;
    }
    Ok(())
}
