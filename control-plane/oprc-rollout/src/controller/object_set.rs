//! Revision (ObjectSet) controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{Span, debug, info, instrument, warn};

use crate::crd::{
    ConditionStatus, ConditionType, LifecycleState, OWNER_LABEL, ObjectSetPhaseSpec,
    ObjectSetStatus, ObjectSetTemplatePhase,
};
use crate::probing::parse_probes;
use crate::store::{ObjectKey, from_dynamic, to_dynamic};

use super::adapters::{ObjectSetLike, PhaseLike};
use super::applier::{ObjectApplier, PhaseOwner, owner_label_value};
use super::conditions::{
    find, is_true, is_true_at_generation, new_condition, remove_condition, set_condition,
};
use super::phases::{PhaseDelegate, PhaseWalker, WalkOutcome};
use super::status::should_patch_status;
use super::{
    ControllerContext, ReconcileErr, controller_ref, ensure_finalizer, invalid_selector,
    missing_dependencies, remove_finalizer, revision_annotation, write_status,
};

/// Name of the phase object a delegated phase is handed to.
pub fn phase_object_name(object_set: &str, phase: &str) -> String {
    format!("{object_set}-{phase}")
}

/// Hands class-tagged phases to phase objects owned by the ObjectSet.
struct PhaseObjectDelegate<'a, K: ObjectSetLike> {
    ctx: &'a ControllerContext,
    parent: &'a K,
    owner: &'a PhaseOwner,
}

impl<'a, K: ObjectSetLike> PhaseObjectDelegate<'a, K> {
    fn key(&self, phase: &ObjectSetTemplatePhase) -> ObjectKey {
        ObjectKey::of::<K::Phase>(
            self.parent.meta().namespace.as_deref(),
            &phase_object_name(&self.parent.name_any(), &phase.name),
        )
    }

    fn desired(&self, phase: &ObjectSetTemplatePhase) -> K::Phase {
        let meta = ObjectMeta {
            name: Some(phase_object_name(&self.parent.name_any(), &phase.name)),
            namespace: self.parent.meta().namespace.clone(),
            labels: Some(BTreeMap::from([(
                OWNER_LABEL.to_string(),
                owner_label_value(&self.parent.name_any()),
            )])),
            owner_references: Some(vec![self.owner.reference.clone()]),
            ..Default::default()
        };
        K::Phase::build(
            meta,
            ObjectSetPhaseSpec {
                paused: self.owner.paused,
                paused_for: self.owner.paused_for.clone(),
                revision: self.owner.revision,
                phase: phase.clone(),
                availability_probes: self.parent.availability_probes().to_vec(),
            },
        )
    }
}

impl<K: ObjectSetLike> PhaseObjectDelegate<'_, K> {
    /// Hand the owner's paused objects to every existing phase object. True
    /// once each of them reports status for the spec that carries them.
    async fn sync_paused(&self, phases: &[ObjectSetTemplatePhase]) -> Result<bool, ReconcileErr> {
        let store = &*self.ctx.store;
        let mut settled = true;
        for phase in phases.iter().filter(|p| p.delegated_class().is_some()) {
            let key = self.key(phase);
            let Some(live) = store.get(&key).await? else {
                continue;
            };
            let live: K::Phase = from_dynamic(&live)?;
            if live.paused_for() != self.owner.paused_for.as_slice() {
                store
                    .patch(&key, &json!({"spec": {"pausedFor": self.owner.paused_for}}))
                    .await?;
                debug!(%key, "paused objects handed to phase object");
                settled = false;
            } else if live.phase_status().and_then(|s| s.observed_generation)
                != live.meta().generation
            {
                settled = false;
            }
        }
        Ok(settled)
    }
}

fn same_phase_spec<P: PhaseLike>(a: &P, b: &P) -> bool {
    a.paused() == b.paused()
        && a.paused_for() == b.paused_for()
        && a.revision() == b.revision()
        && a.phase() == b.phase()
        && a.availability_probes() == b.availability_probes()
}

#[async_trait]
impl<'a, K: ObjectSetLike> PhaseDelegate for PhaseObjectDelegate<'a, K> {
    async fn reconcile_phase(
        &self,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<String>, ReconcileErr> {
        let store = &*self.ctx.store;
        let key = self.key(phase);
        let desired = self.desired(phase);
        let Some(live) = store.get(&key).await? else {
            store.create(&to_dynamic(&desired)?).await?;
            info!(%key, "created phase object");
            return Ok(vec![format!("{key}: waiting for phase object status")]);
        };
        let live: K::Phase = from_dynamic(&live)?;
        if !same_phase_spec(&live, &desired) {
            let mut spec = serde_json::to_value(&desired)?
                .get("spec")
                .cloned()
                .unwrap_or_default();
            // merge patches keep omitted fields, so empty lists are sent explicitly
            if let Some(map) = spec.as_object_mut() {
                map.insert("pausedFor".into(), json!(self.owner.paused_for));
                map.insert(
                    "availabilityProbes".into(),
                    json!(self.parent.availability_probes()),
                );
            }
            store.patch(&key, &json!({ "spec": spec })).await?;
            return Ok(vec![format!("{key}: waiting for phase object status")]);
        }
        let conditions = live
            .phase_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        if is_true_at_generation(conditions, ConditionType::Available, live.meta().generation) {
            return Ok(Vec::new());
        }
        let reason = find(conditions, ConditionType::Available)
            .and_then(|c| c.message.clone())
            .unwrap_or_else(|| "not yet reconciled".to_string());
        Ok(vec![format!("{key}: {reason}")])
    }

    async fn teardown_phase(
        &self,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<bool, ReconcileErr> {
        let store = &*self.ctx.store;
        let key = self.key(phase);
        if store.get(&key).await?.is_none() {
            return Ok(true);
        }
        store.delete(&key).await?;
        Ok(store.get(&key).await?.is_none())
    }
}

#[instrument(skip_all, fields(ns, name))]
pub async fn reconcile<K: ObjectSetLike>(
    obj: Arc<K>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let name = obj.name_any();
    let ns = obj.namespace();
    Span::current().record("name", name.as_str());
    Span::current().record("ns", ns.as_deref().unwrap_or(""));

    let store = &*ctx.store;
    let reference = controller_ref(&*obj)?;
    let uid = reference.uid.clone();
    let revision = revision_annotation(obj.meta());
    let owner = PhaseOwner {
        reference,
        namespace: ns.clone(),
        revision: revision.unwrap_or_default(),
        paused: obj.lifecycle_state() == LifecycleState::Paused,
        paused_for: obj.paused_for().to_vec(),
    };
    // teardown ignores the lifecycle pause but still honours paused objects
    let teardown_owner = PhaseOwner {
        paused: false,
        ..owner.clone()
    };
    let delegate = PhaseObjectDelegate {
        ctx: &ctx,
        parent: &*obj,
        owner: &owner,
    };
    let teardown_delegate = PhaseObjectDelegate {
        ctx: &ctx,
        parent: &*obj,
        owner: &teardown_owner,
    };
    let applier = || ObjectApplier {
        store,
        watcher: &ctx.watcher,
    };

    if obj.meta().deletion_timestamp.is_some() {
        let walker = PhaseWalker {
            applier: applier(),
            delegate: Some(&teardown_delegate),
        };
        if walker.teardown(&teardown_owner, obj.phases()).await? {
            ctx.watcher.free(&uid).await;
            remove_finalizer(store, &*obj).await?;
            info!("teardown finished");
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(ctx.cfg.requeue()));
    }

    ensure_finalizer(store, &*obj).await?;

    let current = obj.set_status().cloned();
    let mut status = current.clone().unwrap_or_default();
    let generation = obj.meta().generation;
    status.observed_generation = generation;
    status.revision = revision;

    if obj.lifecycle_state() == LifecycleState::Archived {
        status.paused_for = obj.paused_for().to_vec();
        let walker = PhaseWalker {
            applier: applier(),
            delegate: Some(&teardown_delegate),
        };
        let done = walker.teardown(&teardown_owner, obj.phases()).await?;
        let action = if done {
            ctx.watcher.free(&uid).await;
            set_condition(
                &mut status.conditions,
                new_condition(
                    ConditionType::Archived,
                    ConditionStatus::True,
                    "Archived",
                    "All phases torn down",
                    generation,
                ),
            );
            for t in [
                ConditionType::Available,
                ConditionType::Paused,
                ConditionType::Progressing,
            ] {
                remove_condition(&mut status.conditions, t);
            }
            Action::await_change()
        } else {
            set_condition(
                &mut status.conditions,
                new_condition(
                    ConditionType::Archived,
                    ConditionStatus::False,
                    "ArchivalInProgress",
                    "Tearing down phases",
                    generation,
                ),
            );
            Action::requeue(ctx.cfg.requeue())
        };
        publish(store, &*obj, current.as_ref(), &status).await?;
        if done {
            info!("archived");
        }
        return Ok(action);
    }
    remove_condition(&mut status.conditions, ConditionType::Archived);

    // the paused set is only reported once delegated phases run with it
    let handed_over = delegate.sync_paused(obj.phases()).await?
        || status.paused_for.as_slice() == obj.paused_for();
    if handed_over {
        status.paused_for = obj.paused_for().to_vec();
    } else {
        debug!("waiting for phase objects to observe paused objects");
    }

    let missing = missing_dependencies(store, obj.dependencies()).await?;
    if !missing.is_empty() {
        warn!(missing = ?missing, "dependencies not served, backing off");
        set_condition(
            &mut status.conditions,
            new_condition(
                ConditionType::Available,
                ConditionStatus::False,
                "MissingDependency",
                format!("Missing dependencies: {}", missing.join(", ")),
                generation,
            ),
        );
        publish(store, &*obj, current.as_ref(), &status).await?;
        return Ok(Action::requeue(ctx.cfg.dependency_backoff()));
    }

    let walker = PhaseWalker {
        applier: applier(),
        delegate: Some(&delegate),
    };
    let walked = match parse_probes(obj.availability_probes()) {
        Ok(probes) => walker.reconcile(&owner, obj.phases(), &probes).await,
        Err(e) => Err(invalid_selector(e)),
    };
    let outcome = match walked {
        Ok(outcome) => outcome,
        Err(ReconcileErr::InvalidObject(msg)) => {
            set_condition(
                &mut status.conditions,
                new_condition(
                    ConditionType::Available,
                    ConditionStatus::False,
                    "InvalidObject",
                    msg.clone(),
                    generation,
                ),
            );
            publish(store, &*obj, current.as_ref(), &status).await?;
            return Err(ReconcileErr::InvalidObject(msg));
        }
        Err(e) => return Err(e),
    };

    let action = match &outcome {
        WalkOutcome::Available => {
            set_condition(
                &mut status.conditions,
                new_condition(
                    ConditionType::Available,
                    ConditionStatus::True,
                    "Available",
                    outcome.message(),
                    generation,
                ),
            );
            // latched once, never retracted
            if !is_true(&status.conditions, ConditionType::Succeeded) {
                info!("revision succeeded");
                set_condition(
                    &mut status.conditions,
                    new_condition(
                        ConditionType::Succeeded,
                        ConditionStatus::True,
                        "Available",
                        "Revision became available",
                        generation,
                    ),
                );
            }
            Action::await_change()
        }
        WalkOutcome::Blocked { .. } => {
            set_condition(
                &mut status.conditions,
                new_condition(
                    ConditionType::Available,
                    ConditionStatus::False,
                    "ProbeFailure",
                    outcome.message(),
                    generation,
                ),
            );
            Action::requeue(ctx.cfg.requeue())
        }
    };

    if obj.lifecycle_state() == LifecycleState::Paused {
        set_condition(
            &mut status.conditions,
            new_condition(
                ConditionType::Paused,
                ConditionStatus::True,
                "Paused",
                "Lifecycle state is Paused",
                generation,
            ),
        );
    } else {
        remove_condition(&mut status.conditions, ConditionType::Paused);
    }

    publish(store, &*obj, current.as_ref(), &status).await?;
    if !handed_over {
        return Ok(Action::requeue(ctx.cfg.requeue()));
    }
    Ok(action)
}

async fn publish<K: ObjectSetLike>(
    store: &dyn crate::store::ClusterStore,
    obj: &K,
    current: Option<&ObjectSetStatus>,
    desired: &ObjectSetStatus,
) -> Result<(), ReconcileErr> {
    if should_patch_status(current, desired) {
        write_status(store, obj, desired).await?;
    }
    Ok(())
}
