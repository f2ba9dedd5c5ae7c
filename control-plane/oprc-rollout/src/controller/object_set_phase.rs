//! Reconciler for phase objects of the configured class.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{Span, debug, info, instrument};

use crate::crd::{ConditionStatus, ConditionType};
use crate::probing::parse_probes;

use super::adapters::PhaseLike;
use super::applier::{ObjectApplier, PhaseOwner};
use super::conditions::{new_condition, set_condition};
use super::phases::PhaseWalker;
use super::status::should_patch_status;
use super::{
    ControllerContext, ReconcileErr, controller_ref, ensure_finalizer, invalid_selector,
    remove_finalizer, write_status,
};

#[instrument(skip_all, fields(ns, name))]
pub async fn reconcile<P: PhaseLike>(
    obj: Arc<P>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let name = obj.name_any();
    let ns = obj.namespace();
    Span::current().record("name", name.as_str());
    Span::current().record("ns", ns.as_deref().unwrap_or(""));

    let class = obj.phase().class.as_deref().unwrap_or_default();
    if class != ctx.cfg.phase_class {
        debug!(class, "phase class handled elsewhere, skipping");
        return Ok(Action::await_change());
    }

    let store = &*ctx.store;
    let reference = controller_ref(&*obj)?;
    let uid = reference.uid.clone();
    let owner = PhaseOwner {
        reference,
        namespace: ns,
        revision: obj.revision(),
        paused: obj.paused(),
        paused_for: obj.paused_for().to_vec(),
    };
    let walker = PhaseWalker {
        applier: ObjectApplier {
            store,
            watcher: &ctx.watcher,
        },
        delegate: None,
    };

    if obj.meta().deletion_timestamp.is_some() {
        let teardown_owner = PhaseOwner {
            paused: false,
            ..owner
        };
        if walker.teardown_phase(&teardown_owner, obj.phase()).await? {
            ctx.watcher.free(&uid).await;
            remove_finalizer(store, &*obj).await?;
            info!("teardown finished");
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(ctx.cfg.requeue()));
    }

    ensure_finalizer(store, &*obj).await?;

    let current = obj.phase_status().cloned();
    let mut status = current.clone().unwrap_or_default();
    let generation = obj.meta().generation;
    status.observed_generation = generation;

    let walked = match parse_probes(obj.availability_probes()) {
        Ok(probes) => walker.reconcile_phase(&owner, obj.phase(), &probes).await,
        Err(e) => Err(invalid_selector(e)),
    };
    let failures = match walked {
        Ok(failures) => failures,
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
            if should_patch_status(current.as_ref(), &status) {
                write_status(store, &*obj, &status).await?;
            }
            return Err(ReconcileErr::InvalidObject(msg));
        }
        Err(e) => return Err(e),
    };

    let action = if failures.is_empty() {
        set_condition(
            &mut status.conditions,
            new_condition(
                ConditionType::Available,
                ConditionStatus::True,
                "Available",
                "Phase available",
                generation,
            ),
        );
        Action::await_change()
    } else {
        set_condition(
            &mut status.conditions,
            new_condition(
                ConditionType::Available,
                ConditionStatus::False,
                "ProbeFailure",
                failures.join("; "),
                generation,
            ),
        );
        Action::requeue(ctx.cfg.requeue())
    };

    if should_patch_status(current.as_ref(), &status) {
        write_status(store, &*obj, &status).await?;
    }
    Ok(action)
}
