//! Phase walker and teardown walker.

use async_trait::async_trait;
use kube::core::DynamicObject;
use tracing::{debug, info, trace};

use crate::crd::ObjectSetTemplatePhase;
use crate::document::{describe, is_controlled_by, parse_object};
use crate::probing::{ProbeList, Prober};
use crate::store::ObjectKey;

use super::ReconcileErr;
use super::applier::{ObjectApplier, PhaseOwner};

/// Handles phases that declare a class, instead of applying their objects
/// directly.
#[async_trait]
pub trait PhaseDelegate: Send + Sync {
    /// Failure messages of the delegated phase; empty once it is available.
    async fn reconcile_phase(
        &self,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<String>, ReconcileErr>;

    /// True once nothing of the delegated phase remains.
    async fn teardown_phase(
        &self,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<bool, ReconcileErr>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalkOutcome {
    Available,
    Blocked { phase: String, failures: Vec<String> },
}

impl WalkOutcome {
    pub fn message(&self) -> String {
        match self {
            WalkOutcome::Available => "All phases available".to_string(),
            WalkOutcome::Blocked { phase, failures } => {
                format!("Phase {:?} not available: {}", phase, failures.join("; "))
            }
        }
    }
}

pub struct PhaseWalker<'a> {
    pub applier: ObjectApplier<'a>,
    pub delegate: Option<&'a dyn PhaseDelegate>,
}

fn parse_phase(phase: &ObjectSetTemplatePhase) -> Result<Vec<DynamicObject>, ReconcileErr> {
    phase
        .objects
        .iter()
        .enumerate()
        .map(|(i, o)| {
            parse_object(&o.object).map_err(|e| {
                ReconcileErr::InvalidObject(format!(
                    "phase {:?} object #{}: {}",
                    phase.name, i, e
                ))
            })
        })
        .collect()
}

fn member_key(owner: &PhaseOwner, obj: &DynamicObject) -> Option<ObjectKey> {
    let mut key = ObjectKey::from_object(obj)?;
    if key.namespace.is_none() {
        key.namespace = owner.namespace.clone();
    }
    Some(key)
}

impl PhaseWalker<'_> {
    fn delegate_for(&self, phase: &ObjectSetTemplatePhase) -> Option<&dyn PhaseDelegate> {
        phase.delegated_class().and(self.delegate)
    }

    /// Walk phases in order, stopping at the first one that is not available.
    pub async fn reconcile(
        &self,
        owner: &PhaseOwner,
        phases: &[ObjectSetTemplatePhase],
        probes: &ProbeList,
    ) -> Result<WalkOutcome, ReconcileErr> {
        // every member must parse before anything is written
        let parsed = phases
            .iter()
            .map(parse_phase)
            .collect::<Result<Vec<_>, _>>()?;

        for (phase, objects) in phases.iter().zip(parsed) {
            let failures = match self.delegate_for(phase) {
                Some(delegate) => delegate.reconcile_phase(phase).await?,
                None => self.apply_and_probe(owner, objects, probes).await?,
            };
            if !failures.is_empty() {
                debug!(phase = %phase.name, failures = failures.len(), "phase blocked");
                return Ok(WalkOutcome::Blocked {
                    phase: phase.name.clone(),
                    failures,
                });
            }
        }
        Ok(WalkOutcome::Available)
    }

    /// Reconcile a single phase, returning its probe failures.
    pub async fn reconcile_phase(
        &self,
        owner: &PhaseOwner,
        phase: &ObjectSetTemplatePhase,
        probes: &ProbeList,
    ) -> Result<Vec<String>, ReconcileErr> {
        let objects = parse_phase(phase)?;
        self.apply_and_probe(owner, objects, probes).await
    }

    async fn apply_and_probe(
        &self,
        owner: &PhaseOwner,
        objects: Vec<DynamicObject>,
        probes: &ProbeList,
    ) -> Result<Vec<String>, ReconcileErr> {
        let mut failures = Vec::new();
        for obj in objects {
            let outcome = self.applier.apply(owner, obj).await?;
            trace!(object = %describe(&outcome.object), action = ?outcome.action, "applied");
            let result = probes.probe(&outcome.object);
            if !result.success {
                failures.push(format!(
                    "{}: {}",
                    describe(&outcome.object),
                    result.messages.join(", ")
                ));
            }
        }
        Ok(failures)
    }

    /// Delete phases in reverse order. Returns true once every phase is gone;
    /// an earlier phase is only touched after the later ones are.
    pub async fn teardown(
        &self,
        owner: &PhaseOwner,
        phases: &[ObjectSetTemplatePhase],
    ) -> Result<bool, ReconcileErr> {
        for phase in phases.iter().rev() {
            let done = match self.delegate_for(phase) {
                Some(delegate) => delegate.teardown_phase(phase).await?,
                None => self.teardown_phase(owner, phase).await?,
            };
            if !done {
                debug!(phase = %phase.name, "waiting for phase teardown");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn teardown_phase(
        &self,
        owner: &PhaseOwner,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<bool, ReconcileErr> {
        let store = self.applier.store;
        let mut done = true;
        for raw in &phase.objects {
            // objects that never parsed were never applied
            let Ok(obj) = parse_object(&raw.object) else { continue };
            if owner.is_paused(&obj) {
                continue;
            }
            let Some(key) = member_key(owner, &obj) else { continue };
            let Some(live) = store.get(&key).await? else { continue };
            if !is_controlled_by(&live.metadata, owner.uid()) {
                continue;
            }
            store.delete(&key).await?;
            if store.get(&key).await?.is_some() {
                done = false;
            } else {
                info!(%key, "deleted");
            }
        }
        Ok(done)
    }
}
