//! Capability traits letting one engine drive both the namespaced and the
//! cluster-scoped flavour of each kind.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Resource;
use kube::api::ObjectMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crd::{
    ClusterObjectDeployment, ClusterObjectSet, ClusterObjectSetPhase,
    ClusterObjectSetPhaseSpec, ClusterObjectSetSpec, DependencyRef,
    LifecycleState, ObjectDeployment, ObjectDeploymentStatus, ObjectSet,
    ObjectSetPhase, ObjectSetPhaseSpec, ObjectSetPhaseStatus, ObjectSetProbe,
    ObjectSetSpec, ObjectSetStatus, ObjectSetTemplate, ObjectSetTemplatePhase,
    PausedObject,
};

pub trait Managed:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Managed for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub trait ObjectSetLike: Managed {
    /// Phase object kind used for delegated phases.
    type Phase: PhaseLike;

    fn lifecycle_state(&self) -> LifecycleState;
    fn paused_for(&self) -> &[PausedObject];
    fn phases(&self) -> &[ObjectSetTemplatePhase];
    fn availability_probes(&self) -> &[ObjectSetProbe];
    fn dependencies(&self) -> &[DependencyRef];
    fn set_status(&self) -> Option<&ObjectSetStatus>;
    fn build(meta: ObjectMeta, spec: ObjectSetSpec) -> Self;
}

pub trait PhaseLike: Managed {
    fn paused(&self) -> bool;
    fn paused_for(&self) -> &[PausedObject];
    fn revision(&self) -> i64;
    fn phase(&self) -> &ObjectSetTemplatePhase;
    fn availability_probes(&self) -> &[ObjectSetProbe];
    fn phase_status(&self) -> Option<&ObjectSetPhaseStatus>;
    fn build(meta: ObjectMeta, spec: ObjectSetPhaseSpec) -> Self;
}

pub trait DeploymentLike: Managed {
    type ObjectSet: ObjectSetLike;

    fn selector(&self) -> &LabelSelector;
    fn template(&self) -> &ObjectSetTemplate;
    fn revision_history_limit(&self) -> Option<i32>;
    fn deployment_status(&self) -> Option<&ObjectDeploymentStatus>;
}

impl ObjectSetLike for ObjectSet {
    type Phase = ObjectSetPhase;

    fn lifecycle_state(&self) -> LifecycleState {
        self.spec.lifecycle_state
    }
    fn paused_for(&self) -> &[PausedObject] {
        &self.spec.paused_for
    }
    fn phases(&self) -> &[ObjectSetTemplatePhase] {
        &self.spec.phases
    }
    fn availability_probes(&self) -> &[ObjectSetProbe] {
        &self.spec.availability_probes
    }
    fn dependencies(&self) -> &[DependencyRef] {
        &self.spec.dependencies
    }
    fn set_status(&self) -> Option<&ObjectSetStatus> {
        self.status.as_ref()
    }
    fn build(meta: ObjectMeta, spec: ObjectSetSpec) -> Self {
        ObjectSet {
            metadata: meta,
            spec,
            status: None,
        }
    }
}

impl ObjectSetLike for ClusterObjectSet {
    type Phase = ClusterObjectSetPhase;

    fn lifecycle_state(&self) -> LifecycleState {
        self.spec.lifecycle_state
    }
    fn paused_for(&self) -> &[PausedObject] {
        &self.spec.paused_for
    }
    fn phases(&self) -> &[ObjectSetTemplatePhase] {
        &self.spec.phases
    }
    fn availability_probes(&self) -> &[ObjectSetProbe] {
        &self.spec.availability_probes
    }
    fn dependencies(&self) -> &[DependencyRef] {
        &self.spec.dependencies
    }
    fn set_status(&self) -> Option<&ObjectSetStatus> {
        self.status.as_ref()
    }
    fn build(mut meta: ObjectMeta, spec: ObjectSetSpec) -> Self {
        meta.namespace = None;
        ClusterObjectSet {
            metadata: meta,
            spec: ClusterObjectSetSpec {
                lifecycle_state: spec.lifecycle_state,
                paused_for: spec.paused_for,
                phases: spec.phases,
                availability_probes: spec.availability_probes,
                dependencies: spec.dependencies,
            },
            status: None,
        }
    }
}

impl PhaseLike for ObjectSetPhase {
    fn paused(&self) -> bool {
        self.spec.paused
    }
    fn paused_for(&self) -> &[PausedObject] {
        &self.spec.paused_for
    }
    fn revision(&self) -> i64 {
        self.spec.revision
    }
    fn phase(&self) -> &ObjectSetTemplatePhase {
        &self.spec.phase
    }
    fn availability_probes(&self) -> &[ObjectSetProbe] {
        &self.spec.availability_probes
    }
    fn phase_status(&self) -> Option<&ObjectSetPhaseStatus> {
        self.status.as_ref()
    }
    fn build(meta: ObjectMeta, spec: ObjectSetPhaseSpec) -> Self {
        ObjectSetPhase {
            metadata: meta,
            spec,
            status: None,
        }
    }
}

impl PhaseLike for ClusterObjectSetPhase {
    fn paused(&self) -> bool {
        self.spec.paused
    }
    fn paused_for(&self) -> &[PausedObject] {
        &self.spec.paused_for
    }
    fn revision(&self) -> i64 {
        self.spec.revision
    }
    fn phase(&self) -> &ObjectSetTemplatePhase {
        &self.spec.phase
    }
    fn availability_probes(&self) -> &[ObjectSetProbe] {
        &self.spec.availability_probes
    }
    fn phase_status(&self) -> Option<&ObjectSetPhaseStatus> {
        self.status.as_ref()
    }
    fn build(mut meta: ObjectMeta, spec: ObjectSetPhaseSpec) -> Self {
        meta.namespace = None;
        ClusterObjectSetPhase {
            metadata: meta,
            spec: ClusterObjectSetPhaseSpec {
                paused: spec.paused,
                paused_for: spec.paused_for,
                revision: spec.revision,
                phase: spec.phase,
                availability_probes: spec.availability_probes,
            },
            status: None,
        }
    }
}

impl DeploymentLike for ObjectDeployment {
    type ObjectSet = ObjectSet;

    fn selector(&self) -> &LabelSelector {
        &self.spec.selector
    }
    fn template(&self) -> &ObjectSetTemplate {
        &self.spec.template
    }
    fn revision_history_limit(&self) -> Option<i32> {
        self.spec.revision_history_limit
    }
    fn deployment_status(&self) -> Option<&ObjectDeploymentStatus> {
        self.status.as_ref()
    }
}

impl DeploymentLike for ClusterObjectDeployment {
    type ObjectSet = ClusterObjectSet;

    fn selector(&self) -> &LabelSelector {
        &self.spec.selector
    }
    fn template(&self) -> &ObjectSetTemplate {
        &self.spec.template
    }
    fn revision_history_limit(&self) -> Option<i32> {
        self.spec.revision_history_limit
    }
    fn deployment_status(&self) -> Option<&ObjectDeploymentStatus> {
        self.status.as_ref()
    }
}
