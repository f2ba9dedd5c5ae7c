pub mod common;
pub mod object_deployment;
pub mod object_set;
pub mod object_set_phase;

pub use common::*;
pub use object_deployment::{
    ClusterObjectDeployment, ClusterObjectDeploymentSpec, ObjectDeployment,
    ObjectDeploymentSpec, ObjectDeploymentStatus,
};
pub use object_set::{
    ClusterObjectSet, ClusterObjectSetSpec, ObjectSet, ObjectSetSpec,
    ObjectSetStatus,
};
pub use object_set_phase::{
    ClusterObjectSetPhase, ClusterObjectSetPhaseSpec, ObjectSetPhase,
    ObjectSetPhaseSpec, ObjectSetPhaseStatus,
};
