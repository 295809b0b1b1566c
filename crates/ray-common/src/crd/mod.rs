//! Custom Resource Definitions for the Ray operator

mod condition;
mod defaults;
mod ray;

pub use condition::{ConditionStatus, RayCondition, RayConditionType};
pub use defaults::{
    DEFAULT_HEAD_ARGS, DEFAULT_HEAD_COMMAND, DEFAULT_HEAD_IMAGE, DEFAULT_HEAD_PORTS,
    DEFAULT_HEAD_REPLICAS,
};
pub use ray::{Ray, RaySpec, RayStatus, ReplicaSpec, ReplicaStatus, Role};
