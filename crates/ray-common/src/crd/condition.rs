//! Status conditions for the Ray CRD
//!
//! Conditions are unique by type and kept in insertion order. Writing a
//! condition always refreshes `lastUpdateTime`; `lastTransitionTime` moves
//! only when the status value flips.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ray::{RayStatus, Role};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Map a Kubernetes condition status string; anything unrecognized is `Unknown`
    pub fn from_k8s(status: &str) -> Self {
        match status {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kind of fact a `RayCondition` reports
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum RayConditionType {
    /// Aggregate health of head and worker
    Health,
    /// Head Deployment reports Available
    RayHeadDeploymentAvailable,
    /// Mirror of the head Deployment's Progressing condition
    RayHeadDeploymentProgressing,
    /// Mirror of the head Deployment's ReplicaFailure condition
    RayHeadDeploymentReplicaFailure,
    /// Worker Deployment reports Available
    RayWorkerDeploymentAvailable,
    /// Mirror of the worker Deployment's Progressing condition
    RayWorkerDeploymentProgressing,
    /// Mirror of the worker Deployment's ReplicaFailure condition
    RayWorkerDeploymentReplicaFailure,
}

impl RayConditionType {
    /// `{Role}DeploymentAvailable`
    pub fn available(role: Role) -> Self {
        match role {
            Role::Head => Self::RayHeadDeploymentAvailable,
            Role::Worker => Self::RayWorkerDeploymentAvailable,
        }
    }

    /// `{Role}DeploymentProgressing`
    pub fn progressing(role: Role) -> Self {
        match role {
            Role::Head => Self::RayHeadDeploymentProgressing,
            Role::Worker => Self::RayWorkerDeploymentProgressing,
        }
    }

    /// `{Role}DeploymentReplicaFailure`
    pub fn replica_failure(role: Role) -> Self {
        match role {
            Role::Head => Self::RayHeadDeploymentReplicaFailure,
            Role::Worker => Self::RayWorkerDeploymentReplicaFailure,
        }
    }
}

impl std::fmt::Display for RayConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Health => "Health",
            Self::RayHeadDeploymentAvailable => "RayHeadDeploymentAvailable",
            Self::RayHeadDeploymentProgressing => "RayHeadDeploymentProgressing",
            Self::RayHeadDeploymentReplicaFailure => "RayHeadDeploymentReplicaFailure",
            Self::RayWorkerDeploymentAvailable => "RayWorkerDeploymentAvailable",
            Self::RayWorkerDeploymentProgressing => "RayWorkerDeploymentProgressing",
            Self::RayWorkerDeploymentReplicaFailure => "RayWorkerDeploymentReplicaFailure",
        };
        f.write_str(s)
    }
}

/// A condition on a Ray's status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayCondition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub type_: RayConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the last write
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time this condition was written
    pub last_update_time: DateTime<Utc>,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
}

impl RayStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: RayConditionType) -> Option<&RayCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or update the condition of `type_`
    ///
    /// New types are appended with both timestamps at `now`. Existing ones get
    /// `now` as update time, the new reason and message, and `now` as
    /// transition time only if `status` differs from the stored value.
    pub fn set_condition(
        &mut self,
        type_: RayConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();

        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.last_update_time = now;
                existing.reason = reason;
                existing.message = message;
            }
            None => self.conditions.push(RayCondition {
                type_,
                status,
                reason,
                message,
                last_update_time: now,
                last_transition_time: now,
            }),
        }
    }
}
