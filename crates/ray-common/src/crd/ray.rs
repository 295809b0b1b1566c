//! Ray CRD types
//!
//! A `Ray` declares a head and a worker role. The operator turns each role
//! into a Deployment and exposes the head through a Service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::RayCondition;
use crate::{HEAD_LABEL_KEY, PARENT_LABEL_KEY, WORKER_LABEL_KEY};

// =============================================================================
// Role
// =============================================================================

/// One of the two replica groups of a Ray cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The single scheduler/redis node
    Head,
    /// Compute nodes joining the head
    Worker,
}

impl Role {
    /// Suffix of owned object names and role label values
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Worker => "worker",
        }
    }

    /// Pod label key that selects this role's pods
    pub fn label_key(self) -> &'static str {
        match self {
            Self::Head => HEAD_LABEL_KEY,
            Self::Worker => WORKER_LABEL_KEY,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head => write!(f, "Head"),
            Self::Worker => write!(f, "Worker"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Replica specification for a head or worker group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

/// Ray cluster specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.kubeflow.org",
    version = "v1",
    kind = "Ray",
    plural = "rays",
    namespaced,
    status = "RayStatus",
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.conditions[?(@.type==\"Health\")].status"}"#,
    printcolumn = r#"{"name":"Workers","type":"integer","jsonPath":".status.worker.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RaySpec {
    /// Head group; defaulted to one `ray-head` container when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<ReplicaSpec>,

    /// Worker group
    pub worker: ReplicaSpec,
}

impl Ray {
    /// Name of the Deployment (and, for the head, Service) owned for `role`
    pub fn object_name(&self, role: Role) -> String {
        format!("{}-{}", self.name_any(), role.suffix())
    }

    /// Labels that select the pods of `role`
    ///
    /// Shared by Deployment selectors, the head Service selector and pod
    /// listing during status aggregation.
    pub fn role_labels(&self, role: Role) -> BTreeMap<String, String> {
        BTreeMap::from([
            (role.label_key().to_string(), self.object_name(role)),
            (PARENT_LABEL_KEY.to_string(), self.name_any()),
        ])
    }

    /// The parent's own labels overlaid with the role labels
    pub fn object_labels(&self, role: Role) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.extend(self.role_labels(role));
        labels
    }

    /// `key=value` selector matching only the pods of `role`
    pub fn pod_selector(&self, role: Role) -> String {
        format!("{}={}", role.label_key(), self.object_name(role))
    }

    /// Replica spec for `role`, if declared
    pub fn replica_spec(&self, role: Role) -> Option<&ReplicaSpec> {
        match role {
            Role::Head => self.spec.head.as_ref(),
            Role::Worker => Some(&self.spec.worker),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Replica counters copied from a Deployment's status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Non-terminated pods targeted by the Deployment
    #[serde(default)]
    pub replicas: i32,
    /// Pods running the desired template
    #[serde(default)]
    pub updated_replicas: i32,
    /// Ready pods
    #[serde(default)]
    pub ready_replicas: i32,
    /// Pods ready for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,
    /// Pods still required for full capacity
    #[serde(default)]
    pub unavailable_replicas: i32,
}

/// Observed state of a Ray cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayStatus {
    /// Head Deployment counters
    #[serde(default)]
    pub head: ReplicaStatus,

    /// Worker Deployment counters
    #[serde(default)]
    pub worker: ReplicaStatus,

    /// Conditions, unique by type, in insertion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RayCondition>,

    /// When the operator first observed this Ray
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Highest `metadata.generation` observed
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time a reconcile pass changed the status
    ///
    /// Passes that observe nothing new are not persisted, so this can lag
    /// the most recent pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================
