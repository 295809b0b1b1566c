//! Status aggregation
//!
//! Folds the applied head and worker Deployments, plus the pods they select,
//! into the Ray's status: replica counters, per-role Deployment conditions
//! and an overall `Health` condition. The status is written back once at the
//! end of a pass, and only when the observation changed.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use ray_common::crd::{ConditionStatus, Ray, RayConditionType, RayStatus, ReplicaStatus, Role};
use ray_common::Error;

use crate::client::RayKubeClient;

/// Number of roles that must be available for the Ray to be healthy
pub const SHOULD_ACTIVE: usize = 2;

const DEPLOYMENT_AVAILABLE: &str = "Available";
const DEPLOYMENT_PROGRESSING: &str = "Progressing";
const DEPLOYMENT_REPLICA_FAILURE: &str = "ReplicaFailure";

/// How a role counts toward `Health`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleState {
    /// Deployment reports Available=True
    Active,
    /// Too early to judge, or not available while all pods are pending/running
    Running,
    /// Not available with at least one pod outside pending/running
    Down,
}

/// A role's applied Deployment and the pods it selects
#[derive(Clone, Copy, Debug)]
pub struct RoleObservation<'a> {
    /// Which role this is
    pub role: Role,
    /// The Deployment returned by apply
    pub deployment: &'a Deployment,
    /// Pods matching the role selector
    pub pods: &'a [Pod],
}

/// Recompute the Ray's status and persist it if it changed
///
/// Pod listing failures abort before anything is written. Returns whether a
/// status write happened.
pub async fn update_status(
    ray: &Ray,
    head: &Deployment,
    worker: &Deployment,
    kube: &dyn RayKubeClient,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    let name = ray.name_any();
    let namespace = ray.namespace().ok_or_else(|| {
        Error::internal_with_context("status", format!("Ray {name} has no namespace"))
    })?;

    let worker_pods = kube
        .list_pods(&namespace, &ray.pod_selector(Role::Worker))
        .await?;
    let head_pods = kube
        .list_pods(&namespace, &ray.pod_selector(Role::Head))
        .await?;

    let previous = ray.status.clone().unwrap_or_default();
    let status = aggregate_status(
        ray,
        RoleObservation {
            role: Role::Worker,
            deployment: worker,
            pods: &worker_pods,
        },
        RoleObservation {
            role: Role::Head,
            deployment: head,
            pods: &head_pods,
        },
        now,
    );

    if !observation_changed(&previous, &status) {
        debug!(ray = %name, "status unchanged, skipping write");
        return Ok(false);
    }

    debug!(
        ray = %name,
        health = ?status.condition(RayConditionType::Health).map(|c| c.status),
        "updating Ray status"
    );
    kube.patch_ray_status(&namespace, &name, &status).await?;
    Ok(true)
}

/// Compute the next status from the current one and fresh observations
///
/// Worker is folded in before head so conditions keep a stable order.
pub fn aggregate_status(
    ray: &Ray,
    worker: RoleObservation<'_>,
    head: RoleObservation<'_>,
    now: DateTime<Utc>,
) -> RayStatus {
    let mut status = ray.status.clone().unwrap_or_default();

    status.start_time.get_or_insert(now);
    status.last_reconcile_time = Some(now);
    let generation = ray.metadata.generation.unwrap_or_default();
    if generation > status.observed_generation {
        status.observed_generation = generation;
    }

    status.worker = replica_status(worker.deployment);
    status.head = replica_status(head.deployment);

    let mut active = 0;
    let mut running = 0;
    for observation in [worker, head] {
        match observe_role(&mut status, observation, now) {
            RoleState::Active => active += 1,
            RoleState::Running => running += 1,
            RoleState::Down => {}
        }
    }

    let overall = health(active, running);
    status.set_condition(RayConditionType::Health, overall, "", "", now);
    status
}

/// Whether `next` records anything `previous` does not
///
/// Refresh-only timestamps (`lastReconcileTime`, each condition's
/// `lastUpdateTime`) are ignored. Writing them alone would fire a watch event
/// on the Ray and start another pass.
pub fn observation_changed(previous: &RayStatus, next: &RayStatus) -> bool {
    fn without_refresh_times(status: &RayStatus) -> RayStatus {
        let mut status = status.clone();
        status.last_reconcile_time = None;
        for condition in &mut status.conditions {
            condition.last_update_time = condition.last_transition_time;
        }
        status
    }
    without_refresh_times(previous) != without_refresh_times(next)
}

/// `True` when every role is active, `Unknown` when the rest are still
/// coming up, `False` otherwise
pub fn health(active: usize, running: usize) -> ConditionStatus {
    if active == SHOULD_ACTIVE {
        ConditionStatus::True
    } else if active + running == SHOULD_ACTIVE {
        ConditionStatus::Unknown
    } else {
        ConditionStatus::False
    }
}

/// Whether every pod is `Pending` or `Running`
///
/// Bridges the window where a Deployment reports Available=False although
/// its pods are healthy. Vacuously true for no pods.
pub fn all_pods_pending_or_running(pods: &[Pod]) -> bool {
    pods.iter().all(|pod| {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        matches!(phase, Some("Pending") | Some("Running"))
    })
}

fn observe_role(next: &mut RayStatus, obs: RoleObservation<'_>, now: DateTime<Utc>) -> RoleState {
    let conditions = deployment_conditions(obs.deployment);
    let available = RayConditionType::available(obs.role);

    let state = match find_condition(conditions, DEPLOYMENT_AVAILABLE) {
        None => RoleState::Running,
        Some(c) if ConditionStatus::from_k8s(&c.status) == ConditionStatus::True => {
            next.set_condition(available, ConditionStatus::True, "", "", now);
            RoleState::Active
        }
        Some(_) => {
            next.set_condition(available, ConditionStatus::False, "", "", now);
            if all_pods_pending_or_running(obs.pods) {
                RoleState::Running
            } else {
                RoleState::Down
            }
        }
    };

    mirror_deployment_conditions(next, obs.role, conditions, now);
    state
}

fn mirror_deployment_conditions(
    status: &mut RayStatus,
    role: Role,
    conditions: &[DeploymentCondition],
    now: DateTime<Utc>,
) {
    let mut replica_failure_seen = false;
    for condition in conditions {
        let type_ = match condition.type_.as_str() {
            DEPLOYMENT_PROGRESSING => RayConditionType::progressing(role),
            DEPLOYMENT_REPLICA_FAILURE => {
                replica_failure_seen = true;
                RayConditionType::replica_failure(role)
            }
            _ => continue,
        };
        status.set_condition(
            type_,
            ConditionStatus::from_k8s(&condition.status),
            condition.reason.clone().unwrap_or_default(),
            condition.message.clone().unwrap_or_default(),
            now,
        );
    }

    if !replica_failure_seen {
        status.set_condition(
            RayConditionType::replica_failure(role),
            ConditionStatus::Unknown,
            "",
            "",
            now,
        );
    }
}

fn deployment_conditions(deployment: &Deployment) -> &[DeploymentCondition] {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

fn find_condition<'a>(
    conditions: &'a [DeploymentCondition],
    type_: &str,
) -> Option<&'a DeploymentCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

fn replica_status(deployment: &Deployment) -> ReplicaStatus {
    let Some(s) = deployment.status.as_ref() else {
        return ReplicaStatus::default();
    };
    ReplicaStatus {
        replicas: s.replicas.unwrap_or_default(),
        updated_replicas: s.updated_replicas.unwrap_or_default(),
        ready_replicas: s.ready_replicas.unwrap_or_default(),
        available_replicas: s.available_replicas.unwrap_or_default(),
        unavailable_replicas: s.unavailable_replicas.unwrap_or_default(),
    }
}
