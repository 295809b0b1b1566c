//! Ray reconciliation
//!
//! One pass: validate, default, compose, apply the head Service, the head
//! Deployment and the worker Deployment, then aggregate status. Policy and
//! composition failures wait for a spec change; API failures requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use ray_common::crd::Ray;
use ray_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use ray_common::Error;

use crate::apply::{apply_deployment, apply_service};
use crate::client::{RayKubeClient, RayKubeClientImpl};
use crate::composer::{Composer, DefaultComposer};
use crate::status::update_status;
use crate::validator::{NoopValidator, Validator};

/// Reporting component name on Events
pub const CONTROLLER_NAME: &str = "ray-operator";

/// Delay before retrying a pass that failed with a retryable error
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Shared, immutable capabilities for every reconcile pass
pub struct Context {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn RayKubeClient>,
    /// Builds the desired owned objects
    pub composer: Arc<dyn Composer>,
    /// Admission policy
    pub validator: Arc<dyn Validator>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Source of the pass timestamp
    pub clock: fn() -> DateTime<Utc>,
}

impl Context {
    /// Create a new Context with the given dependencies
    pub fn new(
        kube: Arc<dyn RayKubeClient>,
        composer: Arc<dyn Composer>,
        validator: Arc<dyn Validator>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            composer,
            validator,
            events,
            clock: Utc::now,
        }
    }

    /// Production context: real client, default composer, accept-all validator
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(RayKubeClientImpl::new(client)),
            Arc::new(DefaultComposer),
            Arc::new(NoopValidator),
            events,
        )
    }

    /// Create a context for testing with a mock or fake client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn RayKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(DefaultComposer),
            Arc::new(NoopValidator),
            Arc::new(ray_common::events::NoopEventPublisher),
        )
    }
}

/// Reconcile a Ray
#[instrument(skip(ray, ctx), fields(ray = %ray.name_any()))]
pub async fn reconcile(ray: Arc<Ray>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling ray");
    let now = (ctx.clock)();

    if ray.namespace().is_none() {
        error!("Ray is missing namespace");
        return Ok(Action::await_change());
    }

    if let Err(e) = ctx.validator.validate_ray(&ray) {
        warn!(error = %e, "ray validation failed");
        ctx.events
            .publish(
                &ray.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATE,
                Some(e.to_string()),
            )
            .await;
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    let mut defaulted = (*ray).clone();
    defaulted.spec.apply_defaults();

    // Head ports must be defaulted before the Service copies them
    let desired_service = ctx.composer.desired_head_service(&defaulted)?;
    let desired_head = ctx.composer.desired_head(&defaulted)?;
    let desired_worker = ctx.composer.desired_worker(&defaulted)?;

    let kube = ctx.kube.as_ref();
    let events = ctx.events.as_ref();
    apply_service(&ray, desired_service, kube, events).await?;
    let head = apply_deployment(&ray, desired_head, kube, events).await?;
    let worker = apply_deployment(&ray, desired_worker, kube, events).await?;

    let written = update_status(&ray, &head, &worker, kube, now).await?;
    debug!(status_written = written, "reconcile pass complete");

    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(ray: Arc<Ray>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        ray = %ray.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use ray_common::crd::{ConditionStatus, RayConditionType, Role};

    use crate::client::MockRayKubeClient;
    use crate::composer::MockComposer;
    use crate::testing::{
        pod_in_phase, ray_with_worker_template, sample_ray, t0, worker_template, FakeCluster,
        RecordingEventPublisher,
    };
    use crate::validator::MockValidator;

    fn fixed_clock() -> DateTime<Utc> {
        t0()
    }

    fn fake_context(
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingEventPublisher>,
    ) -> Arc<Context> {
        let mut ctx = Context::new(
            cluster,
            Arc::new(DefaultComposer),
            Arc::new(NoopValidator),
            events,
        );
        ctx.clock = fixed_clock;
        Arc::new(ctx)
    }

    fn health(status: Option<&ray_common::crd::RayStatus>) -> Option<ConditionStatus> {
        status
            .and_then(|s| s.condition(RayConditionType::Health))
            .map(|c| c.status)
    }

    // =========================================================================
    // Story Tests: full passes against an in-memory cluster
    // =========================================================================

    /// Story: a Ray with only workers gets a defaulted head, a head Service
    /// with the default ports, and becomes healthy once both roles are available
    #[tokio::test]
    async fn story_worker_only_ray_converges_to_healthy() {
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = fake_context(cluster.clone(), events.clone());
        let mut ray = ray_with_worker_template("demo", Some(worker_template()));

        let action = reconcile(Arc::new(ray.clone()), ctx.clone())
            .await
            .expect("first pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.creates(), 3);
        assert_eq!(events.reasons(), vec![reasons::CREATED.to_string(); 3]);

        let head = cluster
            .deployment("default", "demo-head")
            .expect("head created");
        assert_eq!(head.spec.as_ref().and_then(|s| s.replicas), Some(1));
        let head_container = head
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers[0].clone())
            .expect("head container");
        assert_eq!(head_container.name, "ray-head");
        assert_eq!(head_container.image.as_deref(), Some("rayproject/examples"));

        let worker = cluster
            .deployment("default", "demo-worker")
            .expect("worker created");
        assert_eq!(worker.spec.as_ref().and_then(|s| s.replicas), Some(3));

        let ports: Vec<i32> = cluster
            .service("default", "demo-head")
            .and_then(|s| s.spec)
            .and_then(|s: ServiceSpec| s.ports)
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default();
        assert_eq!(ports, vec![6379, 6380, 6381, 12345, 12346]);

        // Neither Deployment has reported yet
        assert_eq!(
            health(cluster.last_status().as_ref()),
            Some(ConditionStatus::Unknown)
        );

        cluster.set_deployment_conditions("default", "demo-head", &[("Available", "True")]);
        cluster.set_deployment_conditions("default", "demo-worker", &[("Available", "True")]);
        ray.status = cluster.last_status();

        reconcile(Arc::new(ray), ctx).await.expect("second pass");

        assert_eq!(
            health(cluster.last_status().as_ref()),
            Some(ConditionStatus::True)
        );
        assert_eq!(cluster.creates(), 3);
        assert_eq!(cluster.updates(), 0);
    }

    /// Story: a head whose Deployment has not reported Available and whose
    /// pods are pending keeps Health at Unknown
    #[tokio::test]
    async fn story_pending_head_keeps_health_unknown() {
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = fake_context(cluster.clone(), events);
        let mut ray = sample_ray("demo");

        reconcile(Arc::new(ray.clone()), ctx.clone())
            .await
            .expect("first pass");
        cluster.set_deployment_conditions("default", "demo-worker", &[("Available", "True")]);
        cluster.add_pod(
            "default",
            pod_in_phase("demo-head-abc", "Pending"),
            ray.role_labels(Role::Head),
        );
        ray.status = cluster.last_status();

        reconcile(Arc::new(ray), ctx).await.expect("second pass");

        let status = cluster.last_status().expect("status written");
        let head_available = status.condition(RayConditionType::available(Role::Head));
        assert!(head_available.is_none());
        assert_eq!(
            status
                .condition(RayConditionType::available(Role::Worker))
                .map(|c| c.status),
            Some(ConditionStatus::True)
        );
        assert_eq!(health(Some(&status)), Some(ConditionStatus::Unknown));
    }

    /// Story: re-running a pass with nothing changed writes nothing
    #[tokio::test]
    async fn story_steady_state_pass_is_a_no_op() {
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = fake_context(cluster.clone(), events.clone());
        let mut ray = sample_ray("demo");

        reconcile(Arc::new(ray.clone()), ctx.clone())
            .await
            .expect("first pass");
        ray.status = cluster.last_status();
        reconcile(Arc::new(ray), ctx).await.expect("second pass");

        assert_eq!(cluster.creates(), 3);
        assert_eq!(cluster.updates(), 0);
        assert_eq!(cluster.status_writes(), 1);
        assert_eq!(events.reasons().len(), 3);
    }

    /// Story: scaling workers updates only the worker Deployment
    #[tokio::test]
    async fn story_scaling_workers_updates_worker_deployment() {
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = fake_context(cluster.clone(), events.clone());
        let mut ray = sample_ray("demo");

        reconcile(Arc::new(ray.clone()), ctx.clone())
            .await
            .expect("first pass");
        ray.spec.worker.replicas = Some(5);
        ray.status = cluster.last_status();
        reconcile(Arc::new(ray), ctx).await.expect("second pass");

        assert_eq!(cluster.updates(), 1);
        let worker = cluster
            .deployment("default", "demo-worker")
            .expect("worker");
        assert_eq!(worker.spec.and_then(|s| s.replicas), Some(5));
        assert_eq!(
            events.reasons().last().map(String::as_str),
            Some(reasons::UPDATED)
        );
    }

    /// Story: a rejected Ray is left alone until its spec changes
    #[tokio::test]
    async fn story_validation_failure_awaits_change() {
        let mut validator = MockValidator::new();
        validator
            .expect_validate_ray()
            .returning(|_| Err(Error::validation_for("demo", "not allowed")));
        let mut kube = MockRayKubeClient::new();
        kube.expect_get_deployment().never();
        kube.expect_get_service().never();
        kube.expect_patch_ray_status().never();
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(DefaultComposer),
            Arc::new(validator),
            events.clone(),
        ));

        let action = reconcile(Arc::new(sample_ray("demo")), ctx)
            .await
            .expect("validation failure is not an error");

        assert_eq!(action, Action::await_change());
        assert_eq!(
            events.reasons(),
            vec![reasons::VALIDATION_FAILED.to_string()]
        );
        assert_eq!(events.warnings(), 1);
    }

    /// Story: a Ray whose worker has no template cannot be composed and is
    /// not requeued
    #[tokio::test]
    async fn story_composition_failure_is_terminal() {
        let mut kube = MockRayKubeClient::new();
        kube.expect_get_service().never();
        kube.expect_get_deployment().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));
        let ray = Arc::new(ray_with_worker_template("demo", None));

        let err = reconcile(ray.clone(), ctx.clone())
            .await
            .expect_err("composition fails");

        assert!(matches!(err, Error::Composition { .. }));
        assert_eq!(error_policy(ray, &err, ctx), Action::await_change());
    }

    /// Story: composer errors surface before anything is applied
    #[tokio::test]
    async fn story_composer_failure_applies_nothing() {
        let mut composer = MockComposer::new();
        composer
            .expect_desired_head_service()
            .returning(|_| Err(Error::composition_for("demo", "no owner reference")));
        let mut kube = MockRayKubeClient::new();
        kube.expect_get_service().never();
        let ctx = Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(composer),
            Arc::new(NoopValidator),
            Arc::new(RecordingEventPublisher::default()),
        ));

        let result = reconcile(Arc::new(sample_ray("demo")), ctx).await;
        assert!(result.is_err());
    }

    /// Story: an apply failure is retried
    #[tokio::test]
    async fn story_apply_failure_requeues() {
        let mut kube = MockRayKubeClient::new();
        kube.expect_get_service()
            .returning(|_, _| Err(Error::internal("connection refused")));
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(DefaultComposer),
            Arc::new(NoopValidator),
            events.clone(),
        ));
        let ray = Arc::new(sample_ray("demo"));

        let err = reconcile(ray.clone(), ctx.clone())
            .await
            .expect_err("apply fails");

        assert!(err.is_retryable());
        assert_eq!(error_policy(ray, &err, ctx), Action::requeue(RETRY_DELAY));
        assert_eq!(events.reasons(), vec![reasons::CREATE_FAILED.to_string()]);
    }

    #[tokio::test]
    async fn missing_namespace_awaits_change() {
        let mut kube = MockRayKubeClient::new();
        kube.expect_get_service().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));
        let mut ray = sample_ray("demo");
        ray.metadata.namespace = None;

        let action = reconcile(Arc::new(ray), ctx).await.expect("no error");
        assert_eq!(action, Action::await_change());
    }
}
