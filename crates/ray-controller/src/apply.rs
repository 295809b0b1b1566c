//! Idempotent create-or-update of owned objects
//!
//! Each apply looks the object up by name, creates it when absent, and
//! replaces it only when its change predicate fires. The predicates are
//! narrow on purpose: Deployments are compared on replicas and container
//! resources, Services on port numbers. Everything else is first-write-wins
//! so the operator does not fight defaulting by the API server or edits by
//! other actors.
//!
//! Every create or update outcome, success or failure, emits exactly one
//! Event on the Ray.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use ray_common::crd::Ray;
use ray_common::events::{actions, reasons, EventPublisher};
use ray_common::Error;

use crate::client::RayKubeClient;
use crate::semantic::resources_equal;

/// Replica count the API server assumes when a Deployment leaves it unset
const DEFAULT_DEPLOYMENT_REPLICAS: i32 = 1;

/// An owned object kind the applier knows how to fetch, write and diff
#[async_trait]
trait Applicable: Resource + Clone + Send + Sync + Sized {
    const KIND: &'static str;

    async fn get(kube: &dyn RayKubeClient, ns: &str, name: &str) -> Result<Option<Self>, Error>;

    async fn create(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error>;

    async fn replace(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error>;

    fn changed(desired: &Self, live: &Self) -> bool;

    /// Copy server-owned fields from `live` that an update must preserve
    fn carry_over(desired: &mut Self, live: &Self) {
        desired.meta_mut().resource_version = live.meta().resource_version.clone();
    }
}

#[async_trait]
impl Applicable for Deployment {
    const KIND: &'static str = "Deployment";

    async fn get(kube: &dyn RayKubeClient, ns: &str, name: &str) -> Result<Option<Self>, Error> {
        kube.get_deployment(ns, name).await
    }

    async fn create(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error> {
        kube.create_deployment(ns, obj).await
    }

    async fn replace(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error> {
        kube.replace_deployment(ns, obj).await
    }

    fn changed(desired: &Self, live: &Self) -> bool {
        deployment_changed(desired, live)
    }
}

#[async_trait]
impl Applicable for Service {
    const KIND: &'static str = "Service";

    async fn get(kube: &dyn RayKubeClient, ns: &str, name: &str) -> Result<Option<Self>, Error> {
        kube.get_service(ns, name).await
    }

    async fn create(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error> {
        kube.create_service(ns, obj).await
    }

    async fn replace(kube: &dyn RayKubeClient, ns: &str, obj: &Self) -> Result<Self, Error> {
        kube.replace_service(ns, obj).await
    }

    fn changed(desired: &Self, live: &Self) -> bool {
        service_changed(desired, live)
    }

    fn carry_over(desired: &mut Self, live: &Self) {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        // clusterIP is immutable once allocated
        if let (Some(want), Some(have)) = (desired.spec.as_mut(), live.spec.as_ref()) {
            want.cluster_ip = have.cluster_ip.clone();
            want.cluster_ips = have.cluster_ips.clone();
        }
    }
}

/// Create or update a Deployment owned by `ray`
pub async fn apply_deployment(
    ray: &Ray,
    desired: Deployment,
    kube: &dyn RayKubeClient,
    events: &dyn EventPublisher,
) -> Result<Deployment, Error> {
    apply(ray, desired, kube, events).await
}

/// Create or update a Service owned by `ray`
pub async fn apply_service(
    ray: &Ray,
    desired: Service,
    kube: &dyn RayKubeClient,
    events: &dyn EventPublisher,
) -> Result<Service, Error> {
    apply(ray, desired, kube, events).await
}

async fn apply<K: Applicable>(
    ray: &Ray,
    mut desired: K,
    kube: &dyn RayKubeClient,
    events: &dyn EventPublisher,
) -> Result<K, Error> {
    let name = desired.name_any();
    let namespace = desired.namespace().ok_or_else(|| {
        Error::internal_with_context("apply", format!("{} {name} has no namespace", K::KIND))
    })?;

    let live = match K::get(kube, &namespace, &name).await {
        Ok(live) => live,
        Err(e) => {
            warn!(kind = K::KIND, %name, error = %e, "failed to look up owned object");
            notify(ray, events, Outcome::CreateFailed, K::KIND, &name).await;
            return Err(e);
        }
    };

    let Some(live) = live else {
        debug!(kind = K::KIND, %name, %namespace, "creating owned object");
        return match K::create(kube, &namespace, &desired).await {
            Ok(created) => {
                info!(kind = K::KIND, %name, "created owned object");
                notify(ray, events, Outcome::Created, K::KIND, &name).await;
                Ok(created)
            }
            Err(e) => {
                warn!(kind = K::KIND, %name, error = %e, "failed to create owned object");
                notify(ray, events, Outcome::CreateFailed, K::KIND, &name).await;
                Err(e)
            }
        };
    };

    if !K::changed(&desired, &live) {
        debug!(kind = K::KIND, %name, "owned object up to date");
        return Ok(live);
    }

    K::carry_over(&mut desired, &live);
    debug!(kind = K::KIND, %name, %namespace, "updating owned object");
    match K::replace(kube, &namespace, &desired).await {
        Ok(updated) => {
            info!(kind = K::KIND, %name, "updated owned object");
            notify(ray, events, Outcome::Updated, K::KIND, &name).await;
            Ok(updated)
        }
        Err(e) => {
            warn!(kind = K::KIND, %name, error = %e, "failed to update owned object");
            notify(ray, events, Outcome::UpdateFailed, K::KIND, &name).await;
            Err(e)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Created,
    CreateFailed,
    Updated,
    UpdateFailed,
}

async fn notify(ray: &Ray, events: &dyn EventPublisher, outcome: Outcome, kind: &str, name: &str) {
    let (type_, reason, action, note) = match outcome {
        Outcome::Created => (
            EventType::Normal,
            reasons::CREATED,
            actions::CREATE,
            format!("Created {kind} {name}"),
        ),
        Outcome::CreateFailed => (
            EventType::Warning,
            reasons::CREATE_FAILED,
            actions::CREATE,
            format!("Failed to create {kind} {name}"),
        ),
        Outcome::Updated => (
            EventType::Normal,
            reasons::UPDATED,
            actions::UPDATE,
            format!("Updated {kind} {name}"),
        ),
        Outcome::UpdateFailed => (
            EventType::Warning,
            reasons::UPDATE_FAILED,
            actions::UPDATE,
            format!("Failed to update {kind} {name}"),
        ),
    };
    events
        .publish(&ray.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Whether a Service needs an update: port count or any port number differs
pub fn service_changed(desired: &Service, live: &Service) -> bool {
    let ports = |s: &Service| -> Vec<i32> {
        s.spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default()
    };
    ports(desired) != ports(live)
}

/// Whether a Deployment needs an update: replicas or any container's
/// resources differ, compared by container index
pub fn deployment_changed(desired: &Deployment, live: &Deployment) -> bool {
    if replicas(desired) != replicas(live) {
        return true;
    }

    let live_containers = containers(live);
    containers(desired)
        .iter()
        .enumerate()
        .any(|(i, want)| match live_containers.get(i) {
            Some(have) => !resources_equal(want.resources.as_ref(), have.resources.as_ref()),
            None => true,
        })
}

fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(DEFAULT_DEPLOYMENT_REPLICAS)
}

fn containers(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default()
}
