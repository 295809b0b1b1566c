//! Shared test fixtures: sample Rays, an in-memory cluster and an event recorder

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, ObjectReference, Pod, PodSpec, PodStatus, PodTemplateSpec, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use ray_common::crd::{Ray, RaySpec, RayStatus, ReplicaSpec};
use ray_common::events::EventPublisher;
use ray_common::Error;

use crate::client::RayKubeClient;

// =============================================================================
// Fixtures
// =============================================================================

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn worker_template() -> PodTemplateSpec {
    PodTemplateSpec {
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "ray-worker".to_string(),
                image: Some("rayproject/examples".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A Ray as stored by the API server, before defaulting
pub fn ray_with_worker_template(name: &str, template: Option<PodTemplateSpec>) -> Ray {
    let mut ray = Ray::new(
        name,
        RaySpec {
            head: None,
            worker: ReplicaSpec {
                replicas: Some(3),
                template,
            },
        },
    );
    ray.metadata.namespace = Some("default".to_string());
    ray.metadata.uid = Some(format!("uid-{name}"));
    ray.metadata.generation = Some(1);
    ray
}

/// A defaulted Ray with three workers
pub fn sample_ray(name: &str) -> Ray {
    let mut ray = ray_with_worker_template(name, Some(worker_template()));
    ray.spec.apply_defaults();
    ray
}

pub fn deployment_with_conditions(conditions: &[(&str, &str)]) -> Deployment {
    Deployment {
        status: Some(DeploymentStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, status)| DeploymentCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_in_phase(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

// =============================================================================
// In-memory cluster
// =============================================================================

type Key = (String, String);

#[derive(Default)]
struct ClusterState {
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    pods: Vec<(String, Pod)>,
    statuses: Vec<RayStatus>,
    creates: usize,
    updates: usize,
    version: u64,
    last_replaced_resource_version: Option<String>,
}

impl ClusterState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Stateful `RayKubeClient` that behaves like a tiny API server:
/// create conflicts on existing names, replace checks resourceVersion and
/// keeps the live status.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        f(&mut self.state.lock().expect("mutex should not be poisoned"))
    }

    pub fn creates(&self) -> usize {
        self.with_state(|s| s.creates)
    }

    pub fn updates(&self) -> usize {
        self.with_state(|s| s.updates)
    }

    pub fn status_writes(&self) -> usize {
        self.with_state(|s| s.statuses.len())
    }

    pub fn last_status(&self) -> Option<RayStatus> {
        self.with_state(|s| s.statuses.last().cloned())
    }

    pub fn last_replaced_resource_version(&self) -> Option<String> {
        self.with_state(|s| s.last_replaced_resource_version.clone())
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.with_state(|s| s.deployments.get(&key(namespace, name)).cloned())
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.with_state(|s| s.services.get(&key(namespace, name)).cloned())
    }

    /// Simulate the Deployment controller reporting conditions
    pub fn set_deployment_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[(&str, &str)],
    ) {
        let status = deployment_with_conditions(conditions).status;
        self.with_state(|s| {
            if let Some(d) = s.deployments.get_mut(&key(namespace, name)) {
                d.status = status;
            }
        });
    }

    /// Simulate the API server allocating a cluster IP
    pub fn allocate_cluster_ip(&self, namespace: &str, name: &str, ip: &str) {
        self.with_state(|s| {
            if let Some(spec) = s
                .services
                .get_mut(&key(namespace, name))
                .and_then(|svc| svc.spec.as_mut())
            {
                spec.cluster_ip = Some(ip.to_string());
                spec.cluster_ips = Some(vec![ip.to_string()]);
            }
        });
    }

    pub fn add_pod(&self, namespace: &str, mut pod: Pod, labels: BTreeMap<String, String>) {
        pod.metadata.labels = Some(labels);
        self.with_state(|s| s.pods.push((namespace.to_string(), pod)));
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl RayKubeClient for FakeCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        self.with_state(|s| {
            let k = key(namespace, &deployment.name_any());
            if s.deployments.contains_key(&k) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = deployment.clone();
            created.metadata.resource_version = Some(s.next_version());
            s.deployments.insert(k, created.clone());
            s.creates += 1;
            Ok(created)
        })
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        self.with_state(|s| {
            let k = key(namespace, &deployment.name_any());
            let Some(live) = s.deployments.get(&k).cloned() else {
                return Err(api_error(404, "NotFound"));
            };
            if live.metadata.resource_version != deployment.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }
            s.last_replaced_resource_version = deployment.metadata.resource_version.clone();
            let mut replaced = deployment.clone();
            replaced.status = live.status;
            replaced.metadata.resource_version = Some(s.next_version());
            s.deployments.insert(k, replaced.clone());
            s.updates += 1;
            Ok(replaced)
        })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        self.with_state(|s| {
            let k = key(namespace, &service.name_any());
            if s.services.contains_key(&k) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = service.clone();
            created.metadata.resource_version = Some(s.next_version());
            s.services.insert(k, created.clone());
            s.creates += 1;
            Ok(created)
        })
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        self.with_state(|s| {
            let k = key(namespace, &service.name_any());
            let Some(live) = s.services.get(&k).cloned() else {
                return Err(api_error(404, "NotFound"));
            };
            if live.metadata.resource_version != service.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }
            let live_ip = live.spec.as_ref().and_then(|sp| sp.cluster_ip.clone());
            let desired_ip = service.spec.as_ref().and_then(|sp| sp.cluster_ip.clone());
            if live_ip.is_some() && live_ip != desired_ip {
                return Err(api_error(422, "Invalid"));
            }
            s.last_replaced_resource_version = service.metadata.resource_version.clone();
            let mut replaced = service.clone();
            replaced.metadata.resource_version = Some(s.next_version());
            s.services.insert(k, replaced.clone());
            s.updates += 1;
            Ok(replaced)
        })
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let (label_key, label_value) = label_selector
            .split_once('=')
            .unwrap_or((label_selector, ""));
        Ok(self.with_state(|s| {
            s.pods
                .iter()
                .filter(|(ns, _)| ns == namespace)
                .filter(|(_, pod)| {
                    pod.labels().get(label_key).map(String::as_str) == Some(label_value)
                })
                .map(|(_, pod)| pod.clone())
                .collect()
        }))
    }

    async fn patch_ray_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &RayStatus,
    ) -> Result<(), Error> {
        self.with_state(|s| s.statuses.push(status.clone()));
        Ok(())
    }
}

// =============================================================================
// Event recorder
// =============================================================================

#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(bool, String)>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> usize {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .filter(|(warning, _)| *warning)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .push((matches!(type_, EventType::Warning), reason.to_string()));
    }
}
