//! Desired-state composition
//!
//! Turns a defaulted `Ray` into the head Deployment, worker Deployment and
//! head Service. Composition is pure: the same Ray always yields the same
//! objects, and every object carries a controller owner reference back to
//! the Ray so deletion cascades and owned-object events map to its key.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use ray_common::crd::{Ray, Role};
use ray_common::{Error, HEAD_CONTAINER_NAME, HEAD_SERVICE_ENV, NODE_IP_ENV};

/// Field path resolving to the pod's own IP
const POD_IP_FIELD_PATH: &str = "status.podIP";

/// Builds the objects a Ray should own
#[cfg_attr(test, automock)]
pub trait Composer: Send + Sync {
    /// Desired head Deployment
    fn desired_head(&self, ray: &Ray) -> Result<Deployment, Error>;

    /// Desired worker Deployment
    fn desired_worker(&self, ray: &Ray) -> Result<Deployment, Error>;

    /// Desired head Service; ports come from the head template
    fn desired_head_service(&self, ray: &Ray) -> Result<Service, Error>;
}

/// Default composer
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultComposer;

impl Composer for DefaultComposer {
    fn desired_head(&self, ray: &Ray) -> Result<Deployment, Error> {
        desired_deployment(ray, Role::Head)
    }

    fn desired_worker(&self, ray: &Ray) -> Result<Deployment, Error> {
        desired_deployment(ray, Role::Worker)
    }

    fn desired_head_service(&self, ray: &Ray) -> Result<Service, Error> {
        let template = role_template(ray, Role::Head)?;

        let ports: Vec<ServicePort> = template
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter(|c| c.name == HEAD_CONTAINER_NAME)
            .flat_map(|c| c.ports.iter().flatten())
            .enumerate()
            .map(|(i, port)| ServicePort {
                name: Some(
                    port.name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| format!("copy-from-{i}")),
                ),
                port: port.container_port,
                target_port: Some(IntOrString::Int(port.container_port)),
                ..Default::default()
            })
            .collect();

        Ok(Service {
            metadata: owned_metadata(ray, Role::Head)?,
            spec: Some(ServiceSpec {
                selector: Some(ray.role_labels(Role::Head)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn desired_deployment(ray: &Ray, role: Role) -> Result<Deployment, Error> {
    let replicas = ray.replica_spec(role).and_then(|s| s.replicas);
    let mut template = role_template(ray, role)?.clone();

    let mut pod_labels = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    pod_labels.extend(ray.object_labels(role));
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels = Some(pod_labels);

    let mut env = vec![EnvVar {
        name: NODE_IP_ENV.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: POD_IP_FIELD_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if role == Role::Worker {
        env.push(EnvVar {
            name: HEAD_SERVICE_ENV.to_string(),
            value: Some(ray.object_name(Role::Head)),
            ..Default::default()
        });
    }
    if let Some(spec) = template.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            inject_env(container, &env);
        }
    }

    Ok(Deployment {
        metadata: owned_metadata(ray, role)?,
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(ray.role_labels(role)),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn role_template(ray: &Ray, role: Role) -> Result<&PodTemplateSpec, Error> {
    ray.replica_spec(role)
        .and_then(|s| s.template.as_ref())
        .ok_or_else(|| {
            Error::composition_for(
                ray.name_any(),
                format!("{} template is required", role.suffix()),
            )
        })
}

/// Set each variable in `env` on the container, replacing any same-named entry
fn inject_env(container: &mut Container, env: &[EnvVar]) {
    let vars = container.env.get_or_insert_with(Vec::new);
    for var in env {
        vars.retain(|existing| existing.name != var.name);
        vars.push(var.clone());
    }
}

fn owned_metadata(ray: &Ray, role: Role) -> Result<ObjectMeta, Error> {
    let namespace = ray
        .namespace()
        .ok_or_else(|| Error::composition_for(ray.name_any(), "Ray has no namespace"))?;

    Ok(ObjectMeta {
        name: Some(ray.object_name(role)),
        namespace: Some(namespace),
        labels: Some(ray.object_labels(role)),
        owner_references: Some(vec![owner_reference(ray)?]),
        ..Default::default()
    })
}

fn owner_reference(ray: &Ray) -> Result<OwnerReference, Error> {
    let mut owner = ray.controller_owner_ref(&()).ok_or_else(|| {
        Error::composition_for(
            ray.name_any(),
            "cannot build owner reference: Ray has no uid",
        )
    })?;
    owner.block_owner_deletion = Some(true);
    Ok(owner)
}
