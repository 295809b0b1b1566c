//! Defaulting for the head group
//!
//! A Ray without a head, or whose head lacks a `ray-head` container, gets a
//! runnable single-node head filled in. Defaulting is idempotent.

use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};

use super::ray::{RaySpec, ReplicaSpec};
use crate::HEAD_CONTAINER_NAME;

/// Head replica count when unset
pub const DEFAULT_HEAD_REPLICAS: i32 = 1;

/// Head container image when unset
pub const DEFAULT_HEAD_IMAGE: &str = "rayproject/examples";

/// Head container command when unset
pub const DEFAULT_HEAD_COMMAND: &[&str] = &["/bin/bash", "-c", "--"];

/// Head container args when unset
pub const DEFAULT_HEAD_ARGS: &[&str] = &["ray start --head --redis-port=6379 \
--redis-shard-ports=6380,6381 --object-manager-port=12345 --node-manager-port=12346 \
--node-ip-address=$RAY_NODE_IP --block"];

/// Head container ports when unset, as `(name, containerPort)`
pub const DEFAULT_HEAD_PORTS: &[(&str, i32)] = &[
    ("redis-primary", 6379),
    ("redis-shard-0", 6380),
    ("redis-shard-1", 6381),
    ("object-manager", 12345),
    ("node-manager", 12346),
];

impl RaySpec {
    /// Fill in the head group
    pub fn apply_defaults(&mut self) {
        let head = self.head.get_or_insert_with(ReplicaSpec::default);
        head.replicas.get_or_insert(DEFAULT_HEAD_REPLICAS);
        let template = head.template.get_or_insert_with(PodTemplateSpec::default);
        default_head_template(template);
    }
}

fn default_head_template(template: &mut PodTemplateSpec) {
    let containers = &mut template
        .spec
        .get_or_insert_with(PodSpec::default)
        .containers;
    let existing = containers
        .iter_mut()
        .find(|c| c.name == HEAD_CONTAINER_NAME);
    match existing {
        Some(container) => default_head_container(container),
        None => {
            let mut container = Container {
                name: HEAD_CONTAINER_NAME.to_string(),
                ..Default::default()
            };
            default_head_container(&mut container);
            containers.push(container);
        }
    }
}

fn default_head_container(c: &mut Container) {
    if c.image.as_deref().map_or(true, str::is_empty) {
        c.image = Some(DEFAULT_HEAD_IMAGE.to_string());
    }
    if c.command.as_ref().map_or(true, Vec::is_empty) {
        c.command = Some(to_strings(DEFAULT_HEAD_COMMAND));
    }
    if c.args.as_ref().map_or(true, Vec::is_empty) {
        c.args = Some(to_strings(DEFAULT_HEAD_ARGS));
    }
    if c.ports.as_ref().map_or(true, Vec::is_empty) {
        c.ports = Some(
            DEFAULT_HEAD_PORTS
                .iter()
                .map(|(name, port)| ContainerPort {
                    name: Some((*name).to_string()),
                    container_port: *port,
                    ..Default::default()
                })
                .collect(),
        );
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}
