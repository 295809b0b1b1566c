//! Kubernetes access for the Ray controller
//!
//! Everything a reconcile pass reads or writes goes through `RayKubeClient`
//! so passes can be exercised against mocks and in-memory fakes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use ray_common::crd::{Ray, RayStatus};
use ray_common::{Error, FIELD_MANAGER};

/// Trait abstracting the Kubernetes calls made during a reconcile pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RayKubeClient: Send + Sync {
    /// Get a Deployment, `None` if it does not exist
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Replace a Deployment; the object must carry the live resourceVersion
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Get a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Replace a Service; the object must carry the live resourceVersion
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// List pods in `namespace` matching a `key=value` label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Merge-patch the status subresource of a Ray
    async fn patch_ray_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RayStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct RayKubeClientImpl {
    client: Client,
}

impl RayKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn object_name<'a>(name: &'a Option<String>, kind: &str) -> Result<&'a str, Error> {
    name.as_deref()
        .ok_or_else(|| Error::internal_with_context("client", format!("{kind} has no name")))
}

#[async_trait]
impl RayKubeClient for RayKubeClientImpl {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), deployment).await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let name = object_name(&deployment.metadata.name, "Deployment")?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams::default();
        Ok(api.replace(name, &params, deployment).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let name = object_name(&service.metadata.name, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), service).await?)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn patch_ray_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RayStatus,
    ) -> Result<(), Error> {
        let api: Api<Ray> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}
