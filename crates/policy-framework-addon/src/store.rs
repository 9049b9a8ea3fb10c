use async_trait::async_trait;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    discovery::ApiResource,
};

use crate::{
    crds::policy::{Policy, PolicyStatus},
    error::ReconcileError,
};

/// Typed access to Policy objects on one cluster.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Policy>, ReconcileError>;
    async fn create(&self, policy: &Policy) -> Result<Policy, ReconcileError>;
    async fn replace(&self, policy: &Policy) -> Result<Policy, ReconcileError>;
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PolicyStatus,
    ) -> Result<(), ReconcileError>;
    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ReconcileError>;
}

/// Untyped access to expanded template objects.
#[async_trait]
pub trait TemplateClient: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ReconcileError>;
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError>;
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError>;
}

const FIELD_MANAGER: &str = "policy-framework-addon";

#[derive(Clone)]
pub struct KubePolicyStore {
    pub client: Client,
}

impl KubePolicyStore {
    fn api(&self, ns: &str) -> Api<Policy> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Policy>, ReconcileError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, policy: &Policy) -> Result<Policy, ReconcileError> {
        let ns = policy.namespace().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        Ok(self.api(&ns).create(&pp, policy).await?)
    }

    async fn replace(&self, policy: &Policy) -> Result<Policy, ReconcileError> {
        let ns = policy.namespace().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        Ok(self.api(&ns).replace(&policy.name_any(), &pp, policy).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PolicyStatus,
    ) -> Result<(), ReconcileError> {
        let pp = PatchParams::default();
        let _ = self
            .api(namespace)
            .patch_status(
                name,
                &pp,
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ReconcileError> {
        let dp = DeleteParams::default();
        match self.api(namespace).delete(name, &dp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone)]
pub struct KubeTemplateClient {
    pub client: Client,
}

impl KubeTemplateClient {
    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl TemplateClient for KubeTemplateClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ReconcileError> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        Ok(self.api(resource, namespace).create(&pp, object).await?)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        Ok(self
            .api(resource, namespace)
            .replace(&object.name_any(), &pp, object)
            .await?)
    }
}
