use async_trait::async_trait;
use kube::{Client, core::GroupVersionKind, discovery::ApiResource};

use crate::error::ReconcileError;

/// One entry of a group/version resource listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

/// A kind resolved to the resource the API server serves it under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedResource {
    pub gvk: GroupVersionKind,
    pub plural: String,
    pub namespaced: bool,
}

impl ResolvedResource {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk, &self.plural)
    }
}

#[async_trait]
pub trait ResourceDiscovery: Send + Sync {
    /// Resources served for `group/version`. A missing group version is
    /// reported through an error for which `is_not_found()` holds.
    async fn resources_for(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<DiscoveredResource>, ReconcileError>;
}

pub fn gvk_string(gvk: &GroupVersionKind) -> String {
    format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
}

/// Looks the kind up in its group version's listing. Not-found, either for
/// the whole group version or for the kind within it, becomes
/// `NoVersionedResource`; any other discovery failure is returned unchanged.
pub async fn gvr_from_gvk(
    discovery: &dyn ResourceDiscovery,
    gvk: &GroupVersionKind,
) -> Result<ResolvedResource, ReconcileError> {
    let resources = match discovery.resources_for(&gvk.group, &gvk.version).await {
        Ok(r) => r,
        Err(e) if e.is_not_found() => {
            return Err(ReconcileError::NoVersionedResource {
                gvk: gvk_string(gvk),
                source: Box::new(e),
            });
        }
        Err(e) => return Err(e),
    };
    resources
        .into_iter()
        .find(|r| r.kind == gvk.kind)
        .map(|r| ResolvedResource {
            gvk: gvk.clone(),
            plural: r.plural,
            namespaced: r.namespaced,
        })
        .ok_or_else(|| ReconcileError::NoVersionedResource {
            gvk: gvk_string(gvk),
            source: Box::new(ReconcileError::NotFound("no matching kind was found".into())),
        })
}

/// Asks the API server's discovery endpoints directly; nothing is cached.
#[derive(Clone)]
pub struct KubeDiscovery {
    pub client: Client,
}

#[async_trait]
impl ResourceDiscovery for KubeDiscovery {
    async fn resources_for(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<DiscoveredResource>, ReconcileError> {
        let list = if group.is_empty() {
            self.client.list_core_api_resources(version).await?
        } else {
            self.client
                .list_api_group_resources(&format!("{}/{}", group, version))
                .await?
        };
        Ok(list
            .resources
            .into_iter()
            // subresources such as "policies/status" repeat the parent kind
            .filter(|r| !r.name.contains('/'))
            .map(|r| DiscoveredResource {
                kind: r.kind,
                plural: r.name,
                namespaced: r.namespaced,
            })
            .collect())
    }
}
