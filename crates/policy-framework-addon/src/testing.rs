//! In-memory collaborators for reconciler tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{ResourceExt, api::DynamicObject, discovery::ApiResource, runtime::events::EventType};

use crate::{
    crds::policy::{Policy, PolicyStatus},
    discovery::{DiscoveredResource, ResourceDiscovery},
    error::ReconcileError,
    events::EventSink,
    store::{PolicyStore, TemplateClient},
};

/// Counts collaborator calls and parks the configured one forever.
#[derive(Default)]
pub struct HangPoint {
    calls: AtomicUsize,
    hang_at: Mutex<Option<usize>>,
}

impl HangPoint {
    pub fn set(&self, call: usize) {
        *self.hang_at.lock().unwrap() = Some(call);
    }

    pub async fn enter(&self) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let hang_at = *self.hang_at.lock().unwrap();
        if hang_at == Some(n) {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Default)]
pub struct FakePolicyStore {
    policies: Mutex<BTreeMap<(String, String), Policy>>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    hang: Mutex<Arc<HangPoint>>,
    version: AtomicUsize,
}

impl FakePolicyStore {
    pub fn with_hang_point(hang: Arc<HangPoint>) -> Self {
        Self {
            hang: Mutex::new(hang),
            ..Default::default()
        }
    }

    pub fn insert(&self, policy: Policy) {
        let key = (policy.namespace().unwrap_or_default(), policy.name_any());
        self.policies.lock().unwrap().insert(key, policy);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<Policy> {
        self.policies
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| *c == name).count()
    }

    /// Creates, replaces, status patches and successful deletes.
    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c.as_str(), "create" | "replace" | "patch_status" | "deleted"))
            .count()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn hang_on_call(&self, call: usize) {
        self.hang.lock().unwrap().set(call);
    }

    pub fn share_hang_point(&self, other: &FakePolicyStore) {
        *self.hang.lock().unwrap() = other.hang.lock().unwrap().clone();
    }

    pub fn hang_point(&self) -> Arc<HangPoint> {
        self.hang.lock().unwrap().clone()
    }

    async fn enter(&self, call: &str) -> Result<(), ReconcileError> {
        self.calls.lock().unwrap().push(call.to_string());
        let hang = self.hang_point();
        hang.enter().await;
        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(msg) => Err(anyhow::anyhow!(msg).into()),
            None => Ok(()),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl PolicyStore for FakePolicyStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Policy>, ReconcileError> {
        self.enter("get").await?;
        Ok(self.stored(namespace, name))
    }

    async fn create(&self, policy: &Policy) -> Result<Policy, ReconcileError> {
        self.enter("create").await?;
        let mut created = policy.clone();
        created.metadata.resource_version = Some(self.next_version());
        self.insert(created.clone());
        Ok(created)
    }

    async fn replace(&self, policy: &Policy) -> Result<Policy, ReconcileError> {
        self.enter("replace").await?;
        let ns = policy.namespace().unwrap_or_default();
        if self.stored(&ns, &policy.name_any()).is_none() {
            return Err(ReconcileError::NotFound(policy.name_any()));
        }
        let mut replaced = policy.clone();
        replaced.metadata.resource_version = Some(self.next_version());
        self.insert(replaced.clone());
        Ok(replaced)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PolicyStatus,
    ) -> Result<(), ReconcileError> {
        self.enter("patch_status").await?;
        let mut map = self.policies.lock().unwrap();
        let policy = map
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))?;
        policy.status = Some(status.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ReconcileError> {
        self.enter("delete").await?;
        let removed = self
            .policies
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.calls.lock().unwrap().push("deleted".into());
        }
        Ok(removed)
    }
}

type ObjectKey = (String, Option<String>, String);

fn object_key(plural: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
    (plural.to_string(), namespace.map(str::to_string), name.to_string())
}

#[derive(Default)]
pub struct FakeTemplateClient {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    calls: Mutex<Vec<String>>,
    hang: Mutex<Arc<HangPoint>>,
}

impl FakeTemplateClient {
    pub fn with_hang_point(hang: Arc<HangPoint>) -> Self {
        Self {
            hang: Mutex::new(hang),
            ..Default::default()
        }
    }

    pub fn stored(
        &self,
        plural: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(plural, namespace, name))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    /// Simulates the enforcement agent reporting on an object.
    pub fn set_status(
        &self,
        plural: &str,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) {
        let mut map = self.objects.lock().unwrap();
        if let Some(obj) = map.get_mut(&object_key(plural, namespace, name)) {
            obj.data["status"] = status;
        }
    }

    async fn enter(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
        let hang = self.hang.lock().unwrap().clone();
        hang.enter().await;
    }

    fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
        object_key(&resource.plural, namespace, name)
    }
}

#[async_trait]
impl TemplateClient for FakeTemplateClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ReconcileError> {
        self.enter("get").await;
        Ok(self.objects.lock().unwrap().get(&Self::key(resource, namespace, name)).cloned())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        self.enter("create").await;
        let mut created = object.clone();
        created.metadata.resource_version = Some("1".into());
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(resource, namespace, &object.name_any()), created.clone());
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        self.enter("replace").await;
        let key = Self::key(resource, namespace, &object.name_any());
        let mut map = self.objects.lock().unwrap();
        let previous = map
            .get(&key)
            .ok_or_else(|| ReconcileError::NotFound(object.name_any()))?;
        let mut replaced = object.clone();
        // status is a subresource and survives a spec replace
        if let Some(status) = previous.data.get("status") {
            replaced.data["status"] = status.clone();
        }
        map.insert(key, replaced.clone());
        Ok(replaced)
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    groups: Mutex<HashMap<(String, String), Vec<DiscoveredResource>>>,
    failure: Mutex<Option<String>>,
    hang: Mutex<Arc<HangPoint>>,
}

impl FakeDiscovery {
    pub fn with_policy_kinds() -> Self {
        let discovery = Self::default();
        discovery.add(
            "policy.open-cluster-management.io",
            "v1",
            vec![
                ("Policy", "policies", true),
                ("ConfigurationPolicy", "configurationpolicies", true),
            ],
        );
        discovery.add(
            "templates.gatekeeper.sh",
            "v1",
            vec![("ConstraintTemplate", "constrainttemplates", false)],
        );
        discovery
    }

    pub fn with_hang_point(self, hang: Arc<HangPoint>) -> Self {
        *self.hang.lock().unwrap() = hang;
        self
    }

    pub fn add(&self, group: &str, version: &str, kinds: Vec<(&str, &str, bool)>) {
        let resources = kinds
            .into_iter()
            .map(|(kind, plural, namespaced)| DiscoveredResource {
                kind: kind.into(),
                plural: plural.into(),
                namespaced,
            })
            .collect();
        self.groups
            .lock()
            .unwrap()
            .insert((group.to_string(), version.to_string()), resources);
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl ResourceDiscovery for FakeDiscovery {
    async fn resources_for(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<DiscoveredResource>, ReconcileError> {
        let hang = self.hang.lock().unwrap().clone();
        hang.enter().await;
        let failure = self.failure.lock().unwrap().clone();
        if let Some(msg) = failure {
            return Err(anyhow::anyhow!(msg).into());
        }
        self.groups
            .lock()
            .unwrap()
            .get(&(group.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound(format!("{}/{}", group, version)))
    }
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub target: String,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.all().into_iter().filter(|e| e.reason == reason).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, target: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            target: target.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
