use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use kube::{
    Api, Client, Resource, ResourceExt,
    api::DynamicObject,
    core::GroupVersionKind,
    discovery::ApiResource,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        watcher,
    },
};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    allow_list,
    cancel::{self, cancellable},
    config::Config,
    crds::policy::{
        CLUSTER_NAME_LABEL, CLUSTER_NAMESPACE_LABEL, ComplianceHistory, ComplianceState,
        DetailsPerTemplate, PARENT_POLICY_LABEL, Policy, PolicyStatus, PolicyTemplate,
        RemediationAction, TemplateMeta,
    },
    defaults::Scheme,
    discovery::{ResourceDiscovery, gvr_from_gvk},
    error::ReconcileError,
    events::{EventSink, REASON_TEMPLATE_SYNC, compliance_reason},
    spec_sync::UNINSTALL_REQUEUE,
    store::{PolicyStore, TemplateClient},
    uninstall::UninstallFlag,
};

/// Templates report compliance asynchronously; revisit to pick it up.
const STATUS_REFRESH: Duration = Duration::from_secs(60);

pub struct Ctx {
    /// Managed-cluster policies; their status holds the template history.
    pub policies: Arc<dyn PolicyStore>,
    pub templates: Arc<dyn TemplateClient>,
    pub discovery: Arc<dyn ResourceDiscovery>,
    pub scheme: Arc<Scheme>,
    pub events: Arc<dyn EventSink>,
    pub uninstall: UninstallFlag,
    pub shutdown: CancellationToken,
}

pub fn controller(managed: Client, cfg: &Config) -> Controller<Policy> {
    let api: Api<Policy> = Api::namespaced(managed, &cfg.target_namespace);
    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(cfg.concurrent_reconciles))
        .shutdown_on_signal()
}

pub async fn reconcile(policy: Arc<Policy>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let cancel = ctx.shutdown.child_token();
    reconcile_templates(&policy, &ctx, &cancel).await
}

pub fn error_policy(_policy: Arc<Policy>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    if err.is_canceled() {
        return Action::requeue(Duration::from_secs(5));
    }
    error!(error = %err, "policy template sync failed");
    Action::requeue(Duration::from_secs(60))
}

pub fn template_name(template: &PolicyTemplate) -> Option<String> {
    template
        .object_definition
        .0
        .get("metadata")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

/// Names must be unique across the whole list, whatever the kinds.
pub fn has_duplicate_names(templates: &[PolicyTemplate]) -> bool {
    let mut seen = HashSet::new();
    templates
        .iter()
        .filter_map(template_name)
        .any(|name| !seen.insert(name))
}

pub async fn reconcile_templates(
    policy: &Policy,
    ctx: &Ctx,
    cancel: &CancellationToken,
) -> Result<Action, ReconcileError> {
    let ns = policy.namespace().unwrap_or_default();
    let name = policy.name_any();
    if ctx.uninstall.is_uninstalling() {
        info!(
            namespace = %ns,
            name = %name,
            "skipping template sync because the addon is uninstalling"
        );
        return Ok(Action::requeue(UNINSTALL_REQUEUE));
    }
    cancel::check(cancel)?;

    if has_duplicate_names(&policy.spec.policy_templates) {
        warn!(namespace = %ns, name = %name, "duplicate names used for templates in the policy");
        return Err(ReconcileError::DuplicateTemplateNames);
    }
    if policy.spec.disabled {
        debug!(namespace = %ns, name = %name, "policy is disabled, not expanding templates");
        return Ok(Action::await_change());
    }

    let mut pass = TemplatePass::new(policy, ctx, cancel);
    let mut errs = Vec::new();
    for (index, template) in policy.spec.policy_templates.iter().enumerate() {
        cancel::check(cancel)?;
        match pass.sync_template(index, template).await {
            Ok(()) => {}
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                let tname =
                    template_name(template).unwrap_or_else(|| format!("template-{}", index));
                warn!(
                    namespace = %ns,
                    name = %name,
                    template = %tname,
                    error = %e,
                    "failed to sync policy template"
                );
                pass.template_error(index, &tname, &e.to_string());
                errs.push(e);
            }
        }
    }
    pass.commit().await?;

    match ReconcileError::aggregate(errs) {
        Some(err) => Err(err),
        None => Ok(Action::requeue(STATUS_REFRESH)),
    }
}

struct PendingEvent {
    type_: EventType,
    reason: String,
    message: String,
}

/// One attempt over a policy's templates. History and events are staged
/// here and only leave through `commit`, so an interrupted attempt leaves no
/// trace.
struct TemplatePass<'a> {
    policy: &'a Policy,
    ctx: &'a Ctx,
    cancel: &'a CancellationToken,
    namespace: String,
    status: PolicyStatus,
    pending: Vec<PendingEvent>,
}

impl<'a> TemplatePass<'a> {
    fn new(policy: &'a Policy, ctx: &'a Ctx, cancel: &'a CancellationToken) -> Self {
        let mut status = policy.status.clone().unwrap_or_default();
        status
            .details
            .resize_with(policy.spec.policy_templates.len(), DetailsPerTemplate::default);
        Self {
            policy,
            ctx,
            cancel,
            namespace: policy.namespace().unwrap_or_default(),
            status,
            pending: Vec::new(),
        }
    }

    async fn sync_template(
        &mut self,
        index: usize,
        template: &PolicyTemplate,
    ) -> Result<(), ReconcileError> {
        let mut object: DynamicObject =
            serde_json::from_value(template.object_definition.0.clone())?;
        let gvk = object_gvk(&object)?;
        let tname = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ReconcileError::InvalidTemplate("template has no name".into()))?;

        if allow_list::is_removed_kind(&gvk.group, &gvk.kind) {
            info!(template = %tname, kind = %gvk.kind, "template kind is no longer supported");
            self.template_error(index, &tname, &format!("{} is no longer supported", gvk.kind));
            return Ok(());
        }
        if !allow_list::classify(&gvk.group, &gvk.kind, object.metadata.labels.as_ref()) {
            return Err(ReconcileError::UnrecognizedTemplateKind {
                group: gvk.group.clone(),
                kind: gvk.kind.clone(),
            });
        }

        let resolved =
            cancellable(self.cancel, gvr_from_gvk(self.ctx.discovery.as_ref(), &gvk)).await?;
        if let Some(action) = effective_remediation(&object, self.policy.spec.remediation_action) {
            set_remediation(&mut object, action);
        }
        self.ctx.scheme.apply_defaults(&gvk, &mut object)?;

        let namespace = resolved.namespaced.then(|| self.namespace.clone());
        self.decorate(&mut object, namespace.as_deref());
        let resource = resolved.api_resource();
        let ns = namespace.as_deref();

        let existing =
            cancellable(self.cancel, self.ctx.templates.get(&resource, ns, &tname)).await?;
        match existing {
            None => {
                cancellable(self.cancel, self.ctx.templates.create(&resource, ns, &object)).await?;
                info!(template = %tname, kind = %gvk.kind, "created policy template");
                self.stage(
                    EventType::Normal,
                    REASON_TEMPLATE_SYNC,
                    format!("Policy template {} was created successfully", tname),
                );
            }
            Some(current) if needs_update(&current, &object) => {
                object.metadata.resource_version = current.metadata.resource_version.clone();
                cancellable(self.cancel, self.ctx.templates.replace(&resource, ns, &object)).await?;
                info!(template = %tname, kind = %gvk.kind, "updated policy template");
                self.stage(
                    EventType::Normal,
                    REASON_TEMPLATE_SYNC,
                    format!("Policy template {} was updated successfully", tname),
                );
            }
            Some(_) => debug!(template = %tname, "policy template is up to date"),
        }

        self.handle_sync_success(index, &tname, &resource, ns).await?;
        Ok(())
    }

    /// Re-reads the synced object and records its observed compliance.
    /// Returns whether anything new was recorded; with an unchanged
    /// observation this is a no-op.
    async fn handle_sync_success(
        &mut self,
        index: usize,
        tname: &str,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<bool, ReconcileError> {
        let observed =
            cancellable(self.cancel, self.ctx.templates.get(resource, namespace, tname)).await?;
        let (state, message) = observed_compliance(observed.as_ref());
        Ok(self.record(index, tname, state, &message))
    }

    fn template_error(&mut self, index: usize, tname: &str, msg: &str) {
        let message = format!("template-error; {}", msg);
        let at = self.pending.len();
        if self.record(index, tname, ComplianceState::NonCompliant, &message) {
            self.pending.insert(
                at,
                PendingEvent {
                    type_: EventType::Warning,
                    reason: REASON_TEMPLATE_SYNC.into(),
                    message,
                },
            );
        }
    }

    /// Appends `"<state>; <message>"` to the template's history and stages the
    /// matching compliance event, unless it repeats the latest entry.
    fn record(&mut self, index: usize, tname: &str, state: ComplianceState, message: &str) -> bool {
        let full = format!("{}; {}", state, message);
        let detail = &mut self.status.details[index];
        if detail.template_meta.as_ref().is_some_and(|m| m.name != tname) {
            // a different template now sits at this index
            *detail = DetailsPerTemplate::default();
        }
        detail.template_meta = Some(TemplateMeta {
            name: tname.to_string(),
        });
        if detail.last_message() == Some(full.as_str()) {
            return false;
        }
        detail.compliance_state = Some(state);
        detail.history.push(ComplianceHistory {
            last_timestamp: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
            message: full.clone(),
            event_name: Some(format!("{}.{}", self.policy.name_any(), tname)),
        });
        let type_ = match state {
            ComplianceState::NonCompliant => EventType::Warning,
            _ => EventType::Normal,
        };
        let reason = compliance_reason(Some(&self.namespace), tname);
        self.stage(type_, &reason, full);
        true
    }

    fn stage(&mut self, type_: EventType, reason: &str, message: String) {
        self.pending.push(PendingEvent {
            type_,
            reason: reason.to_string(),
            message,
        });
    }

    fn decorate(&self, object: &mut DynamicObject, namespace: Option<&str>) {
        object.metadata.namespace = namespace.map(str::to_string);
        let policy_labels = self.policy.labels();
        let labels = object.labels_mut();
        for (from, short) in [
            (CLUSTER_NAME_LABEL, "cluster-name"),
            (CLUSTER_NAMESPACE_LABEL, "cluster-namespace"),
        ] {
            if let Some(value) = policy_labels.get(from) {
                labels.insert(from.to_string(), value.clone());
                labels.insert(short.to_string(), value.clone());
            }
        }
        labels.insert(PARENT_POLICY_LABEL.to_string(), self.policy.name_any());
        // a cluster-scoped object cannot be owned by a namespaced policy
        if namespace.is_some()
            && let Some(owner) = self.policy.controller_owner_ref(&())
        {
            object.metadata.owner_references = Some(vec![owner]);
        }
    }

    async fn commit(self) -> Result<(), ReconcileError> {
        cancel::check(self.cancel)?;
        let mut status = self.status;
        status.compliance_state = status.rollup();
        if status != self.policy.status.clone().unwrap_or_default() {
            cancellable(
                self.cancel,
                self.ctx
                    .policies
                    .patch_status(&self.namespace, &self.policy.name_any(), &status),
            )
            .await?;
        }
        let target = self.policy.object_ref(&());
        for event in self.pending {
            self.ctx
                .events
                .emit(&target, event.type_, &event.reason, &event.message)
                .await;
        }
        Ok(())
    }
}

fn object_gvk(object: &DynamicObject) -> Result<GroupVersionKind, ReconcileError> {
    let types = object
        .types
        .as_ref()
        .filter(|t| !t.kind.is_empty() && !t.api_version.is_empty())
        .ok_or_else(|| {
            ReconcileError::InvalidTemplate("template is missing apiVersion or kind".into())
        })?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

/// The template's own remediation wins, then the policy's; otherwise none.
fn effective_remediation(
    object: &DynamicObject,
    policy_default: Option<RemediationAction>,
) -> Option<RemediationAction> {
    object
        .data
        .get("spec")
        .and_then(|s| s.get("remediationAction"))
        .and_then(Value::as_str)
        .and_then(RemediationAction::parse)
        .or(policy_default)
}

fn set_remediation(object: &mut DynamicObject, action: RemediationAction) {
    if let Some(spec) = object.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("remediationAction".into(), Value::from(action.as_str()));
    }
}

/// Labels and annotations added by others on the live object are tolerated.
fn needs_update(current: &DynamicObject, desired: &DynamicObject) -> bool {
    current.data.get("spec") != desired.data.get("spec")
        || !contains_all(current.labels(), desired.labels())
        || !contains_all(current.annotations(), desired.annotations())
        || current.owner_references() != desired.owner_references()
}

fn contains_all(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(k, v)| current.get(k) == Some(v))
}

fn observed_compliance(object: Option<&DynamicObject>) -> (ComplianceState, String) {
    let status = object.and_then(|o| o.data.get("status"));
    let state = status
        .and_then(|s| s.get("compliant"))
        .and_then(Value::as_str)
        .and_then(ComplianceState::parse);
    let detail = status
        .and_then(|s| s.get("compliancyDetails"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|d| d.get("conditions").and_then(Value::as_array))
        .flatten()
        .filter_map(|c| c.get("message").and_then(Value::as_str))
        .find(|m| !m.is_empty())
        .map(str::to_string);
    match state {
        Some(state) => (state, detail.unwrap_or_else(|| "template is in sync".into())),
        None => (
            ComplianceState::Pending,
            "template sync completed; waiting for the template status".into(),
        ),
    }
}
