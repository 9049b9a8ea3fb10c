use std::{collections::BTreeMap, sync::Arc};

use futures::StreamExt;
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        WatchStreamExt,
        controller::{self, Action, Controller},
        events::EventType,
        reflector::ObjectRef,
        watcher,
    },
};
use tokio::{sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cancel::cancellable,
    config::Config,
    crds::policy::{CLUSTER_NAMESPACE_LABEL, Policy},
    error::ReconcileError,
    events::{EventSink, REASON_SPEC_SYNC},
    store::PolicyStore,
    uninstall::UninstallFlag,
};

pub const UNINSTALL_REQUEUE: Duration = Duration::from_secs(300);

/// Hub-side identity of a replicated policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

/// Asks the status-sync pathway to refresh one managed policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSyncRequest {
    pub namespace: String,
    pub name: String,
}

pub struct Ctx {
    pub hub: Arc<dyn PolicyStore>,
    pub managed: Arc<dyn PolicyStore>,
    pub events: Arc<dyn EventSink>,
    pub target_namespace: String,
    pub status_sync: mpsc::Sender<StatusSyncRequest>,
    pub uninstall: UninstallFlag,
    pub shutdown: CancellationToken,
}

pub fn controller(hub: Client, managed: Client, cfg: &Config) -> Controller<Policy> {
    let api: Api<Policy> = Api::namespaced(hub, &cfg.cluster_namespace_on_hub);
    let mirrors: Api<Policy> = Api::namespaced(managed, &cfg.target_namespace);
    let hub_ns = cfg.cluster_namespace_on_hub.clone();
    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(cfg.concurrent_reconciles))
        // drift on the managed side is corrected from the hub copy
        .watches(mirrors, watcher::Config::default(), move |mirror: Policy| {
            Some(ObjectRef::new(&mirror.name_any()).within(&hub_ns))
        })
        .shutdown_on_signal()
}

pub async fn reconcile(policy: Arc<Policy>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let key = PolicyKey {
        namespace: policy.namespace().unwrap_or_default(),
        name: policy.name_any(),
    };
    let cancel = ctx.shutdown.child_token();
    reconcile_spec(&key, &ctx, &cancel).await
}

pub fn error_policy(_policy: Arc<Policy>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    if err.is_canceled() {
        return Action::requeue(Duration::from_secs(5));
    }
    error!(error = ?err, "policy spec sync failed");
    Action::requeue(Duration::from_secs(30))
}

/// The controller's store forgets deleted hub policies before they can be
/// reconciled, so deletions are forwarded from a plain watch.
pub async fn forward_hub_deletions(api: Api<Policy>, ctx: Arc<Ctx>) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Delete(policy)) => {
                let key = PolicyKey {
                    namespace: policy.namespace().unwrap_or_default(),
                    name: policy.name_any(),
                };
                let cancel = ctx.shutdown.child_token();
                if let Err(e) = reconcile_spec(&key, &ctx, &cancel).await {
                    warn!(error = ?e, name = %key.name, "failed to remove deleted policy");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = ?e, "hub policy watch error"),
        }
    }
}

pub async fn reconcile_spec(
    key: &PolicyKey,
    ctx: &Ctx,
    cancel: &CancellationToken,
) -> Result<Action, ReconcileError> {
    let target_ns = ctx.target_namespace.as_str();
    if ctx.uninstall.is_uninstalling() {
        info!(
            namespace = %key.namespace,
            name = %key.name,
            "skipping reconcile because the addon is uninstalling"
        );
        return Ok(Action::requeue(UNINSTALL_REQUEUE));
    }
    debug!(
        namespace = %key.namespace,
        name = %key.name,
        target_namespace = target_ns,
        "reconciling policy"
    );

    let Some(hub) = cancellable(cancel, ctx.hub.get(&key.namespace, &key.name)).await? else {
        info!(
            name = %key.name,
            "policy was deleted on the hub, removing it from the managed cluster"
        );
        let deleted = cancellable(cancel, ctx.managed.delete(target_ns, &key.name)).await?;
        if !deleted {
            debug!(name = %key.name, "managed policy was already gone");
        }
        return Ok(Action::await_change());
    };

    let mirror = match cancellable(cancel, ctx.managed.get(target_ns, &key.name)).await? {
        Some(mirror) => mirror,
        None => {
            info!(name = %key.name, "policy not found on the managed cluster, creating it");
            let created =
                cancellable(cancel, ctx.managed.create(&replicate(&hub, target_ns))).await?;
            ctx.events
                .emit(
                    &created.object_ref(&()),
                    EventType::Normal,
                    REASON_SPEC_SYNC,
                    &format!(
                        "Policy {} was synchronized to cluster namespace {}",
                        hub.name_any(),
                        target_ns
                    ),
                )
                .await;
            created
        }
    };

    if !equivalent_replicated_policies(&hub, &mirror) {
        info!(name = %key.name, "policy mismatch between hub and managed, updating it");
        let mut updated = mirror;
        updated.metadata.annotations = hub.metadata.annotations.clone();
        updated.spec = hub.spec.clone();
        let updated = cancellable(cancel, ctx.managed.replace(&updated)).await?;
        ctx.events
            .emit(
                &updated.object_ref(&()),
                EventType::Normal,
                REASON_SPEC_SYNC,
                &format!(
                    "Policy {} was updated in cluster namespace {}",
                    hub.name_any(),
                    target_ns
                ),
            )
            .await;
    } else if hub.status.clone().unwrap_or_default() != mirror.status.clone().unwrap_or_default() {
        info!(name = %key.name, "policy status does not match the hub, triggering status sync");
        let request = StatusSyncRequest {
            namespace: target_ns.to_string(),
            name: mirror.name_any(),
        };
        // Blocks while the queue is full, but never past cancellation.
        cancellable(cancel, async {
            ctx.status_sync
                .send(request)
                .await
                .map_err(|_| ReconcileError::StatusSyncClosed)
        })
        .await?;
    }

    debug!(name = %key.name, "reconciliation complete");
    Ok(Action::await_change())
}

/// Labels are not compared: the cluster-namespace label is rewritten on the
/// managed side and may legitimately differ.
pub fn equivalent_replicated_policies(a: &Policy, b: &Policy) -> bool {
    annotations(a) == annotations(b) && a.spec == b.spec
}

fn annotations(p: &Policy) -> BTreeMap<String, String> {
    p.metadata.annotations.clone().unwrap_or_default()
}

/// Copy of a hub policy as it should be created on the managed cluster.
pub fn replicate(hub: &Policy, target_namespace: &str) -> Policy {
    let mut mirror = hub.clone();
    mirror.metadata.namespace = Some(target_namespace.to_string());
    if let Some(labels) = mirror.metadata.labels.as_mut()
        && let Some(ns) = labels.get_mut(CLUSTER_NAMESPACE_LABEL)
        && !ns.is_empty()
    {
        *ns = target_namespace.to_string();
    }
    mirror.metadata.owner_references = None;
    mirror.metadata.resource_version = None;
    mirror.metadata.uid = None;
    mirror.metadata.creation_timestamp = None;
    mirror.metadata.generation = None;
    mirror.metadata.managed_fields = None;
    mirror
}
