use futures::StreamExt;
use kube::{Api, Client};
use policy_framework_addon::{
    config::Config,
    crds::policy::Policy,
    defaults::Scheme,
    discovery::KubeDiscovery,
    events::KubeEventSink,
    spec_sync as spec,
    store::{KubePolicyStore, KubeTemplateClient},
    template_sync as tmpl,
    uninstall::UninstallFlag,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("policy-framework-addon starting up");

    let cfg = Config::from_env()?;
    let managed = Client::try_default().await?;
    let hub = cfg.hub_client().await?;
    let shutdown = CancellationToken::new();
    let uninstall = UninstallFlag::new();
    let (status_tx, mut status_rx) = mpsc::channel(cfg.status_sync_queue);

    // Spec sync: hub -> managed
    let spec_ctx = Arc::new(spec::Ctx {
        hub: Arc::new(KubePolicyStore {
            client: hub.clone(),
        }),
        managed: Arc::new(KubePolicyStore {
            client: managed.clone(),
        }),
        events: Arc::new(KubeEventSink::new(managed.clone(), "policy-spec-sync")),
        target_namespace: cfg.target_namespace.clone(),
        status_sync: status_tx,
        uninstall: uninstall.clone(),
        shutdown: shutdown.clone(),
    });
    let spec_controller = spec::controller(hub.clone(), managed.clone(), &cfg)
        .run(spec::reconcile, spec::error_policy, spec_ctx.clone())
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "spec sync reconcile error");
            }
        });
    let hub_policies: Api<Policy> = Api::namespaced(hub.clone(), &cfg.cluster_namespace_on_hub);
    let hub_deletions = spec::forward_hub_deletions(hub_policies, spec_ctx);

    // Template sync on the managed cluster
    let tmpl_ctx = Arc::new(tmpl::Ctx {
        policies: Arc::new(KubePolicyStore {
            client: managed.clone(),
        }),
        templates: Arc::new(KubeTemplateClient {
            client: managed.clone(),
        }),
        discovery: Arc::new(KubeDiscovery {
            client: managed.clone(),
        }),
        scheme: Arc::new(Scheme::with_policy_types()),
        events: Arc::new(KubeEventSink::new(managed.clone(), "policy-template-sync")),
        uninstall,
        shutdown: shutdown.clone(),
    });
    let tmpl_controller = tmpl::controller(managed.clone(), &cfg)
        .run(tmpl::reconcile, tmpl::error_policy, tmpl_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "template sync reconcile error");
            }
        });

    // Status sync lives in its own controller; requests are surfaced here.
    let status_requests = async move {
        while let Some(req) = status_rx.recv().await {
            debug!(namespace = %req.namespace, name = %req.name, "status sync requested");
        }
    };

    tokio::select! {
        _ = spec_controller => {},
        _ = tmpl_controller => {},
        _ = hub_deletions => {},
        _ = status_requests => {},
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    shutdown.cancel();
    Ok(())
}
