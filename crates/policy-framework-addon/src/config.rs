use std::path::PathBuf;

use kube::{
    Client,
    config::{KubeConfigOptions, Kubeconfig},
};

pub const DEFAULT_TARGET_NAMESPACE: &str = "open-cluster-management-policies";

#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace on the managed cluster that receives replicated policies.
    pub target_namespace: String,
    /// Namespace on the hub holding this cluster's replicated policies.
    pub cluster_namespace_on_hub: String,
    pub hub_kubeconfig: Option<PathBuf>,
    pub concurrent_reconciles: u16,
    pub status_sync_queue: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let target_namespace =
            std::env::var("TARGET_NAMESPACE").unwrap_or_else(|_| DEFAULT_TARGET_NAMESPACE.into());
        let cluster_namespace_on_hub =
            std::env::var("CLUSTER_NAMESPACE_ON_HUB").unwrap_or_else(|_| target_namespace.clone());
        let hub_kubeconfig = std::env::var_os("HUB_KUBECONFIG").map(PathBuf::from);
        let concurrent_reconciles = parse_env("CONCURRENT_RECONCILES", 10)?;
        let status_sync_queue =
            non_zero("STATUS_SYNC_QUEUE", parse_env("STATUS_SYNC_QUEUE", 100)?)?;
        Ok(Self {
            target_namespace,
            cluster_namespace_on_hub,
            hub_kubeconfig,
            concurrent_reconciles,
            status_sync_queue,
        })
    }

    /// Hub client from `HUB_KUBECONFIG`, else the default config.
    pub async fn hub_client(&self) -> anyhow::Result<Client> {
        match &self.hub_kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await?;
                Ok(Client::try_from(config)?)
            }
            None => Ok(Client::try_default().await?),
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={}: {}", name, v, e)),
        Err(_) => Ok(default),
    }
}

/// A bounded channel cannot have zero capacity.
fn non_zero(name: &str, value: usize) -> anyhow::Result<usize> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(value)
}
