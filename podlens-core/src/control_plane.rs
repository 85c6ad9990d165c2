use crate::prelude::*;
use crate::tls::install_rustls_provider;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use tracing::{debug, info, warn};

const LAST_N_LOG_LINES: i64 = 50;

/// The subset of the cluster API the dashboard reads and writes.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `None` when the pod does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn list_deployments(&self, namespace: Option<&str>) -> Result<Vec<Deployment>>;
    /// Full-object replace; `deployment` must be the complete current object
    /// with only the targeted fields changed.
    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;
    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<String>,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    cluster_url: String,
}

impl KubeControlPlane {
    pub async fn new(options: &KubeConfigOptions) -> Result<Self> {
        if !install_rustls_provider() {
            warn!("No rustls crypto provider installed, TLS connections will fail");
        }
        let cfg = match Config::from_kubeconfig(options).await {
            Ok(cfg) => {
                info!(
                    "Loaded kubeconfig (context: {:?}), cluster_url: {}",
                    options.context, cfg.cluster_url
                );
                cfg
            }
            Err(err) => {
                info!(
                    "Failed to load kubeconfig (context: {:?}), falling back to in-cluster config. The error was: {err:?}",
                    options.context
                );
                let in_cluster_cfg = Config::incluster()?;
                info!(
                    "Loaded in-cluster config, cluster_url: {}",
                    in_cluster_cfg.cluster_url
                );
                in_cluster_cfg
            }
        };
        let cluster_url = cfg.cluster_url.to_string();
        let client = Client::try_from(cfg)?;
        Ok(KubeControlPlane {
            client,
            cluster_url,
        })
    }

    pub fn from_client(client: Client) -> Self {
        KubeControlPlane {
            client,
            cluster_url: String::new(),
        }
    }

    pub fn cluster_url(&self) -> &str {
        &self.cluster_url
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        debug!("delete of pod {namespace}/{name} accepted");
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn list_deployments(&self, namespace: Option<&str>) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = match namespace {
            Some(ns) => self.deployments(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let replaced = self
            .deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await?;
        debug!("replace of deployment {namespace}/{name} accepted");
        Ok(replaced)
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<String>,
    ) -> Result<String> {
        let log_params = LogParams {
            container,
            tail_lines: Some(LAST_N_LOG_LINES),
            timestamps: true,
            ..LogParams::default()
        };
        Ok(self.pods(namespace).logs(pod_name, &log_params).await?)
    }
}
