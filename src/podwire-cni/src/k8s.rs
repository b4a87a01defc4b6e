//! Kubernetes metadata lookups
//!
//! Only two questions are ever asked of the API server: a pod's labels and
//! annotations, and a node's pod CIDR.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::CniError;

/// Orchestrator metadata the plugin depends on
pub trait PodMetadata {
    /// `(labels, annotations)` of a pod
    fn labels_and_annotations(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), CniError>;

    /// Pod CIDR assigned to a node; an unassigned CIDR is an error
    fn pod_cidr(&self, node: &str) -> Result<String, CniError>;
}

/// Kubernetes API client built from a kubeconfig or the in-cluster environment
pub struct KubeClient {
    kubeconfig: Option<PathBuf>,
    api_root: Option<String>,
}

impl KubeClient {
    pub fn new(kubeconfig: Option<PathBuf>, api_root: Option<String>) -> Self {
        Self {
            kubeconfig,
            api_root,
        }
    }

    fn connect(&self) -> Result<(Runtime, Client), CniError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
            })?;

        let client = runtime.block_on(async {
            let mut config = match &self.kubeconfig {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        CniError::metadata_error(&format!(
                            "failed to read kubeconfig {}",
                            path.display()
                        ))
                        .with_details(&e.to_string())
                    })?;
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            CniError::metadata_error("invalid kubeconfig")
                                .with_details(&e.to_string())
                        })?
                }
                None => Config::infer().await.map_err(|e| {
                    CniError::metadata_error("failed to load Kubernetes client config")
                        .with_details(&e.to_string())
                })?,
            };

            if let Some(root) = &self.api_root {
                config.cluster_url = root.parse().map_err(|e| {
                    CniError::metadata_error(&format!("invalid Kubernetes API root {}", root))
                        .with_details(&format!("{}", e))
                })?;
            }

            Client::try_from(config).map_err(|e| {
                CniError::metadata_error("failed to create Kubernetes client")
                    .with_details(&e.to_string())
            })
        })?;

        Ok((runtime, client))
    }
}

impl PodMetadata for KubeClient {
    fn labels_and_annotations(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), CniError> {
        let (runtime, client) = self.connect()?;
        let fetched = runtime.block_on(async {
            Api::<Pod>::namespaced(client, namespace).get(pod).await
        });
        let fetched = fetched.map_err(|e| {
            CniError::metadata_error(&format!("failed to get pod {}/{}", namespace, pod))
                .with_details(&e.to_string())
        })?;

        let labels = fetched.metadata.labels.unwrap_or_default();
        let annotations = fetched.metadata.annotations.unwrap_or_default();
        debug!(namespace, pod, ?labels, ?annotations, "fetched pod metadata");
        Ok((labels, annotations))
    }

    fn pod_cidr(&self, node: &str) -> Result<String, CniError> {
        let (runtime, client) = self.connect()?;
        let fetched = runtime
            .block_on(async { Api::<Node>::all(client).get(node).await })
            .map_err(|e| {
                CniError::metadata_error(&format!("failed to get node {}", node))
                    .with_details(&e.to_string())
            })?;

        fetched
            .spec
            .and_then(|spec| spec.pod_cidr)
            .filter(|cidr| !cidr.is_empty())
            .ok_or_else(|| {
                CniError::metadata_error(&format!("no podCidr for node {}", node))
            })
    }
}
