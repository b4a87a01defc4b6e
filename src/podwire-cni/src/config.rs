//! CNI Network Configuration parsing
//!
//! Handles the network configuration JSON passed via stdin, the CNI_*
//! environment of one invocation, and the orchestrator-specific CNI_ARGS.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CniError, CniErrorCode};

/// Default MTU for both ends of the veth pair
const DEFAULT_MTU: u32 = 1500;

/// Default log level when the config does not set one
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default directory of the file-backed endpoint store
pub const DEFAULT_DATASTORE_DIR: &str = "/var/lib/podwire/endpoints";

/// Policy type that turns on orchestrator integration
pub const POLICY_TYPE_K8S: &str = "k8s";

/// Network configuration passed to the CNI plugin
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI specification version
    pub cni_version: String,

    /// Network name (must be unique on the host)
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// MTU for the interface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log_level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Node name override; defaults to the host name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodename: Option<String>,

    /// IPAM configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,

    /// Policy integration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Kubernetes API access
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Endpoint datastore location
    #[serde(default)]
    pub datastore: DatastoreConfig,
}

impl NetworkConfig {
    /// Parse the network configuration from raw stdin bytes
    pub fn parse(input: &[u8]) -> Result<Self, CniError> {
        serde_json::from_slice(input).map_err(|e| {
            CniError::new(CniErrorCode::DecodingFailure, "failed to parse network config")
                .with_details(&e.to_string())
        })
    }

    /// Get the MTU value for network interfaces
    pub fn mtu_value(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    /// Get the configured log level
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// IPAM section, required by ADD and DEL
    pub fn ipam(&self) -> Result<&IpamConfig, CniError> {
        self.ipam
            .as_ref()
            .ok_or_else(|| CniError::config_error("network config has no ipam section"))
    }

    /// Whether labels and profiles come from the orchestrator
    pub fn is_k8s_policy(&self) -> bool {
        self.policy.policy_type.as_deref() == Some(POLICY_TYPE_K8S)
    }

    /// Name of this node as recorded in endpoints
    pub fn node_name(&self) -> Result<String, CniError> {
        if let Some(name) = self.nodename.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }

        let hostname = nix::unistd::gethostname().map_err(|e| {
            CniError::io_error("failed to read host name").with_details(&e.to_string())
        })?;
        hostname
            .into_string()
            .map_err(|_| CniError::io_error("host name is not valid UTF-8"))
    }

    /// Name of the node whose pod CIDR is used for host-local IPAM
    pub fn pod_cidr_node(&self, nodename: &str) -> String {
        self.kubernetes
            .node_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| nodename.to_string())
    }

    /// Directory of the endpoint store
    pub fn datastore_dir(&self) -> PathBuf {
        self.datastore
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASTORE_DIR))
    }
}

/// IPAM (IP Address Management) configuration
///
/// Only the keys this plugin acts on are typed; everything else belongs to
/// the allocator and is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConfig {
    /// IPAM plugin type (e.g., "host-local", "calico-ipam")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Subnet in CIDR notation, or "usePodCidr"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Allocator-specific keys
    #[serde(flatten)]
    pub specific: HashMap<String, Value>,
}

impl IpamConfig {
    /// Whether the subnet should be replaced by the node's pod CIDR
    pub fn uses_pod_cidr(&self) -> bool {
        self.plugin_type == "host-local"
            && self
                .subnet
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("usePodCidr"))
    }
}

/// Policy integration settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// "k8s" enables label and namespace-profile integration
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,

    /// API server root; a trailing "/api/..." is ignored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_api_root: Option<String>,
}

/// Kubernetes API access settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Path to a kubeconfig file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    /// Node name used for pod CIDR lookups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// API server root; wins over the policy section
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_api_root: Option<String>,
}

impl KubernetesConfig {
    /// Effective API server override, if any
    pub fn api_root<'a>(&'a self, policy: &'a PolicyConfig) -> Option<&'a str> {
        let root = self
            .k8s_api_root
            .as_deref()
            .filter(|r| !r.is_empty())
            .or_else(|| policy.k8s_api_root.as_deref().filter(|r| !r.is_empty()))?;

        // Older configs carried the full "/api/v1/" suffix
        Some(root.split("/api/").next().unwrap_or(root))
    }
}

/// Endpoint datastore settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatastoreConfig {
    /// Directory holding endpoint records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Rewrite one key of the `ipam` object in the raw network config
///
/// The raw bytes are what the allocator sees, so changes made here are how
/// per-pod settings reach it.
pub fn rewrite_ipam_field(raw: &[u8], key: &str, value: Value) -> Result<Vec<u8>, CniError> {
    let mut document: Value = serde_json::from_slice(raw).map_err(|e| {
        CniError::decode_error("failed to parse network config").with_details(&e.to_string())
    })?;

    let ipam = document
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| CniError::decode_error("network config ipam section is not an object"))?;
    ipam.insert(key.to_string(), value);

    serde_json::to_vec(&document).map_err(|e| {
        CniError::decode_error("failed to serialize network config").with_details(&e.to_string())
    })
}

/// Per-call data supplied by the container runtime
#[derive(Debug, Clone)]
pub struct InvocationArgs {
    /// CNI_CONTAINERID
    pub container_id: String,

    /// CNI_NETNS; may be empty on DEL when the namespace is already gone
    pub netns: String,

    /// CNI_IFNAME
    pub ifname: String,

    /// CNI_ARGS
    pub args: String,

    /// Raw network config; rewritten before it reaches the allocator
    pub stdin_data: Vec<u8>,
}

impl InvocationArgs {
    /// Read the invocation from the CNI_* environment variables
    pub fn from_env(stdin_data: Vec<u8>, require_netns: bool) -> Result<Self, CniError> {
        let container_id = required_env("CNI_CONTAINERID")?;
        let ifname = required_env("CNI_IFNAME")?;
        let netns = if require_netns {
            required_env("CNI_NETNS")?
        } else {
            env::var("CNI_NETNS").unwrap_or_default()
        };

        Ok(Self {
            container_id,
            netns,
            ifname,
            args: env::var("CNI_ARGS").unwrap_or_default(),
            stdin_data,
        })
    }

    /// Orchestrator arguments carried in CNI_ARGS
    pub fn k8s_args(&self) -> Result<K8sArgs, CniError> {
        K8sArgs::parse(&self.args)
    }
}

fn required_env(name: &str) -> Result<String, CniError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                &format!("{} not set", name),
            )
        })
}

/// Kubernetes pod identity from CNI_ARGS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_namespace: Option<String>,
    pub pod_name: Option<String>,
    pub infra_container_id: Option<String>,
}

impl K8sArgs {
    /// Parse "K=V;K=V" pairs, ignoring keys this plugin does not use
    pub fn parse(args: &str) -> Result<Self, CniError> {
        let mut parsed = Self::default();

        for pair in args.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                CniError::new(
                    CniErrorCode::InvalidEnvironmentVariables,
                    &format!("invalid CNI_ARGS pair: {}", pair),
                )
            })?;

            let value = Some(value.to_string()).filter(|v| !v.is_empty());
            match key {
                "K8S_POD_NAMESPACE" => parsed.pod_namespace = value,
                "K8S_POD_NAME" => parsed.pod_name = value,
                "K8S_POD_INFRA_CONTAINER_ID" => parsed.infra_container_id = value,
                _ => {}
            }
        }

        Ok(parsed)
    }

    /// Namespace and pod name, when both are present
    pub fn pod(&self) -> Option<(&str, &str)> {
        Some((self.pod_namespace.as_deref()?, self.pod_name.as_deref()?))
    }
}
