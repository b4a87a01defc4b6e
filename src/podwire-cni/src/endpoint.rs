//! Workload endpoint records
//!
//! The durable record binding a container instance to its network identity,
//! the key it is stored under, and the names derived from the workload.

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::K8sArgs;
use crate::ipam::AddressAssignment;

/// Orchestrator name for Kubernetes pods
pub const ORCHESTRATOR_K8S: &str = "k8s";

/// Orchestrator name for plain CNI containers
pub const ORCHESTRATOR_CNI: &str = "cni";

/// Prefix for host-side veth names
const HOST_VETH_PREFIX: &str = "pw";

/// Maximum length for interface names (Linux limit is 15 + null terminator)
const MAX_IFNAME_LEN: usize = 15;

/// Who a container belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub orchestrator: String,
    pub workload: String,
}

impl Identity {
    /// Kubernetes pods are identified as "<namespace>.<pod>", anything else
    /// by its container id.
    pub fn from_args(container_id: &str, k8s: &K8sArgs) -> Self {
        match k8s.pod() {
            Some((namespace, pod)) => Self {
                orchestrator: ORCHESTRATOR_K8S.to_string(),
                workload: format!("{}.{}", namespace, pod),
            },
            None => Self {
                orchestrator: ORCHESTRATOR_CNI.to_string(),
                workload: container_id.to_string(),
            },
        }
    }
}

/// Stable key of an endpoint record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub node: String,
    pub orchestrator: String,
    pub workload: String,
    pub endpoint: String,
}

impl EndpointKey {
    pub fn new(node: &str, identity: &Identity, endpoint: &str) -> Self {
        Self {
            node: node.to_string(),
            orchestrator: identity.orchestrator.clone(),
            workload: identity.workload.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Hex digest of the key tuple, used to name stored records
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.node, &self.orchestrator, &self.workload, &self.endpoint] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Durable record of one pod's network attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpoint {
    pub metadata: EndpointMetadata,
    pub spec: EndpointSpec,

    /// Bumped by the store on every write
    #[serde(default)]
    pub revision: u64,
}

/// Identifying half of an endpoint record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMetadata {
    /// Container-side interface name
    pub name: String,
    pub node: String,
    pub orchestrator: String,
    pub workload: String,

    /// Container id that currently owns the record; empty on legacy records
    #[serde(default)]
    pub active_instance_id: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Network half of an endpoint record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Host-side veth name
    #[serde(default)]
    pub interface_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default)]
    pub ip_networks: Vec<IpNetwork>,

    #[serde(default)]
    pub profiles: Vec<String>,
}

impl WorkloadEndpoint {
    /// Fresh record for `key`, owned by `container_id`
    pub fn new(key: &EndpointKey, container_id: &str) -> Self {
        Self {
            metadata: EndpointMetadata {
                name: key.endpoint.clone(),
                node: key.node.clone(),
                orchestrator: key.orchestrator.clone(),
                workload: key.workload.clone(),
                active_instance_id: container_id.to_string(),
                labels: BTreeMap::new(),
            },
            spec: EndpointSpec::default(),
            revision: 0,
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            node: self.metadata.node.clone(),
            orchestrator: self.metadata.orchestrator.clone(),
            workload: self.metadata.workload.clone(),
            endpoint: self.metadata.name.clone(),
        }
    }

    /// A record with no active instance predates ownership tracking and is
    /// treated as owned by whoever asks.
    pub fn is_owned_by(&self, container_id: &str) -> bool {
        self.metadata.active_instance_id.is_empty()
            || self.metadata.active_instance_id == container_id
    }

    pub fn assignments(&self) -> Vec<AddressAssignment> {
        self.spec
            .ip_networks
            .iter()
            .map(|net| AddressAssignment::new(*net))
            .collect()
    }

    pub fn set_assignments(&mut self, assignments: &[AddressAssignment]) {
        self.spec.ip_networks = assignments.iter().map(|a| a.address).collect();
    }
}

/// Host-side veth name for a workload
///
/// Depends only on the workload so a repeated ADD targets the same name and
/// can clear a leftover link first.
pub fn veth_name_for_workload(workload: &str) -> String {
    let digest = hex::encode(Sha256::digest(workload.as_bytes()));
    let id_part = &digest[..MAX_IFNAME_LEN - HOST_VETH_PREFIX.len() - 2];
    format!("{}{}", HOST_VETH_PREFIX, id_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EndpointKey {
        EndpointKey {
            node: "node-a".to_string(),
            orchestrator: ORCHESTRATOR_K8S.to_string(),
            workload: "default.web-0".to_string(),
            endpoint: "eth0".to_string(),
        }
    }

    #[test]
    fn test_identity_from_args() {
        let k8s = K8sArgs {
            pod_namespace: Some("default".to_string()),
            pod_name: Some("web-0".to_string()),
            infra_container_id: None,
        };
        let identity = Identity::from_args("abc123", &k8s);
        assert_eq!(identity.orchestrator, ORCHESTRATOR_K8S);
        assert_eq!(identity.workload, "default.web-0");

        let identity = Identity::from_args("abc123", &K8sArgs::default());
        assert_eq!(identity.orchestrator, ORCHESTRATOR_CNI);
        assert_eq!(identity.workload, "abc123");
    }

    #[test]
    fn test_veth_name_for_workload() {
        let name = veth_name_for_workload("default.web-0");
        assert!(name.starts_with("pw"));
        assert_eq!(name.len(), 13);
        assert!(name.len() <= MAX_IFNAME_LEN);

        // Deterministic per workload, distinct across workloads
        assert_eq!(name, veth_name_for_workload("default.web-0"));
        assert_ne!(name, veth_name_for_workload("default.web-1"));
    }

    #[test]
    fn test_ownership() {
        let mut endpoint = WorkloadEndpoint::new(&key(), "abc");
        assert!(endpoint.is_owned_by("abc"));
        assert!(!endpoint.is_owned_by("def"));

        endpoint.metadata.active_instance_id.clear();
        assert!(endpoint.is_owned_by("def"));
    }

    #[test]
    fn test_key_round_trip_and_digest() {
        let endpoint = WorkloadEndpoint::new(&key(), "abc");
        assert_eq!(endpoint.key(), key());
        assert_eq!(key().digest().len(), 64);

        let mut other = key();
        other.endpoint = "eth1".to_string();
        assert_ne!(key().digest(), other.digest());
    }

    #[test]
    fn test_assignments_round_trip() {
        let mut endpoint = WorkloadEndpoint::new(&key(), "abc");
        let assignments = vec![
            AddressAssignment::new("10.0.5.9/32".parse().unwrap()),
            AddressAssignment::new("fd00::9/128".parse().unwrap()),
        ];
        endpoint.set_assignments(&assignments);
        assert_eq!(endpoint.spec.ip_networks.len(), 2);
        assert_eq!(endpoint.assignments(), assignments);
    }
}
