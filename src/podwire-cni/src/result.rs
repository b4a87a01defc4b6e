//! CNI Result types
//!
//! Output formats for CNI operations as defined in CNI Spec 1.0.0

use serde::{Deserialize, Serialize};

use crate::ipam::AddressAssignment;

/// Result returned by ADD operation
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI specification version
    pub cni_version: String,

    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,

    /// IP addresses assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,

    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsResult>,
}

impl CniResult {
    /// Create a new CNI result
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            interfaces: None,
            ips: None,
            dns: None,
        }
    }

    /// Add an interface to the result
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        let iface = Interface { name, mac, sandbox };
        self.interfaces.get_or_insert_with(Vec::new).push(iface);
        self
    }

    /// Add an assigned address to the result
    ///
    /// Results for 0.x versions carry an explicit "version" field.
    pub fn with_ip(mut self, assignment: &AddressAssignment, interface: usize) -> Self {
        let version = self
            .cni_version
            .starts_with("0.")
            .then(|| assignment.family().to_string());
        let ip = IpConfig {
            version,
            address: assignment.address.to_string(),
            gateway: assignment.gateway.map(|gw| gw.to_string()),
            interface: Some(interface),
        };
        self.ips.get_or_insert_with(Vec::new).push(ip);
        self
    }

    /// Set DNS configuration
    pub fn with_dns(mut self, dns: Option<DnsResult>) -> Self {
        self.dns = dns;
        self
    }
}

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,

    /// MAC address
    pub mac: String,

    /// Network namespace path (for container-side interfaces)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// "4" or "6"; only present in 0.x results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// IP address in CIDR notation
    pub address: String,

    /// Gateway IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into interfaces array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// DNS configuration result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsResult {
    /// DNS nameserver IPs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,

    /// DNS domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,

    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Result returned by VERSION operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    /// Current CNI version
    pub cni_version: String,

    /// List of supported CNI versions
    pub supported_versions: Vec<String>,
}
