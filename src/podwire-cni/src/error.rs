//! Plugin errors
//!
//! Every failure leaves the plugin as a [`CniError`]: a numeric code the
//! runtime can branch on, a one-line message, and optional details. Codes
//! below 100 are the standard CNI codes; 101 and up name the stage of pod
//! attachment that failed.

use std::io::Write;

use serde_json::json;
use thiserror::Error;

/// Error codes reported in the CNI error object
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)] // Standard codes this plugin never raises
pub enum CniErrorCode {
    IncompatibleVersion = 1,
    UnsupportedField = 2,

    /// CHECK found no record, a record owned by someone else, or no interface
    UnknownContainer = 3,

    /// A CNI_* variable is missing, or CNI_ARGS is malformed or could not be set
    InvalidEnvironmentVariables = 4,

    IoFailure = 5,

    /// Network config or IPAM config is not the JSON we expect
    DecodingFailure = 6,

    /// Conflicting or malformed pod annotations, a missing ipam section, or
    /// more than one address of a family
    InvalidNetworkConfig = 7,

    TryAgainLater = 11,

    /// Veth pair could not be created, configured or removed
    VethCreationFailed = 101,

    /// IPAM plugin missing, failing, or returning no usable address
    IpamFailure = 102,

    /// Container namespace could not be entered or restored, or a link could
    /// not be moved between namespaces
    NamespaceFailure = 103,

    /// Container default routes or host per-address routes
    RouteFailure = 104,

    /// proxy_arp, proxy_ndp, proxy_delay or forwarding on the host veth
    SysctlFailure = 105,

    /// Endpoint store unreachable or holding an unreadable record
    DatastoreFailure = 106,

    /// Endpoint record changed between read and delete; DEL may be retried
    DatastoreConflict = 107,

    /// An IPv6 address was assigned but the host veth has no IPv6 address to
    /// route through
    HostLacksIpv6 = 108,

    /// Pod or node lookup against the Kubernetes API failed
    MetadataFailure = 109,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Write the CNI error object as one line of JSON
    ///
    /// Runtimes and delegating plugins read this from stdout.
    pub fn write_json<W: Write>(&self, cni_version: &str, out: &mut W) -> std::io::Result<()> {
        let object = json!({
            "cniVersion": cni_version,
            "code": self.code as u32,
            "msg": self.msg,
            "details": self.details,
        });
        writeln!(out, "{}", object)
    }
}

impl CniError {
    pub fn io_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IoFailure, msg)
    }

    pub fn decode_error(msg: &str) -> Self {
        Self::new(CniErrorCode::DecodingFailure, msg)
    }

    pub fn config_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidNetworkConfig, msg)
    }

    pub fn veth_error(msg: &str) -> Self {
        Self::new(CniErrorCode::VethCreationFailed, msg)
    }

    pub fn ipam_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IpamFailure, msg)
    }

    pub fn namespace_error(msg: &str) -> Self {
        Self::new(CniErrorCode::NamespaceFailure, msg)
    }

    pub fn route_error(msg: &str) -> Self {
        Self::new(CniErrorCode::RouteFailure, msg)
    }

    pub fn metadata_error(msg: &str) -> Self {
        Self::new(CniErrorCode::MetadataFailure, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(CniErrorCode::UnknownContainer as u32, 3);
        assert_eq!(CniErrorCode::InvalidNetworkConfig as u32, 7);
        assert_eq!(CniErrorCode::VethCreationFailed as u32, 101);
        assert_eq!(CniErrorCode::SysctlFailure as u32, 105);
        assert_eq!(CniErrorCode::DatastoreConflict as u32, 107);
        assert_eq!(CniErrorCode::MetadataFailure as u32, 109);
    }

    #[test]
    fn test_error_with_details() {
        let err = CniError::new(CniErrorCode::IpamFailure, "allocation failed")
            .with_details("pool exhausted");

        assert_eq!(err.code(), CniErrorCode::IpamFailure);
        assert_eq!(err.message(), "allocation failed");
        assert_eq!(err.details(), Some("pool exhausted"));
        assert_eq!(err.to_string(), "allocation failed");
    }

    #[test]
    fn test_convenience_constructors() {
        let err = CniError::config_error("bad annotation");
        assert_eq!(err.code(), CniErrorCode::InvalidNetworkConfig);

        let err = CniError::route_error("no route");
        assert_eq!(err.code(), CniErrorCode::RouteFailure);

        let err = CniError::namespace_error("setns failed");
        assert_eq!(err.code(), CniErrorCode::NamespaceFailure);
    }

    #[test]
    fn test_error_object_is_what_a_delegating_plugin_decodes() {
        let err = CniError::new(CniErrorCode::DatastoreConflict, "endpoint changed")
            .with_details("revision 3 != 4");
        let mut out = Vec::new();
        err.write_json("1.0.0", &mut out).unwrap();

        assert!(out.ends_with(b"\n"));
        let object: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(object["cniVersion"], "1.0.0");
        assert_eq!(object["code"], 107);
        assert_eq!(object["msg"], "endpoint changed");
        assert_eq!(object["details"], "revision 3 != 4");
    }
}
