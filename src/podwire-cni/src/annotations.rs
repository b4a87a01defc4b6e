//! Pod annotations that steer address assignment
//!
//! Annotations arrive as a loose string map; they are parsed here, once,
//! into a typed [`PodAnnotations`] and the rest of the plugin only sees that.

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::{debug, info};

use crate::cleanup;
use crate::error::CniError;
use crate::ipam::{AddressAssignment, Ipam, IpamOutput};

/// Exact addresses, still allocated through the IPAM plugin
pub const IP_ADDRS_ANNOTATION: &str = "podwire.io/ipAddrs";

/// Exact addresses, IPAM plugin bypassed
pub const IP_ADDRS_NO_IPAM_ANNOTATION: &str = "podwire.io/ipAddrsNoIpam";

/// Preferred IPv4 pools
pub const IPV4_POOLS_ANNOTATION: &str = "podwire.io/ipv4pools";

/// Preferred IPv6 pools
pub const IPV6_POOLS_ANNOTATION: &str = "podwire.io/ipv6pools";

/// How addresses are obtained for a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressStrategy {
    /// Whatever the IPAM plugin hands out
    Allocate,
    /// Ask the IPAM plugin for each of these addresses
    AllocateSpecific(Vec<IpAddr>),
    /// Use these addresses without calling the IPAM plugin
    Bypass(Vec<IpAddr>),
}

/// Where resolved addresses came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// The IPAM plugin holds them and must release them on failure
    Allocator,
    /// Fabricated from annotations; nothing to release
    Annotation,
}

/// Typed view of the annotations this plugin understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAnnotations {
    pub strategy: AddressStrategy,
    pub ipv4_pools: Option<Vec<String>>,
    pub ipv6_pools: Option<Vec<String>>,
}

impl Default for PodAnnotations {
    fn default() -> Self {
        Self {
            strategy: AddressStrategy::Allocate,
            ipv4_pools: None,
            ipv6_pools: None,
        }
    }
}

impl PodAnnotations {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Result<Self, CniError> {
        let lookup = |key: &str| annotations.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let strategy = match (lookup(IP_ADDRS_ANNOTATION), lookup(IP_ADDRS_NO_IPAM_ANNOTATION)) {
            (None, None) => AddressStrategy::Allocate,
            (Some(_), Some(_)) => {
                return Err(CniError::config_error(&format!(
                    "can't have both annotations: '{}' and '{}' in use at the same time",
                    IP_ADDRS_ANNOTATION, IP_ADDRS_NO_IPAM_ANNOTATION
                )));
            }
            (Some(value), None) => {
                AddressStrategy::AllocateSpecific(parse_ip_list(IP_ADDRS_ANNOTATION, value)?)
            }
            (None, Some(value)) => {
                AddressStrategy::Bypass(parse_ip_list(IP_ADDRS_NO_IPAM_ANNOTATION, value)?)
            }
        };

        Ok(Self {
            strategy,
            ipv4_pools: lookup(IPV4_POOLS_ANNOTATION)
                .map(|v| parse_string_list(IPV4_POOLS_ANNOTATION, v))
                .transpose()?,
            ipv6_pools: lookup(IPV6_POOLS_ANNOTATION)
                .map(|v| parse_string_list(IPV6_POOLS_ANNOTATION, v))
                .transpose()?,
        })
    }
}

fn parse_string_list(annotation: &str, value: &str) -> Result<Vec<String>, CniError> {
    serde_json::from_str(value).map_err(|e| {
        CniError::config_error(&format!(
            "failed to parse '{}' as JSON for annotation \"{}\"",
            value, annotation
        ))
        .with_details(&e.to_string())
    })
}

/// Parse a JSON array of address literals, e.g. `["10.0.0.1", "2001:db8::1"]`
fn parse_ip_list(annotation: &str, value: &str) -> Result<Vec<IpAddr>, CniError> {
    info!(annotation, value, "parsing address annotation");
    let literals = parse_string_list(annotation, value)?;

    if literals.is_empty() {
        return Err(CniError::config_error(&format!(
            "annotation \"{}\" specified but empty",
            annotation
        )));
    }

    literals
        .iter()
        .map(|literal| {
            literal
                .parse::<IpAddr>()
                .map_err(|_| CniError::config_error(&format!("invalid IP format: {}", literal)))
        })
        .collect()
}

/// Produce the addresses for `strategy`
///
/// `stdin` is the (possibly rewritten) network config the IPAM plugin sees.
pub fn resolve(
    strategy: &AddressStrategy,
    ipam: &Ipam,
    stdin: &[u8],
) -> Result<(IpamOutput, AddressSource), CniError> {
    match strategy {
        AddressStrategy::Allocate => Ok((ipam.allocate(stdin)?, AddressSource::Allocator)),
        AddressStrategy::AllocateSpecific(ips) => {
            let mut output = IpamOutput::default();
            for ip in ips {
                match ipam.allocate_specific(*ip, stdin) {
                    Ok(assignment) => {
                        debug!(version = %assignment.family(), %ip, "adding address to result");
                        output.assignments.push(assignment);
                    }
                    Err(e) => {
                        if !output.assignments.is_empty() {
                            cleanup::release_after_failure(ipam, stdin);
                        }
                        return Err(CniError::ipam_error(&format!(
                            "error getting IP {} from IPAM: {}",
                            ip,
                            e.message()
                        ))
                        .with_details(e.details().unwrap_or_default()));
                    }
                }
            }
            Ok((output, AddressSource::Allocator))
        }
        AddressStrategy::Bypass(ips) => {
            let assignments = ips.iter().copied().map(AddressAssignment::exact).collect();
            debug!(?assignments, "bypassing IPAM");
            Ok((
                IpamOutput {
                    assignments,
                    dns: None,
                },
                AddressSource::Annotation,
            ))
        }
    }
}
