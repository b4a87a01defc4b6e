//! Veth pair management
//!
//! Creates the veth pair inside the container namespace, wires addresses and
//! routes there, hands the host end back to the host namespace and finishes
//! the host side: kernel parameters, link state, per-address routes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use tracing::{debug, info};

use crate::endpoint::veth_name_for_workload;
use crate::error::{CniError, CniErrorCode};
use crate::ipam::{AddressAssignment, AddressFamily};
use crate::netlink::{Kernel, LinkOps, Route, RouteScope};

/// Next hop of every container's IPv4 default route
///
/// Never assigned anywhere; the host end answers ARP for it via proxy_arp.
pub const IPV4_NEXT_HOP: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// What to wire up
#[derive(Debug, Clone)]
pub struct AttachRequest<'a> {
    pub netns: &'a str,
    pub workload: &'a str,
    /// Explicit host-side name; derived from the workload when absent
    pub host_ifname: Option<&'a str>,
    pub container_ifname: &'a str,
    pub mtu: u32,
    pub assignments: &'a [AddressAssignment],
}

/// What was wired up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub host_ifname: String,
    pub container_mac: String,
}

/// Host end just moved back to the host namespace
///
/// A namespace move leaves the link administratively down.
struct MigratedLink {
    name: String,
}

/// Host end up and usable for routes
struct ActiveLink {
    index: u32,
}

impl MigratedLink {
    fn bring_up<L: LinkOps>(self, links: &L) -> Result<ActiveLink, CniError> {
        let index = require_index(links, &self.name)?;
        links.set_up(index)?;
        debug!(link = %self.name, "host veth up in host namespace");
        Ok(ActiveLink { index })
    }
}

/// Create and configure the veth pair for one container
pub fn attach<K: Kernel>(kernel: &K, request: &AttachRequest<'_>) -> Result<Attachment, CniError> {
    let host_ifname = request
        .host_ifname
        .map(str::to_string)
        .unwrap_or_else(|| veth_name_for_workload(request.workload));

    let host = kernel.host()?;
    if let Some(stale) = host.link_index(&host_ifname)? {
        info!(link = %host_ifname, "deleting stale host veth");
        host.delete_link(stale)?;
    }

    let (container_mac, migrated) = kernel.in_netns(request.netns, |links, host_netns| {
        links.add_veth(request.container_ifname, &host_ifname)?;
        let container_index = require_index(links, request.container_ifname)?;
        let host_index = require_index(links, &host_ifname)?;

        links.set_mtu(container_index, request.mtu)?;
        links.set_mtu(host_index, request.mtu)?;

        // Up before anything reads its IPv6 link-local address
        links.set_up(host_index)?;
        links.set_up(container_index)?;

        let mac = links.hardware_address(container_index)?;

        for assignment in request.assignments {
            match assignment.family() {
                AddressFamily::V4 => configure_ipv4(links, container_index, assignment)?,
                AddressFamily::V6 => {
                    configure_ipv6(links, container_index, host_index, assignment)?
                }
            }
        }

        links.move_to_netns(host_index, host_netns)?;
        Ok((mac, MigratedLink { name: host_ifname.clone() }))
    })?;

    configure_sysctls(kernel, &host_ifname, request.assignments)?;

    let active = migrated.bring_up(&host)?;
    for assignment in request.assignments {
        host.add_route(&Route {
            index: active.index,
            destination: assignment.host_route(),
            gateway: None,
            scope: RouteScope::Link,
        })?;
    }

    info!(
        host = %host_ifname,
        container = request.container_ifname,
        mac = %container_mac,
        "veth pair attached"
    );

    Ok(Attachment {
        host_ifname,
        container_mac,
    })
}

fn configure_ipv4<L: LinkOps>(
    links: &L,
    container_index: u32,
    assignment: &AddressAssignment,
) -> Result<(), CniError> {
    let next_hop = IpNetwork::V4(Ipv4Network::from(IPV4_NEXT_HOP));
    links.add_route(&Route {
        index: container_index,
        destination: next_hop,
        gateway: None,
        scope: RouteScope::Link,
    })?;
    links.add_route(&Route {
        index: container_index,
        destination: IpNetwork::V4(default_prefix(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0))?),
        gateway: Some(IpAddr::V4(IPV4_NEXT_HOP)),
        scope: RouteScope::Universe,
    })?;
    links.add_address(container_index, assignment.address)
}

fn configure_ipv6<L: LinkOps>(
    links: &L,
    container_index: u32,
    host_index: u32,
    assignment: &AddressAssignment,
) -> Result<(), CniError> {
    let host_addresses = links.ipv6_addresses(host_index)?;
    let gateway = host_addresses.first().copied().ok_or_else(|| {
        CniError::new(
            CniErrorCode::HostLacksIpv6,
            "IPv6 address allocated but the host veth has no IPv6 address",
        )
        .with_details("enable IPv6 on the host or stop allocating IPv6 addresses")
    })?;

    links.add_route(&Route {
        index: container_index,
        destination: IpNetwork::V6(default_prefix(Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0))?),
        gateway: Some(IpAddr::V6(gateway)),
        scope: RouteScope::Universe,
    })?;
    links.add_address(container_index, assignment.address)
}

/// Kernel parameters of the host veth for the families in use
pub fn configure_sysctls<K: Kernel>(
    kernel: &K,
    host_ifname: &str,
    assignments: &[AddressAssignment],
) -> Result<(), CniError> {
    let has = |family| assignments.iter().any(|a| a.family() == family);

    if has(AddressFamily::V4) {
        kernel.write_sysctl(&format!("/proc/sys/net/ipv4/conf/{}/proxy_arp", host_ifname), "1")?;
        kernel.write_sysctl(&format!("/proc/sys/net/ipv4/neigh/{}/proxy_delay", host_ifname), "0")?;
        kernel.write_sysctl(&format!("/proc/sys/net/ipv4/conf/{}/forwarding", host_ifname), "1")?;
    }
    if has(AddressFamily::V6) {
        kernel.write_sysctl(&format!("/proc/sys/net/ipv6/conf/{}/proxy_ndp", host_ifname), "1")?;
        kernel.write_sysctl(&format!("/proc/sys/net/ipv6/conf/{}/forwarding", host_ifname), "1")?;
    }
    Ok(())
}

/// Delete the container interface; its veth peer goes with it
///
/// Missing links are not an error.
pub fn remove_container_interface<K: Kernel>(
    kernel: &K,
    netns: &str,
    ifname: &str,
) -> Result<(), CniError> {
    kernel.in_netns(netns, |links, _| match links.link_index(ifname)? {
        Some(index) => {
            links.delete_link(index)?;
            info!(link = ifname, "deleted container interface");
            Ok(())
        }
        None => {
            debug!(link = ifname, "container interface already gone");
            Ok(())
        }
    })
}

/// Whether `ifname` exists inside the namespace
pub fn container_interface_exists<K: Kernel>(
    kernel: &K,
    netns: &str,
    ifname: &str,
) -> Result<bool, CniError> {
    kernel.in_netns(netns, |links, _| Ok(links.link_index(ifname)?.is_some()))
}

fn default_prefix<N>(network: Result<N, ipnetwork::IpNetworkError>) -> Result<N, CniError> {
    network.map_err(|e| CniError::route_error("invalid default route").with_details(&e.to_string()))
}

fn require_index<L: LinkOps>(links: &L, name: &str) -> Result<u32, CniError> {
    links
        .link_index(name)?
        .ok_or_else(|| CniError::veth_error(&format!("link {} not found after creation", name)))
}
