//! Link, address and route operations
//!
//! [`LinkOps`] is the set of netlink calls the attachment engine needs;
//! [`Kernel`] hands out a `LinkOps` bound to the host namespace or to a
//! container namespace. The real implementation talks rtnetlink over a
//! single-threaded tokio runtime so the socket lives in whichever namespace
//! the calling thread is in when it connects.

use std::net::{IpAddr, Ipv6Addr};
use std::os::fd::RawFd;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::{new_connection, Handle};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::CniError;
use crate::netns;
use crate::sysctl;

/// Route scope, as far as the attachment engine cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    /// Destination is directly on the link
    Link,
    /// Reached through a gateway
    Universe,
}

/// A route to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub index: u32,
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub scope: RouteScope,
}

/// Netlink operations against one namespace
pub trait LinkOps {
    fn link_index(&self, name: &str) -> Result<Option<u32>, CniError>;
    fn delete_link(&self, index: u32) -> Result<(), CniError>;
    /// Create a veth pair; both ends land in the current namespace
    fn add_veth(&self, name: &str, peer: &str) -> Result<(), CniError>;
    fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CniError>;
    fn set_up(&self, index: u32) -> Result<(), CniError>;
    /// Hardware address formatted as `aa:bb:cc:dd:ee:ff`
    fn hardware_address(&self, index: u32) -> Result<String, CniError>;
    fn ipv6_addresses(&self, index: u32) -> Result<Vec<Ipv6Addr>, CniError>;
    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), CniError>;
    fn add_route(&self, route: &Route) -> Result<(), CniError>;
    /// Move a link to the namespace behind `netns_fd`
    fn move_to_netns(&self, index: u32, netns_fd: RawFd) -> Result<(), CniError>;
}

/// Access to the host and container namespaces
pub trait Kernel {
    type Links: LinkOps;

    /// Links of the host namespace
    fn host(&self) -> Result<Self::Links, CniError>;

    /// Run `f` inside the namespace at `netns_path`
    ///
    /// `f` also gets a descriptor of the host namespace. The namespace switch
    /// is undone on every return path.
    fn in_netns<T, F>(&self, netns_path: &str, f: F) -> Result<T, CniError>
    where
        F: FnOnce(&Self::Links, RawFd) -> Result<T, CniError>;

    /// Whether the namespace at `netns_path` still exists
    fn netns_exists(&self, netns_path: &str) -> bool;

    /// All-or-nothing write of a /proc/sys entry
    fn write_sysctl(&self, path: &str, value: &str) -> Result<(), CniError>;
}

/// The running kernel
pub struct HostKernel;

impl Kernel for HostKernel {
    type Links = RtNetlink;

    fn host(&self) -> Result<RtNetlink, CniError> {
        RtNetlink::connect()
    }

    fn in_netns<T, F>(&self, netns_path: &str, f: F) -> Result<T, CniError>
    where
        F: FnOnce(&RtNetlink, RawFd) -> Result<T, CniError>,
    {
        netns::with_netns(netns_path, |host_fd| {
            let links = RtNetlink::connect()?;
            f(&links, host_fd)
        })
    }

    fn netns_exists(&self, netns_path: &str) -> bool {
        netns::netns_exists(netns_path)
    }

    fn write_sysctl(&self, path: &str, value: &str) -> Result<(), CniError> {
        sysctl::write_proc_sys(path, value)
    }
}

/// rtnetlink connection bound to the namespace it was opened in
pub struct RtNetlink {
    runtime: Runtime,
    handle: Handle,
}

impl RtNetlink {
    pub fn connect() -> Result<Self, CniError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
            })?;

        let handle = runtime.block_on(async {
            let (connection, handle, _) = new_connection().map_err(|e| {
                CniError::io_error("failed to create netlink connection")
                    .with_details(&e.to_string())
            })?;
            tokio::spawn(connection);
            Ok::<_, CniError>(handle)
        })?;

        Ok(Self { runtime, handle })
    }
}

fn is_exists(e: &rtnetlink::Error) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(m) if m.raw_code() == -libc::EEXIST)
}

fn is_no_device(e: &rtnetlink::Error) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(m) if m.raw_code() == -libc::ENODEV)
}

impl LinkOps for RtNetlink {
    fn link_index(&self, name: &str) -> Result<Option<u32>, CniError> {
        self.runtime.block_on(async {
            let mut links = self.handle.link().get().match_name(name.to_string()).execute();
            match links.try_next().await {
                Ok(Some(link)) => Ok(Some(link.header.index)),
                Ok(None) => Ok(None),
                Err(e) if is_no_device(&e) => Ok(None),
                Err(e) => Err(CniError::io_error(&format!("failed to get link {}", name))
                    .with_details(&e.to_string())),
            }
        })
    }

    fn delete_link(&self, index: u32) -> Result<(), CniError> {
        self.runtime.block_on(async {
            match self.handle.link().del(index).execute().await {
                Ok(()) => Ok(()),
                Err(e) if is_no_device(&e) => Ok(()),
                Err(e) => Err(CniError::veth_error(&format!("failed to delete link {}", index))
                    .with_details(&e.to_string())),
            }
        })
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<(), CniError> {
        self.runtime.block_on(async {
            self.handle
                .link()
                .add()
                .veth(name.to_string(), peer.to_string())
                .execute()
                .await
                .map_err(|e| {
                    CniError::veth_error(&format!("failed to create veth pair {} <-> {}", name, peer))
                        .with_details(&e.to_string())
                })
        })
    }

    fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CniError> {
        self.runtime.block_on(async {
            self.handle
                .link()
                .set(index)
                .mtu(mtu)
                .execute()
                .await
                .map_err(|e| CniError::veth_error("failed to set MTU").with_details(&e.to_string()))
        })
    }

    fn set_up(&self, index: u32) -> Result<(), CniError> {
        self.runtime.block_on(async {
            self.handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| {
                    CniError::veth_error(&format!("failed to set link {} up", index))
                        .with_details(&e.to_string())
                })
        })
    }

    fn hardware_address(&self, index: u32) -> Result<String, CniError> {
        self.runtime.block_on(async {
            let mut links = self.handle.link().get().match_index(index).execute();
            let link = links
                .try_next()
                .await
                .map_err(|e| {
                    CniError::veth_error(&format!("failed to get link {}", index))
                        .with_details(&e.to_string())
                })?
                .ok_or_else(|| CniError::veth_error(&format!("link {} not found", index)))?;

            link.attributes
                .iter()
                .find_map(|attr| match attr {
                    LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
                    _ => None,
                })
                .ok_or_else(|| {
                    CniError::veth_error(&format!("link {} has no hardware address", index))
                })
        })
    }

    fn ipv6_addresses(&self, index: u32) -> Result<Vec<Ipv6Addr>, CniError> {
        self.runtime.block_on(async {
            let mut messages = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();

            let mut found = Vec::new();
            loop {
                let message = messages.try_next().await.map_err(|e| {
                    CniError::route_error(&format!("failed to list addresses of link {}", index))
                        .with_details(&e.to_string())
                })?;
                let Some(message) = message else { break };
                for attr in &message.attributes {
                    if let AddressAttribute::Address(IpAddr::V6(addr)) = attr {
                        found.push(*addr);
                    }
                }
            }
            Ok(found)
        })
    }

    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), CniError> {
        self.runtime.block_on(async {
            match self
                .handle
                .address()
                .add(index, address.ip(), address.prefix())
                .execute()
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if is_exists(&e) => {
                    debug!(%address, "address already present");
                    Ok(())
                }
                Err(e) => Err(CniError::veth_error(&format!(
                    "failed to add IP address {} to link {}",
                    address, index
                ))
                .with_details(&e.to_string())),
            }
        })
    }

    fn add_route(&self, route: &Route) -> Result<(), CniError> {
        let scope = match route.scope {
            RouteScope::Link => netlink_packet_route::route::RouteScope::Link,
            RouteScope::Universe => netlink_packet_route::route::RouteScope::Universe,
        };

        let outcome = self.runtime.block_on(async {
            match (route.destination, route.gateway) {
                (IpNetwork::V4(dst), gateway) => {
                    let mut request = self
                        .handle
                        .route()
                        .add()
                        .v4()
                        .destination_prefix(dst.network(), dst.prefix())
                        .output_interface(route.index)
                        .scope(scope);
                    if let Some(IpAddr::V4(gw)) = gateway {
                        request = request.gateway(gw);
                    }
                    request.execute().await
                }
                (IpNetwork::V6(dst), gateway) => {
                    let mut request = self
                        .handle
                        .route()
                        .add()
                        .v6()
                        .destination_prefix(dst.network(), dst.prefix())
                        .output_interface(route.index)
                        .scope(scope);
                    if let Some(IpAddr::V6(gw)) = gateway {
                        request = request.gateway(gw);
                    }
                    request.execute().await
                }
            }
        });

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => {
                debug!(destination = %route.destination, "route already present");
                Ok(())
            }
            Err(e) => Err(CniError::route_error(&format!(
                "failed to add route {} via {:?}",
                route.destination, route.gateway
            ))
            .with_details(&e.to_string())),
        }
    }

    fn move_to_netns(&self, index: u32, netns_fd: RawFd) -> Result<(), CniError> {
        self.runtime.block_on(async {
            self.handle
                .link()
                .set(index)
                .setns_by_fd(netns_fd)
                .execute()
                .await
                .map_err(|e| {
                    CniError::namespace_error(&format!("failed to move link {} to namespace", index))
                        .with_details(&e.to_string())
                })
        })
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
