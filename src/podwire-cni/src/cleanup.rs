//! Compensating cleanup
//!
//! Releases addresses and removes the container interface after a failure or
//! on DEL. Secondary errors during cleanup after a failure are logged; the
//! original error is what the caller sees.

use tracing::{error, warn};

use crate::error::CniError;
use crate::ipam::Ipam;
use crate::netlink::Kernel;
use crate::veth;

/// Container interface to remove
#[derive(Debug, Clone)]
pub struct Teardown<'a> {
    pub netns: &'a str,
    pub container_ifname: &'a str,
}

/// Release whatever the allocator holds for `stdin`, logging failure
pub fn release_after_failure(ipam: &Ipam, stdin: &[u8]) {
    if let Err(e) = ipam.release(stdin) {
        warn!(error = %e, details = ?e.details(), "failed to release IP allocation");
    }
}

/// Remove the container interface; a namespace that is gone is already clean
pub fn remove_container_interface<K: Kernel>(
    kernel: &K,
    teardown: &Teardown<'_>,
) -> Result<(), CniError> {
    if !kernel.netns_exists(teardown.netns) {
        return Ok(());
    }
    veth::remove_container_interface(kernel, teardown.netns, teardown.container_ifname)
}

/// Undo a failed ADD
///
/// `release` carries the config to release addresses with, only when this
/// invocation obtained them from the allocator. Never fails.
pub fn after_failure<K: Kernel>(
    kernel: &K,
    ipam: &Ipam,
    release: Option<&[u8]>,
    teardown: Option<&Teardown<'_>>,
) {
    if let Some(stdin) = release {
        release_after_failure(ipam, stdin);
    }
    if let Some(teardown) = teardown {
        if let Err(e) = remove_container_interface(kernel, teardown) {
            error!(error = %e, netns = teardown.netns, "failed to remove container interface");
        }
    }
}

/// DEL: release addresses and remove the interface, both attempted
///
/// A release failure outranks a teardown failure; a leaked allocation is the
/// worse outcome. The outranked error is logged.
pub fn release_and_teardown<K: Kernel>(
    kernel: &K,
    ipam: &Ipam,
    stdin: &[u8],
    teardown: &Teardown<'_>,
) -> Result<(), CniError> {
    let released = ipam.release(stdin);
    let removed = remove_container_interface(kernel, teardown);

    match (released, removed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(release_err), Err(teardown_err)) => {
            error!(error = %teardown_err, "failed to remove container interface");
            Err(release_err)
        }
    }
}
