//! Network Namespace operations
//!
//! Handles entering and exiting container network namespaces.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use crate::error::CniError;

/// Namespace of the calling thread
const SELF_NETNS: &str = "/proc/self/ns/net";

/// Guard that saves the current network namespace and restores it on drop
pub struct NetnsGuard {
    /// Handle of the namespace we came from
    original_ns: File,
    restored: bool,
}

impl NetnsGuard {
    /// Enter a network namespace, saving the current namespace for later restoration
    ///
    /// # Arguments
    /// * `netns_path` - Path to the target network namespace (e.g., "/var/run/netns/cni-1234")
    pub fn enter(netns_path: &str) -> Result<Self, CniError> {
        let original_ns = open_netns(SELF_NETNS)?;
        let target_ns = open_netns(netns_path)?;

        setns(target_ns.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error(&format!("failed to enter network namespace {}", netns_path))
                .with_details(&e.to_string())
        })?;
        debug!(netns = netns_path, "entered network namespace");

        Ok(Self {
            original_ns,
            restored: false,
        })
    }

    /// Raw descriptor of the namespace we came from, for moving links back to it
    pub fn original_fd(&self) -> RawFd {
        self.original_ns.as_raw_fd()
    }

    /// Restore the original namespace, reporting failure
    pub fn restore(mut self) -> Result<(), CniError> {
        self.restored = true;
        setns(self.original_ns.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error("failed to restore original network namespace")
                .with_details(&e.to_string())
        })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = setns(self.original_ns.as_fd(), CloneFlags::CLONE_NEWNET) {
            error!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Execute a closure within a different network namespace
///
/// The closure receives the descriptor of the namespace it was called from.
pub fn with_netns<T, F>(netns_path: &str, f: F) -> Result<T, CniError>
where
    F: FnOnce(RawFd) -> Result<T, CniError>,
{
    let guard = NetnsGuard::enter(netns_path)?;
    let result = f(guard.original_fd());
    guard.restore()?;
    result
}

/// Open a network namespace file
pub fn open_netns(netns_path: &str) -> Result<File, CniError> {
    File::open(netns_path).map_err(|e| {
        CniError::namespace_error(&format!("failed to open network namespace: {}", netns_path))
            .with_details(&e.to_string())
    })
}

/// Whether a namespace file is still there
///
/// DEL may arrive after the runtime already tore the namespace down.
pub fn netns_exists(netns_path: &str) -> bool {
    !netns_path.is_empty() && std::path::Path::new(netns_path).exists()
}
