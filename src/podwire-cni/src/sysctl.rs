//! Kernel parameter writes under /proc/sys

use std::fs::OpenOptions;
use std::io::Write;

use tracing::debug;

use crate::error::{CniError, CniErrorCode};

/// Write `value` to a /proc/sys entry in one write
///
/// A short write leaves the parameter in an unknown state and is an error.
pub fn write_proc_sys(path: &str, value: &str) -> Result<(), CniError> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        CniError::new(CniErrorCode::SysctlFailure, &format!("failed to open {}", path))
            .with_details(&e.to_string())
    })?;

    let written = file.write(value.as_bytes()).map_err(|e| {
        CniError::new(CniErrorCode::SysctlFailure, &format!("failed to write {}", path))
            .with_details(&e.to_string())
    })?;

    if written < value.len() {
        return Err(CniError::new(
            CniErrorCode::SysctlFailure,
            &format!("short write to {}: {} of {} bytes", path, written, value.len()),
        ));
    }

    debug!(path, value, "wrote sysctl");
    Ok(())
}
