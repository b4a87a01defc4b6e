//! IP Address Management (IPAM)
//!
//! Delegates allocation to the IPAM plugin named in the network config and
//! normalizes what it returns. Requesting one exact address goes through the
//! `IP=` convention of CNI_ARGS, applied with a scoped override that always
//! puts the previous value back.

use std::env;
use std::fmt;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use ipnetwork::IpNetwork;
use serde::Deserialize;
use tracing::{debug, error};

use crate::cleanup;
use crate::error::{CniError, CniErrorCode};
use crate::result::DnsResult;

/// Environment variable carrying CNI_ARGS to the IPAM plugin
const CNI_ARGS_VAR: &str = "CNI_ARGS";

/// Address family of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "4"),
            AddressFamily::V6 => write!(f, "6"),
        }
    }
}

/// One allocated address with its prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAssignment {
    pub address: IpNetwork,
    pub gateway: Option<IpAddr>,
}

impl AddressAssignment {
    pub fn new(address: IpNetwork) -> Self {
        Self {
            address,
            gateway: None,
        }
    }

    /// Single-address assignment (/32 or /128) for an exact IP
    pub fn exact(ip: IpAddr) -> Self {
        Self::new(IpNetwork::from(ip))
    }

    pub fn family(&self) -> AddressFamily {
        match self.address {
            IpNetwork::V4(_) => AddressFamily::V4,
            IpNetwork::V6(_) => AddressFamily::V6,
        }
    }

    /// Host route covering just this address
    pub fn host_route(&self) -> IpNetwork {
        IpNetwork::from(self.address.ip())
    }
}

/// Reject more than one address of the same family
pub fn ensure_one_per_family(assignments: &[AddressAssignment]) -> Result<(), CniError> {
    for family in [AddressFamily::V4, AddressFamily::V6] {
        let count = assignments.iter().filter(|a| a.family() == family).count();
        if count > 1 {
            return Err(CniError::config_error(&format!(
                "{} IPv{} addresses assigned, at most one per family is supported",
                count, family
            )));
        }
    }
    Ok(())
}

/// Normalized output of an IPAM ADD
#[derive(Debug, Clone, Default)]
pub struct IpamOutput {
    pub assignments: Vec<AddressAssignment>,
    pub dns: Option<DnsResult>,
}

/// IPAM plugin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpamCommand {
    Add,
    Del,
}

impl IpamCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpamCommand::Add => "ADD",
            IpamCommand::Del => "DEL",
        }
    }
}

/// Runs an IPAM plugin and returns its stdout
pub trait IpamExec {
    fn exec(
        &self,
        plugin: &str,
        command: IpamCommand,
        stdin: &[u8],
        cni_args: &str,
    ) -> Result<Vec<u8>, CniError>;
}

/// Executes IPAM plugin binaries found on CNI_PATH
pub struct ExecPlugin {
    search_path: Vec<PathBuf>,
}

impl ExecPlugin {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    /// Search the directories listed in CNI_PATH
    pub fn from_env() -> Self {
        let search_path = env::var("CNI_PATH")
            .unwrap_or_default()
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::new(search_path)
    }

    fn find(&self, plugin: &str) -> Result<PathBuf, CniError> {
        self.search_path
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                CniError::ipam_error(&format!("failed to find IPAM plugin {:?} in CNI_PATH", plugin))
                    .with_details(&format!("searched {:?}", self.search_path))
            })
    }
}

/// Error object a CNI plugin prints on failure
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: Option<u32>,
    msg: String,
    #[serde(default)]
    details: Option<String>,
}

impl IpamExec for ExecPlugin {
    fn exec(
        &self,
        plugin: &str,
        command: IpamCommand,
        stdin: &[u8],
        cni_args: &str,
    ) -> Result<Vec<u8>, CniError> {
        let path = self.find(plugin)?;

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command.as_str())
            .env(CNI_ARGS_VAR, cni_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CniError::ipam_error(&format!("failed to run IPAM plugin {}", path.display()))
                    .with_details(&e.to_string())
            })?;

        feed_stdin(&mut child, stdin)?;

        let output = child.wait_with_output().map_err(|e| {
            CniError::ipam_error("failed to wait for IPAM plugin").with_details(&e.to_string())
        })?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(plugin_error) => {
                let details = plugin_error.details.unwrap_or_default();
                Err(CniError::ipam_error(&format!(
                    "IPAM plugin {} {} failed (code {}): {}",
                    plugin,
                    command.as_str(),
                    plugin_error.code.unwrap_or_default(),
                    plugin_error.msg
                ))
                .with_details(&details))
            }
            Err(_) => Err(CniError::ipam_error(&format!(
                "IPAM plugin {} {} failed with {}",
                plugin,
                command.as_str(),
                output.status
            ))
            .with_details(String::from_utf8_lossy(&output.stdout).trim())),
        }
    }
}

/// Write the config to the plugin and close its stdin
///
/// A plugin that exits before reading everything is killed and reaped here.
fn feed_stdin(child: &mut Child, stdin: &[u8]) -> Result<(), CniError> {
    let Some(mut input) = child.stdin.take() else {
        return Ok(());
    };

    if let Err(e) = input.write_all(stdin) {
        drop(input);
        let _ = child.kill();
        let _ = child.wait();
        return Err(CniError::ipam_error("failed to write IPAM plugin config")
            .with_details(&e.to_string()));
    }

    Ok(())
}

/// Access to the CNI_ARGS value handed to the IPAM plugin
pub trait CniArgsEnv {
    fn get(&self) -> String;
    fn set(&self, value: &str) -> Result<(), CniError>;
}

/// CNI_ARGS in the process environment
pub struct ProcessEnv;

impl CniArgsEnv for ProcessEnv {
    fn get(&self) -> String {
        env::var(CNI_ARGS_VAR).unwrap_or_default()
    }

    fn set(&self, value: &str) -> Result<(), CniError> {
        if value.contains('\0') {
            return Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                "failed to set CNI_ARGS: value contains a NUL byte",
            ));
        }
        env::set_var(CNI_ARGS_VAR, value);
        Ok(())
    }
}

/// Scoped `IP=<addr>` override of CNI_ARGS
///
/// `restore` reports whether the previous value came back; if the guard is
/// dropped without it, restoring is still attempted.
struct CniArgsOverride<'a> {
    env: &'a dyn CniArgsEnv,
    original: String,
    restored: bool,
}

impl<'a> CniArgsOverride<'a> {
    fn apply(env: &'a dyn CniArgsEnv, ip: IpAddr) -> Result<Self, CniError> {
        let original = env.get();
        debug!(cni_args = %original, "original CNI_ARGS");

        if original
            .split(';')
            .any(|pair| pair.split_once('=').is_some_and(|(key, _)| key == "IP"))
        {
            error!("'IP' variable already set in CNI_ARGS environment variable");
        }

        let requested = format!("{};IP={}", original, ip);
        debug!(cni_args = %requested, "new CNI_ARGS");
        env.set(&requested)?;

        Ok(Self {
            env,
            original,
            restored: false,
        })
    }

    fn restore(mut self) -> Result<(), CniError> {
        self.restored = true;
        self.env.set(&self.original)
    }
}

impl Drop for CniArgsOverride<'_> {
    fn drop(&mut self) {
        if !self.restored {
            let _ = self.env.set(&self.original);
        }
    }
}

/// Client for the configured IPAM plugin
pub struct Ipam {
    plugin_type: String,
    exec: Box<dyn IpamExec>,
    env: Box<dyn CniArgsEnv>,
}

impl Ipam {
    pub fn new(plugin_type: &str, exec: Box<dyn IpamExec>, env: Box<dyn CniArgsEnv>) -> Self {
        Self {
            plugin_type: plugin_type.to_string(),
            exec,
            env,
        }
    }

    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    /// Allocate whatever addresses the plugin hands out for this config
    pub fn allocate(&self, stdin: &[u8]) -> Result<IpamOutput, CniError> {
        debug!(plugin = %self.plugin_type, "calling IPAM plugin");
        let raw = self
            .exec
            .exec(&self.plugin_type, IpamCommand::Add, stdin, &self.env.get())?;
        let output = parse_ipam_output(&raw)?;
        debug!(assignments = ?output.assignments, "IPAM plugin returned");
        Ok(output)
    }

    /// Allocate exactly `ip`
    ///
    /// CNI_ARGS is restored on every path. If restoring fails the allocation
    /// is released, since the override may leak into later calls.
    pub fn allocate_specific(
        &self,
        ip: IpAddr,
        stdin: &[u8],
    ) -> Result<AddressAssignment, CniError> {
        let scoped = CniArgsOverride::apply(self.env.as_ref(), ip)?;
        let allocated = self.allocate(stdin);
        let restored = scoped.restore();

        match (allocated, restored) {
            (Ok(output), Ok(())) => output.assignments.into_iter().next().ok_or_else(|| {
                CniError::ipam_error("IPAM plugin returned missing IP config")
            }),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(restore_err)) => {
                error!(error = %restore_err, "error restoring CNI_ARGS environment variable");
                cleanup::release_after_failure(self, stdin);
                Err(restore_err)
            }
            (Err(e), Err(restore_err)) => {
                error!(error = %restore_err, "error restoring CNI_ARGS environment variable");
                cleanup::release_after_failure(self, stdin);
                Err(e)
            }
        }
    }

    /// Free whatever the plugin holds for this config
    pub fn release(&self, stdin: &[u8]) -> Result<(), CniError> {
        debug!(plugin = %self.plugin_type, "releasing IP allocation");
        self.exec
            .exec(&self.plugin_type, IpamCommand::Del, stdin, &self.env.get())?;
        Ok(())
    }
}

/// Result shapes produced by IPAM plugins (0.2.0 and 0.3.0+)
#[derive(Debug, Deserialize)]
struct RawIpamResult {
    #[serde(default)]
    ips: Vec<RawIpConfig>,
    #[serde(default)]
    ip4: Option<LegacyIpConfig>,
    #[serde(default)]
    ip6: Option<LegacyIpConfig>,
    #[serde(default)]
    dns: Option<DnsResult>,
}

#[derive(Debug, Deserialize)]
struct RawIpConfig {
    #[serde(default)]
    version: Option<String>,
    address: IpNetwork,
    #[serde(default)]
    gateway: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct LegacyIpConfig {
    ip: IpNetwork,
    #[serde(default)]
    gateway: Option<IpAddr>,
}

fn parse_ipam_output(raw: &[u8]) -> Result<IpamOutput, CniError> {
    let result: RawIpamResult = serde_json::from_slice(raw).map_err(|e| {
        CniError::ipam_error("failed to parse IPAM plugin output").with_details(&e.to_string())
    })?;

    let mut assignments = Vec::new();
    for ip in result.ips {
        let assignment = AddressAssignment {
            address: ip.address,
            gateway: ip.gateway,
        };
        if let Some(version) = ip.version.as_deref() {
            if version != assignment.family().to_string() {
                return Err(CniError::ipam_error(&format!(
                    "IPAM plugin returned {} tagged as IPv{}",
                    ip.address, version
                )));
            }
        }
        assignments.push(assignment);
    }
    for legacy in [result.ip4, result.ip6].into_iter().flatten() {
        assignments.push(AddressAssignment {
            address: legacy.ip,
            gateway: legacy.gateway,
        });
    }

    if assignments.is_empty() {
        return Err(CniError::ipam_error("IPAM plugin returned missing IP config"));
    }

    Ok(IpamOutput {
        assignments,
        dns: result.dns,
    })
}
