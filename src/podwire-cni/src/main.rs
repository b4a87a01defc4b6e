//! Podwire CNI Plugin
//!
//! Attaches pods to a routed network: one veth pair per pod, host routes and
//! proxy ARP/NDP on the host end, and a durable endpoint record per pod.
//! Implements CNI Spec 1.0.0.

mod annotations;
mod cleanup;
mod config;
mod endpoint;
mod error;
mod ipam;
mod k8s;
mod lifecycle;
mod logging;
mod netlink;
mod netns;
mod result;
mod store;
mod sysctl;
mod veth;

#[cfg(test)]
mod testing;

use std::env;
use std::io::{self, Read};
use std::path::PathBuf;

use config::{InvocationArgs, NetworkConfig};
use error::{CniError, CniErrorCode};
use ipam::{ExecPlugin, Ipam, ProcessEnv};
use k8s::KubeClient;
use lifecycle::Plugin;
use netlink::HostKernel;
use result::VersionResult;
use store::FileStore;

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version supported by this plugin
const CNI_VERSION: &str = "1.0.0";

/// Supported CNI versions
const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

fn main() {
    if let Err(e) = run() {
        // The runtime decodes the error object from stdout
        if e.write_json(CNI_VERSION, &mut io::stdout().lock()).is_err() {
            eprintln!("{}", e);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), CniError> {
    let command = env::var("CNI_COMMAND").map_err(|_| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            "CNI_COMMAND not set",
        )
    })?;

    // Size limit guards against unbounded stdin
    let mut input = Vec::new();
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_end(&mut input)
        .map_err(|e| {
            CniError::new(CniErrorCode::IoFailure, "failed to read stdin")
                .with_details(&e.to_string())
        })?;

    if command == "VERSION" {
        return cmd_version();
    }

    let conf = NetworkConfig::parse(&input)?;
    logging::init(conf.log_level());

    match command.as_str() {
        "ADD" => cmd_add(conf, InvocationArgs::from_env(input, true)?),
        "DEL" => cmd_del(conf, InvocationArgs::from_env(input, false)?),
        "CHECK" => cmd_check(conf, InvocationArgs::from_env(input, true)?),
        _ => {
            // Truncate command for safety in error message (avoid log injection)
            let safe_command: String = command
                .chars()
                .take(32)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                &format!("unknown CNI_COMMAND: {}", safe_command),
            ))
        }
    }
}

/// Wire the plugin to the running host
fn host_plugin(conf: NetworkConfig) -> Result<Plugin<HostKernel>, CniError> {
    let ipam = Ipam::new(
        &conf.ipam()?.plugin_type,
        Box::new(ExecPlugin::from_env()),
        Box::new(ProcessEnv),
    );
    let store = FileStore::new(conf.datastore_dir());
    let metadata = KubeClient::new(
        conf.kubernetes.kubeconfig.as_ref().map(PathBuf::from),
        conf.kubernetes.api_root(&conf.policy).map(str::to_string),
    );

    Ok(Plugin::new(
        conf,
        HostKernel,
        Box::new(store),
        ipam,
        Box::new(metadata),
    ))
}

/// Handle ADD command - attach the container and print the result
fn cmd_add(conf: NetworkConfig, mut args: InvocationArgs) -> Result<(), CniError> {
    let result = host_plugin(conf)?.cmd_add(&mut args)?;

    println!("{}", serde_json::to_string(&result).map_err(|e| {
        CniError::new(CniErrorCode::IoFailure, "failed to serialize result")
            .with_details(&e.to_string())
    })?);

    Ok(())
}

/// Handle DEL command - DEL outputs nothing on success
fn cmd_del(conf: NetworkConfig, args: InvocationArgs) -> Result<(), CniError> {
    host_plugin(conf)?.cmd_del(&args)
}

/// Handle CHECK command - CHECK outputs nothing on success
fn cmd_check(conf: NetworkConfig, args: InvocationArgs) -> Result<(), CniError> {
    host_plugin(conf)?.cmd_check(&args)
}

/// Handle VERSION command - report supported CNI versions
fn cmd_version() -> Result<(), CniError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    println!("{}", serde_json::to_string(&result).map_err(|e| {
        CniError::new(CniErrorCode::IoFailure, "failed to serialize version")
            .with_details(&e.to_string())
    })?);

    Ok(())
}
