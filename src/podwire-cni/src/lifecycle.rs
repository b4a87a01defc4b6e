//! ADD, DEL and CHECK
//!
//! Ties the endpoint record to address acquisition and the attachment
//! engine. The record's active instance id decides who may delete it: a DEL
//! from a container that no longer owns the record is ignored, and the delete
//! itself is compare-and-delete against the record as read.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{error, info, info_span, warn};

use crate::annotations::{self, AddressSource, PodAnnotations};
use crate::cleanup::{self, Teardown};
use crate::config::{rewrite_ipam_field, InvocationArgs, K8sArgs, NetworkConfig};
use crate::endpoint::{EndpointKey, Identity, WorkloadEndpoint};
use crate::error::{CniError, CniErrorCode};
use crate::ipam::{ensure_one_per_family, Ipam, IpamOutput};
use crate::k8s::PodMetadata;
use crate::netlink::Kernel;
use crate::result::CniResult;
use crate::store::{EndpointStore, StoreError};
use crate::veth::{self, AttachRequest};

/// Label carrying the pod's namespace
pub const NAMESPACE_LABEL: &str = "podwire.io/namespace";

/// Allocator that understands `ipv4_pools` / `ipv6_pools`
const POOL_AWARE_IPAM: &str = "calico-ipam";

/// Stands in for `usePodCidr` when releasing
const RELEASE_SUBNET: &str = "0.0.0.0/0";

/// One plugin invocation's collaborators
pub struct Plugin<K: Kernel> {
    conf: NetworkConfig,
    kernel: K,
    store: Box<dyn EndpointStore>,
    ipam: Ipam,
    metadata: Box<dyn PodMetadata>,
}

impl<K: Kernel> Plugin<K> {
    pub fn new(
        conf: NetworkConfig,
        kernel: K,
        store: Box<dyn EndpointStore>,
        ipam: Ipam,
        metadata: Box<dyn PodMetadata>,
    ) -> Self {
        Self {
            conf,
            kernel,
            store,
            ipam,
            metadata,
        }
    }

    fn identify(&self, args: &InvocationArgs) -> Result<(K8sArgs, Identity, EndpointKey), CniError> {
        let k8s = args.k8s_args()?;
        let identity = Identity::from_args(&args.container_id, &k8s);
        let node = self.conf.node_name()?;
        let key = EndpointKey::new(&node, &identity, &args.ifname);
        Ok((k8s, identity, key))
    }

    /// Attach the container, creating or reusing its endpoint record
    pub fn cmd_add(&self, args: &mut InvocationArgs) -> Result<CniResult, CniError> {
        let (k8s, identity, key) = self.identify(args)?;
        let span = info_span!(
            "cni",
            command = "ADD",
            container_id = %args.container_id,
            workload = %identity.workload,
            orchestrator = %identity.orchestrator
        );
        let _entered = span.enter();

        let existing = match self.store.get(&key) {
            Ok(endpoint) => Some(endpoint),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        // `source` is None for a reused record: nothing was acquired here
        let (mut endpoint, output, source) = match existing {
            Some(mut endpoint) => {
                info!(
                    previous_instance = %endpoint.metadata.active_instance_id,
                    "reusing existing endpoint"
                );
                endpoint.metadata.active_instance_id = args.container_id.clone();
                let output = IpamOutput {
                    assignments: endpoint.assignments(),
                    dns: None,
                };
                (endpoint, output, None)
            }
            None => {
                let (endpoint, output, source) = self.prepare_endpoint(args, &k8s, &key)?;
                (endpoint, output, Some(source))
            }
        };

        let release =
            (source == Some(AddressSource::Allocator)).then_some(args.stdin_data.as_slice());
        let teardown = Teardown {
            netns: &args.netns,
            container_ifname: &args.ifname,
        };

        if let Err(e) = ensure_one_per_family(&output.assignments) {
            cleanup::after_failure(&self.kernel, &self.ipam, release, None);
            return Err(e);
        }
        info!(ips = ?endpoint.spec.ip_networks, "using IPs");

        let stored_name = endpoint.spec.interface_name.clone();
        let request = AttachRequest {
            netns: &args.netns,
            workload: &identity.workload,
            host_ifname: Some(stored_name.as_str()).filter(|name| !name.is_empty()),
            container_ifname: &args.ifname,
            mtu: self.conf.mtu_value(),
            assignments: &output.assignments,
        };
        let attachment = match veth::attach(&self.kernel, &request) {
            Ok(attachment) => attachment,
            Err(e) => {
                error!(error = %e, details = ?e.details(), "error setting up networking");
                cleanup::after_failure(&self.kernel, &self.ipam, release, Some(&teardown));
                return Err(e);
            }
        };

        endpoint.spec.mac = Some(attachment.container_mac.clone());
        endpoint.spec.interface_name = attachment.host_ifname.clone();

        let stored = match self.store.apply(endpoint) {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "failed to write endpoint");
                cleanup::after_failure(&self.kernel, &self.ipam, release, Some(&teardown));
                return Err(e.into());
            }
        };
        info!(revision = stored.revision, "wrote endpoint to datastore");

        let mut result = CniResult::new(self.conf.cni_version.clone())
            .with_interface(
                args.ifname.clone(),
                attachment.container_mac,
                Some(args.netns.clone()),
            )
            .with_dns(output.dns);
        for assignment in &output.assignments {
            result = result.with_ip(assignment, 0);
        }
        Ok(result)
    }

    /// Build a fresh record and acquire its addresses
    fn prepare_endpoint(
        &self,
        args: &mut InvocationArgs,
        k8s: &K8sArgs,
        key: &EndpointKey,
    ) -> Result<(WorkloadEndpoint, IpamOutput, AddressSource), CniError> {
        let ipam_conf = self.conf.ipam()?;

        if ipam_conf.uses_pod_cidr() {
            let node = self.conf.pod_cidr_node(&key.node);
            let pod_cidr = self.metadata.pod_cidr(&node)?;
            info!(%pod_cidr, "passing node pod CIDR to host-local IPAM");
            args.stdin_data =
                rewrite_ipam_field(&args.stdin_data, "subnet", Value::String(pod_cidr))?;
        }

        let mut endpoint = WorkloadEndpoint::new(key, &args.container_id);
        let mut pod_annotations = BTreeMap::new();
        match (self.conf.is_k8s_policy(), k8s.pod()) {
            (true, Some((namespace, pod))) => {
                let (mut labels, annotations) =
                    self.metadata.labels_and_annotations(namespace, pod)?;
                labels.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());
                endpoint.metadata.labels = labels;
                endpoint.spec.profiles = vec![format!("k8s_ns.{}", namespace)];
                pod_annotations = annotations;
            }
            _ => endpoint.spec.profiles = vec![self.conf.name.clone()],
        }

        let parsed = PodAnnotations::parse(&pod_annotations)?;
        if self.ipam.plugin_type() == POOL_AWARE_IPAM {
            if let Some(pools) = &parsed.ipv4_pools {
                args.stdin_data = rewrite_ipam_field(&args.stdin_data, "ipv4_pools", json!(pools))?;
            }
            if let Some(pools) = &parsed.ipv6_pools {
                args.stdin_data = rewrite_ipam_field(&args.stdin_data, "ipv6_pools", json!(pools))?;
            }
        }

        let (output, source) = annotations::resolve(&parsed.strategy, &self.ipam, &args.stdin_data)?;
        endpoint.set_assignments(&output.assignments);
        Ok((endpoint, output, source))
    }

    /// Detach the container
    ///
    /// Succeeds without touching anything when another container owns the
    /// record. A datastore that cannot be read aborts before any cleanup.
    pub fn cmd_del(&self, args: &InvocationArgs) -> Result<(), CniError> {
        let (_, identity, key) = self.identify(args)?;
        let span = info_span!(
            "cni",
            command = "DEL",
            container_id = %args.container_id,
            workload = %identity.workload,
            orchestrator = %identity.orchestrator
        );
        let _entered = span.enter();

        match self.store.get(&key) {
            Err(StoreError::NotFound) => {
                warn!("endpoint does not exist in the datastore, moving forward with the clean up");
            }
            Err(e) => {
                error!(error = %e, "cannot verify endpoint ownership, not cleaning up");
                return Err(e.into());
            }
            Ok(endpoint) if !endpoint.is_owned_by(&args.container_id) => {
                warn!(
                    active_instance = %endpoint.metadata.active_instance_id,
                    "container id does not own the endpoint, ignoring DEL"
                );
                return Ok(());
            }
            Ok(endpoint) => match self.store.compare_and_delete(&endpoint) {
                Ok(()) => info!("deleted endpoint"),
                Err(StoreError::NotFound) => {
                    info!("endpoint already gone, no need to delete");
                }
                Err(StoreError::Conflict) => {
                    warn!("endpoint was modified before it could be deleted");
                    return Err(CniError::new(
                        CniErrorCode::DatastoreConflict,
                        "error deleting endpoint: endpoint was modified before it could be deleted",
                    ));
                }
                Err(e) => return Err(e.into()),
            },
        }

        // host-local parses `subnet` on DEL as well; any CIDR releases by container id
        let release_stdin = if self.conf.ipam()?.uses_pod_cidr() {
            rewrite_ipam_field(&args.stdin_data, "subnet", Value::String(RELEASE_SUBNET.to_string()))?
        } else {
            args.stdin_data.clone()
        };

        cleanup::release_and_teardown(
            &self.kernel,
            &self.ipam,
            &release_stdin,
            &Teardown {
                netns: &args.netns,
                container_ifname: &args.ifname,
            },
        )
    }

    /// Verify the container is still attached as recorded
    pub fn cmd_check(&self, args: &InvocationArgs) -> Result<(), CniError> {
        let (_, _, key) = self.identify(args)?;

        let endpoint = self.store.get(&key).map_err(|e| match e {
            StoreError::NotFound => CniError::new(
                CniErrorCode::UnknownContainer,
                &format!("no endpoint recorded for container {}", args.container_id),
            ),
            e => e.into(),
        })?;

        if !endpoint.is_owned_by(&args.container_id) {
            return Err(CniError::new(
                CniErrorCode::UnknownContainer,
                &format!(
                    "endpoint is owned by container {}",
                    endpoint.metadata.active_instance_id
                ),
            ));
        }

        if !veth::container_interface_exists(&self.kernel, &args.netns, &args.ifname)? {
            return Err(CniError::new(
                CniErrorCode::UnknownContainer,
                &format!("interface {} not found in {}", args.ifname, args.netns),
            ));
        }
        Ok(())
    }
}
