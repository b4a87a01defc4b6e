//! In-memory stand-ins for the kernel, the datastore, the IPAM plugin and the
//! API server, shared by the unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr};
use std::os::fd::RawFd;
use std::rc::Rc;

use ipnetwork::IpNetwork;

use crate::endpoint::{EndpointKey, WorkloadEndpoint};
use crate::error::{CniError, CniErrorCode};
use crate::ipam::{CniArgsEnv, IpamCommand, IpamExec};
use crate::k8s::PodMetadata;
use crate::netlink::{Kernel, LinkOps, Route};
use crate::store::{EndpointStore, StoreError};

/// Name of the host namespace in [`FakeKernel`]
pub const HOST_NS: &str = "host";

/// Descriptor handed to `in_netns` closures as "the host namespace"
const HOST_FD: RawFd = 1000;

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub ns: String,
    pub name: String,
    pub index: u32,
    pub up: bool,
    pub mtu: u32,
    pub mac: String,
    pub link_local: Option<Ipv6Addr>,
    peer: Option<u32>,
}

#[derive(Default)]
struct KernelState {
    namespaces: HashSet<String>,
    current_ns: String,
    ipv6: bool,
    next_index: u32,
    links: Vec<FakeLink>,
    addresses: Vec<(String, u32, IpNetwork)>,
    routes: Vec<(String, Route)>,
    sysctls: Vec<(String, String)>,
    failing: HashSet<&'static str>,
}

impl KernelState {
    fn check(&self, op: &'static str) -> Result<(), CniError> {
        if !self.failing.contains(op) {
            return Ok(());
        }
        Err(match op {
            "add_route" => CniError::route_error(&format!("injected {} failure", op)),
            "move_to_netns" => CniError::namespace_error(&format!("injected {} failure", op)),
            _ => CniError::veth_error(&format!("injected {} failure", op)),
        })
    }

    fn new_link(&mut self, ns: &str, name: &str) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        self.links.push(FakeLink {
            ns: ns.to_string(),
            name: name.to_string(),
            index,
            up: false,
            mtu: 1500,
            mac: format!("ee:ee:00:00:{:02x}:{:02x}", index >> 8, index & 0xff),
            link_local: None,
            peer: None,
        });
        index
    }

    fn link_mut(&mut self, ns: &str, index: u32) -> Result<&mut FakeLink, CniError> {
        self.links
            .iter_mut()
            .find(|l| l.ns == ns && l.index == index)
            .ok_or_else(|| CniError::veth_error(&format!("no link {} in {}", index, ns)))
    }
}

/// Kernel double: namespaces, links, addresses and routes held in memory
#[derive(Clone)]
pub struct FakeKernel {
    state: Rc<RefCell<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let mut state = KernelState {
            current_ns: HOST_NS.to_string(),
            ipv6: true,
            ..Default::default()
        };
        state.namespaces.insert(HOST_NS.to_string());
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn with_netns(self, path: &str) -> Self {
        self.state.borrow_mut().namespaces.insert(path.to_string());
        self
    }

    /// Links never get an IPv6 link-local address
    pub fn without_ipv6(self) -> Self {
        self.state.borrow_mut().ipv6 = false;
        self
    }

    pub fn add_link(&self, ns: &str, name: &str) -> u32 {
        self.state.borrow_mut().new_link(ns, name)
    }

    /// Make every later call of `op` fail
    pub fn fail_on(&self, op: &'static str) {
        self.state.borrow_mut().failing.insert(op);
    }

    pub fn link(&self, ns: &str, name: &str) -> Option<FakeLink> {
        self.state
            .borrow()
            .links
            .iter()
            .find(|l| l.ns == ns && l.name == name)
            .cloned()
    }

    pub fn links_in(&self, ns: &str) -> Vec<FakeLink> {
        self.state
            .borrow()
            .links
            .iter()
            .filter(|l| l.ns == ns)
            .cloned()
            .collect()
    }

    pub fn routes_in(&self, ns: &str) -> Vec<Route> {
        self.state
            .borrow()
            .routes
            .iter()
            .filter(|(route_ns, _)| route_ns == ns)
            .map(|(_, route)| route.clone())
            .collect()
    }

    pub fn addresses_in(&self, ns: &str) -> Vec<IpNetwork> {
        self.state
            .borrow()
            .addresses
            .iter()
            .filter(|(address_ns, _, _)| address_ns == ns)
            .map(|(_, _, address)| *address)
            .collect()
    }

    pub fn sysctls(&self) -> Vec<(String, String)> {
        self.state.borrow().sysctls.clone()
    }

    /// Link-local address a link got when it came up
    pub fn link_local_of(&self, name: &str) -> Ipv6Addr {
        self.state
            .borrow()
            .links
            .iter()
            .find(|l| l.name == name)
            .and_then(|l| l.link_local)
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    pub fn current_ns_is_host(&self) -> bool {
        self.state.borrow().current_ns == HOST_NS
    }

    fn links(&self, ns: &str) -> FakeLinks {
        FakeLinks {
            ns: ns.to_string(),
            state: Rc::clone(&self.state),
        }
    }
}

impl Kernel for FakeKernel {
    type Links = FakeLinks;

    fn host(&self) -> Result<FakeLinks, CniError> {
        Ok(self.links(HOST_NS))
    }

    fn in_netns<T, F>(&self, netns_path: &str, f: F) -> Result<T, CniError>
    where
        F: FnOnce(&FakeLinks, RawFd) -> Result<T, CniError>,
    {
        if !self.netns_exists(netns_path) {
            return Err(CniError::namespace_error(&format!(
                "failed to open network namespace: {}",
                netns_path
            )));
        }
        let previous = std::mem::replace(
            &mut self.state.borrow_mut().current_ns,
            netns_path.to_string(),
        );
        let result = f(&self.links(netns_path), HOST_FD);
        self.state.borrow_mut().current_ns = previous;
        result
    }

    fn netns_exists(&self, netns_path: &str) -> bool {
        self.state.borrow().namespaces.contains(netns_path)
    }

    fn write_sysctl(&self, path: &str, value: &str) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        if state.failing.contains("write_sysctl") {
            return Err(CniError::new(
                CniErrorCode::SysctlFailure,
                &format!("injected failure writing {}", path),
            ));
        }
        state.sysctls.push((path.to_string(), value.to_string()));
        Ok(())
    }
}

/// [`LinkOps`] bound to one fake namespace
pub struct FakeLinks {
    ns: String,
    state: Rc<RefCell<KernelState>>,
}

impl LinkOps for FakeLinks {
    fn link_index(&self, name: &str) -> Result<Option<u32>, CniError> {
        let state = self.state.borrow();
        state.check("link_index")?;
        Ok(state
            .links
            .iter()
            .find(|l| l.ns == self.ns && l.name == name)
            .map(|l| l.index))
    }

    fn delete_link(&self, index: u32) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("delete_link")?;
        let peer = state.link_mut(&self.ns, index).ok().and_then(|l| l.peer);
        let gone: Vec<u32> = std::iter::once(index).chain(peer).collect();
        state.links.retain(|l| !gone.contains(&l.index));
        state.addresses.retain(|(_, i, _)| !gone.contains(i));
        state.routes.retain(|(_, r)| !gone.contains(&r.index));
        Ok(())
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("add_veth")?;
        if state.links.iter().any(|l| l.ns == self.ns && (l.name == name || l.name == peer)) {
            return Err(CniError::veth_error(&format!("link {} or {} exists", name, peer)));
        }
        let a = state.new_link(&self.ns, name);
        let b = state.new_link(&self.ns, peer);
        state.link_mut(&self.ns, a)?.peer = Some(b);
        state.link_mut(&self.ns, b)?.peer = Some(a);
        Ok(())
    }

    fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("set_mtu")?;
        state.link_mut(&self.ns, index)?.mtu = mtu;
        Ok(())
    }

    fn set_up(&self, index: u32) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("set_up")?;
        let ipv6 = state.ipv6;
        let link = state.link_mut(&self.ns, index)?;
        link.up = true;
        if ipv6 && link.link_local.is_none() {
            link.link_local = Some(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, index as u16));
        }
        Ok(())
    }

    fn hardware_address(&self, index: u32) -> Result<String, CniError> {
        let mut state = self.state.borrow_mut();
        state.check("hardware_address")?;
        Ok(state.link_mut(&self.ns, index)?.mac.clone())
    }

    fn ipv6_addresses(&self, index: u32) -> Result<Vec<Ipv6Addr>, CniError> {
        let mut state = self.state.borrow_mut();
        state.check("ipv6_addresses")?;
        let link_local = state.link_mut(&self.ns, index)?.link_local;
        let mut found: Vec<Ipv6Addr> = link_local.into_iter().collect();
        found.extend(state.addresses.iter().filter_map(|(ns, i, address)| {
            match (ns == &self.ns && *i == index, address.ip()) {
                (true, IpAddr::V6(ip)) => Some(ip),
                _ => None,
            }
        }));
        Ok(found)
    }

    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("add_address")?;
        state.link_mut(&self.ns, index)?;
        state.addresses.push((self.ns.clone(), index, address));
        Ok(())
    }

    fn add_route(&self, route: &Route) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("add_route")?;
        state
            .link_mut(&self.ns, route.index)
            .map_err(|e| CniError::route_error(e.message()))?;
        state.routes.push((self.ns.clone(), route.clone()));
        Ok(())
    }

    fn move_to_netns(&self, index: u32, netns_fd: RawFd) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        state.check("move_to_netns")?;
        if netns_fd != HOST_FD {
            return Err(CniError::namespace_error("unknown namespace descriptor"));
        }
        let link = state.link_mut(&self.ns, index)?;
        link.ns = HOST_NS.to_string();
        link.up = false;
        Ok(())
    }
}

/// Datastore double with injectable failures
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<EndpointKey, WorkloadEndpoint>,
    unreachable: bool,
    conflict_on_delete: bool,
    vanish_on_delete: bool,
    fail_apply: bool,
    delete_attempts: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint: WorkloadEndpoint) {
        self.state
            .borrow_mut()
            .records
            .insert(endpoint.key(), endpoint);
    }

    pub fn record(&self, key: &EndpointKey) -> Option<WorkloadEndpoint> {
        self.state.borrow().records.get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().records.is_empty()
    }

    pub fn set_unreachable(&self) {
        self.state.borrow_mut().unreachable = true;
    }

    /// Someone else rewrites the record right before each delete
    pub fn conflict_on_delete(&self) {
        self.state.borrow_mut().conflict_on_delete = true;
    }

    /// Someone else deletes the record right before each delete
    pub fn vanish_on_delete(&self) {
        self.state.borrow_mut().vanish_on_delete = true;
    }

    pub fn fail_apply(&self) {
        self.state.borrow_mut().fail_apply = true;
    }

    pub fn delete_attempts(&self) -> usize {
        self.state.borrow().delete_attempts
    }
}

impl EndpointStore for MemoryStore {
    fn get(&self, key: &EndpointKey) -> Result<WorkloadEndpoint, StoreError> {
        let state = self.state.borrow();
        if state.unreachable {
            return Err(StoreError::Unreachable("store offline".to_string()));
        }
        state.records.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn apply(&self, mut endpoint: WorkloadEndpoint) -> Result<WorkloadEndpoint, StoreError> {
        let mut state = self.state.borrow_mut();
        if state.unreachable || state.fail_apply {
            return Err(StoreError::Unreachable("store offline".to_string()));
        }
        endpoint.revision += 1;
        state.records.insert(endpoint.key(), endpoint.clone());
        Ok(endpoint)
    }

    fn compare_and_delete(&self, expected: &WorkloadEndpoint) -> Result<(), StoreError> {
        let mut state = self.state.borrow_mut();
        state.delete_attempts += 1;
        if state.unreachable {
            return Err(StoreError::Unreachable("store offline".to_string()));
        }
        let key = expected.key();
        if state.vanish_on_delete {
            state.records.remove(&key);
        }
        if state.conflict_on_delete {
            if let Some(record) = state.records.get_mut(&key) {
                record.revision += 1;
            }
        }
        match state.records.get(&key) {
            None => Err(StoreError::NotFound),
            Some(record) if record != expected => Err(StoreError::Conflict),
            Some(_) => {
                state.records.remove(&key);
                Ok(())
            }
        }
    }
}

/// One invocation of the IPAM plugin
#[derive(Debug, Clone)]
pub struct IpamCall {
    pub command: IpamCommand,
    pub cni_args: String,
    pub stdin: Vec<u8>,
}

#[derive(Default)]
struct IpamState {
    calls: Vec<IpamCall>,
    result: Option<String>,
    add_failures: HashMap<usize, CniError>,
    del_failure: Option<CniError>,
}

/// IPAM plugin double
///
/// ADD answers with the `IP=` address from CNI_ARGS when one is present,
/// otherwise with the configured result.
#[derive(Clone)]
pub struct ScriptedIpam {
    state: Rc<RefCell<IpamState>>,
}

impl ScriptedIpam {
    pub const DEFAULT_V4: &'static str = "10.0.0.5/32";

    pub fn echo() -> Self {
        Self {
            state: Rc::new(RefCell::new(IpamState::default())),
        }
    }

    /// Raw plugin output for ADDs without an `IP=` request
    pub fn set_result(&self, raw: &str) {
        self.state.borrow_mut().result = Some(raw.to_string());
    }

    pub fn fail_next_add(&self, err: CniError) {
        let n = self.add_count();
        self.fail_add_number(n, err);
    }

    /// Fail the `n`th ADD, counting from zero
    pub fn fail_add_number(&self, n: usize, err: CniError) {
        self.state.borrow_mut().add_failures.insert(n, err);
    }

    pub fn fail_next_del(&self, err: CniError) {
        self.state.borrow_mut().del_failure = Some(err);
    }

    pub fn calls(&self) -> Vec<IpamCall> {
        self.state.borrow().calls.clone()
    }

    pub fn add_count(&self) -> usize {
        self.count(IpamCommand::Add)
    }

    pub fn release_count(&self) -> usize {
        self.count(IpamCommand::Del)
    }

    fn count(&self, command: IpamCommand) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.command == command)
            .count()
    }
}

impl IpamExec for ScriptedIpam {
    fn exec(
        &self,
        _plugin: &str,
        command: IpamCommand,
        stdin: &[u8],
        cni_args: &str,
    ) -> Result<Vec<u8>, CniError> {
        let adds_so_far = self.add_count();
        let mut state = self.state.borrow_mut();
        state.calls.push(IpamCall {
            command,
            cni_args: cni_args.to_string(),
            stdin: stdin.to_vec(),
        });

        if command == IpamCommand::Del {
            return match state.del_failure.take() {
                Some(err) => Err(err),
                None => Ok(Vec::new()),
            };
        }
        if let Some(err) = state.add_failures.remove(&adds_so_far) {
            return Err(err);
        }

        let requested = cni_args
            .split(';')
            .filter_map(|pair| pair.strip_prefix("IP="))
            .last()
            .and_then(|ip| ip.parse::<IpAddr>().ok());
        let raw = match requested {
            Some(ip) => format!(
                r#"{{"cniVersion":"1.0.0","ips":[{{"address":"{}"}}]}}"#,
                IpNetwork::from(ip)
            ),
            None => state.result.clone().unwrap_or_else(|| {
                format!(
                    r#"{{"cniVersion":"1.0.0","ips":[{{"address":"{}"}}]}}"#,
                    Self::DEFAULT_V4
                )
            }),
        };
        Ok(raw.into_bytes())
    }
}

#[derive(Default)]
struct ArgsState {
    value: String,
    sets: usize,
    fail_from: Option<usize>,
}

/// CNI_ARGS held in memory
#[derive(Clone, Default)]
pub struct MemoryArgsEnv {
    state: Rc<RefCell<ArgsState>>,
}

impl MemoryArgsEnv {
    pub fn new(value: &str) -> Self {
        let env = Self::default();
        env.state.borrow_mut().value = value.to_string();
        env
    }

    pub fn value(&self) -> String {
        self.state.borrow().value.clone()
    }

    /// Fail the `n`th set and every one after it, counting from zero
    pub fn fail_sets_from(&self, n: usize) {
        self.state.borrow_mut().fail_from = Some(n);
    }
}

impl CniArgsEnv for MemoryArgsEnv {
    fn get(&self) -> String {
        self.value()
    }

    fn set(&self, value: &str) -> Result<(), CniError> {
        let mut state = self.state.borrow_mut();
        let attempt = state.sets;
        state.sets += 1;
        if state.fail_from.is_some_and(|n| attempt >= n) {
            return Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                "failed to set CNI_ARGS",
            ));
        }
        state.value = value.to_string();
        Ok(())
    }
}

#[derive(Default)]
struct MetadataState {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    pod_cidr: Option<String>,
    lookups: Vec<String>,
}

/// API server double
#[derive(Clone, Default)]
pub struct FakeMetadata {
    state: Rc<RefCell<MetadataState>>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pod(&self, labels: &[(&str, &str)], annotations: &[(&str, &str)]) {
        let owned = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        let mut state = self.state.borrow_mut();
        state.labels = owned(labels);
        state.annotations = owned(annotations);
    }

    pub fn set_pod_cidr(&self, cidr: &str) {
        self.state.borrow_mut().pod_cidr = Some(cidr.to_string());
    }

    /// `pod/<namespace>/<name>` and `node/<name>` for every lookup made
    pub fn lookups(&self) -> Vec<String> {
        self.state.borrow().lookups.clone()
    }
}

impl PodMetadata for FakeMetadata {
    fn labels_and_annotations(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), CniError> {
        let mut state = self.state.borrow_mut();
        state.lookups.push(format!("pod/{}/{}", namespace, pod));
        Ok((state.labels.clone(), state.annotations.clone()))
    }

    fn pod_cidr(&self, node: &str) -> Result<String, CniError> {
        let mut state = self.state.borrow_mut();
        state.lookups.push(format!("node/{}", node));
        state
            .pod_cidr
            .clone()
            .ok_or_else(|| CniError::metadata_error(&format!("no podCidr for node {}", node)))
    }
}
