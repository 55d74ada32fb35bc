// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The application facade: routing, endpoint indices and event dispatch
//!
//! [App] owns everything the framework manages for a node: the
//! configuration, the registered modules and connectors, the two endpoint
//! indices (by id and by name), the waker queue driving retry/expiry, the
//! discovery catalog and the observer receiving app-level events. All of
//! it is single-threaded state, touched only from the app's own loop;
//! connectors running IO elsewhere talk to it exclusively through the
//! event channel behind [AppContext].
//!
//! Lifecycle (init/run/stop) lives in [lifecycle]; the cooperative tick
//! pass lives in [tick].

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::address::{Address, AddressType};
use crate::config::AppConfig;
use crate::connector::{
    bind_handle_to_endpoint, unbind_handle_from_endpoint, AppContext, ConnectionHandle,
    ConnectorRef, CoreEvent,
};
use crate::discovery::{DiscoveryAction, DiscoveryNode, DiscoverySet};
use crate::endpoint::{Endpoint, EndpointOps, EndpointRef, RoutedResponse};
use crate::errors::{result_from_code, AppError};
use crate::events::{AppEvents, NullEvents};
use crate::gateway::GatewayMatcher;
use crate::message::{Message, MessageSender, Metadata};
use crate::module::{AppModule, ModuleEntry, ModuleRef};
use crate::waker::WakerQueue;

mod lifecycle;
mod tick;

pub use lifecycle::RunMode;

/// Lifecycle state flags, kept as one bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFlag {
    /// The main loop is (or should be) running
    Running = 0,
    /// Cooperative shutdown was requested
    Stopping,
    /// The stop grace period elapsed; shutdown is now forced
    Timeout,
    /// An observer callback is currently on the stack
    InCallback,
    /// The tick interval changed; the schedule must be rebuilt
    ResetTimer,
    /// `init` completed successfully
    Initialized,
    /// Shutdown drained completely
    Stopped,
    /// Id sends must not fall back to the default bus connector
    DisableBusFallback,
}

struct StatData {
    endpoint_wake_count: u64,
    last_checkpoint_min: u64,
}

/// The application core. See the [crate] documentation for an overview.
pub struct App {
    pub(crate) config: AppConfig,
    pub(crate) conf_file: Option<PathBuf>,
    pub(crate) pid_file: Option<PathBuf>,
    pub(crate) upgrade_mode: bool,
    pub(crate) startup_log: Option<String>,
    pub(crate) execute_path: PathBuf,
    pub(crate) id_override: Option<String>,
    pub(crate) id_mask_override: Option<String>,
    pub(crate) last_command: Vec<String>,
    pub(crate) mode: RunMode,

    pub(crate) resolved_id: u64,
    pub(crate) id_mask: Vec<u64>,
    pub(crate) hash_code: String,
    pub(crate) app_version: String,
    pub(crate) build_version: String,

    flags: u32,
    pub(crate) modules: Vec<ModuleEntry>,
    pub(crate) connectors: Vec<ConnectorRef>,
    connector_by_scheme: HashMap<String, ConnectorRef>,
    pub(crate) default_connector: Option<ConnectorRef>,

    endpoints_by_id: HashMap<u64, EndpointRef>,
    endpoints_by_name: HashMap<String, EndpointRef>,
    pub(crate) waker: WakerQueue,
    pub(crate) discovery: DiscoverySet,
    pub(crate) matcher: GatewayMatcher,

    observer: Option<Box<dyn AppEvents>>,
    events_rx: mpsc::UnboundedReceiver<CoreEvent>,
    context: AppContext,

    pub(crate) last_tick: Instant,
    pub(crate) next_tick_at: Instant,
    pub(crate) stop_deadline: Option<Instant>,
    pub(crate) pending_signals: Vec<i32>,
    pub(crate) signals: Option<lifecycle::SignalHub>,
    pub(crate) last_proc_event_count: u64,
    stats: StatData,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Create an app with default configuration and no modules or
    /// connectors registered.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            config: AppConfig::default(),
            conf_file: None,
            pid_file: None,
            upgrade_mode: false,
            startup_log: None,
            execute_path: std::env::current_exe().unwrap_or_default(),
            id_override: None,
            id_mask_override: None,
            last_command: Vec::new(),
            mode: RunMode::Start,
            resolved_id: 0,
            id_mask: Vec::new(),
            hash_code: String::new(),
            app_version: String::new(),
            build_version: String::new(),
            flags: 0,
            modules: Vec::new(),
            connectors: Vec::new(),
            connector_by_scheme: HashMap::new(),
            default_connector: None,
            endpoints_by_id: HashMap::new(),
            endpoints_by_name: HashMap::new(),
            waker: WakerQueue::default(),
            discovery: DiscoverySet::new(),
            matcher: GatewayMatcher::default(),
            observer: Some(Box::new(NullEvents)),
            events_rx,
            context: AppContext::new(events_tx),
            last_tick: now,
            next_tick_at: now,
            stop_deadline: None,
            pending_signals: Vec::new(),
            signals: None,
            last_proc_event_count: 0,
            stats: StatData {
                endpoint_wake_count: 0,
                last_checkpoint_min: 0,
            },
        }
    }

    // ========================= Flags and accessors ========================= //

    pub(crate) fn set_flag(&mut self, flag: AppFlag, value: bool) -> bool {
        let bit = 1u32 << (flag as u32);
        let prior = (self.flags & bit) != 0;
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
        prior
    }

    /// Check one lifecycle flag.
    pub fn check_flag(&self, flag: AppFlag) -> bool {
        (self.flags & (1u32 << (flag as u32))) != 0
    }

    /// Whether `init` completed.
    pub fn is_inited(&self) -> bool {
        self.check_flag(AppFlag::Initialized)
    }

    /// Whether the main loop is active.
    pub fn is_running(&self) -> bool {
        self.check_flag(AppFlag::Running)
    }

    /// Whether shutdown was requested.
    pub fn is_closing(&self) -> bool {
        self.check_flag(AppFlag::Stopping)
    }

    /// Whether shutdown completed.
    pub fn is_closed(&self) -> bool {
        self.check_flag(AppFlag::Stopped)
    }

    /// The resolved numeric node id.
    pub fn get_id(&self) -> u64 {
        self.resolved_id
    }

    /// The node name.
    pub fn get_app_name(&self) -> &str {
        &self.config.name
    }

    /// The frozen identity digest.
    pub fn get_app_identity(&self) -> &str {
        &self.config.identity
    }

    /// The node type name.
    pub fn get_type_name(&self) -> &str {
        &self.config.type_name
    }

    /// The numeric node type.
    pub fn get_type_id(&self) -> u64 {
        self.config.type_id
    }

    /// The stable content hash over the node name, hex.
    pub fn get_hash_code(&self) -> &str {
        &self.hash_code
    }

    /// The loaded configuration tree.
    pub fn get_configure(&self) -> &AppConfig {
        &self.config
    }

    /// The node metadata used for gateway matching.
    pub fn get_metadata(&self) -> &Metadata {
        &self.config.metadata
    }

    /// The optional area metadata.
    pub fn get_area(&self) -> &crate::config::AreaConfig {
        &self.config.area
    }

    /// Convert an id string (plain or dotted) using this app's id mask.
    pub fn convert_app_id_by_string(&self, id: &str) -> u64 {
        crate::identity::convert_app_id_by_string(id, &self.id_mask)
    }

    /// Render an id using this app's id mask.
    pub fn convert_app_id_to_string(&self, id: u64, hex: bool) -> String {
        crate::identity::convert_app_id_to_string(id, &self.id_mask, hex)
    }

    /// Application version string, settable by the embedder.
    pub fn get_app_version(&self) -> &str {
        &self.app_version
    }

    /// Set the application version string.
    pub fn set_app_version(&mut self, version: impl Into<String>) {
        self.app_version = version.into();
    }

    /// Build version string, settable by the embedder.
    pub fn get_build_version(&self) -> &str {
        &self.build_version
    }

    /// Set the build version string.
    pub fn set_build_version(&mut self, version: impl Into<String>) {
        self.build_version = version.into();
    }

    /// Whether the last command or action ran in upgrade mode.
    pub fn is_current_upgrade_mode(&self) -> bool {
        self.upgrade_mode
    }

    /// The cached tick time used as the base for message expiry.
    pub fn get_last_tick_time(&self) -> Instant {
        self.last_tick
    }

    /// Allow id sends to fall back to the default bus connector (the
    /// default).
    pub fn enable_fallback_to_bus_connector(&mut self) {
        self.set_flag(AppFlag::DisableBusFallback, false);
    }

    /// Forbid the bus-connector fallback for id sends.
    pub fn disable_fallback_to_bus_connector(&mut self) {
        self.set_flag(AppFlag::DisableBusFallback, true);
    }

    /// Whether the bus-connector fallback is enabled.
    pub fn is_fallback_to_bus_connector_enabled(&self) -> bool {
        !self.check_flag(AppFlag::DisableBusFallback)
    }

    // ========================= Registration ========================= //

    /// Register a module. Must happen before `init`.
    pub fn add_module<M: AppModule + 'static>(&mut self, module: M) -> ModuleRef {
        let shared: ModuleRef = Rc::new(std::cell::RefCell::new(module));
        self.modules.push(ModuleEntry::new(shared.clone()));
        shared
    }

    /// Register a connector for every scheme it reports. Re-binding a
    /// scheme replaces the previous connector for future resolutions.
    pub fn add_connector<C: crate::connector::Connector + 'static>(
        &mut self,
        connector: C,
    ) -> Rc<std::cell::RefCell<C>> {
        let concrete = Rc::new(std::cell::RefCell::new(connector));
        let dynamic: ConnectorRef = concrete.clone();
        let schemes: Vec<String> = dynamic
            .borrow()
            .schemes()
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        for scheme in schemes {
            self.connector_by_scheme.insert(scheme, dynamic.clone());
        }
        self.connectors.push(dynamic);
        concrete
    }

    /// Mark a registered connector as the default bus transport: the
    /// target of the id-send fallback and of CLI command delivery.
    pub fn set_default_connector(&mut self, connector: &ConnectorRef) {
        self.default_connector = Some(connector.clone());
    }

    /// The context handed to connectors for marshaling events back onto
    /// this app's loop.
    pub fn context(&self) -> AppContext {
        self.context.clone()
    }

    /// Install the observer receiving app-level events.
    pub fn set_events_observer(&mut self, observer: Box<dyn AppEvents>) {
        self.observer = Some(observer);
    }

    /// Start listening on an address through whichever connector owns its
    /// scheme.
    pub fn listen(&mut self, address: &str) -> Result<(), AppError> {
        let addr = Address::parse(address)?;
        let connector = self
            .connector_by_scheme
            .get(&addr.scheme)
            .cloned()
            .ok_or(AppError::ChannelNotSupported)?;
        let result = connector.borrow_mut().start_listen(&addr);
        result
    }

    /// Advisory address classification from the owning connector.
    pub fn get_address_type(&self, address: &str) -> AddressType {
        let Ok(addr) = Address::parse(address) else {
            return AddressType::NONE;
        };
        match self.connector_by_scheme.get(&addr.scheme) {
            Some(connector) => connector.borrow().address_type(&addr),
            None => AddressType::NONE,
        }
    }

    // ========================= Discovery ========================= //

    /// The discovery catalog this app routes against.
    pub fn discovery_set(&self) -> &DiscoverySet {
        &self.discovery
    }

    /// Look up a discovery node by id.
    pub fn get_discovery_node_by_id(&self, id: u64) -> Option<Rc<DiscoveryNode>> {
        self.discovery.get_node_by_id(id)
    }

    /// Look up a discovery node by name.
    pub fn get_discovery_node_by_name(&self, name: &str) -> Option<Rc<DiscoveryNode>> {
        self.discovery.get_node_by_name(name)
    }

    /// Apply a discovery PUT/DELETE event: update the catalog, refresh any
    /// live endpoint snapshot and let every connector react.
    pub fn handle_discovery_event(&mut self, action: DiscoveryAction, node: &Rc<DiscoveryNode>) {
        match action {
            DiscoveryAction::Put => {
                tracing::info!(
                    "app {}({}, type={}:{}) got a PUT discovery event({}({}, type={}:{}))",
                    self.get_app_name(),
                    self.get_id(),
                    self.get_type_id(),
                    self.get_type_name(),
                    node.name(),
                    node.id(),
                    node.info().type_id,
                    node.info().type_name
                );
            }
            DiscoveryAction::Delete => {
                tracing::info!(
                    "app {}({}, type={}:{}) got a DELETE discovery event({}({}, type={}:{}))",
                    self.get_app_name(),
                    self.get_id(),
                    self.get_type_id(),
                    self.get_type_name(),
                    node.name(),
                    node.id(),
                    node.info().type_id,
                    node.info().type_name
                );
            }
        }

        self.discovery.apply(action, node);

        if action == DiscoveryAction::Put {
            let live = self
                .endpoints_by_id
                .get(&node.id())
                .or_else(|| self.endpoints_by_name.get(node.name()))
                .cloned();
            if let Some(endpoint) = live {
                self.reindex_endpoint(&endpoint, node);
            }
        }

        for connector in self.connectors.clone() {
            connector.borrow_mut().on_discovery_event(action, node);
        }
    }

    /// Whether this local node may use the advertised gateway.
    pub fn match_gateway(&self, gateway: &crate::config::GatewayConfig) -> bool {
        self.matcher.matches(gateway)
    }

    // ========================= Endpoint indices ========================= //

    /// The endpoint cached for `id`, if any.
    pub fn get_endpoint_by_id(&self, id: u64) -> Option<EndpointRef> {
        self.endpoints_by_id.get(&id).cloned()
    }

    /// The endpoint cached for `name`, if any.
    pub fn get_endpoint_by_name(&self, name: &str) -> Option<EndpointRef> {
        self.endpoints_by_name.get(name).cloned()
    }

    /// Drop the endpoint indexed under `id`, cancelling whatever it still
    /// buffers. A second call is a no-op.
    pub fn remove_endpoint_by_id(&mut self, id: u64) {
        let Some(endpoint) = self.endpoints_by_id.remove(&id) else {
            return;
        };
        let name = endpoint.borrow().name().to_string();
        if !name.is_empty() {
            let same = self
                .endpoints_by_name
                .get(&name)
                .is_some_and(|other| Rc::ptr_eq(other, &endpoint));
            if same {
                self.endpoints_by_name.remove(&name);
            }
        }
        self.reset_endpoint(endpoint);
    }

    /// Drop the endpoint indexed under `name`, cancelling whatever it
    /// still buffers. A second call is a no-op.
    pub fn remove_endpoint_by_name(&mut self, name: &str) {
        let Some(endpoint) = self.endpoints_by_name.remove(name) else {
            return;
        };
        let id = endpoint.borrow().id();
        if id != 0 {
            let same = self
                .endpoints_by_id
                .get(&id)
                .is_some_and(|other| Rc::ptr_eq(other, &endpoint));
            if same {
                self.endpoints_by_id.remove(&id);
            }
        }
        self.reset_endpoint(endpoint);
    }

    /// Drop a specific endpoint object from both indices.
    pub fn remove_endpoint(&mut self, endpoint: &EndpointRef) {
        let (id, name) = {
            let guard = endpoint.borrow();
            (guard.id(), guard.name().to_string())
        };
        if id != 0 {
            let same = self
                .endpoints_by_id
                .get(&id)
                .is_some_and(|other| Rc::ptr_eq(other, endpoint));
            if same {
                self.endpoints_by_id.remove(&id);
            }
        }
        if !name.is_empty() {
            let same = self
                .endpoints_by_name
                .get(&name)
                .is_some_and(|other| Rc::ptr_eq(other, endpoint));
            if same {
                self.endpoints_by_name.remove(&name);
            }
        }
        self.reset_endpoint(endpoint.clone());
    }

    pub(crate) fn endpoint_index_sizes(&self) -> (usize, usize) {
        (self.endpoints_by_id.len(), self.endpoints_by_name.len())
    }

    fn reset_endpoint(&mut self, endpoint: EndpointRef) {
        let mut responses = Vec::new();
        endpoint.borrow_mut().reset(&mut responses);
        self.dispatch_routed_responses(responses);
    }

    /// Find or create the endpoint representing `discovery`, reconciling
    /// the id and name indices.
    ///
    /// When the two indices disagree, the name-indexed endpoint wins and
    /// the stale id-indexed one is dropped (its buffered messages cancel
    /// with `Closing` responses). A freshly created endpoint walks the
    /// node's gateways in advertised order and binds the first connection
    /// a matching connector accepts.
    pub fn mutable_endpoint(&mut self, discovery: &Rc<DiscoveryNode>) -> Option<EndpointRef> {
        if self.is_closing() {
            return None;
        }

        let id = discovery.id();
        let name = discovery.name();

        let by_id_hit = if id != 0 {
            self.endpoints_by_id.get(&id).cloned()
        } else {
            None
        };
        let by_name_hit = if !name.is_empty() {
            self.endpoints_by_name.get(name).cloned()
        } else {
            None
        };

        let ret = match (by_id_hit, by_name_hit) {
            (Some(by_id), Some(by_name)) => {
                if !Rc::ptr_eq(&by_id, &by_name) {
                    // the indices disagree: the stale id entry loses
                    self.remove_endpoint_by_id(id);
                }
                Some(by_name)
            }
            (Some(by_id), None) => Some(by_id),
            (None, Some(by_name)) => Some(by_name),
            (None, None) => None,
        };

        let is_created = ret.is_none();
        let endpoint = ret.unwrap_or_else(Endpoint::create);
        self.reindex_endpoint(&endpoint, discovery);

        if is_created {
            self.connect_new_endpoint(discovery, &endpoint);
        }

        Some(endpoint)
    }

    /// Re-home `endpoint` under `node`'s id and name, purging index
    /// entries left behind by a prior snapshot, and install the new
    /// discovery snapshot.
    fn reindex_endpoint(&mut self, endpoint: &EndpointRef, node: &Rc<DiscoveryNode>) {
        let (old_id, old_name) = {
            let guard = endpoint.borrow();
            (guard.id(), guard.name().to_string())
        };
        let new_id = node.id();
        let new_name = node.name();

        if old_id != 0 && old_id != new_id {
            let stale = self
                .endpoints_by_id
                .get(&old_id)
                .is_some_and(|other| Rc::ptr_eq(other, endpoint));
            if stale {
                self.endpoints_by_id.remove(&old_id);
            }
        }
        if !old_name.is_empty() && old_name != new_name {
            let stale = self
                .endpoints_by_name
                .get(&old_name)
                .is_some_and(|other| Rc::ptr_eq(other, endpoint));
            if stale {
                self.endpoints_by_name.remove(&old_name);
            }
        }

        if new_id != 0 {
            let occupied_by_other = self
                .endpoints_by_id
                .get(&new_id)
                .is_some_and(|other| !Rc::ptr_eq(other, endpoint));
            if occupied_by_other {
                self.remove_endpoint_by_id(new_id);
            }
            self.endpoints_by_id.insert(new_id, endpoint.clone());
        }
        if !new_name.is_empty() {
            let occupied_by_other = self
                .endpoints_by_name
                .get(new_name)
                .is_some_and(|other| !Rc::ptr_eq(other, endpoint));
            if occupied_by_other {
                self.remove_endpoint_by_name(new_name);
            }
            self.endpoints_by_name
                .insert(new_name.to_string(), endpoint.clone());
        }

        endpoint.borrow_mut().update_discovery(node.clone());
    }

    fn connect_new_endpoint(&mut self, discovery: &Rc<DiscoveryNode>, endpoint: &EndpointRef) {
        // first wake on the next tick so a failed connect cleans up fast
        {
            let mut responses = Vec::new();
            let mut ops = self.endpoint_ops(&mut responses);
            let now = ops.now;
            endpoint.borrow_mut().add_waker(now, &mut ops);
        }

        let handle = ConnectionHandle::new();
        for _ in 0..discovery.ingress_size() {
            let Some(gateway) = discovery.next_ingress_gateway() else {
                break;
            };
            if !self.matcher.matches(gateway) {
                tracing::debug!(
                    "atapp endpoint {}({}) skip unmatched gateway {}",
                    discovery.id(),
                    discovery.name(),
                    gateway.address
                );
                continue;
            }

            let addr = match Address::parse(&gateway.address) {
                Ok(parsed) => parsed,
                Err(_) => {
                    tracing::debug!(
                        "atapp endpoint {}({}) skip malformed address {}",
                        discovery.id(),
                        discovery.name(),
                        gateway.address
                    );
                    continue;
                }
            };

            let Some(connector) = self.connector_by_scheme.get(&addr.scheme).cloned() else {
                tracing::debug!(
                    "atapp endpoint {}({}) skip unsupported address {}",
                    discovery.id(),
                    discovery.name(),
                    gateway.address
                );
                continue;
            };

            let accepted = connector
                .borrow_mut()
                .start_connect(discovery, &addr, &handle)
                .is_ok();
            if accepted && Rc::strong_count(&handle) > 1 {
                handle.set_connector(&connector);
                bind_handle_to_endpoint(&handle, endpoint);
                tracing::info!(
                    "atapp endpoint {}({}) connect address {} success and use handle {}",
                    discovery.id(),
                    discovery.name(),
                    addr,
                    handle.id()
                );
                break;
            } else {
                tracing::info!(
                    "atapp endpoint {}({}) skip address {} with handle {}",
                    discovery.id(),
                    discovery.name(),
                    addr,
                    handle.id()
                );
            }
        }
    }

    // ========================= Send paths ========================= //

    fn endpoint_ops<'a>(&'a mut self, responses: &'a mut Vec<RoutedResponse>) -> EndpointOps<'a> {
        EndpointOps {
            now: self.last_tick,
            message_timeout: self.config.timer.message_timeout,
            send_buffer_number: self.config.bus.send_buffer_number,
            send_buffer_size: self.config.bus.send_buffer_size,
            app_closing: self.check_flag(AppFlag::Stopping),
            waker: &mut self.waker,
            responses,
        }
    }

    fn push_to_endpoint(
        &mut self,
        endpoint: &EndpointRef,
        message_type: i32,
        sequence: Option<u64>,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        let mut responses = Vec::new();
        let (sequence, code) = {
            let mut ops = self.endpoint_ops(&mut responses);
            endpoint.borrow_mut().push_forward_message(
                &mut ops,
                message_type,
                sequence.unwrap_or(0),
                payload,
                metadata,
            )
        };
        self.dispatch_routed_responses(responses);
        result_from_code(code).map(|()| sequence)
    }

    /// Send to a node by numeric id.
    ///
    /// Resolution order: the endpoint cache, then the discovery catalog,
    /// then (unless disabled) the default bus connector's legacy direct
    /// send.
    pub fn send_message_by_id(
        &mut self,
        target_node_id: u64,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        if let Some(endpoint) = self.endpoints_by_id.get(&target_node_id).cloned() {
            return self.push_to_endpoint(&endpoint, message_type, sequence, payload, metadata);
        }

        if let Some(node) = self.discovery.get_node_by_id(target_node_id) {
            return self.send_message_by_discovery(&node, message_type, payload, sequence, metadata);
        }

        if self.check_flag(AppFlag::DisableBusFallback) {
            return Err(AppError::NodeNotFound);
        }
        let Some(connector) = self.default_connector.clone() else {
            return Err(AppError::NotInited);
        };
        let mut seq = sequence.unwrap_or(0);
        let code = connector.borrow_mut().send_fallback_request(
            target_node_id,
            message_type,
            &mut seq,
            payload,
            metadata,
        );
        result_from_code(code).map(|()| seq)
    }

    /// Send to a node by name. Name sends have no legacy fallback: an
    /// unknown name fails with `NodeNotFound` (or `DiscoveryDisabled` when
    /// the catalog is empty).
    pub fn send_message_by_name(
        &mut self,
        target_node_name: &str,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        if let Some(endpoint) = self.endpoints_by_name.get(target_node_name).cloned() {
            return self.push_to_endpoint(&endpoint, message_type, sequence, payload, metadata);
        }

        if self.discovery.is_empty() {
            return Err(AppError::DiscoveryDisabled);
        }
        let node = self
            .discovery
            .get_node_by_name(target_node_name)
            .ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// Send to a specific discovery node, creating or reusing its
    /// endpoint.
    pub fn send_message_by_discovery(
        &mut self,
        node: &Rc<DiscoveryNode>,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        let endpoint = self.mutable_endpoint(node).ok_or(AppError::NodeNotFound)?;
        self.push_to_endpoint(&endpoint, message_type, sequence, payload, metadata)
    }

    /// Send to whichever node owns `key` on the consistent-hash ring of
    /// the app's own catalog.
    pub fn send_message_by_consistent_hash(
        &mut self,
        key: &[u8],
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        if self.discovery.is_empty() {
            return Err(AppError::DiscoveryDisabled);
        }
        let node = self
            .discovery
            .get_node_by_consistent_hash(key)
            .ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// [Self::send_message_by_consistent_hash] with a `u64` key.
    pub fn send_message_by_consistent_hash_u64(
        &mut self,
        key: u64,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        self.send_message_by_consistent_hash(
            &key.to_be_bytes(),
            message_type,
            payload,
            sequence,
            metadata,
        )
    }

    /// [Self::send_message_by_consistent_hash] with an `i64` key.
    pub fn send_message_by_consistent_hash_i64(
        &mut self,
        key: i64,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        self.send_message_by_consistent_hash(
            &key.to_be_bytes(),
            message_type,
            payload,
            sequence,
            metadata,
        )
    }

    /// [Self::send_message_by_consistent_hash] with a string key.
    pub fn send_message_by_consistent_hash_str(
        &mut self,
        key: &str,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        self.send_message_by_consistent_hash(
            key.as_bytes(),
            message_type,
            payload,
            sequence,
            metadata,
        )
    }

    /// Send to a uniformly random node from the app's own catalog.
    pub fn send_message_by_random(
        &mut self,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        if self.discovery.is_empty() {
            return Err(AppError::DiscoveryDisabled);
        }
        let node = self
            .discovery
            .get_node_by_random()
            .ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// Send to the next node in rotation from the app's own catalog.
    pub fn send_message_by_round_robin(
        &mut self,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        if self.discovery.is_empty() {
            return Err(AppError::DiscoveryDisabled);
        }
        let node = self
            .discovery
            .get_node_by_round_robin()
            .ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// Consistent-hash send against an explicit catalog.
    pub fn send_message_by_consistent_hash_with_set(
        &mut self,
        set: &DiscoverySet,
        key: &[u8],
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        let node = set
            .get_node_by_consistent_hash(key)
            .ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// Random send against an explicit catalog.
    pub fn send_message_by_random_with_set(
        &mut self,
        set: &DiscoverySet,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        let node = set.get_node_by_random().ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    /// Round-robin send against an explicit catalog.
    pub fn send_message_by_round_robin_with_set(
        &mut self,
        set: &DiscoverySet,
        message_type: i32,
        payload: &[u8],
        sequence: Option<u64>,
        metadata: Option<&Metadata>,
    ) -> Result<u64, AppError> {
        let node = set.get_node_by_round_robin().ok_or(AppError::NodeNotFound)?;
        self.send_message_by_discovery(&node, message_type, payload, sequence, metadata)
    }

    // ========================= Event dispatch ========================= //

    pub(crate) fn dispatch_routed_responses(&mut self, responses: Vec<RoutedResponse>) {
        for response in responses {
            self.trigger_event_on_forward_response(
                &response.source,
                &response.message,
                response.error_code,
            );
        }
    }

    fn with_observer<R>(
        &mut self,
        default: R,
        call: impl FnOnce(&mut dyn AppEvents, &mut App) -> R,
    ) -> R {
        let Some(mut observer) = self.observer.take() else {
            return default;
        };
        let prior = self.set_flag(AppFlag::InCallback, true);
        let result = call(observer.as_mut(), self);
        self.set_flag(AppFlag::InCallback, prior);
        // a handler may have installed a replacement observer
        if self.observer.is_none() {
            self.observer = Some(observer);
        }
        result
    }

    /// Dispatch an incoming forward request to the observer.
    pub fn trigger_event_on_forward_request(
        &mut self,
        source: &MessageSender,
        message: &Message,
    ) -> i32 {
        self.with_observer(0, |observer, app| {
            observer.on_forward_request(app, source, message)
        })
    }

    /// Dispatch a forward response (receipt or failure) to the observer.
    pub fn trigger_event_on_forward_response(
        &mut self,
        source: &MessageSender,
        message: &Message,
        error_code: i32,
    ) -> i32 {
        self.with_observer(0, |observer, app| {
            observer.on_forward_response(app, source, message, error_code)
        })
    }

    fn trigger_event_on_connected(&mut self, peer: &MessageSender) {
        self.with_observer((), |observer, app| observer.on_connected(app, peer));
    }

    fn trigger_event_on_disconnected(&mut self, peer: &MessageSender, error_code: i32) {
        self.with_observer((), |observer, app| {
            observer.on_disconnected(app, peer, error_code)
        });
    }

    pub(crate) fn trigger_event_on_all_modules_ready(&mut self) {
        self.with_observer((), |observer, app| observer.on_all_modules_ready(app));
    }

    fn peer_of_handle(handle: &crate::connector::HandleRef) -> MessageSender {
        match handle.endpoint() {
            Some(endpoint) => {
                let guard = endpoint.borrow();
                MessageSender {
                    id: guard.id(),
                    name: guard.name().to_string(),
                }
            }
            None => MessageSender::default(),
        }
    }

    /// Drain the core event channel, reacting to connector notifications.
    /// Returns the number of events processed.
    pub(crate) fn process_core_events(&mut self) -> i32 {
        let mut count = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            count += 1;
            self.handle_core_event(event);
        }
        count
    }

    pub(crate) fn handle_core_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::HandleReady(handle) => {
                handle.set_ready(true);
                let peer = Self::peer_of_handle(&handle);
                self.trigger_event_on_connected(&peer);

                if let Some(endpoint) = handle.endpoint() {
                    let loop_times = self.config.bus.loop_times;
                    let mut responses = Vec::new();
                    {
                        let mut ops = self.endpoint_ops(&mut responses);
                        endpoint
                            .borrow_mut()
                            .retry_pending_messages(&mut ops, loop_times);
                    }
                    self.dispatch_routed_responses(responses);
                }
            }
            CoreEvent::HandleClosed { handle, error_code } => {
                handle.set_closing();
                let peer = Self::peer_of_handle(&handle);
                let orphan = handle.endpoint();
                unbind_handle_from_endpoint(&handle);
                if let Some(connector) = handle.connector() {
                    connector.borrow_mut().close_handle(&handle);
                }
                // an endpoint left with no handles is collected on the
                // next waker drain
                if let Some(endpoint) = orphan {
                    if !endpoint.borrow().has_connection_handle() {
                        let mut responses = Vec::new();
                        let mut ops = self.endpoint_ops(&mut responses);
                        let now = ops.now;
                        endpoint.borrow_mut().add_waker(now, &mut ops);
                    }
                }
                self.trigger_event_on_disconnected(&peer, error_code);
            }
            CoreEvent::ForwardRequest { from, message } => {
                self.trigger_event_on_forward_request(&from, &message);
            }
            CoreEvent::ForwardResponse {
                target,
                message,
                error_code,
            } => {
                self.trigger_event_on_forward_response(&target, &message, error_code);
            }
            CoreEvent::CustomCommand { from, words, reply } => {
                let lines = self.run_custom_command(&from, &words);
                let _ = reply.send(lines);
            }
        }
    }

    // ========================= Custom commands ========================= //

    pub(crate) fn run_custom_command(
        &mut self,
        from: &MessageSender,
        words: &[String],
    ) -> Vec<String> {
        let mut response = Vec::new();
        match words.first().map(String::as_str) {
            Some("stop") => {
                if words.iter().any(|w| w == "--upgrade") {
                    self.upgrade_mode = true;
                }
                response.push(format!("node {} is stopping", self.get_app_name()));
                self.stop();
            }
            Some("reload") => match self.reload() {
                Ok(()) => response.push("reload done".to_string()),
                Err(err) => response.push(format!("reload failed: {err}")),
            },
            Some("list-discovery") => {
                for node in self.discovery.nodes() {
                    response.push(format!(
                        "{}({}, type={}:{})",
                        node.name(),
                        node.id(),
                        node.info().type_id,
                        node.info().type_name
                    ));
                }
            }
            Some(_) => {
                let code = {
                    let words = words.to_vec();
                    let from = from.clone();
                    self.with_observer(0, |observer, app| {
                        let mut lines = Vec::new();
                        let ret = observer.on_custom_command(app, &from, &words, &mut lines);
                        response = lines;
                        ret
                    })
                };
                if code != 0 {
                    response.push(format!("command failed with code {code}"));
                }
            }
            None => {
                response.push("command is empty".to_string());
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::loopback::{LoopbackConnector, LoopbackHub};

    #[test]
    fn flags_toggle_independently() {
        let mut app = App::new();
        assert!(!app.check_flag(AppFlag::Running));
        assert!(!app.set_flag(AppFlag::Running, true));
        assert!(app.check_flag(AppFlag::Running));
        assert!(!app.check_flag(AppFlag::Stopping));
        assert!(app.set_flag(AppFlag::Running, false));
        assert!(!app.check_flag(AppFlag::Running));
    }

    #[test]
    fn rebinding_a_scheme_is_observable() {
        let mut app = App::new();
        let first_hub = LoopbackHub::new();
        let second_hub = LoopbackHub::new();

        app.add_connector(LoopbackConnector::new(app.context(), first_hub.clone()));
        app.listen("mem://alpha").expect("listen");
        assert!(first_hub.has_peer("alpha"));

        // the scheme re-binds; the next resolution uses the new connector
        app.add_connector(LoopbackConnector::new(app.context(), second_hub.clone()));
        app.listen("mem://beta").expect("listen");
        assert!(!first_hub.has_peer("beta"));
        assert!(second_hub.has_peer("beta"));
    }

    #[test]
    fn listen_on_unknown_scheme_fails() {
        let mut app = App::new();
        assert_eq!(
            Err(AppError::ChannelNotSupported),
            app.listen("quic://nowhere:1")
        );
        assert_eq!(Err(AppError::BadData), app.listen("not-an-address"));
    }

    #[test]
    fn builtin_commands_respond() {
        let mut app = App::new();
        let from = MessageSender::by_id(0);

        let lines = app.run_custom_command(&from, &["list-discovery".to_string()]);
        assert!(lines.is_empty());

        let lines = app.run_custom_command(&from, &["definitely-unknown".to_string()]);
        assert_eq!(vec!["unknown command: definitely-unknown".to_string()], lines);

        let lines = app.run_custom_command(&from, &[]);
        assert_eq!(vec!["command is empty".to_string()], lines);
    }

    #[test]
    fn stop_command_sets_upgrade_mode() {
        let mut app = App::new();
        let from = MessageSender::by_id(0);
        assert!(!app.is_current_upgrade_mode());
        let _ = app.run_custom_command(
            &from,
            &["stop".to_string(), "--upgrade".to_string()],
        );
        assert!(app.is_current_upgrade_mode());
        assert!(app.is_closing());
    }
}
