//! Module bus
//!
//! Wires the fabric, registry, connection table, SVC channel and hotplug
//! manager together and is the one entry point for transports:
//!
//! - `interface_attached` / `interface_detached` on link events
//! - `receive` for every inbound frame
//! - `authorize` / `deny` for the authorization gate
//! - `subscribe` for [`BusEvent`]s
//!
//! Inbound frames are forwarded synchronously; anything that may wait is
//! queued on a worker keyed by interface id.

use super::connection::{Connection, ConnectionInfo, ConnectionTable, HostEndpoint};
use super::error::{BusError, BusResult};
use super::hotplug::{HotplugManager, HotplugSettings};
use super::id_pool::IdPool;
use super::interface::{InterfaceInfo, InterfaceState, HOST_INTERFACE_ID, SVC_INTERFACE_ID};
use super::message::{decode_frame, CportId, InterfaceId};
use super::operation::OperationStats;
use super::protocol::control::{ControlProtocol, InterfaceIds};
use super::protocol::svc::{HostSvcProtocol, SvcNotice};
use super::protocol::{ProtocolHandler, ProtocolInfo, ProtocolRegistry, ProtocolVersion, PROTOCOL_CONTROL, PROTOCOL_SVC};
use super::routing::{CportAddr, FabricStats, RoutingFabric};
use super::simulator::FrameSink;
use super::svc::{SvcChannel, SvcEndpoint, SvcSettings, SVC_CPORT_COUNT, SVC_HOST_CPORT};
use super::transport::Transport;
use super::worker::WorkerPool;
use crate::config::BusConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Event channel depth
const EVENT_CAPACITY: usize = 256;

/// Observable bus events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// An interface changed hotplug state
    InterfaceStateChanged {
        /// Interface
        intf: InterfaceId,
        /// Previous state
        from: InterfaceState,
        /// New state
        to: InterfaceState,
    },
    /// A module is ready for use
    ModuleAvailable {
        /// Interface
        intf: InterfaceId,
        /// Assigned device id
        device_id: u8,
        /// Identification data
        ids: InterfaceIds,
    },
    /// A module is active but waits for `authorize` or `deny`
    AuthorizationRequired {
        /// Interface
        intf: InterfaceId,
        /// Identification data
        ids: InterfaceIds,
    },
    /// A module was detached
    ModuleRemoved {
        /// Interface
        intf: InterfaceId,
    },
    /// Attach failed and was unwound
    AttachFailed {
        /// Interface
        intf: InterfaceId,
        /// Failure
        error: String,
    },
    /// The host received a notice from the SVC
    Svc(SvcNotice),
}

/// Completion of a queued hotplug job
pub type HotplugCompletion = oneshot::Receiver<BusResult<()>>;

/// Bus counters snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    /// Fabric counters
    pub fabric: FabricStats,
    /// SVC channel counters
    pub svc: OperationStats,
    /// Inbound frames rejected before routing
    pub invalid_frames: u64,
    /// Interfaces not yet removed
    pub interfaces: usize,
    /// Device ids in use
    pub device_ids_in_use: usize,
    /// Open connections
    pub connections: usize,
}

/// The module bus control plane
pub struct Bus {
    config: BusConfig,
    fabric: Arc<RoutingFabric>,
    registry: Arc<ProtocolRegistry>,
    connections: Arc<ConnectionTable>,
    svc: Arc<SvcChannel>,
    hotplug: Arc<HotplugManager>,
    workers: WorkerPool,
    events: broadcast::Sender<BusEvent>,
    started: AtomicBool,
    invalid_frames: AtomicU64,
}

impl Bus {
    /// Build a bus on the current tokio runtime
    pub fn new(config: BusConfig) -> BusResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| BusError::InvalidState(e.to_string()))?;
        let workers = WorkerPool::try_current()
            .ok_or_else(|| BusError::InvalidState("no tokio runtime".into()))?;

        let fabric = Arc::new(RoutingFabric::new());
        let registry = Arc::new(ProtocolRegistry::new());
        let connections = Arc::new(ConnectionTable::new(
            Arc::clone(&fabric),
            Arc::clone(&registry),
            workers.clone(),
            config.cport_count,
            config.operation_timeout(),
        ));
        let svc = SvcChannel::new(
            Arc::clone(&fabric),
            workers.clone(),
            SvcSettings {
                timeout: config.svc_timeout(),
                host_svc_cport: config.host_svc_cport(),
                endo_id: config.endo_id,
            },
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let hotplug = Arc::new(HotplugManager::new(
            Arc::clone(&fabric),
            Arc::clone(&svc),
            Arc::clone(&connections),
            IdPool::device_ids(config.device_id_first, config.device_id_last),
            events.clone(),
            HotplugSettings {
                control_cport: config.control_cport,
                require_authorization: config.require_authorization,
                max_interfaces: config.max_interfaces,
            },
        ));

        Ok(Arc::new(Self {
            config,
            fabric,
            registry,
            connections,
            svc,
            hotplug,
            workers,
            events,
            started: AtomicBool::new(false),
            invalid_frames: AtomicU64::new(0),
        }))
    }

    /// Register the SVC and host endpoints, bind the built-in protocols
    /// and bring up the SVC link to the host. Returns the host's SVC
    /// protocol version.
    pub async fn start(&self) -> BusResult<ProtocolVersion> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::InvalidState("bus already started".into()));
        }

        let cport_count = self.config.cport_count;
        self.fabric.add_device(
            SVC_INTERFACE_ID,
            Arc::new(SvcEndpoint::new(&self.svc)),
            cport_count.max(SVC_CPORT_COUNT),
        )?;
        self.fabric
            .add_device(HOST_INTERFACE_ID, Arc::new(HostEndpoint::new(&self.connections)), cport_count)?;

        self.registry.register(Arc::new(ControlProtocol::new()))?;
        let events = self.events.clone();
        self.registry.register(Arc::new(HostSvcProtocol::new(Arc::new(move |notice: SvcNotice| {
            let _ = events.send(BusEvent::Svc(notice));
        }))))?;

        let host_svc = self.connections.create(
            SVC_INTERFACE_ID,
            SVC_HOST_CPORT,
            PROTOCOL_SVC,
            None,
            Some(self.config.host_svc_cport()),
        )?;
        host_svc.enable()?;

        match self.svc.probe_host().await {
            Ok(version) => {
                info!(version = %version, host_svc_cport = host_svc.host_cport(), "bus started");
                Ok(version)
            }
            Err(e) => {
                warn!(error = %e, "host probe failed");
                let _ = self.connections.destroy(host_svc.host_cport());
                Err(e)
            }
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Routing fabric
    pub fn fabric(&self) -> &Arc<RoutingFabric> {
        &self.fabric
    }

    /// Protocol registry
    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Hotplug manager
    pub fn hotplug(&self) -> &Arc<HotplugManager> {
        &self.hotplug
    }

    /// Subscribe to bus events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Register an upper-layer protocol
    pub fn register_protocol(&self, handler: Arc<dyn ProtocolHandler>) -> BusResult<()> {
        self.registry.register(handler)
    }

    /// Remove a protocol; fails while connections use it
    pub fn deregister_protocol(&self, id: u8, version: ProtocolVersion) -> BusResult<()> {
        self.registry.deregister(id, version).map(|_| ())
    }

    /// Registered protocols in lookup order
    pub fn protocols(&self) -> Vec<ProtocolInfo> {
        self.registry.list()
    }

    fn queue<F, Fut>(&self, intf: InterfaceId, job: F) -> HotplugCompletion
    where
        F: FnOnce(Arc<HotplugManager>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = BusResult<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let hotplug = Arc::clone(&self.hotplug);
        self.workers.spawn_keyed(u16::from(intf), async move {
            let _ = tx.send(job(hotplug).await);
        });
        rx
    }

    /// A link came up on `intf`. Registers its transport and queues the
    /// attach sequence. If attach fails the transport is unregistered
    /// again, so the same interface id can be plugged anew.
    pub fn interface_attached(&self, intf: InterfaceId, transport: Arc<dyn Transport>) -> BusResult<HotplugCompletion> {
        if intf == SVC_INTERFACE_ID || intf == HOST_INTERFACE_ID {
            return Err(BusError::InvalidState(format!("interface {} is reserved", intf)));
        }
        self.fabric.add_device(intf, transport, self.config.cport_count)?;

        debug!(intf, "attach queued");
        let fabric = Arc::clone(&self.fabric);
        Ok(self.queue(intf, move |hotplug| async move {
            let result = hotplug.attach(intf).await;
            if result.is_err() {
                unregister_transport(&fabric, intf);
            }
            result
        }))
    }

    /// A link went down on `intf`. Queues detach, then unregisters the
    /// transport.
    pub fn interface_detached(&self, intf: InterfaceId) -> HotplugCompletion {
        let fabric = Arc::clone(&self.fabric);
        let workers = self.workers.clone();

        debug!(intf, "detach queued");
        self.queue(intf, move |hotplug| async move {
            let result = hotplug.detach(intf).await;
            unregister_transport(&fabric, intf);
            workers.retire(u16::from(intf));
            result
        })
    }

    /// Release the authorization gate for `intf`
    pub fn authorize(&self, intf: InterfaceId) -> HotplugCompletion {
        self.queue(intf, move |hotplug| async move { hotplug.authorize(intf).await })
    }

    /// Refuse the module on `intf`; it is unwound to `Removed` and its
    /// transport unregistered
    pub fn deny(&self, intf: InterfaceId) -> HotplugCompletion {
        let fabric = Arc::clone(&self.fabric);
        self.queue(intf, move |hotplug| async move {
            let result = hotplug.deny(intf).await;
            if result.is_ok() && hotplug.state(intf) == Some(InterfaceState::Removed) {
                unregister_transport(&fabric, intf);
            }
            result
        })
    }

    /// Inbound frame (envelope + message) from the transport of `from_intf`
    pub fn receive(&self, from_intf: InterfaceId, frame: &[u8]) -> BusResult<()> {
        let (envelope, message) = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                warn!(intf = from_intf, len = frame.len(), error = %e, "invalid frame dropped");
                return Err(e);
            }
        };

        self.fabric
            .forward(from_intf, envelope.src_cport, &message)
            .map(|_| ())
    }

    /// Open a connection for `protocol_id` to (`intf`, `intf_cport`):
    /// routes both ways, init, and `CONNECTED` over the interface's
    /// control connection
    pub async fn open_connection(
        &self,
        intf: InterfaceId,
        intf_cport: CportId,
        protocol_id: u8,
    ) -> BusResult<Arc<Connection>> {
        let control = self.control_connection(intf)?;

        let connection = self.connections.create(intf, intf_cport, protocol_id, None, None)?;
        let host_end = CportAddr::new(HOST_INTERFACE_ID, connection.host_cport());
        let intf_end = CportAddr::new(intf, intf_cport);

        let result = self.route_and_init(&connection, &control, host_end, intf_end).await;
        if let Err(e) = result {
            let _ = self.connections.destroy(connection.host_cport());
            return Err(e);
        }
        Ok(connection)
    }

    async fn route_and_init(
        &self,
        connection: &Arc<Connection>,
        control: &Connection,
        host_end: CportAddr,
        intf_end: CportAddr,
    ) -> BusResult<()> {
        let protocol = Some(connection.protocol_id());
        self.fabric
            .add_tagged_route(host_end.intf, host_end.cport, intf_end.intf, intf_end.cport, protocol)?;
        if let Err(e) = self
            .fabric
            .add_tagged_route(intf_end.intf, intf_end.cport, host_end.intf, host_end.cport, protocol)
        {
            let _ = self.fabric.remove_route(host_end.intf, host_end.cport, intf_end.intf, intf_end.cport);
            return Err(e);
        }

        if let Err(e) = self.connections.init(connection, Some(control)).await {
            let _ = self.fabric.remove_route(host_end.intf, host_end.cport, intf_end.intf, intf_end.cport);
            let _ = self.fabric.remove_route(intf_end.intf, intf_end.cport, host_end.intf, host_end.cport);
            return Err(e);
        }
        Ok(())
    }

    /// Close a connection opened with [`Bus::open_connection`]
    pub fn close_connection(&self, host_cport: CportId) -> BusResult<()> {
        let connection = self
            .connections
            .get(host_cport)
            .ok_or_else(|| BusError::NotFound(format!("connection on host cport {}", host_cport)))?;
        if connection.protocol_id() == PROTOCOL_CONTROL {
            return Err(BusError::InvalidState("control connections close on detach".into()));
        }

        let host_end = CportAddr::new(HOST_INTERFACE_ID, host_cport);
        let intf_end = CportAddr::new(connection.intf(), connection.intf_cport());
        let _ = self.fabric.remove_route(host_end.intf, host_end.cport, intf_end.intf, intf_end.cport);
        let _ = self.fabric.remove_route(intf_end.intf, intf_end.cport, host_end.intf, host_end.cport);
        self.connections.destroy(host_cport)
    }

    fn control_connection(&self, intf: InterfaceId) -> BusResult<Arc<Connection>> {
        let interface = self
            .hotplug
            .interface(intf)
            .ok_or_else(|| BusError::NotFound(format!("interface {}", intf)))?;
        if interface.state() != InterfaceState::Active || !interface.is_authorized() {
            return Err(BusError::NotConnected);
        }
        interface
            .host_cport()
            .and_then(|cport| self.connections.get(cport))
            .ok_or(BusError::NotConnected)
    }

    /// Interface snapshots
    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.hotplug.interfaces()
    }

    /// Hotplug state of one interface
    pub fn interface_state(&self, intf: InterfaceId) -> Option<InterfaceState> {
        self.hotplug.state(intf)
    }

    /// Connection on a host cport
    pub fn connection(&self, host_cport: CportId) -> Option<Arc<Connection>> {
        self.connections.get(host_cport)
    }

    /// Connection snapshots
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.list()
    }

    /// Counters snapshot
    pub fn stats(&self) -> BusStats {
        BusStats {
            fabric: self.fabric.stats(),
            svc: self.svc.stats(),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            interfaces: self.hotplug.attached().len(),
            device_ids_in_use: self.hotplug.device_ids_in_use(),
            connections: self.connections.len(),
        }
    }

    /// Detach every interface, destroy all connections and cancel every
    /// pending operation
    pub async fn shutdown(&self) {
        let pending: Vec<_> = self
            .hotplug
            .attached()
            .into_iter()
            .map(|intf| (intf, self.interface_detached(intf)))
            .collect();
        for (intf, done) in pending {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(intf, error = %e, "detach on shutdown failed"),
                Err(_) => warn!(intf, "detach on shutdown dropped"),
            }
        }

        let destroyed = self.connections.destroy_all();
        let canceled = self.svc.cancel_all();
        for intf in [SVC_INTERFACE_ID, HOST_INTERFACE_ID] {
            let _ = self.fabric.remove_device(intf);
        }
        self.workers.retire_all();
        self.started.store(false, Ordering::SeqCst);

        info!(connections = destroyed, canceled, "bus shut down");
    }
}

fn unregister_transport(fabric: &RoutingFabric, intf: InterfaceId) {
    if let Ok(routes) = fabric.remove_device(intf) {
        debug!(intf, routes, "transport unregistered");
    }
}

impl FrameSink for Bus {
    fn deliver(&self, intf: InterfaceId, frame: Bytes) -> BusResult<()> {
        self.receive(intf, &frame)
    }
}
