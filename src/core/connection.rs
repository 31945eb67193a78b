//! Connections
//!
//! A [`Connection`] binds a host cport to a cport on an interface and to
//! one protocol version from the registry. It owns a [`Correlator`], so
//! its pending operations die with it.
//!
//! State moves forward only:
//! `Disabled -> Enabled -> Error -> Destroying`, where `Error` is terminal
//! for the instance apart from teardown.

use super::error::{BusError, BusResult};
use super::id_pool::IdPool;
use super::interface::HOST_INTERFACE_ID;
use super::message::{
    CportId, Envelope, InterfaceId, Message, OperationStatus, MESSAGE_TYPE_PROTOCOL_VERSION,
};
use super::operation::{Correlator, OperationStats, RequestHandler};
use super::protocol::control::ControlRequest;
use super::protocol::{ProtocolHandler, ProtocolRegistry, ProtocolVersion, PROTOCOL_CONTROL};
use super::routing::RoutingFabric;
use super::transport::{SendHandle, Transport, TransportError};
use super::worker::WorkerPool;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, not yet usable
    Disabled,
    /// Usable for operations
    Enabled,
    /// Failed; only teardown remains
    Error,
    /// Being torn down
    Destroying,
}

impl ConnectionState {
    fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disabled, Enabled)
                | (Disabled, Error)
                | (Disabled, Destroying)
                | (Enabled, Error)
                | (Enabled, Destroying)
                | (Error, Destroying)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::Error => write!(f, "error"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

/// Host cport bound to an interface cport and a protocol
pub struct Connection {
    name: String,
    host_cport: CportId,
    intf: InterfaceId,
    intf_cport: CportId,
    handler: Arc<dyn ProtocolHandler>,
    remote_version: RwLock<Option<ProtocolVersion>>,
    state: RwLock<ConnectionState>,
    correlator: Correlator,
    timeout: Duration,
}

impl Connection {
    fn new(
        host_cport: CportId,
        intf: InterfaceId,
        intf_cport: CportId,
        handler: Arc<dyn ProtocolHandler>,
        fabric: Arc<RoutingFabric>,
        workers: WorkerPool,
        timeout: Duration,
    ) -> Arc<Self> {
        let name = format!("{}:{}/{}", intf, intf_cport, handler.name());
        let correlator = Correlator::new(name.clone(), fabric, workers, HOST_INTERFACE_ID);

        let connection = Arc::new(Self {
            name,
            host_cport,
            intf,
            intf_cport,
            handler,
            remote_version: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disabled),
            correlator,
            timeout,
        });

        connection.correlator.set_handler(Arc::new(ConnectionRequests {
            connection: Arc::downgrade(&connection),
        }));
        connection
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host side cport
    pub fn host_cport(&self) -> CportId {
        self.host_cport
    }

    /// Remote interface
    pub fn intf(&self) -> InterfaceId {
        self.intf
    }

    /// Cport on the remote interface
    pub fn intf_cport(&self) -> CportId {
        self.intf_cport
    }

    /// Bound protocol id
    pub fn protocol_id(&self) -> u8 {
        self.handler.id()
    }

    /// Locally implemented protocol version
    pub fn local_version(&self) -> ProtocolVersion {
        self.handler.version()
    }

    /// Version reported by the peer, once negotiated
    pub fn remote_version(&self) -> Option<ProtocolVersion> {
        *self.remote_version.read()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Default operation timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Operation counters
    pub fn stats(&self) -> OperationStats {
        self.correlator.stats()
    }

    /// Operations in flight
    pub fn pending_operations(&self) -> usize {
        self.correlator.pending_count()
    }

    fn set_state(&self, next: ConnectionState) -> BusResult<ConnectionState> {
        let mut state = self.state.write();
        if *state == next {
            return Ok(next);
        }
        if !state.can_transition_to(next) {
            return Err(BusError::InvalidState(format!("{}: {} -> {}", self.name, *state, next)));
        }

        let previous = *state;
        *state = next;
        debug!(conn = %self.name, from = %previous, to = %next, "connection state");
        Ok(previous)
    }

    /// Make the connection usable
    pub fn enable(&self) -> BusResult<()> {
        self.set_state(ConnectionState::Enabled).map(|_| ())
    }

    /// Mark the connection failed and abort its pending operations
    pub fn fail(&self, reason: &str) {
        if self.set_state(ConnectionState::Error).is_ok() {
            warn!(conn = %self.name, reason, "connection failed");
            self.correlator.cancel_all(&BusError::Canceled);
        }
    }

    fn ensure_enabled(&self) -> BusResult<()> {
        match self.state() {
            ConnectionState::Enabled => Ok(()),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Synchronous operation with the connection's default timeout
    pub async fn send_sync(&self, message_type: u8, payload: Bytes) -> BusResult<Message> {
        self.send_sync_timeout(message_type, payload, self.timeout).await
    }

    /// Synchronous operation with an explicit timeout
    pub async fn send_sync_timeout(
        &self,
        message_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> BusResult<Message> {
        self.ensure_enabled()?;
        self.correlator
            .send_sync(self.host_cport, message_type, payload, timeout)
            .await
    }

    /// Request that expects no response
    pub fn send_unidirectional(&self, message_type: u8, payload: Bytes) -> BusResult<()> {
        self.ensure_enabled()?;
        self.correlator.send_unidirectional(self.host_cport, message_type, payload)
    }

    /// Ask the peer for its protocol version and check it against ours
    pub async fn negotiate_version(&self) -> BusResult<ProtocolVersion> {
        let local = self.local_version();
        let response = self.send_sync(MESSAGE_TYPE_PROTOCOL_VERSION, local.encode()).await?;
        let remote = ProtocolVersion::decode(response.payload())?;

        local.check_remote(remote)?;
        *self.remote_version.write() = Some(remote);
        debug!(conn = %self.name, local = %local, remote = %remote, "version negotiated");
        Ok(remote)
    }

    /// Inbound message for this connection
    pub fn deliver(&self, raw: &[u8]) -> BusResult<()> {
        match self.state() {
            ConnectionState::Enabled => self.correlator.receive(self.host_cport, raw),
            state => {
                debug!(conn = %self.name, %state, "message on inactive connection dropped");
                Err(BusError::NotConnected)
            }
        }
    }

    fn teardown(&self) {
        if self.set_state(ConnectionState::Destroying).is_err() {
            return;
        }
        self.correlator.cancel_all(&BusError::Canceled);
        self.correlator.clear_handler();
        self.handler.connection_exit(self);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("host_cport", &self.host_cport)
            .field("state", &self.state())
            .finish()
    }
}

/// Routes inbound requests to the bound protocol handler
struct ConnectionRequests {
    connection: Weak<Connection>,
}

#[async_trait]
impl RequestHandler for ConnectionRequests {
    async fn handle_request(
        &self,
        message_type: u8,
        payload: Bytes,
    ) -> Result<Bytes, OperationStatus> {
        let connection = self.connection.upgrade().ok_or(OperationStatus::Nonexistent)?;
        connection.handler.request_recv(&connection, message_type, payload).await
    }
}

/// Connection snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host cport
    pub host_cport: CportId,
    /// Remote interface
    pub intf: InterfaceId,
    /// Remote cport
    pub intf_cport: CportId,
    /// Protocol id
    pub protocol: u8,
    /// Negotiated remote version
    pub remote_version: Option<ProtocolVersion>,
    /// State
    pub state: ConnectionState,
}

/// All host-side connections, keyed by host cport
pub struct ConnectionTable {
    fabric: Arc<RoutingFabric>,
    registry: Arc<ProtocolRegistry>,
    workers: WorkerPool,
    cports: IdPool,
    connections: RwLock<HashMap<CportId, Arc<Connection>>>,
    timeout: Duration,
}

impl ConnectionTable {
    /// Table allocating host cports from `0..cport_count`
    pub fn new(
        fabric: Arc<RoutingFabric>,
        registry: Arc<ProtocolRegistry>,
        workers: WorkerPool,
        cport_count: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            fabric,
            registry,
            workers,
            cports: IdPool::new("host cport", 0, cport_count.saturating_sub(1)),
            connections: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Bind a protocol to (intf, intf_cport) on a new host cport.
    ///
    /// `version` selects an exact protocol version; `None` takes the newest.
    /// `host_cport` pins the host side; `None` allocates the lowest free one.
    /// Routes are not touched.
    pub fn create(
        &self,
        intf: InterfaceId,
        intf_cport: CportId,
        protocol_id: u8,
        version: Option<ProtocolVersion>,
        host_cport: Option<CportId>,
    ) -> BusResult<Arc<Connection>> {
        let version = match version {
            Some(version) => version,
            None => self
                .registry
                .lookup(protocol_id)
                .map(|handler| handler.version())
                .ok_or_else(|| BusError::NotFound(format!("protocol 0x{:02x}", protocol_id)))?,
        };
        let handler = self.registry.acquire(protocol_id, version)?;

        let cport = match host_cport {
            Some(cport) => self.cports.reserve(cport).map(|_| cport),
            None => self.cports.allocate(),
        };
        let cport = match cport {
            Ok(cport) => cport,
            Err(e) => {
                self.registry.release(protocol_id, version);
                return Err(e);
            }
        };

        let connection = Connection::new(
            cport,
            intf,
            intf_cport,
            handler,
            Arc::clone(&self.fabric),
            self.workers.clone(),
            self.timeout,
        );
        self.connections.write().insert(cport, Arc::clone(&connection));

        debug!(conn = %connection.name(), host_cport = cport, "connection created");
        Ok(connection)
    }

    /// Enable, negotiate the version, announce the cport over `control`
    /// and run the protocol's init hook. Any failure leaves the connection
    /// in `Error`.
    pub async fn init(&self, connection: &Arc<Connection>, control: Option<&Connection>) -> BusResult<()> {
        let result = self.try_init(connection, control).await;
        if let Err(e) = &result {
            connection.fail(&e.to_string());
        }
        result
    }

    async fn try_init(&self, connection: &Connection, control: Option<&Connection>) -> BusResult<()> {
        connection.enable()?;
        connection.negotiate_version().await?;

        if connection.protocol_id() != PROTOCOL_CONTROL {
            if let Some(control) = control {
                let request = ControlRequest::Connected { cport: connection.intf_cport() };
                control.send_sync(request.message_type(), request.payload()).await?;
            }
        }

        connection.handler.connection_init(connection).await?;
        info!(
            conn = %connection.name(),
            host_cport = connection.host_cport(),
            version = %connection.remote_version().unwrap_or_default(),
            "connection ready"
        );
        Ok(())
    }

    /// Tear down a connection and free its host cport and protocol reference
    pub fn destroy(&self, host_cport: CportId) -> BusResult<()> {
        let connection = self
            .connections
            .write()
            .remove(&host_cport)
            .ok_or_else(|| BusError::NotFound(format!("connection on host cport {}", host_cport)))?;

        connection.teardown();
        self.registry.release(connection.protocol_id(), connection.local_version());
        self.cports.release(host_cport);

        debug!(conn = %connection.name(), host_cport, "connection destroyed");
        Ok(())
    }

    /// Destroy every connection to an interface; returns how many
    pub fn destroy_interface(&self, intf: InterfaceId) -> usize {
        let cports: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| c.intf() == intf)
            .map(|c| c.host_cport())
            .collect();

        cports.iter().filter(|cport| self.destroy(**cport).is_ok()).count()
    }

    /// Destroy everything
    pub fn destroy_all(&self) -> usize {
        let cports: Vec<_> = self.connections.read().keys().copied().collect();
        cports.iter().filter(|cport| self.destroy(**cport).is_ok()).count()
    }

    /// Connection on a host cport
    pub fn get(&self, host_cport: CportId) -> Option<Arc<Connection>> {
        self.connections.read().get(&host_cport).cloned()
    }

    /// Connections to an interface
    pub fn for_interface(&self, intf: InterfaceId) -> Vec<Arc<Connection>> {
        let mut found: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| c.intf() == intf)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.host_cport());
        found
    }

    /// Hand an inbound message to the connection on `host_cport`
    pub fn deliver(&self, host_cport: CportId, raw: &[u8]) -> BusResult<()> {
        let connection = self
            .get(host_cport)
            .ok_or_else(|| BusError::NotFound(format!("connection on host cport {}", host_cport)))?;
        connection.deliver(raw)
    }

    /// Snapshot of all connections
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<_> = self
            .connections
            .read()
            .values()
            .map(|c| ConnectionInfo {
                host_cport: c.host_cport(),
                intf: c.intf(),
                intf_cport: c.intf_cport(),
                protocol: c.protocol_id(),
                remote_version: c.remote_version(),
                state: c.state(),
            })
            .collect();
        all.sort_by_key(|c| c.host_cport);
        all
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Host cports currently allocated
    pub fn cports_in_use(&self) -> usize {
        self.cports.in_use()
    }
}

/// Transport registered for the host interface; delivers frames straight
/// into the connection table
pub struct HostEndpoint {
    connections: Weak<ConnectionTable>,
    next_handle: AtomicU64,
}

impl HostEndpoint {
    /// Endpoint delivering into `connections`
    pub fn new(connections: &Arc<ConnectionTable>) -> Self {
        Self {
            connections: Arc::downgrade(connections),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl Transport for HostEndpoint {
    fn send(&self, envelope: &Envelope, message: &[u8]) -> Result<SendHandle, TransportError> {
        let connections = self.connections.upgrade().ok_or(TransportError::Disconnected)?;
        connections
            .deliver(envelope.dest_cport, message)
            .map_err(|e| TransportError::SendError(e.to_string()))?;
        Ok(SendHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn cancel(&self, _handle: SendHandle) {
        // Delivery is synchronous; nothing is ever queued
    }

    fn describe(&self) -> String {
        "host".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::decode_frame;
    use crate::core::protocol::control::{ControlProtocol, CONTROL_VERSION};
    use crate::core::transport::{ChannelTransport, FrameReceiver};

    const MODULE: InterfaceId = 3;

    struct Fixture {
        fabric: Arc<RoutingFabric>,
        registry: Arc<ProtocolRegistry>,
        table: Arc<ConnectionTable>,
        module_rx: FrameReceiver,
    }

    fn fixture() -> Fixture {
        let fabric = Arc::new(RoutingFabric::new());
        let registry = Arc::new(ProtocolRegistry::new());
        registry.register(Arc::new(ControlProtocol::new())).unwrap();

        let table = Arc::new(ConnectionTable::new(
            Arc::clone(&fabric),
            Arc::clone(&registry),
            WorkerPool::try_current().unwrap(),
            32,
            Duration::from_millis(200),
        ));
        fabric.add_device(HOST_INTERFACE_ID, Arc::new(HostEndpoint::new(&table)), 32).unwrap();

        let (module, module_rx) = ChannelTransport::new("module");
        fabric.add_device(MODULE, Arc::new(module), 32).unwrap();

        Fixture { fabric, registry, table, module_rx }
    }

    fn route_pair(fabric: &RoutingFabric, host_cport: CportId, intf_cport: CportId) {
        fabric.add_route(HOST_INTERFACE_ID, host_cport, MODULE, intf_cport).unwrap();
        fabric.add_route(MODULE, intf_cport, HOST_INTERFACE_ID, host_cport).unwrap();
    }

    /// Module side: answer every request with `version`
    fn answer_versions(fabric: Arc<RoutingFabric>, mut rx: FrameReceiver, version: ProtocolVersion) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let (env, body) = decode_frame(&frame).unwrap();
                let request = Message::decode(&body).unwrap();
                let response = Message::response(request.header(), OperationStatus::Success, version.encode()).unwrap();
                let _ = fabric.forward(MODULE, env.dest_cport, &response.encode());
            }
        });
    }

    #[tokio::test]
    async fn test_create_takes_reference_and_cport() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();

        assert_eq!(conn.host_cport(), 0);
        assert_eq!(conn.state(), ConnectionState::Disabled);
        assert_eq!(f.registry.refcount(PROTOCOL_CONTROL, CONTROL_VERSION), Some(1));

        f.table.destroy(0).unwrap();
        assert_eq!(f.registry.refcount(PROTOCOL_CONTROL, CONTROL_VERSION), Some(0));
        assert_eq!(f.table.cports_in_use(), 0);
        assert!(f.table.destroy(0).is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        let f = fixture();
        assert!(matches!(f.table.create(MODULE, 2, 0x42, None, None), Err(BusError::NotFound(_))));
        assert_eq!(f.table.cports_in_use(), 0);
    }

    #[tokio::test]
    async fn test_pinned_cport_conflict_releases_protocol() {
        let f = fixture();
        f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, Some(31)).unwrap();
        assert!(f.table.create(MODULE, 3, PROTOCOL_CONTROL, None, Some(31)).is_err());
        assert_eq!(f.registry.refcount(PROTOCOL_CONTROL, CONTROL_VERSION), Some(1));
    }

    #[tokio::test]
    async fn test_init_negotiates_version() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        route_pair(&f.fabric, conn.host_cport(), 2);
        answer_versions(Arc::clone(&f.fabric), f.module_rx, ProtocolVersion::new(0, 3));

        f.table.init(&conn, None).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Enabled);
        assert_eq!(conn.remote_version(), Some(ProtocolVersion::new(0, 3)));
    }

    #[tokio::test]
    async fn test_newer_major_is_unsupported() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        route_pair(&f.fabric, conn.host_cport(), 2);
        answer_versions(Arc::clone(&f.fabric), f.module_rx, ProtocolVersion::new(1, 0));

        let err = f.table.init(&conn, None).await.unwrap_err();
        assert!(matches!(err, BusError::Unsupported(_)));
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_fails_init() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        route_pair(&f.fabric, conn.host_cport(), 2);

        let err = f.table.init(&conn, None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(matches!(conn.send_sync(0x02, Bytes::new()).await, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_destroy_cancels_pending() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        route_pair(&f.fabric, conn.host_cport(), 2);
        conn.enable().unwrap();

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_sync_timeout(0x7f, Bytes::new(), Duration::from_secs(30)).await })
        };
        while conn.pending_operations() == 0 {
            tokio::task::yield_now().await;
        }

        f.table.destroy(conn.host_cport()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap_err(), BusError::Canceled);
        assert_eq!(conn.state(), ConnectionState::Destroying);
    }

    #[tokio::test]
    async fn test_host_answers_control_requests() {
        let mut f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        route_pair(&f.fabric, conn.host_cport(), 2);
        conn.enable().unwrap();

        let mut req = Message::request(0x01, CONTROL_VERSION.encode()).unwrap();
        req.set_operation_id(5);
        f.fabric.forward(MODULE, 2, &req.encode()).unwrap();

        let frame = f.module_rx.recv().await.unwrap();
        let (_, body) = decode_frame(&frame).unwrap();
        let resp = Message::decode(&body).unwrap();
        assert_eq!(resp.operation_id(), 5);
        assert_eq!(ProtocolVersion::decode(resp.payload()).unwrap(), CONTROL_VERSION);
    }

    #[tokio::test]
    async fn test_delivery_to_disabled_connection_dropped() {
        let f = fixture();
        let conn = f.table.create(MODULE, 2, PROTOCOL_CONTROL, None, None).unwrap();
        assert!(matches!(conn.deliver(&[0u8; 8]), Err(BusError::NotConnected)));
        assert!(f.table.deliver(30, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_state_is_forward_only() {
        use ConnectionState::*;
        assert!(Enabled.can_transition_to(Error));
        assert!(!Error.can_transition_to(Enabled));
        assert!(!Destroying.can_transition_to(Enabled));
        assert!(!Enabled.can_transition_to(Disabled));
    }
}
