//! SVC channel
//!
//! The supervisory endpoint lives on interface 0. It owns route management
//! requests (`CONN_CREATE`/`CONN_DESTROY`), probes the host at startup and
//! talks to new interfaces over temporary control routes while they are
//! being identified.

use super::error::{BusError, BusResult};
use super::interface::{HOST_INTERFACE_ID, SVC_INTERFACE_ID};
use super::message::{CportId, Envelope, InterfaceId, Message, OperationStatus};
use super::operation::{Correlator, OperationStats, RequestHandler};
use super::protocol::control::{ControlRequest, InterfaceIds};
use super::protocol::svc::{ConnectionEnds, SvcRequest, SVC_VERSION};
use super::protocol::ProtocolVersion;
use super::routing::{CportAddr, RoutingFabric};
use super::transport::{SendHandle, Transport, TransportError};
use super::worker::WorkerPool;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SVC cport facing the host
pub const SVC_HOST_CPORT: CportId = 0;

/// Cports on the SVC endpoint. The temporary control route of an
/// interface uses the SVC cport equal to its interface id, so every
/// `InterfaceId` needs one.
pub const SVC_CPORT_COUNT: u16 = 1 << 8;

/// Supervisory channel settings
#[derive(Debug, Clone)]
pub struct SvcSettings {
    /// Timeout for SVC operations
    pub timeout: Duration,
    /// Host cport bound to the SVC protocol
    pub host_svc_cport: CportId,
    /// Endo id announced in `HELLO`
    pub endo_id: u16,
}

/// Supervisory endpoint on interface 0
pub struct SvcChannel {
    fabric: Arc<RoutingFabric>,
    correlator: Correlator,
    settings: SvcSettings,
}

impl SvcChannel {
    /// Create the channel; install [`SvcEndpoint`] as interface 0's transport
    pub fn new(fabric: Arc<RoutingFabric>, workers: WorkerPool, settings: SvcSettings) -> Arc<Self> {
        let correlator = Correlator::new("svc", Arc::clone(&fabric), workers, SVC_INTERFACE_ID);
        let channel = Arc::new(Self { fabric, correlator, settings });

        channel.correlator.set_handler(Arc::new(SvcRequests {
            channel: Arc::downgrade(&channel),
        }));
        channel
    }

    /// Settings
    pub fn settings(&self) -> &SvcSettings {
        &self.settings
    }

    /// Operation counters
    pub fn stats(&self) -> OperationStats {
        self.correlator.stats()
    }

    /// Operations in flight
    pub fn pending_operations(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Synchronous operation from SVC cport `src_cport` to
    /// (`dest_if`, `dest_cport`). The route from `src_cport` must lead there.
    pub async fn send_sync(
        &self,
        dest_if: InterfaceId,
        dest_cport: CportId,
        src_cport: CportId,
        message_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> BusResult<Message> {
        let expected = CportAddr::new(dest_if, dest_cport);
        match self.fabric.resolve(SVC_INTERFACE_ID, src_cport) {
            Some(dst) if dst == expected => {}
            Some(dst) => {
                return Err(BusError::NotFound(format!(
                    "svc cport {} routes to {}, not {}",
                    src_cport, dst, expected
                )))
            }
            None => return Err(BusError::NotFound(format!("no route from svc cport {}", src_cport))),
        }

        self.correlator.send_sync(src_cport, message_type, payload, timeout).await
    }

    /// Inbound message addressed to SVC cport `cport`
    pub fn deliver(&self, cport: CportId, raw: &[u8]) -> BusResult<()> {
        self.correlator.receive(cport, raw)
    }

    /// Create the route pair between two endpoints, removing the first leg
    /// if the second cannot be added
    pub fn connect(&self, ends: ConnectionEnds) -> BusResult<()> {
        let a = CportAddr::new(ends.intf1, ends.cport1);
        let b = CportAddr::new(ends.intf2, ends.cport2);

        self.fabric.add_route(a.intf, a.cport, b.intf, b.cport)?;
        if let Err(e) = self.fabric.add_route(b.intf, b.cport, a.intf, a.cport) {
            warn!(%a, %b, error = %e, "reverse route failed, rolling back");
            if let Err(rollback) = self.fabric.remove_route(a.intf, a.cport, b.intf, b.cport) {
                warn!(%a, %b, error = %rollback, "rollback of forward route failed");
            }
            return Err(e);
        }

        info!(%a, %b, "connection created");
        Ok(())
    }

    /// Remove both legs of a route pair. Both are attempted; the first
    /// failure is returned.
    pub fn disconnect(&self, ends: ConnectionEnds) -> BusResult<()> {
        let forward = self.fabric.remove_route(ends.intf1, ends.cport1, ends.intf2, ends.cport2);
        let reverse = self.fabric.remove_route(ends.intf2, ends.cport2, ends.intf1, ends.cport1);

        debug!(
            a = %CportAddr::new(ends.intf1, ends.cport1),
            b = %CportAddr::new(ends.intf2, ends.cport2),
            "connection destroyed"
        );
        forward.and(reverse)
    }

    /// Endpoints of the temporary control route for an interface. The SVC
    /// side uses the interface id as its cport.
    pub fn control_ends(intf: InterfaceId, control_cport: CportId) -> ConnectionEnds {
        ConnectionEnds {
            intf1: SVC_INTERFACE_ID,
            cport1: CportId::from(intf),
            intf2: intf,
            cport2: control_cport,
        }
    }

    /// Read identifiers from a new interface over its temporary control route
    pub async fn identify(&self, intf: InterfaceId, control_cport: CportId) -> BusResult<InterfaceIds> {
        let request = ControlRequest::GetIds;
        let response = self
            .send_sync(
                intf,
                control_cport,
                CportId::from(intf),
                request.message_type(),
                request.payload(),
                self.settings.timeout,
            )
            .await?;
        InterfaceIds::decode(response.payload())
    }

    /// Bring up the SVC link to the host: route pair, version check, hello
    pub async fn probe_host(&self) -> BusResult<ProtocolVersion> {
        let ends = ConnectionEnds {
            intf1: SVC_INTERFACE_ID,
            cport1: SVC_HOST_CPORT,
            intf2: HOST_INTERFACE_ID,
            cport2: self.settings.host_svc_cport,
        };
        self.connect(ends)?;

        let result = self.greet_host().await;
        if result.is_err() {
            let _ = self.disconnect(ends);
        }
        result
    }

    async fn greet_host(&self) -> BusResult<ProtocolVersion> {
        let host_cport = self.settings.host_svc_cport;
        let timeout = self.settings.timeout;

        let version = SvcRequest::ProtocolVersion(SVC_VERSION);
        let response = self
            .send_sync(
                HOST_INTERFACE_ID,
                host_cport,
                SVC_HOST_CPORT,
                version.message_type(),
                version.payload(),
                timeout,
            )
            .await?;
        let host_version = ProtocolVersion::decode(response.payload())?;
        SVC_VERSION.check_remote(host_version)?;
        info!(version = %host_version, "host svc version");

        let hello = SvcRequest::Hello { endo_id: self.settings.endo_id, intf: HOST_INTERFACE_ID };
        self.send_sync(
            HOST_INTERFACE_ID,
            host_cport,
            SVC_HOST_CPORT,
            hello.message_type(),
            hello.payload(),
            timeout,
        )
        .await?;

        Ok(host_version)
    }

    /// Tell the host about an interface event. Best effort.
    pub async fn notify_host(&self, request: SvcRequest) {
        let result = self
            .send_sync(
                HOST_INTERFACE_ID,
                self.settings.host_svc_cport,
                SVC_HOST_CPORT,
                request.message_type(),
                request.payload(),
                self.settings.timeout,
            )
            .await;
        if let Err(e) = result {
            debug!(msg_type = request.message_type(), error = %e, "host notification failed");
        }
    }

    /// Abort everything in flight
    pub fn cancel_all(&self) -> usize {
        self.correlator.cancel_all(&BusError::Canceled)
    }

    fn handle_request(&self, request: SvcRequest) -> Result<Bytes, OperationStatus> {
        match request {
            SvcRequest::ProtocolVersion(remote) => {
                SVC_VERSION.check_remote(remote).map_err(|e| e.status())?;
                Ok(SVC_VERSION.encode())
            }
            SvcRequest::ConnCreate(ends) => self.connect(ends).map(|_| Bytes::new()).map_err(|e| e.status()),
            SvcRequest::ConnDestroy(ends) => self.disconnect(ends).map(|_| Bytes::new()).map_err(|e| e.status()),
            SvcRequest::IntfDeviceId { intf, device_id } => {
                debug!(intf, device_id, "device id notice");
                Ok(Bytes::new())
            }
            SvcRequest::IntfReset { intf } => {
                debug!(intf, "interface reset request");
                Ok(Bytes::new())
            }
            // SVC-originated messages are never valid requests to the SVC
            SvcRequest::IntfHotplug { .. } | SvcRequest::IntfHotUnplug { .. } | SvcRequest::Hello { .. } => {
                Err(OperationStatus::Invalid)
            }
        }
    }
}

struct SvcRequests {
    channel: Weak<SvcChannel>,
}

#[async_trait]
impl RequestHandler for SvcRequests {
    async fn handle_request(&self, message_type: u8, payload: Bytes) -> Result<Bytes, OperationStatus> {
        let channel = self.channel.upgrade().ok_or(OperationStatus::Nonexistent)?;
        let request = SvcRequest::decode(message_type, &payload).map_err(|e| {
            warn!(msg_type = message_type, error = %e, "bad svc request");
            OperationStatus::Invalid
        })?;
        channel.handle_request(request)
    }
}

/// Transport registered for interface 0; delivers into the SVC channel
pub struct SvcEndpoint {
    channel: Weak<SvcChannel>,
    next_handle: AtomicU64,
}

impl SvcEndpoint {
    /// Endpoint delivering into `channel`
    pub fn new(channel: &Arc<SvcChannel>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl Transport for SvcEndpoint {
    fn send(&self, envelope: &Envelope, message: &[u8]) -> Result<SendHandle, TransportError> {
        let channel = self.channel.upgrade().ok_or(TransportError::Disconnected)?;
        channel
            .deliver(envelope.dest_cport, message)
            .map_err(|e| TransportError::SendError(e.to_string()))?;
        Ok(SendHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn cancel(&self, _handle: SendHandle) {}

    fn describe(&self) -> String {
        "svc".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::decode_frame;
    use crate::core::transport::{ChannelTransport, FrameReceiver};

    const MODULE: InterfaceId = 3;

    fn setup() -> (Arc<RoutingFabric>, Arc<SvcChannel>, FrameReceiver) {
        let fabric = Arc::new(RoutingFabric::new());
        let settings = SvcSettings {
            timeout: Duration::from_millis(300),
            host_svc_cport: 31,
            endo_id: 0x4755,
        };
        let channel = SvcChannel::new(Arc::clone(&fabric), WorkerPool::try_current().unwrap(), settings);
        fabric.add_device(SVC_INTERFACE_ID, Arc::new(SvcEndpoint::new(&channel)), 32).unwrap();

        let (module, rx) = ChannelTransport::new("module");
        fabric.add_device(MODULE, Arc::new(module), 32).unwrap();
        let (host, _host_rx) = ChannelTransport::new("host");
        fabric.add_device(HOST_INTERFACE_ID, Arc::new(host), 32).unwrap();

        (fabric, channel, rx)
    }

    #[tokio::test]
    async fn test_connect_rolls_back_first_leg() {
        let (fabric, channel, _rx) = setup();
        // Occupy the reverse leg's source so the second add fails
        fabric.add_route(MODULE, 2, HOST_INTERFACE_ID, 9).unwrap();

        let ends = ConnectionEnds { intf1: HOST_INTERFACE_ID, cport1: 0, intf2: MODULE, cport2: 2 };
        assert!(matches!(channel.connect(ends), Err(BusError::AlreadyExists(_))));
        assert_eq!(fabric.resolve(HOST_INTERFACE_ID, 0), None);
    }

    #[tokio::test]
    async fn test_disconnect_removes_both_legs() {
        let (fabric, channel, _rx) = setup();
        let ends = ConnectionEnds { intf1: HOST_INTERFACE_ID, cport1: 4, intf2: MODULE, cport2: 5 };
        channel.connect(ends).unwrap();
        assert_eq!(fabric.route_count(), 2);

        channel.disconnect(ends).unwrap();
        assert_eq!(fabric.route_count(), 0);
        assert!(channel.disconnect(ends).is_err());
    }

    #[tokio::test]
    async fn test_send_sync_checks_route_destination() {
        let (_fabric, channel, _rx) = setup();
        channel.connect(SvcChannel::control_ends(MODULE, 2)).unwrap();

        let err = channel
            .send_sync(MODULE, 7, 3, 0x7f, Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_identify_over_temporary_route() {
        let (fabric, channel, mut rx) = setup();
        channel.connect(SvcChannel::control_ends(MODULE, 2)).unwrap();

        let module_fabric = Arc::clone(&fabric);
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let (env, body) = decode_frame(&frame).unwrap();
            assert_eq!(env.src_cport, CportId::from(MODULE));
            let request = Message::decode(&body).unwrap();
            let ids = InterfaceIds::new(0x10, 0x20).encode();
            let response = Message::response(request.header(), OperationStatus::Success, ids).unwrap();
            module_fabric.forward(MODULE, env.dest_cport, &response.encode()).unwrap();
        });

        let ids = channel.identify(MODULE, 2).await.unwrap();
        assert_eq!((ids.vendor, ids.product), (0x10, 0x20));
    }

    #[tokio::test]
    async fn test_conn_create_request_from_host() {
        let (fabric, channel, _rx) = setup();
        channel.connect(ConnectionEnds { intf1: SVC_INTERFACE_ID, cport1: 0, intf2: HOST_INTERFACE_ID, cport2: 31 }).unwrap();

        let ends = ConnectionEnds { intf1: HOST_INTERFACE_ID, cport1: 6, intf2: MODULE, cport2: 6 };
        assert_eq!(channel.handle_request(SvcRequest::ConnCreate(ends)), Ok(Bytes::new()));
        assert!(fabric.has_route(CportAddr::new(MODULE, 6), CportAddr::new(HOST_INTERFACE_ID, 6)));

        // Same pair again collides
        assert_eq!(channel.handle_request(SvcRequest::ConnCreate(ends)), Err(OperationStatus::Invalid));
        assert_eq!(channel.handle_request(SvcRequest::ConnDestroy(ends)), Ok(Bytes::new()));
        assert_eq!(
            channel.handle_request(SvcRequest::ConnDestroy(ends)),
            Err(OperationStatus::Nonexistent)
        );
        assert_eq!(
            channel.handle_request(SvcRequest::Hello { endo_id: 1, intf: 1 }),
            Err(OperationStatus::Invalid)
        );
    }
}
