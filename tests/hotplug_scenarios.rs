//! End-to-end hotplug and correlation scenarios

use async_trait::async_trait;
use bytes::Bytes;
use modsbus_core::core::interface::HOST_INTERFACE_ID;
use modsbus_core::core::message::{decode_frame, MessageHeader};
use modsbus_core::core::operation::Correlator;
use modsbus_core::core::protocol::control::TYPE_CONNECTED;
use modsbus_core::core::worker::WorkerPool;
use modsbus_core::{
    Bus, BusConfig, BusError, BusEvent, ChannelTransport, Connection, CportAddr, FrameSink,
    HotplugCompletion, InterfaceState, Message, ModuleProfile, OperationStatus, ProtocolHandler,
    ProtocolRegistry, ProtocolVersion, ReplyRule, RoutingFabric, SimulatedModule,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SLACK: Duration = Duration::from_millis(100);

async fn started_bus(config: BusConfig) -> Arc<Bus> {
    let bus = Bus::new(config).expect("bus");
    bus.start().await.expect("start");
    bus
}

fn plug(bus: &Arc<Bus>, intf: u8, profile: ModuleProfile) -> (HotplugCompletion, Arc<RwLock<modsbus_core::core::simulator::ModuleState>>) {
    let (transport, frames) = ChannelTransport::new(profile.name.clone());
    let module = SimulatedModule::new(profile);
    let state = module.state();
    let sink: Arc<dyn FrameSink> = bus.clone();
    module.spawn(intf, frames, sink);
    (bus.interface_attached(intf, Arc::new(transport)).expect("attach"), state)
}

fn drain(events: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn assert_routes_symmetric(fabric: &RoutingFabric) {
    for route in fabric.routes() {
        assert!(
            fabric.has_route(route.dst, route.src),
            "route {} -> {} has no reverse leg",
            route.src,
            route.dst
        );
    }
}

#[tokio::test]
async fn scenario_a_attach_reaches_active() {
    let bus = started_bus(BusConfig::default()).await;
    let mut events = bus.subscribe();

    let (done, module) = plug(&bus, 3, ModuleProfile::new("cam", 0x10, 0x20));
    done.await.unwrap().unwrap();

    let interface = bus.hotplug().interface(3).unwrap();
    assert_eq!(interface.state(), InterfaceState::Active);
    assert_eq!(interface.device_id(), Some(2));
    assert_eq!(interface.ids().map(|ids| (ids.vendor, ids.product)), Some((0x10, 0x20)));
    assert_eq!(module.read().device_id, Some(2));

    // Data routes up, temporary route gone
    let fabric = bus.fabric();
    assert!(fabric.has_route(CportAddr::new(HOST_INTERFACE_ID, 0), CportAddr::new(3, 2)));
    assert!(fabric.has_route(CportAddr::new(3, 2), CportAddr::new(HOST_INTERFACE_ID, 0)));
    assert_eq!(fabric.resolve(0, 3), None);
    assert_eq!(fabric.routes_for(3).len(), 2);
    assert_routes_symmetric(fabric);

    let seen = drain(&mut events);
    let states: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            BusEvent::InterfaceStateChanged { intf: 3, to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            InterfaceState::Identifying,
            InterfaceState::Routing,
            InterfaceState::DeviceIdAssigned,
            InterfaceState::Initializing,
            InterfaceState::Active,
        ]
    );
    assert!(seen
        .iter()
        .any(|e| matches!(e, BusEvent::ModuleAvailable { intf: 3, device_id: 2, .. })));
}

#[tokio::test]
async fn scenario_b_reverse_route_failure_unwinds() {
    let bus = started_bus(BusConfig::default()).await;
    bus.fabric().set_admission(Some(Arc::new(|src: CportAddr, dst: CportAddr| {
        !(src.intf == 3 && dst.intf == HOST_INTERFACE_ID)
    })));
    let mut events = bus.subscribe();

    let (done, _module) = plug(&bus, 3, ModuleProfile::new("cam", 0x10, 0x20));
    let result = done.await.unwrap();

    assert!(matches!(result, Err(BusError::InvalidState(_))));
    assert_eq!(bus.interface_state(3), Some(InterfaceState::Removed));
    assert!(bus.fabric().routes_for(3).is_empty());
    assert!(!bus.hotplug().is_device_id_allocated(2));
    assert_eq!(bus.stats().device_ids_in_use, 0);
    // Only the host side of the SVC link remains
    assert_eq!(bus.connections().len(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, BusEvent::AttachFailed { intf: 3, .. })));
    assert!(!bus.fabric().has_device(3));

    // The released id goes to the next module
    let (done, _module) = plug(&bus, 4, ModuleProfile::new("mic", 1, 1));
    done.await.unwrap().unwrap();
    assert_eq!(bus.hotplug().interface(4).unwrap().device_id(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn scenario_c_operation_times_out() {
    let bus = started_bus(BusConfig::default()).await;
    let (done, _module) = plug(&bus, 3, ModuleProfile::new("cam", 1, 1).rule(0x42, ReplyRule::Ignore));
    done.await.unwrap().unwrap();

    let host_cport = bus.hotplug().interface(3).unwrap().host_cport().unwrap();
    let control = bus.connection(host_cport).unwrap();

    let start = tokio::time::Instant::now();
    let result = control
        .send_sync_timeout(0x42, Bytes::new(), Duration::from_millis(500))
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(BusError::Timeout(500))));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(500) + SLACK);
    assert_eq!(control.pending_operations(), 0);
    assert_eq!(control.stats().timeouts, 1);
}

fn correlator_fixture() -> (Arc<RoutingFabric>, Arc<Correlator>, modsbus_core::core::transport::FrameReceiver) {
    let fabric = Arc::new(RoutingFabric::new());
    let (module, frames) = ChannelTransport::new("module");
    let (host, _host_frames) = ChannelTransport::new("host");
    fabric.add_device(3, Arc::new(module), 32).unwrap();
    fabric.add_device(HOST_INTERFACE_ID, Arc::new(host), 32).unwrap();
    fabric.add_route(HOST_INTERFACE_ID, 5, 3, 5).unwrap();
    fabric.add_route(3, 5, HOST_INTERFACE_ID, 5).unwrap();

    let workers = WorkerPool::try_current().unwrap();
    let correlator = Arc::new(Correlator::new("test", Arc::clone(&fabric), workers, HOST_INTERFACE_ID));
    (fabric, correlator, frames)
}

fn answer(correlator: &Correlator, frame: &[u8]) -> u16 {
    let (_, body) = decode_frame(frame).unwrap();
    let header = MessageHeader::parse(&body).unwrap();
    let response = Message::response(&header, OperationStatus::Success, Bytes::new()).unwrap();
    correlator.receive(5, &response.encode()).unwrap();
    header.operation_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_d_concurrent_ids_are_distinct() {
    let (_fabric, correlator, mut frames) = correlator_fixture();

    let a = {
        let c = Arc::clone(&correlator);
        tokio::spawn(async move { c.send_sync(5, 0x10, Bytes::new(), Duration::from_secs(5)).await })
    };
    let b = {
        let c = Arc::clone(&correlator);
        tokio::spawn(async move { c.send_sync(5, 0x10, Bytes::new(), Duration::from_secs(5)).await })
    };

    let first = frames.recv().await.unwrap();
    let second = frames.recv().await.unwrap();
    let id1 = answer(&correlator, &first);
    let id2 = answer(&correlator, &second);

    assert_ne!(id1, id2);
    assert_ne!(id1, 0);
    assert_ne!(id2, 0);
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn scenario_e_unknown_response_is_dropped() {
    let (_fabric, correlator, mut frames) = correlator_fixture();

    let pending = {
        let c = Arc::clone(&correlator);
        tokio::spawn(async move { c.send_sync(5, 0x10, Bytes::new(), Duration::from_secs(5)).await })
    };
    let request = frames.recv().await.unwrap();

    let stray = MessageHeader { size: 8, operation_id: 999, message_type: 0x10, result: 0 };
    let response = Message::response(&stray, OperationStatus::Success, Bytes::new()).unwrap();
    assert!(matches!(correlator.receive(5, &response.encode()), Err(BusError::NotFound(_))));
    assert_eq!(correlator.stats().unknown_responses, 1);
    assert_eq!(correlator.pending_count(), 1);

    answer(&correlator, &request);
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn detach_is_idempotent() {
    let bus = started_bus(BusConfig::default()).await;
    let (done, _module) = plug(&bus, 3, ModuleProfile::new("cam", 1, 1));
    done.await.unwrap().unwrap();

    bus.interface_detached(3).await.unwrap().unwrap();
    assert_eq!(bus.interface_state(3), Some(InterfaceState::Removed));
    assert!(bus.fabric().routes_for(3).is_empty());

    assert!(bus.hotplug().detach(3).await.is_ok());
    assert!(bus.hotplug().detach(9).await.is_ok());
    assert_eq!(bus.stats().device_ids_in_use, 0);
}

#[tokio::test]
async fn several_modules_keep_routes_symmetric() {
    let bus = started_bus(BusConfig::default()).await;
    let mut pending = Vec::new();
    for intf in 2..6 {
        pending.push(plug(&bus, intf, ModuleProfile::new("m", u32::from(intf), 1)));
    }
    for (done, _) in pending {
        done.await.unwrap().unwrap();
    }

    let mut device_ids: Vec<_> = (2..6)
        .map(|intf| bus.hotplug().interface(intf).unwrap().device_id().unwrap())
        .collect();
    device_ids.sort_unstable();
    assert_eq!(device_ids, vec![2, 3, 4, 5]);
    assert_routes_symmetric(bus.fabric());

    bus.interface_detached(3).await.unwrap().unwrap();
    assert_routes_symmetric(bus.fabric());
}

#[tokio::test]
async fn attach_limit_is_enforced() {
    let config = BusConfig { max_interfaces: 1, ..Default::default() };
    let bus = started_bus(config).await;

    let (done, _a) = plug(&bus, 3, ModuleProfile::new("a", 1, 1));
    done.await.unwrap().unwrap();
    let (done, _b) = plug(&bus, 4, ModuleProfile::new("b", 1, 1));
    assert!(matches!(done.await.unwrap(), Err(BusError::ResourceExhausted(_))));
}

#[tokio::test]
async fn failed_init_releases_device_id() {
    let bus = started_bus(BusConfig::default()).await;
    let profile = ModuleProfile::new("bad", 1, 1).rule(
        modsbus_core::core::protocol::control::TYPE_SET_DEVICE_ID,
        ReplyRule::Fail { status: OperationStatus::Malfunction.as_u8() },
    );

    let (done, _module) = plug(&bus, 3, profile);
    assert!(matches!(
        done.await.unwrap(),
        Err(BusError::Remote(OperationStatus::Malfunction))
    ));
    assert_eq!(bus.interface_state(3), Some(InterfaceState::Removed));
    assert!(bus.fabric().routes_for(3).is_empty());
    assert_eq!(bus.stats().device_ids_in_use, 0);
    assert_eq!(bus.connections().len(), 1);
}

#[tokio::test]
async fn newer_module_protocol_is_rejected() {
    let bus = started_bus(BusConfig::default()).await;
    let (done, _module) = plug(&bus, 3, ModuleProfile::new("future", 1, 1).control_version(1, 0));

    assert!(matches!(done.await.unwrap(), Err(BusError::Unsupported(_))));
    assert_eq!(bus.interface_state(3), Some(InterfaceState::Removed));
}

#[tokio::test]
async fn authorization_gate() {
    let config = BusConfig { require_authorization: true, ..Default::default() };
    let bus = started_bus(config).await;
    let mut events = bus.subscribe();

    let (done, _a) = plug(&bus, 3, ModuleProfile::new("a", 1, 1));
    done.await.unwrap().unwrap();
    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, BusEvent::AuthorizationRequired { intf: 3, .. })));
    assert!(!seen.iter().any(|e| matches!(e, BusEvent::ModuleAvailable { .. })));

    bus.authorize(3).await.unwrap().unwrap();
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, BusEvent::ModuleAvailable { intf: 3, device_id: 2, .. })));

    // Deny unwinds a second module
    let (done, _b) = plug(&bus, 4, ModuleProfile::new("b", 1, 1));
    done.await.unwrap().unwrap();
    bus.deny(4).await.unwrap().unwrap();
    assert_eq!(bus.interface_state(4), Some(InterfaceState::Removed));
    assert!(!bus.hotplug().is_device_id_allocated(3));
    assert!(!bus.fabric().has_device(4));

    // Authorized modules cannot be denied
    assert!(matches!(bus.deny(3).await.unwrap(), Err(BusError::InvalidState(_))));
}

struct SensorProtocol;

#[async_trait]
impl ProtocolHandler for SensorProtocol {
    fn name(&self) -> &str {
        "sensor"
    }

    fn id(&self) -> u8 {
        0x20
    }

    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::new(0, 1)
    }
}

#[tokio::test]
async fn open_connection_announces_cport() {
    let bus = started_bus(BusConfig::default()).await;
    bus.register_protocol(Arc::new(SensorProtocol)).unwrap();

    let (done, module) = plug(&bus, 3, ModuleProfile::new("sensor", 1, 1));
    done.await.unwrap().unwrap();

    let connection: Arc<Connection> = bus.open_connection(3, 6, 0x20).await.unwrap();
    assert_eq!(connection.remote_version(), Some(ProtocolVersion::new(0, 1)));
    assert_eq!(module.read().connected, vec![6]);
    assert_eq!(module.read().requests.get(&TYPE_CONNECTED), Some(&1));
    assert_eq!(bus.registry().refcount(0x20, ProtocolVersion::new(0, 1)), Some(1));

    // In use, so it stays registered
    assert!(bus.deregister_protocol(0x20, ProtocolVersion::new(0, 1)).is_err());

    bus.close_connection(connection.host_cport()).unwrap();
    assert!(!bus.fabric().has_route(CportAddr::new(3, 6), CportAddr::new(HOST_INTERFACE_ID, connection.host_cport())));
    bus.deregister_protocol(0x20, ProtocolVersion::new(0, 1)).unwrap();
}

#[tokio::test]
async fn detach_clears_data_connection_routes() {
    let bus = started_bus(BusConfig::default()).await;
    bus.register_protocol(Arc::new(SensorProtocol)).unwrap();

    let (done, _module) = plug(&bus, 3, ModuleProfile::new("sensor", 1, 1));
    done.await.unwrap().unwrap();
    let connection = bus.open_connection(3, 6, 0x20).await.unwrap();
    let host_cport = connection.host_cport();
    assert_eq!(bus.fabric().routes_for(3).len(), 4);

    // Transport stays registered; only hotplug state is torn down
    bus.hotplug().detach(3).await.unwrap();
    assert!(bus.fabric().has_device(3));
    assert!(bus.fabric().routes_for(3).is_empty());
    assert!(bus.connection(host_cport).is_none());
    assert_eq!(bus.registry().refcount(0x20, ProtocolVersion::new(0, 1)), Some(0));
    bus.deregister_protocol(0x20, ProtocolVersion::new(0, 1)).unwrap();
}

#[tokio::test]
async fn high_interface_ids_attach() {
    let bus = started_bus(BusConfig::default()).await;

    let (done, _module) = plug(&bus, 40, ModuleProfile::new("far", 1, 1));
    done.await.unwrap().unwrap();
    assert_eq!(bus.interface_state(40), Some(InterfaceState::Active));

    let (done, _module) = plug(&bus, 254, ModuleProfile::new("farthest", 2, 2));
    done.await.unwrap().unwrap();
    assert_eq!(bus.interface_state(254), Some(InterfaceState::Active));
    assert_routes_symmetric(bus.fabric());
}

struct Versioned(u8, u8);

#[async_trait]
impl ProtocolHandler for Versioned {
    fn name(&self) -> &str {
        "versioned"
    }

    fn id(&self) -> u8 {
        5
    }

    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.0, self.1)
    }
}

#[test]
fn registry_lookup_prefers_newest_version() {
    let registry = ProtocolRegistry::new();
    registry.register(Arc::new(Versioned(2, 1))).unwrap();
    registry.register(Arc::new(Versioned(1, 0))).unwrap();

    let handler = registry.lookup(5).unwrap();
    assert_eq!(handler.version(), ProtocolVersion::new(2, 1));
    assert!(matches!(
        registry.register(Arc::new(Versioned(1, 0))),
        Err(BusError::AlreadyExists(_))
    ));
}
