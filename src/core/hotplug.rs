//! Hotplug state machine
//!
//! Drives an interface from link attach to `Active` and back to `Removed`:
//!
//! 1. `Unidentified -> Identifying`: temporary control route pair between
//!    the SVC and the interface's control cport
//! 2. `Identifying -> Routing`: `GET_IDS` over the temporary route
//! 3. `Routing -> DeviceIdAssigned`: temporary route removed, device id
//!    allocated, control connection created, host <-> interface data routes
//! 4. `DeviceIdAssigned -> Initializing -> Active`: connection init and
//!    `SET_DEVICE_ID`
//!
//! Every acquired resource is pushed on an unwind stack; any failure
//! releases the stack in reverse order and ends in `Removed`. Detach is
//! idempotent.
//!
//! All methods that wait must run on a worker, never on the delivery path.

use super::bus::BusEvent;
use super::connection::ConnectionTable;
use super::error::{BusError, BusResult};
use super::id_pool::IdPool;
use super::interface::{
    Interface, InterfaceInfo, InterfaceState, HOST_INTERFACE_ID, SVC_INTERFACE_ID,
};
use super::message::{CportId, InterfaceId};
use super::protocol::control::{ControlRequest, InterfaceIds};
use super::protocol::svc::SvcRequest;
use super::protocol::PROTOCOL_CONTROL;
use super::routing::{CportAddr, RoutingFabric};
use super::svc::SvcChannel;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Hotplug policy and limits
#[derive(Debug, Clone)]
pub struct HotplugSettings {
    /// Control cport on every interface
    pub control_cport: CportId,
    /// Hold back "module available" until authorized
    pub require_authorization: bool,
    /// Maximum interfaces attached at once
    pub max_interfaces: usize,
}

/// Resource acquired during attach, released in reverse on failure
#[derive(Debug, Clone, Copy)]
enum Acquired {
    RouteLeg { src: CportAddr, dst: CportAddr },
    DeviceId(u8),
    Connection(CportId),
}

/// Orchestrates interface attach and detach
pub struct HotplugManager {
    fabric: Arc<RoutingFabric>,
    svc: Arc<SvcChannel>,
    connections: Arc<ConnectionTable>,
    device_ids: IdPool,
    interfaces: RwLock<HashMap<InterfaceId, Interface>>,
    events: broadcast::Sender<BusEvent>,
    settings: HotplugSettings,
}

impl HotplugManager {
    /// Create the manager
    pub fn new(
        fabric: Arc<RoutingFabric>,
        svc: Arc<SvcChannel>,
        connections: Arc<ConnectionTable>,
        device_ids: IdPool,
        events: broadcast::Sender<BusEvent>,
        settings: HotplugSettings,
    ) -> Self {
        Self {
            fabric,
            svc,
            connections,
            device_ids,
            interfaces: RwLock::new(HashMap::new()),
            events,
            settings,
        }
    }

    /// Settings
    pub fn settings(&self) -> &HotplugSettings {
        &self.settings
    }

    /// Current state of an interface
    pub fn state(&self, intf: InterfaceId) -> Option<InterfaceState> {
        self.interfaces.read().get(&intf).map(Interface::state)
    }

    /// Snapshot of one interface
    pub fn interface(&self, intf: InterfaceId) -> Option<Interface> {
        self.interfaces.read().get(&intf).cloned()
    }

    /// Snapshots of all known interfaces, including removed ones
    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        let mut all: Vec<_> = self.interfaces.read().values().map(Interface::info).collect();
        all.sort_by_key(|i| i.id);
        all
    }

    /// Device ids currently assigned
    pub fn device_ids_in_use(&self) -> usize {
        self.device_ids.in_use()
    }

    /// Is this device id currently assigned?
    pub fn is_device_id_allocated(&self, device_id: u8) -> bool {
        self.device_ids.is_allocated(u16::from(device_id))
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, intf: InterfaceId, next: InterfaceState, reason: Option<&str>) -> BusResult<()> {
        let from = {
            let mut interfaces = self.interfaces.write();
            let interface = interfaces
                .get_mut(&intf)
                .ok_or_else(|| BusError::NotFound(format!("interface {}", intf)))?;
            let from = interface.state();
            interface.transition(next, reason)?;
            from
        };

        info!(intf, from = %from, to = %next, reason = reason.unwrap_or(""), "interface state");
        self.emit(BusEvent::InterfaceStateChanged { intf, from, to: next });
        Ok(())
    }

    fn update<F>(&self, intf: InterfaceId, f: F)
    where
        F: FnOnce(&mut Interface),
    {
        if let Some(interface) = self.interfaces.write().get_mut(&intf) {
            f(interface);
        }
    }

    fn admit(&self, intf: InterfaceId) -> BusResult<()> {
        if intf == SVC_INTERFACE_ID || intf == HOST_INTERFACE_ID {
            return Err(BusError::InvalidState(format!("interface {} is reserved", intf)));
        }
        if !self.fabric.has_device(intf) {
            return Err(BusError::NotFound(format!("no transport for interface {}", intf)));
        }

        let mut interfaces = self.interfaces.write();
        if let Some(existing) = interfaces.get(&intf) {
            if !existing.state().is_terminal() {
                return Err(BusError::AlreadyExists(format!(
                    "interface {} is {}",
                    intf,
                    existing.state()
                )));
            }
        }

        let attached = interfaces.values().filter(|i| !i.state().is_terminal()).count();
        if attached >= self.settings.max_interfaces {
            return Err(BusError::ResourceExhausted(format!(
                "{} interfaces attached",
                attached
            )));
        }

        interfaces.insert(intf, Interface::new(intf, self.settings.control_cport));
        Ok(())
    }

    /// Run the full attach sequence for an interface whose transport is
    /// already registered with the fabric
    pub async fn attach(&self, intf: InterfaceId) -> BusResult<()> {
        self.admit(intf)?;
        info!(intf, "interface attached, identifying");

        let mut acquired = Vec::new();
        match self.attach_steps(intf, &mut acquired).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.unwind(intf, acquired);
                let reason = e.to_string();
                if let Err(te) = self.transition(intf, InterfaceState::Removed, Some(&reason)) {
                    warn!(intf, error = %te, "could not mark interface removed");
                }
                warn!(intf, error = %e, "attach failed");
                self.emit(BusEvent::AttachFailed { intf, error: reason });
                Err(e)
            }
        }
    }

    async fn attach_steps(&self, intf: InterfaceId, acquired: &mut Vec<Acquired>) -> BusResult<()> {
        let control_cport = self.settings.control_cport;
        let svc_end = CportAddr::new(SVC_INTERFACE_ID, CportId::from(intf));
        let control_end = CportAddr::new(intf, control_cport);

        // Identify over a temporary route
        self.transition(intf, InterfaceState::Identifying, None)?;
        self.add_leg(acquired, svc_end, control_end, None)?;
        self.add_leg(acquired, control_end, svc_end, None)?;

        let ids = self.svc.identify(intf, control_cport).await?;
        self.update(intf, |i| i.set_ids(ids));
        info!(intf, vendor = ids.vendor, product = ids.product, "interface identified");
        self.transition(intf, InterfaceState::Routing, None)?;

        // Temporary route no longer needed
        while let Some(Acquired::RouteLeg { src, dst }) = acquired.pop() {
            self.remove_leg(src, dst);
        }

        let device_id = self.allocate_device_id()?;
        acquired.push(Acquired::DeviceId(device_id));

        let connection = self.connections.create(intf, control_cport, PROTOCOL_CONTROL, None, None)?;
        let host_cport = connection.host_cport();
        acquired.push(Acquired::Connection(host_cport));

        let host_end = CportAddr::new(HOST_INTERFACE_ID, host_cport);
        self.add_leg(acquired, host_end, control_end, Some(PROTOCOL_CONTROL))?;
        self.add_leg(acquired, control_end, host_end, Some(PROTOCOL_CONTROL))?;

        self.update(intf, |i| {
            i.set_device_id(Some(device_id));
            i.set_host_cport(Some(host_cport));
        });
        self.transition(intf, InterfaceState::DeviceIdAssigned, None)?;

        // Initialize
        self.transition(intf, InterfaceState::Initializing, None)?;
        self.connections.init(&connection, None).await?;

        let request = ControlRequest::SetDeviceId { device_id };
        connection.send_sync(request.message_type(), request.payload()).await?;

        self.transition(intf, InterfaceState::Active, None)?;
        self.svc
            .notify_host(SvcRequest::IntfDeviceId { intf, device_id })
            .await;

        if self.settings.require_authorization {
            info!(intf, device_id, "module awaiting authorization");
            self.emit(BusEvent::AuthorizationRequired { intf, ids });
        } else {
            self.announce(intf, device_id, ids).await;
        }
        Ok(())
    }

    fn allocate_device_id(&self) -> BusResult<u8> {
        let id = self.device_ids.allocate()?;
        u8::try_from(id).map_err(|_| {
            self.device_ids.release(id);
            BusError::ResourceExhausted(format!("device id {} out of range", id))
        })
    }

    fn add_leg(
        &self,
        acquired: &mut Vec<Acquired>,
        src: CportAddr,
        dst: CportAddr,
        protocol: Option<u8>,
    ) -> BusResult<()> {
        self.fabric
            .add_tagged_route(src.intf, src.cport, dst.intf, dst.cport, protocol)?;
        acquired.push(Acquired::RouteLeg { src, dst });
        Ok(())
    }

    fn remove_leg(&self, src: CportAddr, dst: CportAddr) {
        if let Err(e) = self.fabric.remove_route(src.intf, src.cport, dst.intf, dst.cport) {
            warn!(%src, %dst, error = %e, "route removal failed");
        }
    }

    fn unwind(&self, intf: InterfaceId, acquired: Vec<Acquired>) {
        for item in acquired.into_iter().rev() {
            debug!(intf, ?item, "unwinding");
            match item {
                Acquired::RouteLeg { src, dst } => self.remove_leg(src, dst),
                Acquired::DeviceId(id) => {
                    self.device_ids.release(u16::from(id));
                }
                Acquired::Connection(host_cport) => {
                    if let Err(e) = self.connections.destroy(host_cport) {
                        warn!(intf, host_cport, error = %e, "connection teardown failed");
                    }
                }
            }
        }
    }

    async fn announce(&self, intf: InterfaceId, device_id: u8, ids: InterfaceIds) {
        self.update(intf, |i| i.set_authorized(true));
        info!(intf, device_id, "module available");
        self.emit(BusEvent::ModuleAvailable { intf, device_id, ids });
        self.svc.notify_host(SvcRequest::IntfHotplug { intf, ids }).await;
    }

    /// Release the authorization gate for an active interface
    pub async fn authorize(&self, intf: InterfaceId) -> BusResult<()> {
        let interface = self
            .interface(intf)
            .ok_or_else(|| BusError::NotFound(format!("interface {}", intf)))?;

        if interface.state() != InterfaceState::Active {
            return Err(BusError::InvalidState(format!(
                "interface {} is {}",
                intf,
                interface.state()
            )));
        }
        if interface.is_authorized() {
            return Ok(());
        }

        let (Some(device_id), Some(ids)) = (interface.device_id(), interface.ids()) else {
            return Err(BusError::InvalidState(format!("interface {} not identified", intf)));
        };
        self.announce(intf, device_id, ids).await;
        Ok(())
    }

    /// Refuse a module waiting for authorization; it is detached
    pub async fn deny(&self, intf: InterfaceId) -> BusResult<()> {
        let interface = self
            .interface(intf)
            .ok_or_else(|| BusError::NotFound(format!("interface {}", intf)))?;

        match interface.state() {
            InterfaceState::Removed => Ok(()),
            InterfaceState::Active if !interface.is_authorized() => {
                info!(intf, "module denied");
                self.detach(intf).await
            }
            state => Err(BusError::InvalidState(format!(
                "interface {} is {} and not awaiting authorization",
                intf, state
            ))),
        }
    }

    /// Tear an interface down. Detaching an unknown or removed interface
    /// is a no-op.
    pub async fn detach(&self, intf: InterfaceId) -> BusResult<()> {
        let Some(interface) = self.interface(intf) else {
            debug!(intf, "detach of unknown interface ignored");
            return Ok(());
        };

        match interface.state() {
            InterfaceState::Removed => {
                debug!(intf, "interface already removed");
                return Ok(());
            }
            InterfaceState::Active => {}
            state => {
                return Err(BusError::InvalidState(format!("interface {} is {}", intf, state)));
            }
        }

        self.transition(intf, InterfaceState::Detaching, None)?;

        // Control and data connections alike hold a route pair
        for connection in self.connections.for_interface(intf) {
            let host_end = CportAddr::new(HOST_INTERFACE_ID, connection.host_cport());
            let intf_end = CportAddr::new(intf, connection.intf_cport());
            self.remove_leg(host_end, intf_end);
            self.remove_leg(intf_end, host_end);
        }

        let destroyed = self.connections.destroy_interface(intf);
        if let Some(device_id) = interface.device_id() {
            self.device_ids.release(u16::from(device_id));
        }

        self.transition(intf, InterfaceState::Removed, Some("detached"))?;
        info!(intf, connections = destroyed, "interface removed");
        self.emit(BusEvent::ModuleRemoved { intf });

        if interface.is_authorized() {
            self.svc.notify_host(SvcRequest::IntfHotUnplug { intf }).await;
        }
        Ok(())
    }

    /// Interfaces that are not yet removed
    pub fn attached(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<_> = self
            .interfaces
            .read()
            .values()
            .filter(|i| !i.state().is_terminal())
            .map(Interface::id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
