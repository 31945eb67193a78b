//! Cport routing fabric
//!
//! Directional route table between (interface, cport) endpoints:
//! - Device table of per-interface transports
//! - Route add/remove with duplicate detection and an optional admission policy
//! - Message filters keyed by (protocol, message type)
//! - Frame forwarding with envelope rewrite
//!
//! The fabric is the only place that knows whether one interface can reach
//! another. Route pairs are built by callers with two `add_route` calls; the
//! fabric never rolls back on its own.

use super::error::{BusError, BusResult};
use super::message::{CportId, Envelope, InterfaceId, MessageHeader, HEADER_SIZE};
use super::transport::{SendHandle, Transport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One (interface, cport) endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CportAddr {
    /// Interface id
    pub intf: InterfaceId,
    /// Cport on that interface
    pub cport: CportId,
}

impl CportAddr {
    /// Create an endpoint address
    pub fn new(intf: InterfaceId, cport: CportId) -> Self {
        Self { intf, cport }
    }
}

impl fmt::Display for CportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.intf, self.cport)
    }
}

/// Directional route as reported by [`RoutingFabric::routes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Source endpoint
    pub src: CportAddr,
    /// Destination endpoint
    pub dst: CportAddr,
    /// Protocol carried on the route, if tagged
    pub protocol: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    dst: CportAddr,
    protocol: Option<u8>,
}

struct DeviceEntry {
    transport: Arc<dyn Transport>,
    cport_count: u16,
}

/// Verdict of a message filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Frame handled by the filter, do not forward
    Consume,
    /// Forward as usual
    PassThrough,
}

/// Intercepts frames of one (protocol, type) on tagged routes
pub trait MessageFilter: Send + Sync {
    /// Inspect a frame about to be forwarded along `route`
    fn filter(&self, route: &Route, message: &[u8]) -> FilterAction;
}

impl<F> MessageFilter for F
where
    F: Fn(&Route, &[u8]) -> FilterAction + Send + Sync,
{
    fn filter(&self, route: &Route, message: &[u8]) -> FilterAction {
        self(route, message)
    }
}

/// Policy consulted before a route is inserted
pub trait RouteAdmission: Send + Sync {
    /// Return false to reject the route
    fn admit(&self, src: CportAddr, dst: CportAddr) -> bool;
}

impl<F> RouteAdmission for F
where
    F: Fn(CportAddr, CportAddr) -> bool + Send + Sync,
{
    fn admit(&self, src: CportAddr, dst: CportAddr) -> bool {
        self(src, dst)
    }
}

/// Where a forwarded frame went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardReceipt {
    /// Destination endpoint
    pub dst: CportAddr,
    /// Transport handle, `None` when a filter consumed the frame
    pub handle: Option<SendHandle>,
}

/// Fabric counters snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricStats {
    /// Frames handed to a destination transport
    pub forwarded: u64,
    /// Frames dropped for lack of a route or device
    pub dropped: u64,
    /// Frames consumed by filters
    pub filtered: u64,
    /// Destination transport send failures
    pub send_errors: u64,
    /// Routes currently installed
    pub routes: usize,
    /// Devices currently registered
    pub devices: usize,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    send_errors: AtomicU64,
}

/// Route table plus device table
#[derive(Default)]
pub struct RoutingFabric {
    devices: RwLock<HashMap<InterfaceId, DeviceEntry>>,
    routes: RwLock<HashMap<CportAddr, RouteEntry>>,
    filters: RwLock<HashMap<(u8, u8), Arc<dyn MessageFilter>>>,
    admission: RwLock<Option<Arc<dyn RouteAdmission>>>,
    counters: Counters,
}

impl RoutingFabric {
    /// Create an empty fabric
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Register the transport serving an interface
    pub fn add_device(
        &self,
        intf: InterfaceId,
        transport: Arc<dyn Transport>,
        cport_count: u16,
    ) -> BusResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&intf) {
            return Err(BusError::AlreadyExists(format!("device for interface {}", intf)));
        }

        debug!(intf, cport_count, transport = %transport.describe(), "device added");
        devices.insert(intf, DeviceEntry { transport, cport_count });
        Ok(())
    }

    /// Unregister an interface's transport and drop every route touching it.
    /// Returns the number of routes removed.
    pub fn remove_device(&self, intf: InterfaceId) -> BusResult<usize> {
        if self.devices.write().remove(&intf).is_none() {
            return Err(BusError::NotFound(format!("device for interface {}", intf)));
        }

        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|src, entry| src.intf != intf && entry.dst.intf != intf);
        let removed = before - routes.len();

        debug!(intf, routes_removed = removed, "device removed");
        Ok(removed)
    }

    /// Is a transport registered for this interface?
    pub fn has_device(&self, intf: InterfaceId) -> bool {
        self.devices.read().contains_key(&intf)
    }

    /// Transport registered for an interface
    pub fn device(&self, intf: InterfaceId) -> Option<Arc<dyn Transport>> {
        self.devices.read().get(&intf).map(|d| Arc::clone(&d.transport))
    }

    /// Interfaces with a registered transport, ascending
    pub fn device_ids(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<_> = self.devices.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Install a directional route
    pub fn add_route(
        &self,
        src_if: InterfaceId,
        src_cport: CportId,
        dst_if: InterfaceId,
        dst_cport: CportId,
    ) -> BusResult<()> {
        self.add_tagged_route(src_if, src_cport, dst_if, dst_cport, None)
    }

    /// Install a directional route carrying a known protocol, which makes
    /// it eligible for message filters
    pub fn add_tagged_route(
        &self,
        src_if: InterfaceId,
        src_cport: CportId,
        dst_if: InterfaceId,
        dst_cport: CportId,
        protocol: Option<u8>,
    ) -> BusResult<()> {
        let src = CportAddr::new(src_if, src_cport);
        let dst = CportAddr::new(dst_if, dst_cport);

        {
            let devices = self.devices.read();
            for addr in [src, dst] {
                let device = devices
                    .get(&addr.intf)
                    .ok_or_else(|| BusError::NotFound(format!("device for interface {}", addr.intf)))?;
                if addr.cport >= device.cport_count {
                    return Err(BusError::NotFound(format!(
                        "cport {} out of range on interface {} ({} cports)",
                        addr.cport, addr.intf, device.cport_count
                    )));
                }
            }
        }

        if let Some(policy) = self.admission.read().as_ref() {
            if !policy.admit(src, dst) {
                warn!(%src, %dst, "route rejected by admission policy");
                return Err(BusError::InvalidState(format!("route {} -> {} not admitted", src, dst)));
            }
        }

        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&src) {
            return Err(BusError::AlreadyExists(format!("route {} -> {}", src, existing.dst)));
        }

        routes.insert(src, RouteEntry { dst, protocol });
        debug!(%src, %dst, ?protocol, "route added");
        Ok(())
    }

    /// Remove a directional route. The destination must match.
    pub fn remove_route(
        &self,
        src_if: InterfaceId,
        src_cport: CportId,
        dst_if: InterfaceId,
        dst_cport: CportId,
    ) -> BusResult<()> {
        let src = CportAddr::new(src_if, src_cport);
        let dst = CportAddr::new(dst_if, dst_cport);

        let mut routes = self.routes.write();
        match routes.get(&src) {
            Some(entry) if entry.dst == dst => {
                routes.remove(&src);
                debug!(%src, %dst, "route removed");
                Ok(())
            }
            _ => Err(BusError::NotFound(format!("route {} -> {}", src, dst))),
        }
    }

    /// Destination of a source endpoint
    pub fn resolve(&self, src_if: InterfaceId, src_cport: CportId) -> Option<CportAddr> {
        self.routes
            .read()
            .get(&CportAddr::new(src_if, src_cport))
            .map(|entry| entry.dst)
    }

    /// Does the directional route exist?
    pub fn has_route(&self, src: CportAddr, dst: CportAddr) -> bool {
        self.routes.read().get(&src).is_some_and(|entry| entry.dst == dst)
    }

    /// Snapshot of all routes, sorted by source
    pub fn routes(&self) -> Vec<Route> {
        let mut all: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(src, entry)| Route { src: *src, dst: entry.dst, protocol: entry.protocol })
            .collect();
        all.sort_by_key(|r| r.src);
        all
    }

    /// Routes whose source or destination is on `intf`
    pub fn routes_for(&self, intf: InterfaceId) -> Vec<Route> {
        self.routes()
            .into_iter()
            .filter(|r| r.src.intf == intf || r.dst.intf == intf)
            .collect()
    }

    /// Number of installed routes
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Install or clear the admission policy
    pub fn set_admission(&self, policy: Option<Arc<dyn RouteAdmission>>) {
        *self.admission.write() = policy;
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Register a filter for (protocol, message type)
    pub fn register_filter(
        &self,
        protocol: u8,
        message_type: u8,
        filter: Arc<dyn MessageFilter>,
    ) -> BusResult<()> {
        let mut filters = self.filters.write();
        if filters.contains_key(&(protocol, message_type)) {
            return Err(BusError::AlreadyExists(format!(
                "filter for protocol 0x{:02x} type 0x{:02x}",
                protocol, message_type
            )));
        }
        filters.insert((protocol, message_type), filter);
        Ok(())
    }

    /// Remove a filter; returns whether one was registered
    pub fn unregister_filter(&self, protocol: u8, message_type: u8) -> bool {
        self.filters.write().remove(&(protocol, message_type)).is_some()
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Forward one message arriving on (src_if, src_cport) to its routed
    /// destination. The message bytes are passed through unchanged; only
    /// the envelope is rewritten.
    pub fn forward(
        &self,
        src_if: InterfaceId,
        src_cport: CportId,
        message: &[u8],
    ) -> BusResult<ForwardReceipt> {
        let src = CportAddr::new(src_if, src_cport);

        let entry = match self.routes.read().get(&src) {
            Some(entry) => *entry,
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%src, len = message.len(), "no route, frame dropped");
                return Err(BusError::NotFound(format!("route from {}", src)));
            }
        };

        let Some(transport) = self.device(entry.dst.intf) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(%src, dst = %entry.dst, "destination device gone, frame dropped");
            return Err(BusError::NotFound(format!("device for interface {}", entry.dst.intf)));
        };

        if let Some(protocol) = entry.protocol {
            if message.len() >= HEADER_SIZE {
                if let Ok(header) = MessageHeader::parse(message) {
                    let filter = self.filters.read().get(&(protocol, header.message_type)).cloned();
                    if let Some(filter) = filter {
                        let route = Route { src, dst: entry.dst, protocol: entry.protocol };
                        if filter.filter(&route, message) == FilterAction::Consume {
                            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                            trace!(%src, msg_type = header.message_type, "frame consumed by filter");
                            return Ok(ForwardReceipt { dst: entry.dst, handle: None });
                        }
                    }
                }
            }
        }

        let envelope = Envelope {
            size: message.len() as u16,
            dest_cport: entry.dst.cport,
            src_cport,
        };

        match transport.send(&envelope, message) {
            Ok(handle) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                trace!(%src, dst = %entry.dst, len = message.len(), "frame forwarded");
                Ok(ForwardReceipt { dst: entry.dst, handle: Some(handle) })
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%src, dst = %entry.dst, error = %e, "transport send failed");
                Err(e.into())
            }
        }
    }

    /// Cancel a forwarded frame through its destination transport
    pub fn cancel(&self, receipt: &ForwardReceipt) {
        if let (Some(handle), Some(transport)) = (receipt.handle, self.device(receipt.dst.intf)) {
            transport.cancel(handle);
        }
    }

    /// Counters snapshot
    pub fn stats(&self) -> FabricStats {
        FabricStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            routes: self.route_count(),
            devices: self.devices.read().len(),
        }
    }
}
