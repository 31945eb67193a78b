//! Protocol registry
//!
//! Protocols are versioned message contracts bound to connections. The
//! registry keeps them ordered by id (ascending), then major and minor
//! (both descending), so a lookup by id alone yields the newest
//! implementation. Connections hold a reference on the exact version they
//! bound; a referenced protocol cannot be deregistered.
//!
//! Wire protocols:
//! - [`control`] - per-interface control cport
//! - [`svc`] - supervisory channel

pub mod control;
pub mod svc;

use super::connection::Connection;
use super::error::{BusError, BusResult};
use super::message::OperationStatus;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Control protocol id
pub const PROTOCOL_CONTROL: u8 = 0x00;
/// SVC protocol id
pub const PROTOCOL_SVC: u8 = 0x14;
/// Raw pass-through protocol id
pub const PROTOCOL_RAW: u8 = 0xfe;
/// Vendor-specific protocol id
pub const PROTOCOL_VENDOR: u8 = 0xff;

/// Protocol major/minor version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version; a peer with a higher major is incompatible
    pub major: u8,
    /// Minor version; differences are backward compatible
    pub minor: u8,
}

impl ProtocolVersion {
    /// Payload size of a version request/response
    pub const WIRE_SIZE: usize = 2;

    /// Create a version
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Encode as a version request/response payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.freeze()
    }

    /// Decode a version payload, which must be exactly two bytes
    pub fn decode(payload: &[u8]) -> BusResult<Self> {
        match payload {
            [major, minor] => Ok(Self::new(*major, *minor)),
            _ => Err(BusError::InvalidMessage(format!(
                "version payload must be {} bytes, got {}",
                Self::WIRE_SIZE,
                payload.len()
            ))),
        }
    }

    /// Check a remote version against this local one
    pub fn check_remote(&self, remote: ProtocolVersion) -> BusResult<()> {
        if remote.major > self.major {
            return Err(BusError::Unsupported(format!(
                "major version {} > {}",
                remote.major, self.major
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Handler capability bound to connections through the registry
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol name for logs
    fn name(&self) -> &str;

    /// Protocol id
    fn id(&self) -> u8;

    /// Implemented version
    fn version(&self) -> ProtocolVersion;

    /// Called once the connection is enabled and its version negotiated
    async fn connection_init(&self, _connection: &Connection) -> BusResult<()> {
        Ok(())
    }

    /// Called when the connection is torn down
    fn connection_exit(&self, _connection: &Connection) {}

    /// Handle an inbound request on a bound connection
    async fn request_recv(
        &self,
        _connection: &Connection,
        _message_type: u8,
        _payload: Bytes,
    ) -> Result<Bytes, OperationStatus> {
        Err(OperationStatus::ProtocolBad)
    }
}

/// Registered protocol as reported by [`ProtocolRegistry::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Protocol id
    pub id: u8,
    /// Version
    pub version: ProtocolVersion,
    /// Handler name
    pub name: String,
    /// Connections currently bound
    pub refcount: usize,
}

struct ProtocolRecord {
    id: u8,
    version: ProtocolVersion,
    handler: Arc<dyn ProtocolHandler>,
    refcount: usize,
}

type SortKey = (u8, Reverse<u8>, Reverse<u8>);

fn sort_key(id: u8, version: ProtocolVersion) -> SortKey {
    (id, Reverse(version.major), Reverse(version.minor))
}

impl ProtocolRecord {
    fn key(&self) -> SortKey {
        sort_key(self.id, self.version)
    }
}

/// Version-ordered protocol table
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<Vec<ProtocolRecord>>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn position(records: &[ProtocolRecord], id: u8, version: ProtocolVersion) -> Result<usize, usize> {
        let key = sort_key(id, version);
        records.binary_search_by(|r| r.key().cmp(&key))
    }

    /// Register a handler under its declared id and version
    pub fn register(&self, handler: Arc<dyn ProtocolHandler>) -> BusResult<()> {
        let id = handler.id();
        let version = handler.version();
        let mut protocols = self.protocols.write();

        match Self::position(&protocols, id, version) {
            Ok(_) => Err(BusError::AlreadyExists(format!(
                "protocol 0x{:02x} v{}",
                id, version
            ))),
            Err(pos) => {
                info!(protocol = handler.name(), id, %version, "protocol registered");
                protocols.insert(pos, ProtocolRecord { id, version, handler, refcount: 0 });
                Ok(())
            }
        }
    }

    /// Remove a protocol version; fails while connections still hold it
    pub fn deregister(&self, id: u8, version: ProtocolVersion) -> BusResult<Arc<dyn ProtocolHandler>> {
        let mut protocols = self.protocols.write();
        let pos = Self::position(&protocols, id, version)
            .map_err(|_| BusError::NotFound(format!("protocol 0x{:02x} v{}", id, version)))?;

        let refcount = protocols[pos].refcount;
        if refcount != 0 {
            warn!(id, %version, refcount, "deregistering protocol still in use");
            return Err(BusError::InUse(format!(
                "protocol 0x{:02x} v{} has {} references",
                id, version, refcount
            )));
        }

        let record = protocols.remove(pos);
        info!(protocol = record.handler.name(), id, %version, "protocol deregistered");
        Ok(record.handler)
    }

    /// Newest registered version of a protocol
    pub fn lookup(&self, id: u8) -> Option<Arc<dyn ProtocolHandler>> {
        let protocols = self.protocols.read();
        let start = protocols.partition_point(|r| r.id < id);
        protocols
            .get(start)
            .filter(|r| r.id == id)
            .map(|r| Arc::clone(&r.handler))
    }

    /// Exact version lookup
    pub fn find(&self, id: u8, version: ProtocolVersion) -> Option<Arc<dyn ProtocolHandler>> {
        let protocols = self.protocols.read();
        Self::position(&protocols, id, version)
            .ok()
            .map(|pos| Arc::clone(&protocols[pos].handler))
    }

    /// Take a reference on an exact protocol version
    pub fn acquire(&self, id: u8, version: ProtocolVersion) -> BusResult<Arc<dyn ProtocolHandler>> {
        let mut protocols = self.protocols.write();
        let pos = Self::position(&protocols, id, version)
            .map_err(|_| BusError::NotFound(format!("protocol 0x{:02x} v{}", id, version)))?;

        let record = &mut protocols[pos];
        record.refcount += 1;
        Ok(Arc::clone(&record.handler))
    }

    /// Drop a reference taken with [`acquire`](Self::acquire)
    pub fn release(&self, id: u8, version: ProtocolVersion) {
        let mut protocols = self.protocols.write();
        match Self::position(&protocols, id, version) {
            Ok(pos) if protocols[pos].refcount > 0 => protocols[pos].refcount -= 1,
            _ => warn!(id, %version, "release of unreferenced protocol"),
        }
    }

    /// Current reference count, if registered
    pub fn refcount(&self, id: u8, version: ProtocolVersion) -> Option<usize> {
        let protocols = self.protocols.read();
        Self::position(&protocols, id, version).ok().map(|pos| protocols[pos].refcount)
    }

    /// All registered protocols in registry order
    pub fn list(&self) -> Vec<ProtocolInfo> {
        self.protocols
            .read()
            .iter()
            .map(|r| ProtocolInfo {
                id: r.id,
                version: r.version,
                name: r.handler.name().to_string(),
                refcount: r.refcount,
            })
            .collect()
    }

    /// Number of registered protocol versions
    pub fn len(&self) -> usize {
        self.protocols.read().len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.protocols.read().is_empty()
    }
}

/// Order two protocol versions the way the registry does
pub fn registry_order(a: (u8, ProtocolVersion), b: (u8, ProtocolVersion)) -> Ordering {
    sort_key(a.0, a.1).cmp(&sort_key(b.0, b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        id: u8,
        version: ProtocolVersion,
    }

    impl ProtocolHandler for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn id(&self) -> u8 {
            self.id
        }
        fn version(&self) -> ProtocolVersion {
            self.version
        }
    }

    fn dummy(id: u8, major: u8, minor: u8) -> Arc<dyn ProtocolHandler> {
        Arc::new(Dummy { id, version: ProtocolVersion::new(major, minor) })
    }

    #[test]
    fn test_lookup_returns_newest_version() {
        let registry = ProtocolRegistry::new();
        registry.register(dummy(5, 2, 1)).unwrap();
        registry.register(dummy(5, 1, 0)).unwrap();

        let handler = registry.lookup(5).unwrap();
        assert_eq!(handler.version(), ProtocolVersion::new(2, 1));
    }

    #[test]
    fn test_ordering_by_id_then_version_descending() {
        let registry = ProtocolRegistry::new();
        for (id, major, minor) in [(7, 0, 1), (5, 1, 0), (5, 2, 0), (5, 2, 3), (3, 0, 1)] {
            registry.register(dummy(id, major, minor)).unwrap();
        }

        let order: Vec<_> = registry
            .list()
            .into_iter()
            .map(|p| (p.id, p.version.major, p.version.minor))
            .collect();
        assert_eq!(order, vec![(3, 0, 1), (5, 2, 3), (5, 2, 0), (5, 1, 0), (7, 0, 1)]);
        assert_eq!(
            registry_order((5, ProtocolVersion::new(2, 3)), (5, ProtocolVersion::new(2, 0))),
            Ordering::Less
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ProtocolRegistry::new();
        registry.register(dummy(5, 1, 0)).unwrap();
        assert!(matches!(registry.register(dummy(5, 1, 0)), Err(BusError::AlreadyExists(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_missing_id() {
        let registry = ProtocolRegistry::new();
        registry.register(dummy(4, 0, 1)).unwrap();
        registry.register(dummy(6, 0, 1)).unwrap();
        assert!(registry.lookup(5).is_none());
        assert!(registry.find(4, ProtocolVersion::new(0, 2)).is_none());
    }

    #[test]
    fn test_deregister_blocked_while_referenced() {
        let registry = ProtocolRegistry::new();
        let version = ProtocolVersion::new(0, 1);
        registry.register(dummy(9, 0, 1)).unwrap();

        registry.acquire(9, version).unwrap();
        assert_eq!(registry.refcount(9, version), Some(1));
        assert!(matches!(registry.deregister(9, version), Err(BusError::InUse(_))));

        registry.release(9, version);
        assert!(registry.deregister(9, version).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_acquire_requires_exact_version() {
        let registry = ProtocolRegistry::new();
        registry.register(dummy(9, 1, 0)).unwrap();
        assert!(matches!(registry.acquire(9, ProtocolVersion::new(0, 1)), Err(BusError::NotFound(_))));
    }

    #[test]
    fn test_refcount_beyond_u8_blocks_deregister() {
        let registry = ProtocolRegistry::new();
        let version = ProtocolVersion::new(0, 1);
        registry.register(dummy(1, 0, 1)).unwrap();

        for _ in 0..300 {
            registry.acquire(1, version).unwrap();
        }
        for _ in 0..299 {
            registry.release(1, version);
        }
        assert_eq!(registry.refcount(1, version), Some(1));
        assert!(matches!(registry.deregister(1, version), Err(BusError::InUse(_))));

        registry.release(1, version);
        assert!(registry.deregister(1, version).is_ok());
    }

    #[test]
    fn test_version_check() {
        let local = ProtocolVersion::new(1, 0);
        assert!(local.check_remote(ProtocolVersion::new(1, 7)).is_ok());
        assert!(local.check_remote(ProtocolVersion::new(0, 9)).is_ok());
        assert!(matches!(local.check_remote(ProtocolVersion::new(2, 0)), Err(BusError::Unsupported(_))));
    }

    #[test]
    fn test_version_payload_exact_length() {
        assert_eq!(ProtocolVersion::decode(&[0, 1]).unwrap(), ProtocolVersion::new(0, 1));
        assert!(ProtocolVersion::decode(&[0]).is_err());
        assert!(ProtocolVersion::decode(&[0, 1, 2]).is_err());
    }
}
