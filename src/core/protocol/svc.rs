//! SVC protocol
//!
//! Messages exchanged on the supervisory channel between the SVC and the
//! host, plus the host-side handler bound on the host's SVC cport.

use super::control::{exact_len, InterfaceIds};
use super::{ProtocolHandler, ProtocolVersion, PROTOCOL_SVC};
use crate::core::connection::Connection;
use crate::core::error::{BusError, BusResult};
use crate::core::message::{CportId, InterfaceId, OperationStatus, MESSAGE_TYPE_PROTOCOL_VERSION};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Implemented SVC protocol version
pub const SVC_VERSION: ProtocolVersion = ProtocolVersion::new(0, 1);

/// Protocol version negotiation
pub const TYPE_PROTOCOL_VERSION: u8 = MESSAGE_TYPE_PROTOCOL_VERSION;
/// Device id assigned to an interface
pub const TYPE_INTF_DEVICE_ID: u8 = 0x02;
/// Interface attached
pub const TYPE_INTF_HOTPLUG: u8 = 0x03;
/// Interface removed
pub const TYPE_INTF_HOT_UNPLUG: u8 = 0x04;
/// Interface reset
pub const TYPE_INTF_RESET: u8 = 0x05;
/// Create a connection (route pair)
pub const TYPE_CONN_CREATE: u8 = 0x06;
/// Destroy a connection (route pair)
pub const TYPE_CONN_DESTROY: u8 = 0x07;
/// SVC greeting sent to the host once the link is up
pub const TYPE_HELLO: u8 = 0x08;

/// Endo id announced when none is configured
pub const DEFAULT_ENDO_ID: u16 = 0x4755;

/// Both ends of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionEnds {
    /// First interface
    pub intf1: InterfaceId,
    /// Cport on the first interface
    pub cport1: CportId,
    /// Second interface
    pub intf2: InterfaceId,
    /// Cport on the second interface
    pub cport2: CportId,
}

impl ConnectionEnds {
    const WIRE_SIZE: usize = 6;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.intf1);
        buf.put_u16_le(self.cport1);
        buf.put_u8(self.intf2);
        buf.put_u16_le(self.cport2);
    }

    fn decode(mut payload: &[u8]) -> Self {
        Self {
            intf1: payload.get_u8(),
            cport1: payload.get_u16_le(),
            intf2: payload.get_u8(),
            cport2: payload.get_u16_le(),
        }
    }
}

/// SVC requests, decoded after the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcRequest {
    /// Version negotiation
    ProtocolVersion(ProtocolVersion),
    /// Device id assignment notice
    IntfDeviceId {
        /// Interface
        intf: InterfaceId,
        /// Assigned device id
        device_id: u8,
    },
    /// Interface attached with its identification data
    IntfHotplug {
        /// Interface
        intf: InterfaceId,
        /// Identification data
        ids: InterfaceIds,
    },
    /// Interface removed
    IntfHotUnplug {
        /// Interface
        intf: InterfaceId,
    },
    /// Interface reset
    IntfReset {
        /// Interface
        intf: InterfaceId,
    },
    /// Route pair creation
    ConnCreate(ConnectionEnds),
    /// Route pair removal
    ConnDestroy(ConnectionEnds),
    /// Greeting
    Hello {
        /// Endo id
        endo_id: u16,
        /// Interface id of the host
        intf: InterfaceId,
    },
}

impl SvcRequest {
    /// Message type of this request
    pub fn message_type(&self) -> u8 {
        match self {
            Self::ProtocolVersion(_) => TYPE_PROTOCOL_VERSION,
            Self::IntfDeviceId { .. } => TYPE_INTF_DEVICE_ID,
            Self::IntfHotplug { .. } => TYPE_INTF_HOTPLUG,
            Self::IntfHotUnplug { .. } => TYPE_INTF_HOT_UNPLUG,
            Self::IntfReset { .. } => TYPE_INTF_RESET,
            Self::ConnCreate(_) => TYPE_CONN_CREATE,
            Self::ConnDestroy(_) => TYPE_CONN_DESTROY,
            Self::Hello { .. } => TYPE_HELLO,
        }
    }

    /// Encode the request payload
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::ProtocolVersion(version) => return version.encode(),
            Self::IntfDeviceId { intf, device_id } => {
                buf.put_u8(*intf);
                buf.put_u8(*device_id);
            }
            Self::IntfHotplug { intf, ids } => {
                buf.put_u8(*intf);
                buf.extend_from_slice(&ids.encode());
            }
            Self::IntfHotUnplug { intf } | Self::IntfReset { intf } => buf.put_u8(*intf),
            Self::ConnCreate(ends) | Self::ConnDestroy(ends) => ends.encode(&mut buf),
            Self::Hello { endo_id, intf } => {
                buf.put_u16_le(*endo_id);
                buf.put_u8(*intf);
            }
        }
        buf.freeze()
    }

    /// Decode a request; the payload length must match the type exactly
    pub fn decode(message_type: u8, payload: &[u8]) -> BusResult<Self> {
        match message_type {
            TYPE_PROTOCOL_VERSION => Ok(Self::ProtocolVersion(ProtocolVersion::decode(payload)?)),
            TYPE_INTF_DEVICE_ID => {
                exact_len("intf device id", payload, 2)?;
                Ok(Self::IntfDeviceId { intf: payload[0], device_id: payload[1] })
            }
            TYPE_INTF_HOTPLUG => {
                exact_len("intf hotplug", payload, 1 + InterfaceIds::WIRE_SIZE)?;
                Ok(Self::IntfHotplug { intf: payload[0], ids: InterfaceIds::decode(&payload[1..])? })
            }
            TYPE_INTF_HOT_UNPLUG => {
                exact_len("intf hot unplug", payload, 1)?;
                Ok(Self::IntfHotUnplug { intf: payload[0] })
            }
            TYPE_INTF_RESET => {
                exact_len("intf reset", payload, 1)?;
                Ok(Self::IntfReset { intf: payload[0] })
            }
            TYPE_CONN_CREATE => {
                exact_len("conn create", payload, ConnectionEnds::WIRE_SIZE)?;
                Ok(Self::ConnCreate(ConnectionEnds::decode(payload)))
            }
            TYPE_CONN_DESTROY => {
                exact_len("conn destroy", payload, ConnectionEnds::WIRE_SIZE)?;
                Ok(Self::ConnDestroy(ConnectionEnds::decode(payload)))
            }
            TYPE_HELLO => {
                exact_len("hello", payload, 3)?;
                Ok(Self::Hello {
                    endo_id: u16::from_le_bytes([payload[0], payload[1]]),
                    intf: payload[2],
                })
            }
            other => Err(BusError::InvalidMessage(format!("unknown svc type 0x{:02x}", other))),
        }
    }
}

/// SVC notices surfaced by the host-side handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcNotice {
    /// SVC greeted the host
    Hello {
        /// Endo id
        endo_id: u16,
        /// Interface id the SVC assigned to the host
        intf: InterfaceId,
    },
    /// SVC reports an interface attached
    Hotplug {
        /// Interface
        intf: InterfaceId,
        /// Identification data
        ids: InterfaceIds,
    },
    /// SVC reports an interface removed
    HotUnplug {
        /// Interface
        intf: InterfaceId,
    },
}

/// Callback receiving [`SvcNotice`]s
pub type NoticeCallback = Arc<dyn Fn(SvcNotice) + Send + Sync>;

/// Host side of the SVC protocol
pub struct HostSvcProtocol {
    on_notice: NoticeCallback,
}

impl HostSvcProtocol {
    /// Create the handler; `on_notice` runs on a worker for every notice
    pub fn new(on_notice: NoticeCallback) -> Self {
        Self { on_notice }
    }
}

#[async_trait]
impl ProtocolHandler for HostSvcProtocol {
    fn name(&self) -> &str {
        "svc"
    }

    fn id(&self) -> u8 {
        PROTOCOL_SVC
    }

    fn version(&self) -> ProtocolVersion {
        SVC_VERSION
    }

    async fn request_recv(
        &self,
        connection: &Connection,
        message_type: u8,
        payload: Bytes,
    ) -> Result<Bytes, OperationStatus> {
        let request = SvcRequest::decode(message_type, &payload).map_err(|e| {
            debug!(conn = %connection.name(), error = %e, "bad svc request");
            OperationStatus::Invalid
        })?;

        let notice = match request {
            SvcRequest::ProtocolVersion(_) => return Ok(SVC_VERSION.encode()),
            SvcRequest::Hello { endo_id, intf } => {
                info!(endo_id = %format!("0x{:04x}", endo_id), intf, "svc hello");
                SvcNotice::Hello { endo_id, intf }
            }
            SvcRequest::IntfHotplug { intf, ids } => SvcNotice::Hotplug { intf, ids },
            SvcRequest::IntfHotUnplug { intf } => SvcNotice::HotUnplug { intf },
            SvcRequest::IntfDeviceId { .. } | SvcRequest::IntfReset { .. } => return Ok(Bytes::new()),
            // Route management is the SVC's job, never the host's
            SvcRequest::ConnCreate(_) | SvcRequest::ConnDestroy(_) => {
                return Err(OperationStatus::Invalid)
            }
        };

        (self.on_notice)(notice);
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_create_layout() {
        let req = SvcRequest::ConnCreate(ConnectionEnds { intf1: 1, cport1: 0x0102, intf2: 3, cport2: 2 });
        let payload = req.payload();
        assert_eq!(&payload[..], &[1, 0x02, 0x01, 3, 2, 0]);
        assert_eq!(SvcRequest::decode(TYPE_CONN_CREATE, &payload).unwrap(), req);
    }

    #[test]
    fn test_hello_layout() {
        let req = SvcRequest::Hello { endo_id: DEFAULT_ENDO_ID, intf: 1 };
        assert_eq!(&req.payload()[..], &[0x55, 0x47, 1]);
        assert_eq!(SvcRequest::decode(TYPE_HELLO, &req.payload()).unwrap(), req);
    }

    #[test]
    fn test_hotplug_carries_ids() {
        let req = SvcRequest::IntfHotplug { intf: 4, ids: InterfaceIds::new(0x10, 0x20) };
        let payload = req.payload();
        assert_eq!(payload.len(), 17);
        assert_eq!(SvcRequest::decode(TYPE_INTF_HOTPLUG, &payload).unwrap(), req);
    }

    #[test]
    fn test_exact_lengths_enforced() {
        assert!(SvcRequest::decode(TYPE_CONN_DESTROY, &[0; 5]).is_err());
        assert!(SvcRequest::decode(TYPE_INTF_RESET, &[]).is_err());
        assert!(SvcRequest::decode(TYPE_INTF_DEVICE_ID, &[1, 2, 3]).is_err());
        assert!(SvcRequest::decode(0x00, &[]).is_err());
    }
}
