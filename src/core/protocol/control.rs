//! Control protocol
//!
//! Every interface exposes a control cport. The host uses it to identify a
//! freshly attached module, tell it its device id and announce which of its
//! cports are connected.

use super::{ProtocolHandler, ProtocolVersion, PROTOCOL_CONTROL};
use crate::core::connection::Connection;
use crate::core::error::{BusError, BusResult};
use crate::core::message::{CportId, OperationStatus, MESSAGE_TYPE_PROTOCOL_VERSION};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Implemented control protocol version
pub const CONTROL_VERSION: ProtocolVersion = ProtocolVersion::new(0, 1);

/// Protocol version negotiation
pub const TYPE_PROTOCOL_VERSION: u8 = MESSAGE_TYPE_PROTOCOL_VERSION;
/// Module asks whether the peer is an AP
pub const TYPE_PROBE_AP: u8 = 0x02;
/// A cport on the interface has been connected
pub const TYPE_CONNECTED: u8 = 0x05;
/// A cport on the interface has been disconnected
pub const TYPE_DISCONNECTED: u8 = 0x06;
/// Assign the interface its device id
pub const TYPE_SET_DEVICE_ID: u8 = 0x07;
/// Read identification data
pub const TYPE_GET_IDS: u8 = 0x7f;

/// Identification data returned by `GET_IDS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfaceIds {
    /// UniPro manufacturer id
    pub unipro_mfg: u32,
    /// UniPro product id
    pub unipro_prod: u32,
    /// Vendor id
    pub vendor: u32,
    /// Product id
    pub product: u32,
}

impl InterfaceIds {
    /// Payload size
    pub const WIRE_SIZE: usize = 16;

    /// Ids with only vendor and product set
    pub fn new(vendor: u32, product: u32) -> Self {
        Self { vendor, product, ..Self::default() }
    }

    /// Encode as a `GET_IDS` response payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        buf.put_u32_le(self.unipro_mfg);
        buf.put_u32_le(self.unipro_prod);
        buf.put_u32_le(self.vendor);
        buf.put_u32_le(self.product);
        buf.freeze()
    }

    /// Decode a `GET_IDS` response payload
    pub fn decode(payload: &[u8]) -> BusResult<Self> {
        exact_len("get ids response", payload, Self::WIRE_SIZE)?;
        let mut buf = payload;
        Ok(Self {
            unipro_mfg: buf.get_u32_le(),
            unipro_prod: buf.get_u32_le(),
            vendor: buf.get_u32_le(),
            product: buf.get_u32_le(),
        })
    }
}

/// Control requests, decoded after the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Version negotiation carrying the sender's version
    ProtocolVersion(ProtocolVersion),
    /// AP probe
    ProbeAp,
    /// Cport connected
    Connected {
        /// Cport on the receiving interface
        cport: CportId,
    },
    /// Cport disconnected
    Disconnected {
        /// Cport on the receiving interface
        cport: CportId,
    },
    /// Device id assignment
    SetDeviceId {
        /// Assigned device id
        device_id: u8,
    },
    /// Identification request
    GetIds,
}

impl ControlRequest {
    /// Message type of this request
    pub fn message_type(&self) -> u8 {
        match self {
            Self::ProtocolVersion(_) => TYPE_PROTOCOL_VERSION,
            Self::ProbeAp => TYPE_PROBE_AP,
            Self::Connected { .. } => TYPE_CONNECTED,
            Self::Disconnected { .. } => TYPE_DISCONNECTED,
            Self::SetDeviceId { .. } => TYPE_SET_DEVICE_ID,
            Self::GetIds => TYPE_GET_IDS,
        }
    }

    /// Encode the request payload
    pub fn payload(&self) -> Bytes {
        match self {
            Self::ProtocolVersion(version) => version.encode(),
            Self::ProbeAp | Self::GetIds => Bytes::new(),
            Self::Connected { cport } | Self::Disconnected { cport } => {
                Bytes::copy_from_slice(&cport.to_le_bytes())
            }
            Self::SetDeviceId { device_id } => Bytes::copy_from_slice(&[*device_id]),
        }
    }

    /// Decode a request; the payload length must match the type exactly
    pub fn decode(message_type: u8, payload: &[u8]) -> BusResult<Self> {
        match message_type {
            TYPE_PROTOCOL_VERSION => Ok(Self::ProtocolVersion(ProtocolVersion::decode(payload)?)),
            TYPE_PROBE_AP => {
                exact_len("probe ap", payload, 0)?;
                Ok(Self::ProbeAp)
            }
            TYPE_CONNECTED => {
                exact_len("connected", payload, 2)?;
                Ok(Self::Connected { cport: u16::from_le_bytes([payload[0], payload[1]]) })
            }
            TYPE_DISCONNECTED => {
                exact_len("disconnected", payload, 2)?;
                Ok(Self::Disconnected { cport: u16::from_le_bytes([payload[0], payload[1]]) })
            }
            TYPE_SET_DEVICE_ID => {
                exact_len("set device id", payload, 1)?;
                Ok(Self::SetDeviceId { device_id: payload[0] })
            }
            TYPE_GET_IDS => {
                exact_len("get ids", payload, 0)?;
                Ok(Self::GetIds)
            }
            other => Err(BusError::InvalidMessage(format!("unknown control type 0x{:02x}", other))),
        }
    }
}

pub(crate) fn exact_len(what: &str, payload: &[u8], expected: usize) -> BusResult<()> {
    if payload.len() != expected {
        return Err(BusError::InvalidMessage(format!(
            "{} payload must be {} bytes, got {}",
            what,
            expected,
            payload.len()
        )));
    }
    Ok(())
}

/// Host side of the control protocol
#[derive(Debug, Default)]
pub struct ControlProtocol;

impl ControlProtocol {
    /// Create the handler
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolHandler for ControlProtocol {
    fn name(&self) -> &str {
        "control"
    }

    fn id(&self) -> u8 {
        PROTOCOL_CONTROL
    }

    fn version(&self) -> ProtocolVersion {
        CONTROL_VERSION
    }

    async fn request_recv(
        &self,
        connection: &Connection,
        message_type: u8,
        payload: Bytes,
    ) -> Result<Bytes, OperationStatus> {
        let request = ControlRequest::decode(message_type, &payload).map_err(|e| {
            debug!(conn = %connection.name(), error = %e, "bad control request");
            OperationStatus::Invalid
        })?;

        match request {
            ControlRequest::ProtocolVersion(_) => Ok(CONTROL_VERSION.encode()),
            ControlRequest::ProbeAp => Ok(Bytes::new()),
            ControlRequest::Connected { cport } | ControlRequest::Disconnected { cport } => {
                debug!(conn = %connection.name(), cport, msg_type = message_type, "cport notification");
                Ok(Bytes::new())
            }
            // Only the host hands out device ids and identifies peers
            ControlRequest::SetDeviceId { .. } | ControlRequest::GetIds => Err(OperationStatus::Invalid),
        }
    }
}
