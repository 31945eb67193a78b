//! Message model
//!
//! Every message on the bus starts with a fixed 8-byte operation header,
//! little endian on the wire:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 2    | size (header + payload) |
//! | 2      | 2    | operation id (0 = no response expected) |
//! | 4      | 1    | type (bit 7 set = response) |
//! | 5      | 1    | result (responses only) |
//! | 6      | 2    | reserved, zero |
//!
//! Frames travelling through the routing fabric carry an additional
//! [`Envelope`] naming the destination and source cports.

use super::error::BusError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface identifier on the bus
pub type InterfaceId = u8;

/// Cport identifier, local to one interface
pub type CportId = u16;

/// Operation identifier, unique among in-flight operations of one scope
pub type OperationId = u16;

/// Size of the operation header
pub const HEADER_SIZE: usize = 8;

/// Size of the routing envelope
pub const ENVELOPE_SIZE: usize = 6;

/// Largest message (header + payload) accepted on the bus
pub const MESSAGE_SIZE_MAX: usize = 4096;

/// Largest payload a single message can carry
pub const PAYLOAD_SIZE_MAX: usize = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// Type bit marking a response
pub const MESSAGE_TYPE_RESPONSE: u8 = 0x80;

/// Reserved invalid type for every protocol
pub const MESSAGE_TYPE_INVALID: u8 = 0x00;

/// Protocol version request type, shared by every protocol
pub const MESSAGE_TYPE_PROTOCOL_VERSION: u8 = 0x01;

/// Result byte carried by responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationStatus {
    /// Completed successfully
    Success = 0x00,
    /// Interrupted before completion
    Interrupted = 0x01,
    /// Peer timed out
    Timeout = 0x02,
    /// Peer ran out of memory
    NoMemory = 0x03,
    /// Protocol not supported or request type unknown
    ProtocolBad = 0x04,
    /// Message too large (or too small)
    Overflow = 0x05,
    /// Invalid request
    Invalid = 0x06,
    /// Try again later
    Retry = 0x07,
    /// Addressed entity does not exist
    Nonexistent = 0x08,
    /// Unclassified error
    UnknownError = 0xfe,
    /// Implementation error on the peer
    Malfunction = 0xff,
}

impl OperationStatus {
    /// Decode a result byte; unassigned values map to `UnknownError`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Interrupted,
            0x02 => Self::Timeout,
            0x03 => Self::NoMemory,
            0x04 => Self::ProtocolBad,
            0x05 => Self::Overflow,
            0x06 => Self::Invalid,
            0x07 => Self::Retry,
            0x08 => Self::Nonexistent,
            0xff => Self::Malfunction,
            _ => Self::UnknownError,
        }
    }

    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check for success
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Interrupted => "interrupted",
            Self::Timeout => "timeout",
            Self::NoMemory => "no memory",
            Self::ProtocolBad => "protocol bad",
            Self::Overflow => "overflow",
            Self::Invalid => "invalid",
            Self::Retry => "retry",
            Self::Nonexistent => "nonexistent",
            Self::UnknownError => "unknown error",
            Self::Malfunction => "malfunction",
        };
        write!(f, "{} (0x{:02x})", name, self.as_u8())
    }
}

/// Operation header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message size, header included
    pub size: u16,
    /// Operation id, 0 when no response is expected
    pub operation_id: OperationId,
    /// Message type; bit 7 marks a response
    pub message_type: u8,
    /// Result byte, meaningful only in responses
    pub result: u8,
}

impl MessageHeader {
    /// Is this the header of a response?
    pub fn is_response(&self) -> bool {
        self.message_type & MESSAGE_TYPE_RESPONSE != 0
    }

    /// Type with the response bit cleared
    pub fn request_type(&self) -> u8 {
        self.message_type & !MESSAGE_TYPE_RESPONSE
    }

    /// Decoded result byte
    pub fn status(&self) -> OperationStatus {
        OperationStatus::from_u8(self.result)
    }

    /// Parse a header from the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, BusError> {
        if data.len() < HEADER_SIZE {
            return Err(BusError::InvalidMessage(format!(
                "message too short: {} < {} bytes",
                data.len(),
                HEADER_SIZE
            )));
        }

        Ok(Self {
            size: u16::from_le_bytes([data[0], data[1]]),
            operation_id: u16::from_le_bytes([data[2], data[3]]),
            message_type: data[4],
            result: data[5],
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.size);
        buf.put_u16_le(self.operation_id);
        buf.put_u8(self.message_type);
        buf.put_u8(self.result);
        buf.put_u16_le(0);
    }
}

/// A complete message: header plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    payload: Bytes,
}

impl Message {
    /// Build an outgoing request. The operation id is filled in when sent.
    pub fn request(message_type: u8, payload: impl Into<Bytes>) -> Result<Self, BusError> {
        Self::build(message_type & !MESSAGE_TYPE_RESPONSE, 0, 0, payload.into())
    }

    /// Build the response to a request header
    pub fn response(
        request: &MessageHeader,
        status: OperationStatus,
        payload: impl Into<Bytes>,
    ) -> Result<Self, BusError> {
        // A failed response carries no payload
        let payload = if status.is_success() { payload.into() } else { Bytes::new() };
        Self::build(
            request.request_type() | MESSAGE_TYPE_RESPONSE,
            request.operation_id,
            status.as_u8(),
            payload,
        )
    }

    fn build(message_type: u8, operation_id: OperationId, result: u8, payload: Bytes) -> Result<Self, BusError> {
        if payload.len() > PAYLOAD_SIZE_MAX {
            return Err(BusError::InvalidMessage(format!(
                "payload too large: {} > {} bytes",
                payload.len(),
                PAYLOAD_SIZE_MAX
            )));
        }

        Ok(Self {
            header: MessageHeader {
                size: (HEADER_SIZE + payload.len()) as u16,
                operation_id,
                message_type,
                result,
            },
            payload,
        })
    }

    /// Decode a message, validating the size field against the buffer
    pub fn decode(data: &[u8]) -> Result<Self, BusError> {
        let header = MessageHeader::parse(data)?;
        let size = header.size as usize;

        if size < HEADER_SIZE {
            return Err(BusError::InvalidMessage(format!("header size field too small: {}", size)));
        }
        if size != data.len() {
            return Err(BusError::InvalidMessage(format!(
                "size mismatch: header says {} bytes, frame has {}",
                size,
                data.len()
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
        })
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.write(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Header
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, keeping the payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Operation id
    pub fn operation_id(&self) -> OperationId {
        self.header.operation_id
    }

    /// Assign the operation id
    pub fn set_operation_id(&mut self, id: OperationId) {
        self.header.operation_id = id;
    }

    /// Is this a response?
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Request type (response bit cleared)
    pub fn request_type(&self) -> u8 {
        self.header.request_type()
    }

    /// Result of a response
    pub fn status(&self) -> OperationStatus {
        self.header.status()
    }

    /// Total encoded size
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// A message always carries a header
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Routing envelope prepended to every frame on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Size of the enclosed message
    pub size: u16,
    /// Cport on the receiving interface
    pub dest_cport: CportId,
    /// Cport on the sending interface
    pub src_cport: CportId,
}

impl Envelope {
    /// Envelope for a message leaving `src_cport`
    pub fn outbound(src_cport: CportId, message_len: usize) -> Self {
        Self {
            size: message_len as u16,
            dest_cport: 0,
            src_cport,
        }
    }

    /// Parse an envelope
    pub fn parse(data: &[u8]) -> Result<Self, BusError> {
        if data.len() < ENVELOPE_SIZE {
            return Err(BusError::InvalidMessage(format!(
                "frame too short for envelope: {} < {} bytes",
                data.len(),
                ENVELOPE_SIZE
            )));
        }

        Ok(Self {
            size: u16::from_le_bytes([data[0], data[1]]),
            dest_cport: u16::from_le_bytes([data[2], data[3]]),
            src_cport: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    /// Write the envelope
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.size);
        buf.put_u16_le(self.dest_cport);
        buf.put_u16_le(self.src_cport);
    }
}

/// Encode an envelope and message into one transport frame
pub fn encode_frame(envelope: &Envelope, message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + message.len());
    envelope.write(&mut buf);
    buf.extend_from_slice(message);
    buf.freeze()
}

/// Split a transport frame into its envelope and message bytes
pub fn decode_frame(frame: &[u8]) -> Result<(Envelope, Bytes), BusError> {
    let envelope = Envelope::parse(frame)?;
    let body = &frame[ENVELOPE_SIZE..];

    if body.len() != envelope.size as usize {
        return Err(BusError::InvalidMessage(format!(
            "envelope size {} does not match {} bytes of message",
            envelope.size,
            body.len()
        )));
    }

    Ok((envelope, Bytes::copy_from_slice(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let mut msg = Message::request(0x7f, vec![0xaa, 0xbb]).unwrap();
        msg.set_operation_id(0x0102);

        let wire = msg.encode();
        assert_eq!(wire.len(), 10);
        assert_eq!(&wire[..], &[0x0a, 0x00, 0x02, 0x01, 0x7f, 0x00, 0x00, 0x00, 0xaa, 0xbb]);
    }

    #[test]
    fn test_response_sets_high_bit_and_keeps_id() {
        let mut req = Message::request(0x05, Bytes::new()).unwrap();
        req.set_operation_id(77);

        let resp = Message::response(req.header(), OperationStatus::Success, vec![1]).unwrap();
        assert!(resp.is_response());
        assert_eq!(resp.header().message_type, 0x85);
        assert_eq!(resp.request_type(), 0x05);
        assert_eq!(resp.operation_id(), 77);
    }

    #[test]
    fn test_failed_response_drops_payload() {
        let req = Message::request(0x02, Bytes::new()).unwrap();
        let resp = Message::response(req.header(), OperationStatus::Invalid, vec![1, 2, 3]).unwrap();
        assert!(resp.payload().is_empty());
        assert_eq!(resp.status(), OperationStatus::Invalid);
    }

    #[test]
    fn test_short_message_rejected() {
        let err = Message::decode(&[0x08, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let wire = [0x0c, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xff];
        assert!(matches!(Message::decode(&wire), Err(BusError::InvalidMessage(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; PAYLOAD_SIZE_MAX + 1];
        assert!(Message::request(0x10, payload).is_err());
    }

    #[test]
    fn test_unassigned_status_maps_to_unknown() {
        assert_eq!(OperationStatus::from_u8(0x42), OperationStatus::UnknownError);
        assert_eq!(OperationStatus::from_u8(0xff), OperationStatus::Malfunction);
    }

    #[test]
    fn test_frame_envelope() {
        let msg = Message::request(0x03, vec![9, 9]).unwrap().encode();
        let env = Envelope { size: msg.len() as u16, dest_cport: 2, src_cport: 17 };

        let frame = encode_frame(&env, &msg);
        let (parsed, body) = decode_frame(&frame).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(body, msg);

        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }
}
