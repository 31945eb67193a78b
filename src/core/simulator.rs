//! Simulated modules
//!
//! Scriptable module endpoints for tests and the CLI. A simulated module
//! reads frames from a [`ChannelTransport`](super::transport::ChannelTransport)
//! receiver, answers control requests on its control cport and hands the
//! replies back to the bus through a [`FrameSink`].
//!
//! Per message type a [`ReplyRule`] decides whether the module answers
//! normally, stays silent or fails the request. Latency can be simulated
//! with optional random jitter.

use super::error::BusResult;
use super::message::{
    decode_frame, encode_frame, Envelope, InterfaceId, Message, OperationStatus,
};
use super::protocol::control::{ControlRequest, InterfaceIds, CONTROL_VERSION};
use super::protocol::ProtocolVersion;
use super::transport::FrameReceiver;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Where a simulated module sends its frames
pub trait FrameSink: Send + Sync {
    /// Deliver a frame (envelope + message) arriving from `intf`
    fn deliver(&self, intf: InterfaceId, frame: Bytes) -> BusResult<()>;
}

impl<F> FrameSink for F
where
    F: Fn(InterfaceId, Bytes) -> BusResult<()> + Send + Sync,
{
    fn deliver(&self, intf: InterfaceId, frame: Bytes) -> BusResult<()> {
        self(intf, frame)
    }
}

/// How a module reacts to one request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyRule {
    /// Handle the request normally
    Answer,
    /// Never respond
    Ignore,
    /// Respond with a failure status
    Fail {
        /// Wire status byte
        status: u8,
    },
}

/// Latency simulation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Base latency in ms
    pub base_ms: u64,
    /// Random jitter added on top, in ms
    pub jitter_ms: u64,
}

impl LatencyConfig {
    /// Delay for the next reply
    pub fn sample(&self) -> Duration {
        use rand::Rng;

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.base_ms.saturating_add(jitter))
    }
}

/// Description of a simulated module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleProfile {
    /// Display name
    pub name: String,
    /// Vendor id reported by `GET_IDS`
    pub vendor: u32,
    /// Product id reported by `GET_IDS`
    pub product: u32,
    /// Control protocol version the module speaks
    pub control_version: (u8, u8),
    /// Reply latency
    #[serde(default)]
    pub latency: LatencyConfig,
    /// Per message type overrides
    #[serde(default)]
    pub rules: HashMap<u8, ReplyRule>,
}

impl ModuleProfile {
    /// Well-behaved module
    pub fn new(name: &str, vendor: u32, product: u32) -> Self {
        Self {
            name: name.to_string(),
            vendor,
            product,
            control_version: (CONTROL_VERSION.major, CONTROL_VERSION.minor),
            latency: LatencyConfig::default(),
            rules: HashMap::new(),
        }
    }

    /// Override the reaction to one message type
    pub fn rule(mut self, message_type: u8, rule: ReplyRule) -> Self {
        self.rules.insert(message_type, rule);
        self
    }

    /// Set reply latency
    pub fn latency(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.latency = LatencyConfig { base_ms, jitter_ms };
        self
    }

    /// Speak a different control protocol version
    pub fn control_version(mut self, major: u8, minor: u8) -> Self {
        self.control_version = (major, minor);
        self
    }

    fn reply_rule(&self, message_type: u8) -> ReplyRule {
        self.rules.get(&message_type).copied().unwrap_or(ReplyRule::Answer)
    }
}

/// What a simulated module has seen
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleState {
    /// Device id set by the bus
    pub device_id: Option<u8>,
    /// Cports the host reported as connected
    pub connected: Vec<u16>,
    /// Requests received, by message type
    pub requests: HashMap<u8, u64>,
    /// Frames that could not be parsed
    pub malformed: u64,
}

/// A module endpoint answering control requests
pub struct SimulatedModule {
    profile: ModuleProfile,
    state: Arc<RwLock<ModuleState>>,
}

impl SimulatedModule {
    /// Create a module from a profile
    pub fn new(profile: ModuleProfile) -> Self {
        Self {
            profile,
            state: Arc::new(RwLock::new(ModuleState::default())),
        }
    }

    /// Profile
    pub fn profile(&self) -> &ModuleProfile {
        &self.profile
    }

    /// Shared view of the module state
    pub fn state(&self) -> Arc<RwLock<ModuleState>> {
        Arc::clone(&self.state)
    }

    /// Run the module on interface `intf` until the frame channel closes
    pub fn spawn(self, intf: InterfaceId, mut frames: FrameReceiver, sink: Arc<dyn FrameSink>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(intf, module = %self.profile.name, "simulated module running");
            while let Some(frame) = frames.recv().await {
                let Some((envelope, reply)) = self.handle_frame(&frame) else {
                    continue;
                };

                let delay = self.profile.latency.sample();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let out = Envelope::outbound(envelope.dest_cport, reply.len());
                if let Err(e) = sink.deliver(intf, encode_frame(&out, &reply)) {
                    warn!(intf, error = %e, "simulated module reply not delivered");
                }
            }
            debug!(intf, module = %self.profile.name, "simulated module stopped");
        })
    }

    /// Process one inbound frame; returns the reply to send, if any
    pub fn handle_frame(&self, frame: &[u8]) -> Option<(Envelope, Bytes)> {
        let parsed = decode_frame(frame).and_then(|(env, body)| Ok((env, Message::decode(&body)?)));
        let (envelope, request) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.state.write().malformed += 1;
                warn!(module = %self.profile.name, error = %e, "malformed frame");
                return None;
            }
        };

        if request.is_response() {
            trace!(module = %self.profile.name, "ignoring response");
            return None;
        }

        let message_type = request.request_type();
        *self.state.write().requests.entry(message_type).or_insert(0) += 1;

        let outcome = match self.profile.reply_rule(message_type) {
            ReplyRule::Ignore => {
                debug!(module = %self.profile.name, msg_type = message_type, "request ignored");
                return None;
            }
            ReplyRule::Fail { status } => Err(OperationStatus::from_u8(status)),
            ReplyRule::Answer => self.answer(message_type, request.payload()),
        };

        if request.operation_id() == 0 {
            return None;
        }

        let (status, payload) = match outcome {
            Ok(payload) => (OperationStatus::Success, payload),
            Err(status) => (status, Bytes::new()),
        };
        match Message::response(request.header(), status, payload) {
            Ok(response) => Some((envelope, response.encode())),
            Err(e) => {
                warn!(module = %self.profile.name, error = %e, "could not build response");
                None
            }
        }
    }

    fn answer(&self, message_type: u8, payload: &[u8]) -> Result<Bytes, OperationStatus> {
        let request = ControlRequest::decode(message_type, payload).map_err(|e| e.status())?;

        match request {
            ControlRequest::ProtocolVersion(_) => {
                let (major, minor) = self.profile.control_version;
                Ok(ProtocolVersion::new(major, minor).encode())
            }
            ControlRequest::GetIds => {
                Ok(InterfaceIds::new(self.profile.vendor, self.profile.product).encode())
            }
            ControlRequest::SetDeviceId { device_id } => {
                debug!(module = %self.profile.name, device_id, "device id set");
                self.state.write().device_id = Some(device_id);
                Ok(Bytes::new())
            }
            ControlRequest::Connected { cport } => {
                self.state.write().connected.push(cport);
                Ok(Bytes::new())
            }
            ControlRequest::Disconnected { cport } => {
                self.state.write().connected.retain(|c| *c != cport);
                Ok(Bytes::new())
            }
            ControlRequest::ProbeAp => Ok(Bytes::new()),
        }
    }
}
