//! # modsbus Core Library
//!
//! Control plane of a modular-device bus: a supervisory channel (SVC),
//! a host, and hot-pluggable modules exchanging request/response messages
//! over cport-addressed routes.
//!
//! ## Features
//!
//! - Cport routing fabric with symmetric route pairs
//! - Operation correlation with deadlines and cancel
//! - Versioned protocol registry with reference counts
//! - Hotplug state machine with full unwind on failure
//! - Optional authorization gate for new modules
//! - Simulated modules for tests and the CLI
//! - CLI with exit codes and JSON output
//!
//! ## Example
//!
//! ```rust,no_run
//! use modsbus_core::{Bus, BusConfig, BusEvent, ChannelTransport, FrameSink, ModuleProfile, SimulatedModule};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = Bus::new(BusConfig::default())?;
//!     bus.start().await?;
//!
//!     let mut events = bus.subscribe();
//!     let (transport, frames) = ChannelTransport::new("camera");
//!     let sink: Arc<dyn FrameSink> = bus.clone();
//!     SimulatedModule::new(ModuleProfile::new("camera", 0x10, 0x20)).spawn(3, frames, sink);
//!
//!     bus.interface_attached(3, Arc::new(transport))?.await??;
//!     while let Ok(event) = events.recv().await {
//!         if let BusEvent::ModuleAvailable { intf, device_id, .. } = event {
//!             println!("interface {} is device {}", intf, device_id);
//!             break;
//!         }
//!     }
//!
//!     bus.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{BusConfig, ConfigError, LoggingConfig};
pub use crate::core::bus::{Bus, BusEvent, BusStats, HotplugCompletion};
pub use crate::core::connection::{Connection, ConnectionInfo, ConnectionState};
pub use crate::core::error::{BusError, BusResult};
pub use crate::core::interface::{InterfaceInfo, InterfaceState};
pub use crate::core::message::{Envelope, Message, MessageHeader, OperationStatus};
pub use crate::core::protocol::{ProtocolHandler, ProtocolRegistry, ProtocolVersion};
pub use crate::core::routing::{CportAddr, RoutingFabric};
pub use crate::core::simulator::{FrameSink, ModuleProfile, ReplyRule, SimulatedModule};
pub use crate::core::transport::{ChannelTransport, Transport, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
