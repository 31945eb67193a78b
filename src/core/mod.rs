//! Core module containing the module bus control plane
//!
//! This module provides:
//! - Message and envelope codec with wire status codes
//! - Transport capability and an in-memory channel transport
//! - Routing fabric with device table, admission policy and message filters
//! - Operation correlation (pending table, deadlines, cancellation)
//! - Protocol registry with the control and SVC protocols
//! - Host connection table
//! - SVC channel
//! - Hotplug state machine with unwind on failure
//! - Keyed worker pool
//! - Simulated modules
//! - Bus facade tying it all together

pub mod bus;
pub mod connection;
pub mod error;
pub mod hotplug;
pub mod id_pool;
pub mod interface;
pub mod message;
pub mod operation;
pub mod protocol;
pub mod routing;
pub mod simulator;
pub mod svc;
pub mod transport;
pub mod worker;
