//! Interfaces
//!
//! One [`Interface`] per attached module endpoint, owned by the hotplug
//! manager. Its lifecycle is a forward-only state machine with an error
//! exit to `Removed` from every non-terminal state.

use super::error::{BusError, BusResult};
use super::message::{CportId, InterfaceId};
use super::protocol::control::InterfaceIds;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface id of the SVC
pub const SVC_INTERFACE_ID: InterfaceId = 0;
/// Interface id of the host (AP)
pub const HOST_INTERFACE_ID: InterfaceId = 1;

/// Keep at most this many transitions per interface
const MAX_HISTORY: usize = 32;

/// Hotplug state of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceState {
    /// Link attached, nothing known yet
    Unidentified,
    /// Temporary control route up, reading identifiers
    Identifying,
    /// Identified, setting up data routes
    Routing,
    /// Device id allocated and data routes installed
    DeviceIdAssigned,
    /// Running connection and interface initialization
    Initializing,
    /// Fully operational
    Active,
    /// Teardown in progress
    Detaching,
    /// Gone; all resources released
    Removed,
}

impl InterfaceState {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Check if the attach sequence is still running
    pub fn is_attaching(&self) -> bool {
        matches!(
            self,
            Self::Unidentified | Self::Identifying | Self::Routing | Self::DeviceIdAssigned | Self::Initializing
        )
    }

    /// Coarse lifecycle stage
    pub fn stage(&self) -> LifecycleStage {
        match self {
            Self::Unidentified | Self::Identifying => LifecycleStage::Unidentified,
            Self::Routing => LifecycleStage::Identified,
            Self::DeviceIdAssigned | Self::Initializing => LifecycleStage::Routed,
            Self::Active | Self::Detaching => LifecycleStage::Initialized,
            Self::Removed => LifecycleStage::Removed,
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use InterfaceState::*;

        match (self, next) {
            (Unidentified, Identifying)
            | (Identifying, Routing)
            | (Routing, DeviceIdAssigned)
            | (DeviceIdAssigned, Initializing)
            | (Initializing, Active)
            | (Active, Detaching)
            | (Detaching, Removed) => true,
            // Error exit unwinds straight to Removed
            (from, Removed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unidentified => "unidentified",
            Self::Identifying => "identifying",
            Self::Routing => "routing",
            Self::DeviceIdAssigned => "device-id-assigned",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Detaching => "detaching",
            Self::Removed => "removed",
        };
        write!(f, "{}", name)
    }
}

/// Coarse interface lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    /// Not yet identified
    Unidentified,
    /// Identifiers known
    Identified,
    /// Device id and routes in place
    Routed,
    /// Initialized and usable
    Initialized,
    /// Removed
    Removed,
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: InterfaceState,
    /// New state
    pub to: InterfaceState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// One attached module endpoint
#[derive(Debug, Clone)]
pub struct Interface {
    id: InterfaceId,
    state: InterfaceState,
    ids: Option<InterfaceIds>,
    device_id: Option<u8>,
    control_cport: CportId,
    host_cport: Option<CportId>,
    authorized: bool,
    attached_at: DateTime<Local>,
    history: Vec<StateTransition>,
}

impl Interface {
    /// New interface in `Unidentified`
    pub fn new(id: InterfaceId, control_cport: CportId) -> Self {
        Self {
            id,
            state: InterfaceState::Unidentified,
            ids: None,
            device_id: None,
            control_cport,
            host_cport: None,
            authorized: false,
            attached_at: Local::now(),
            history: Vec::new(),
        }
    }

    /// Interface id
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> InterfaceState {
        self.state
    }

    /// Identification data, once read
    pub fn ids(&self) -> Option<InterfaceIds> {
        self.ids
    }

    /// Assigned device id; only valid while attached
    pub fn device_id(&self) -> Option<u8> {
        self.device_id
    }

    /// Control cport on the interface
    pub fn control_cport(&self) -> CportId {
        self.control_cport
    }

    /// Host cport of the control connection
    pub fn host_cport(&self) -> Option<CportId> {
        self.host_cport
    }

    /// Has the module been authorized?
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Transition history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub(crate) fn set_ids(&mut self, ids: InterfaceIds) {
        self.ids = Some(ids);
    }

    pub(crate) fn set_device_id(&mut self, device_id: Option<u8>) {
        self.device_id = device_id;
    }

    pub(crate) fn set_host_cport(&mut self, cport: Option<CportId>) {
        self.host_cport = cport;
    }

    pub(crate) fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
    }

    /// Move to a new state
    pub fn transition(&mut self, next: InterfaceState, reason: Option<&str>) -> BusResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(BusError::InvalidState(format!(
                "interface {}: {} -> {}",
                self.id, self.state, next
            )));
        }

        self.history.push(StateTransition {
            from: self.state,
            to: next,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }

        self.state = next;
        if next.is_terminal() {
            self.device_id = None;
            self.host_cport = None;
        }
        Ok(())
    }

    /// Serializable snapshot
    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            id: self.id,
            state: self.state,
            vendor: self.ids.map(|ids| ids.vendor),
            product: self.ids.map(|ids| ids.product),
            device_id: self.device_id,
            authorized: self.authorized,
            attached_at: self.attached_at,
        }
    }
}

/// Interface snapshot for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface id
    pub id: InterfaceId,
    /// State
    pub state: InterfaceState,
    /// Vendor id, if identified
    pub vendor: Option<u32>,
    /// Product id, if identified
    pub product: Option<u32>,
    /// Device id, if assigned
    pub device_id: Option<u8>,
    /// Authorization granted
    pub authorized: bool,
    /// Attach time
    pub attached_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_path() {
        let mut intf = Interface::new(3, 2);
        for next in [
            InterfaceState::Identifying,
            InterfaceState::Routing,
            InterfaceState::DeviceIdAssigned,
            InterfaceState::Initializing,
            InterfaceState::Active,
        ] {
            intf.transition(next, None).unwrap();
        }
        assert_eq!(intf.state(), InterfaceState::Active);
        assert_eq!(intf.state().stage(), LifecycleStage::Initialized);
        assert_eq!(intf.history().len(), 5);
    }

    #[test]
    fn test_no_skipping_ahead() {
        let mut intf = Interface::new(3, 2);
        assert!(intf.transition(InterfaceState::Active, None).is_err());
        assert_eq!(intf.state(), InterfaceState::Unidentified);
    }

    #[test]
    fn test_error_exit_clears_device_id() {
        let mut intf = Interface::new(4, 2);
        intf.transition(InterfaceState::Identifying, None).unwrap();
        intf.transition(InterfaceState::Routing, None).unwrap();
        intf.set_device_id(Some(2));
        intf.transition(InterfaceState::Removed, Some("route failed")).unwrap();

        assert_eq!(intf.device_id(), None);
        assert_eq!(intf.history().last().unwrap().reason.as_deref(), Some("route failed"));
    }

    #[test]
    fn test_removed_is_terminal() {
        let mut intf = Interface::new(4, 2);
        intf.transition(InterfaceState::Removed, None).unwrap();
        assert!(intf.transition(InterfaceState::Removed, None).is_err());
        assert!(intf.transition(InterfaceState::Identifying, None).is_err());
    }
}
