//----------------------------------------------------------------------------------------------
// Module session
// Session state graph and the state owned by one connection

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::daq::DaqList;
use crate::error::XcpError;
use crate::protocol::Resource;

//----------------------------------------------------------------------------------------------
// SessionState

/// Lifecycle state of a XCP session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Unlocking,
    Unlocked,
    ConfiguringDaq,
    DaqRunning,
    DaqStopped,
    Error,
}

impl SessionState {
    /// Edges of the state graph
    /// Disconnect and the transition to Error are accepted from every state
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (_, Disconnected) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Unlocking) | (Unlocked, Unlocking) => true,
            (Unlocking, Unlocked) | (Unlocking, Connected) => true,
            (Connected, ConfiguringDaq) | (Unlocked, ConfiguringDaq) | (DaqStopped, ConfiguringDaq) => true,
            // Allocation failure
            (ConfiguringDaq, Connected) => true,
            (ConfiguringDaq, DaqRunning) | (DaqStopped, DaqRunning) => true,
            (DaqRunning, DaqStopped) => true,
            _ => false,
        }
    }

    /// Session is established, commands may be sent
    pub fn is_connected(self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting | SessionState::Error)
    }

    /// DAQ lists are configured on the target
    pub fn has_daq_lists(self) -> bool {
        matches!(self, SessionState::ConfiguringDaq | SessionState::DaqRunning | SessionState::DaqStopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

//----------------------------------------------------------------------------------------------
// Session

/// State of one connection, replaced wholesale on reconnect
#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    config: Option<SessionConfig>,
    // Resources still protected, from CONNECT and every UNLOCK response
    protection: Resource,
    lists: Vec<DaqList>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move along the state graph, an undefined edge is a caller error
    pub fn transition(&mut self, to: SessionState) -> Result<(), XcpError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(XcpError::InvalidState {
                operation: "state transition",
                state: self.state,
            });
        }
        debug!("Session state {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Check that `operation` is accepted in the current state
    pub fn require(&self, operation: &'static str, accepted: &[SessionState]) -> Result<(), XcpError> {
        if accepted.contains(&self.state) {
            Ok(())
        } else {
            Err(XcpError::InvalidState { operation, state: self.state })
        }
    }

    pub fn require_connected(&self, operation: &'static str) -> Result<(), XcpError> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(XcpError::InvalidState { operation, state: self.state })
        }
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Negotiated configuration, fails if there is no connection
    pub fn negotiated(&self, operation: &'static str) -> Result<&SessionConfig, XcpError> {
        self.config.as_ref().ok_or(XcpError::InvalidState { operation, state: self.state })
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.protection = config.protection;
        self.config = Some(config);
    }

    pub fn protection(&self) -> Resource {
        self.protection
    }

    pub fn set_protection(&mut self, protection: Resource) {
        self.protection = protection;
    }

    /// Resource may be used without unlock
    pub fn is_accessible(&self, resource: Resource) -> bool {
        !self.protection.intersects(resource)
    }

    pub fn lists(&self) -> &[DaqList] {
        &self.lists
    }

    pub fn set_lists(&mut self, lists: Vec<DaqList>) {
        self.lists = lists;
    }

    pub fn clear_lists(&mut self) {
        self.lists.clear();
    }

    /// Drop everything negotiated, back to Disconnected
    pub fn reset(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!("Session state {} -> {}", self.state, SessionState::Disconnected);
        }
        *self = Session::default();
    }
}

//----------------------------------------------------------------------------------------------
