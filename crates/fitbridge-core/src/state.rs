//! Device states, disconnect reasons and confirm codes
//!
//! These enums travel on the wire as plain integers, so each carries an
//! explicit code and a fallible conversion back from it.

use std::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Device State
// ----------------------------------------------------------------------------

/// Visible state of a device manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Uninit,
    Searching,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Idle,
    Online,
    DPause,
    InvalidStep,
}

impl DeviceState {
    /// All states in wire-code order
    pub const ALL: [DeviceState; 10] = [
        DeviceState::Uninit,
        DeviceState::Searching,
        DeviceState::Connecting,
        DeviceState::Connected,
        DeviceState::Disconnecting,
        DeviceState::Disconnected,
        DeviceState::Idle,
        DeviceState::Online,
        DeviceState::DPause,
        DeviceState::InvalidStep,
    ];

    /// Integer code used on the wire
    pub fn code(self) -> i32 {
        match self {
            DeviceState::Uninit => 0,
            DeviceState::Searching => 1,
            DeviceState::Connecting => 2,
            DeviceState::Connected => 3,
            DeviceState::Disconnecting => 4,
            DeviceState::Disconnected => 5,
            DeviceState::Idle => 6,
            DeviceState::Online => 7,
            DeviceState::DPause => 8,
            DeviceState::InvalidStep => 9,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Upper-case name as shown to operators
    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Uninit => "UNINIT",
            DeviceState::Searching => "SEARCHING",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::Connected => "CONNECTED",
            DeviceState::Disconnecting => "DISCONNECTING",
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Idle => "IDLE",
            DeviceState::Online => "ONLINE",
            DeviceState::DPause => "DPAUSE",
            DeviceState::InvalidStep => "INVALIDSTEP",
        }
    }

    /// Fully stopped: nothing in flight and nothing connected
    pub fn is_stopped(self) -> bool {
        matches!(self, DeviceState::Uninit | DeviceState::Disconnected)
    }

    /// A link to the device exists (possibly with data flowing)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            DeviceState::Connected
                | DeviceState::Idle
                | DeviceState::Online
                | DeviceState::DPause
                | DeviceState::InvalidStep
        )
    }

    /// Waiting for the driver to complete a connect or disconnect
    pub fn is_transient(self) -> bool {
        matches!(self, DeviceState::Connecting | DeviceState::Disconnecting)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Disconnect Reason
// ----------------------------------------------------------------------------

/// Why a state transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    Requested,
    StateChange,
    Simulator,
    PrepareError,
    OperationError,
    Timeout,
    BleDisabled,
}

impl DisconnectReason {
    const ALL: [DisconnectReason; 7] = [
        DisconnectReason::Requested,
        DisconnectReason::StateChange,
        DisconnectReason::Simulator,
        DisconnectReason::PrepareError,
        DisconnectReason::OperationError,
        DisconnectReason::Timeout,
        DisconnectReason::BleDisabled,
    ];

    pub fn code(self) -> i32 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::StateChange => 1,
            DisconnectReason::Simulator => 2,
            DisconnectReason::PrepareError => 3,
            DisconnectReason::OperationError => 4,
            DisconnectReason::Timeout => 5,
            DisconnectReason::BleDisabled => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.code() == code)
    }

    /// Reasons that abort the whole fleet plan
    pub fn is_fatal(self) -> bool {
        matches!(self, DisconnectReason::PrepareError | DisconnectReason::BleDisabled)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::Requested => "REQUESTED",
            DisconnectReason::StateChange => "STATECHANGE",
            DisconnectReason::Simulator => "SIMULATOR",
            DisconnectReason::PrepareError => "PREPARE_ERROR",
            DisconnectReason::OperationError => "OPERATION_ERROR",
            DisconnectReason::Timeout => "TIMEOUT",
            DisconnectReason::BleDisabled => "BLE_DISABLED",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Confirm Codes
// ----------------------------------------------------------------------------

/// Result code carried by every `/confirm` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmCode {
    Ok,
    /// Malformed input or failed write
    Failed1,
    /// Not allowed in the current fleet state
    Failed2,
    /// No reply before the deadline
    Failed3,
}

impl ConfirmCode {
    pub fn code(self) -> i32 {
        match self {
            ConfirmCode::Ok => 0,
            ConfirmCode::Failed1 => -1,
            ConfirmCode::Failed2 => -2,
            ConfirmCode::Failed3 => -10,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ConfirmCode::Ok),
            -1 => Some(ConfirmCode::Failed1),
            -2 => Some(ConfirmCode::Failed2),
            -10 => Some(ConfirmCode::Failed3),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ConfirmCode::Ok
    }
}

/// Message attached to a state rejection
pub const MSG_DISCONNECT_FIRST: &str = "Please disconnect all devices before";

/// Message attached to a command timeout
pub const MSG_COMMAND_TIMEOUT: &str = "Timeout waiting for command response";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for state in DeviceState::ALL {
            assert_eq!(DeviceState::from_code(state.code()), Some(state));
        }
        assert_eq!(DeviceState::from_code(42), None);
    }

    #[test]
    fn stopped_and_connected_are_disjoint() {
        for state in DeviceState::ALL {
            assert!(!(state.is_stopped() && state.is_connected()), "{state}");
        }
    }

    #[test]
    fn confirm_timeout_code_is_reserved() {
        assert_eq!(ConfirmCode::Failed3.code(), -10);
        assert_eq!(ConfirmCode::from_code(-10), Some(ConfirmCode::Failed3));
        assert_eq!(ConfirmCode::from_code(-3), None);
    }
}
