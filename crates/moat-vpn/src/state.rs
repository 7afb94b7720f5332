//! Connection state and the intent view derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of the airlock tunnel, as reported by the tunnel
/// control capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Tunnel is down
    Disconnected,
    /// Start requested, not yet up
    Connecting,
    /// Tunnel is up and capturing traffic
    Connected,
    /// Tunnel is being re-established after a network change
    Reasserting,
    /// Stop requested, not yet confirmed down
    Disconnecting,
    /// Configuration missing or unusable
    Invalid,
}

impl ConnectionState {
    /// Derive the user-facing intent for this state
    pub fn intent(&self) -> DerivedIntent {
        DerivedIntent {
            is_connected: self.is_connected(),
            is_busy: self.is_busy(),
        }
    }

    /// Protected from the user's point of view.
    ///
    /// `Disconnecting` still counts until teardown is confirmed.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Disconnecting)
    }

    /// A transition is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Reasserting
                | ConnectionState::Disconnecting
        )
    }

    /// Down, for any reason. `Invalid` is folded in here.
    pub fn is_down(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Invalid)
    }

    /// Configuration unusable.
    ///
    /// Treated like `Disconnected` everywhere today; kept distinct so a
    /// re-permission prompt can tell the two apart.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ConnectionState::Invalid)
    }

    /// Get display label
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reasserting => "reasserting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the controller presents to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedIntent {
    pub is_connected: bool,
    pub is_busy: bool,
}

/// Status published to observers on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Raw connection state
    pub state: ConnectionState,
    /// Intent derived from `state`
    pub intent: DerivedIntent,
}

impl From<ConnectionState> for ControllerStatus {
    fn from(state: ConnectionState) -> Self {
        Self {
            state,
            intent: state.intent(),
        }
    }
}
