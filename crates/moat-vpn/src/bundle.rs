//! Tunnel Configuration Bundle
//!
//! The serialisable registration handed to the tunnel control capability
//! on connect. It carries the computed policy and, verbatim, the two
//! preference flags so the packet-handling side can recompute and check
//! the same policy on its own.

use crate::policy::NetworkCaptureSettings;
use crate::preferences::Preferences;
use serde::{Deserialize, Serialize};

/// Human-readable name of the registration
pub const TUNNEL_LABEL: &str = "Moat";

/// Loopback "server" the tunnel nominally connects to
pub const TUNNEL_SERVER_ADDRESS: &str = "127.0.0.1";

/// Identifier of the packet-handling provider
pub const PROVIDER_BUNDLE_IDENTIFIER: &str = "moat.packet-tunnel";

/// Preference flags as seen by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfiguration {
    #[serde(default = "default_true")]
    pub allow_multicast_discovery: bool,
    #[serde(default = "default_true")]
    pub allow_local_name_resolution: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderConfiguration {
    /// Preference snapshot carried by this configuration
    pub fn preferences(&self) -> Preferences {
        Preferences::new(self.allow_multicast_discovery, self.allow_local_name_resolution)
    }
}

impl Default for ProviderConfiguration {
    fn default() -> Self {
        Preferences::default().into()
    }
}

impl From<Preferences> for ProviderConfiguration {
    fn from(preferences: Preferences) -> Self {
        Self {
            allow_multicast_discovery: preferences.allow_multicast_discovery,
            allow_local_name_resolution: preferences.allow_local_name_resolution,
        }
    }
}

/// Registration saved with the tunnel control capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfiguration {
    /// Display label
    pub label: String,
    /// Nominal remote endpoint
    pub server_address: String,
    /// Provider that handles the tunnel's packets
    pub provider_bundle_identifier: String,
    /// Keep the airlock up while the device sleeps
    pub disconnect_on_sleep: bool,
    /// Registration enabled
    pub enabled: bool,
    /// Preference flags, verbatim
    #[serde(default)]
    pub provider_configuration: ProviderConfiguration,
    /// Policy computed by the controller (absent from older registrations)
    #[serde(default)]
    pub settings: Option<NetworkCaptureSettings>,
}

impl TunnelConfiguration {
    /// Build the registration for a preference snapshot and its policy
    pub fn new(preferences: Preferences, settings: NetworkCaptureSettings) -> Self {
        Self {
            label: TUNNEL_LABEL.to_string(),
            server_address: TUNNEL_SERVER_ADDRESS.to_string(),
            provider_bundle_identifier: PROVIDER_BUNDLE_IDENTIFIER.to_string(),
            disconnect_on_sleep: false,
            enabled: true,
            provider_configuration: preferences.into(),
            settings: Some(settings),
        }
    }

    /// Encode as JSON
    pub fn to_json(&self) -> Result<String, BundleError> {
        serde_json::to_string_pretty(self).map_err(|e| BundleError::Encode(e.to_string()))
    }

    /// Decode from JSON
    pub fn from_json(content: &str) -> Result<Self, BundleError> {
        serde_json::from_str(content).map_err(|e| BundleError::Decode(e.to_string()))
    }
}

/// Bundle encode/decode errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BundleError {
    #[error("Failed to encode tunnel configuration: {0}")]
    Encode(String),

    #[error("Failed to decode tunnel configuration: {0}")]
    Decode(String),
}
