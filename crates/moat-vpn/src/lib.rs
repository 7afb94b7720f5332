//! Moat VPN - Local-Only Network Airlock
//!
//! Configures and supervises a dead-end virtual interface that swallows
//! all internet-bound traffic while the local network keeps working.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  toggle   ┌──────────────┐  save/start/stop  ┌────────────────┐
//! │   Observer   │──────────▶│  VpnManager  │──────────────────▶│ TunnelControl  │
//! │  (UI, CLI)   │◀──────────│ (state mach.)│◀──────────────────│  (OS binding)  │
//! └──────────────┘  status   └──────┬───────┘   status events   └────────────────┘
//!                                   │ snapshot
//!                                   ▼
//!                      ┌──────────────────────────┐
//!                      │ Preferences → compute_   │
//!                      │ settings (pure policy)   │
//!                      └──────────────────────────┘
//! ```
//!
//! # Policy
//!
//! - **Capture everything**: default route for IPv4 and IPv6 into the tunnel
//! - **Exclude the LAN**: private, unique-local, link-local, broadcast
//! - **Optional carve-outs**: multicast discovery, local DNS fallback
//! - **Dead-end DNS**: resolver points at the tunnel's own address

mod bundle;
mod control;
mod manager;
mod policy;
mod preferences;
mod state;

pub use bundle::{
    BundleError, ProviderConfiguration, TunnelConfiguration, PROVIDER_BUNDLE_IDENTIFIER,
    TUNNEL_LABEL, TUNNEL_SERVER_ADDRESS,
};
pub use control::{
    ControlError, StatusEvent, StatusSubscription, SubscriptionId, TunnelControl, TunnelHandle,
    TunnelRegistration,
};
pub use manager::{ManagerCommand, VpnError, VpnManager};
pub use policy::{
    compute_settings, DnsSettings, NetworkCaptureSettings, RouteDecision, RouteSet,
    MATCH_ALL_DOMAINS, TUNNEL_ADDRESS_V4, TUNNEL_ADDRESS_V6, TUNNEL_MTU,
};
pub use preferences::{ConfigFormat, PreferenceError, PreferenceSource, PreferenceStore, Preferences};
pub use state::{ConnectionState, ControllerStatus, DerivedIntent};
