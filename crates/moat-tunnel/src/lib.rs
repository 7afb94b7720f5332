//! Moat Tunnel - Packet-Handling Side of the Airlock
//!
//! Runs wherever the OS hands packets to the virtual interface. It
//! recomputes the capture policy from the registration's flags, applies
//! it, and discards every captured packet for as long as the tunnel
//! lives.
//!
//! ```text
//!  TunnelConfiguration ──▶ resolve_settings ──▶ NetworkSettingsSink
//!                                                     │
//!                      PacketFlow ──▶ drain ──▶ (discarded)
//! ```

mod flow;
mod provider;

pub use flow::{drain, DrainStats, PacketFlow};
pub use provider::{
    resolve_settings, NetworkSettingsSink, PacketTunnelProvider, ProviderError, SinkError,
    StopReason,
};
