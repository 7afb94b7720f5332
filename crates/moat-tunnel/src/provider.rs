//! Packet Tunnel Provider
//!
//! The data-plane half of the airlock. Receives the configuration bundle
//! saved by the manager, recomputes the capture policy from the flags it
//! carries, applies it to the interface and then swallows every packet
//! that is routed in.
//!
//! # Start sequence
//!
//! 1. Decode the bundle (missing flags default to `true`)
//! 2. Recompute the policy and compare it with the one carried along
//! 3. Apply the settings through the [`NetworkSettingsSink`]
//! 4. Spawn the drain loop

use crate::flow::{drain, DrainStats, PacketFlow};
use async_trait::async_trait;
use moat_vpn::{compute_settings, BundleError, NetworkCaptureSettings, TunnelConfiguration};
use std::fmt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where interface settings get applied (the OS binding)
#[async_trait]
pub trait NetworkSettingsSink: Send + Sync {
    /// Apply routes, addresses, DNS and MTU to the virtual interface
    async fn apply(&self, settings: &NetworkCaptureSettings) -> Result<(), SinkError>;
}

/// Settings rejected by the OS
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Why the tunnel is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// User turned the airlock off
    UserInitiated,
    /// Registration changed or was removed
    ConfigurationChanged,
    /// No usable network
    NetworkUnavailable,
    /// Device going to sleep
    Sleep,
    /// Anything else the OS reports
    Other(i32),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::UserInitiated => write!(f, "user initiated"),
            StopReason::ConfigurationChanged => write!(f, "configuration changed"),
            StopReason::NetworkUnavailable => write!(f, "network unavailable"),
            StopReason::Sleep => write!(f, "sleep"),
            StopReason::Other(code) => write!(f, "reason {}", code),
        }
    }
}

/// Provider errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Failed to set tunnel settings: {0}")]
    SettingsRejected(String),

    #[error("Tunnel already running")]
    AlreadyRunning,
}

struct DrainTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<DrainStats>,
}

/// Packet tunnel provider
pub struct PacketTunnelProvider<S> {
    /// OS binding
    sink: S,
    /// Settings applied by the last successful start
    settings: Option<NetworkCaptureSettings>,
    /// Running drain loop
    drain: Option<DrainTask>,
}

impl<S: NetworkSettingsSink> PacketTunnelProvider<S> {
    /// Create a new provider
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            settings: None,
            drain: None,
        }
    }

    /// Check if the drain loop is running
    pub fn is_running(&self) -> bool {
        self.drain.is_some()
    }

    /// Settings currently applied
    pub fn settings(&self) -> Option<&NetworkCaptureSettings> {
        self.settings.as_ref()
    }

    /// Start from a JSON-encoded bundle
    pub async fn start_tunnel_json<F: PacketFlow>(
        &mut self,
        bundle: &str,
        flow: F,
    ) -> Result<(), ProviderError> {
        let configuration = TunnelConfiguration::from_json(bundle)?;
        self.start_tunnel(&configuration, flow).await
    }

    /// Apply the policy and start discarding packets
    pub async fn start_tunnel<F: PacketFlow>(
        &mut self,
        configuration: &TunnelConfiguration,
        flow: F,
    ) -> Result<(), ProviderError> {
        if self.is_running() {
            return Err(ProviderError::AlreadyRunning);
        }

        info!("Starting tunnel...");

        let settings = resolve_settings(configuration);

        if let Err(e) = self.sink.apply(&settings).await {
            error!("Failed to set tunnel settings: {}", e);
            return Err(ProviderError::SettingsRejected(e.to_string()));
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(drain(flow, shutdown_rx));

        self.settings = Some(settings);
        self.drain = Some(DrainTask { shutdown, task });

        info!("Tunnel started successfully");
        Ok(())
    }

    /// Stop the tunnel and the drain loop
    pub async fn stop_tunnel(&mut self, reason: StopReason) -> DrainStats {
        info!("Stopping tunnel, reason: {}", reason);

        self.settings = None;

        let Some(DrainTask { shutdown, task }) = self.drain.take() else {
            return DrainStats::default();
        };

        // Loop may already have ended on a closed flow
        let _ = shutdown.send(());

        match task.await {
            Ok(stats) => {
                debug!("Discarded {} packets in {} batches", stats.packets, stats.batches);
                stats
            }
            Err(e) => {
                warn!("Drain loop ended abnormally: {}", e);
                DrainStats::default()
            }
        }
    }

    /// Handle a message from the controlling app. Never replies.
    pub fn handle_app_message(&self, data: &[u8]) -> Option<Vec<u8>> {
        match serde_json::from_slice::<serde_json::Value>(data) {
            Ok(message) => info!("Received app message: {}", message),
            Err(_) => debug!("Ignoring non-JSON app message ({} bytes)", data.len()),
        }
        None
    }
}

impl<S> Drop for PacketTunnelProvider<S> {
    fn drop(&mut self) {
        if let Some(DrainTask { shutdown, .. }) = self.drain.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Recompute the policy from the bundle's flags.
///
/// The flags are authoritative; a carried policy that disagrees is logged
/// and replaced.
pub fn resolve_settings(configuration: &TunnelConfiguration) -> NetworkCaptureSettings {
    let preferences = configuration.provider_configuration.preferences();
    let settings = compute_settings(&preferences);

    match &configuration.settings {
        Some(carried) if *carried != settings => {
            warn!(
                "Carried settings disagree with flags {:?}, using recomputed policy",
                preferences
            );
        }
        Some(_) => debug!("Carried settings match recomputed policy"),
        None => debug!("No carried settings, using recomputed policy"),
    }

    settings
}
