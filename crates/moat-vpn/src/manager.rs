//! VPN Manager
//!
//! Owns the airlock's connection state machine. Turns user intents into
//! start/stop calls against a [`TunnelControl`] capability, applies the
//! policy computed for the current preferences at connect time, and
//! republishes every state change to observers.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut vpn = VpnManager::new(control, Arc::new(PreferenceStore::open("moat.toml")?));
//! vpn.load_configuration().await.ok();
//!
//! vpn.toggle().await?;            // Connecting
//! vpn.next_event().await;          // Connected, once the OS confirms
//!
//! let status = vpn.subscribe_status();
//! println!("protected: {}", status.borrow().intent.is_connected);
//! ```
//!
//! # Transitions
//!
//! ```text
//!  Disconnected/Invalid --connect--> Connecting --event--> Connected
//!  Connecting/Connected --event--> Reasserting --event--> Connected
//!  Connected/Reasserting --disconnect--> Disconnecting --event--> Disconnected
//!  Disconnecting --Connected event--> Connected
//!  any --Disconnected/Invalid event--> down
//! ```
//!
//! Events that fit none of these are logged and dropped.
//!
//! All mutation goes through `&mut self`, so the state machine needs no
//! locking. Status events for a handle other than the tracked one are
//! dropped.

use crate::bundle::TunnelConfiguration;
use crate::control::{StatusEvent, StatusSubscription, TunnelControl, TunnelHandle};
use crate::policy::compute_settings;
use crate::preferences::PreferenceSource;
use crate::state::{ConnectionState, ControllerStatus, DerivedIntent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// VPN Manager errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VpnError {
    #[error("Failed to load tunnel configuration: {0}")]
    ConfigurationLoadFailed(String),

    #[error("Failed to save tunnel configuration: {0}")]
    ConfigurationSaveFailed(String),

    #[error("Failed to reload tunnel configuration: {0}")]
    ConfigurationReloadFailed(String),

    #[error("Failed to start tunnel: {0}")]
    TunnelStartFailed(String),

    #[error("Tunnel is busy ({0})")]
    Busy(ConnectionState),

    #[error("VPN already connected")]
    AlreadyConnected,

    #[error("VPN not connected")]
    NotConnected,
}

/// Requests accepted by [`VpnManager::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerCommand {
    /// Connect if down, disconnect if up
    Toggle,
    /// Connect
    Connect,
    /// Disconnect
    Disconnect,
    /// Re-synchronise with the capability's registrations
    Reload,
    /// Release the subscription and stop the loop
    Shutdown,
}

/// VPN Manager
///
/// Tracks one tunnel handle and its [`ConnectionState`].
pub struct VpnManager {
    /// Tunnel control capability
    control: Arc<dyn TunnelControl>,
    /// Where the preference snapshot comes from
    preferences: Arc<dyn PreferenceSource>,
    /// Registration currently tracked
    handle: Option<TunnelHandle>,
    /// Current state
    state: ConnectionState,
    /// Status event subscription, released exactly once
    subscription: Option<StatusSubscription>,
    /// Observer channel
    status_tx: watch::Sender<ControllerStatus>,
}

impl VpnManager {
    /// Create a new VPN manager and subscribe to status events
    pub fn new(control: Arc<dyn TunnelControl>, preferences: Arc<dyn PreferenceSource>) -> Self {
        let subscription = control.subscribe();
        let (status_tx, _) = watch::channel(ControllerStatus::from(ConnectionState::Disconnected));

        debug!("Subscribed to tunnel status ({:?})", subscription.id());

        Self {
            control,
            preferences,
            handle: None,
            state: ConnectionState::Disconnected,
            subscription: Some(subscription),
            status_tx,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the intent derived from the current state
    pub fn intent(&self) -> DerivedIntent {
        self.state.intent()
    }

    /// Check if the airlock is up (or still tearing down)
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Check if a transition is in flight
    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    /// Handle currently tracked
    pub fn handle(&self) -> Option<TunnelHandle> {
        self.handle
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Synchronise with the capability's existing registration.
    ///
    /// Adopts the registration's handle and status if there is one,
    /// otherwise tracks a fresh unregistered handle in `Disconnected`.
    /// Never starts or stops anything, and does nothing while a tracked
    /// tunnel is up or in transition. A load failure keeps the tracked
    /// handle (or falls back to a fresh one) and is returned for the
    /// caller's information only.
    pub async fn load_configuration(&mut self) -> Result<(), VpnError> {
        if let Some(handle) = self.handle {
            if !self.state.is_down() {
                debug!("Keeping {} while {}", handle, self.state);
                return Ok(());
            }
        }

        match self.control.load_existing().await {
            Ok(Some(registration)) => {
                info!(
                    "Found existing registration {} ({})",
                    registration.handle, registration.state
                );
                self.handle = Some(registration.handle);
                self.set_state(registration.state);
                Ok(())
            }
            Ok(None) => {
                let handle = self.control.create_handle();
                debug!("No existing registration, using fresh {}", handle);
                self.handle = Some(handle);
                self.set_state(ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load tunnel configuration: {}", e);
                if self.handle.is_none() {
                    self.handle = Some(self.control.create_handle());
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(VpnError::ConfigurationLoadFailed(e.to_string()))
            }
        }
    }

    /// Connect if down, disconnect if up.
    ///
    /// Rejected with [`VpnError::Busy`] while a transition is in flight so
    /// two start/stop calls never race on the same handle.
    pub async fn toggle(&mut self) -> Result<(), VpnError> {
        if self.state.is_busy() {
            debug!("Ignoring toggle while {}", self.state);
            return Err(VpnError::Busy(self.state));
        }

        if self.state.is_connected() {
            self.disconnect().await
        } else {
            self.connect().await
        }
    }

    /// Connect the airlock
    ///
    /// 1. Reads the preference snapshot
    /// 2. Computes the capture policy
    /// 3. Saves, reloads and starts the registration
    ///
    /// Returns once the start call is accepted; the state stays
    /// `Connecting` until the capability reports otherwise. Any failure
    /// lands back in `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), VpnError> {
        if self.state.is_busy() {
            return Err(VpnError::Busy(self.state));
        }
        if self.state.is_connected() {
            return Err(VpnError::AlreadyConnected);
        }

        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let handle = self.control.create_handle();
                self.handle = Some(handle);
                handle
            }
        };

        self.set_state(ConnectionState::Connecting);

        let preferences = self.preferences.snapshot();
        let settings = compute_settings(&preferences);
        let configuration = TunnelConfiguration::new(preferences, settings);

        info!(
            "Connecting {} (multicast discovery: {}, local DNS: {})",
            handle, preferences.allow_multicast_discovery, preferences.allow_local_name_resolution
        );

        match self.register_and_start(handle, &configuration).await {
            Ok(()) => {
                debug!("Start accepted for {}", handle);
                Ok(())
            }
            Err(e) => {
                error!("VPN connection failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Save, reload and start the registration
    async fn register_and_start(
        &self,
        handle: TunnelHandle,
        configuration: &TunnelConfiguration,
    ) -> Result<(), VpnError> {
        self.control
            .save(handle, configuration)
            .await
            .map_err(|e| VpnError::ConfigurationSaveFailed(e.to_string()))?;

        self.control
            .reload(handle)
            .await
            .map_err(|e| VpnError::ConfigurationReloadFailed(e.to_string()))?;

        self.control
            .start(handle)
            .await
            .map_err(|e| VpnError::TunnelStartFailed(e.to_string()))
    }

    /// Disconnect the airlock
    ///
    /// Moves to `Disconnecting` and asks the capability to stop. The state
    /// only reaches `Disconnected` once the capability confirms.
    pub async fn disconnect(&mut self) -> Result<(), VpnError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Reasserting => {}
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(VpnError::Busy(self.state));
            }
            ConnectionState::Disconnected | ConnectionState::Invalid => {
                return Err(VpnError::NotConnected);
            }
        }

        let handle = self.handle.ok_or(VpnError::NotConnected)?;

        info!("Disconnecting {}", handle);
        self.set_state(ConnectionState::Disconnecting);
        self.control.stop(handle).await;

        Ok(())
    }

    /// Apply a status event. Returns whether the state changed.
    ///
    /// Events for another handle, and events the transition table does not
    /// allow from the current state, are logged and dropped. `Disconnected`
    /// and `Invalid` are accepted from any state. An `Invalid` report is
    /// kept as the raw `Invalid` state rather than folded into
    /// `Disconnected`; both derive the same intent.
    pub fn handle_event(&mut self, event: StatusEvent) -> bool {
        if self.handle != Some(event.handle) {
            debug!(
                "Ignoring {} status for {} (tracking {:?})",
                event.state, event.handle, self.handle
            );
            return false;
        }

        if !accepts_event(self.state, event.state) {
            warn!(
                "Ignoring {} status for {} while {}",
                event.state, event.handle, self.state
            );
            return false;
        }

        let expected = self.state.is_down() || self.state == ConnectionState::Disconnecting;
        if event.state.is_down() && !expected {
            warn!("Tunnel {} went down unexpectedly from {}", event.handle, self.state);
        }

        self.set_state(event.state)
    }

    /// Apply every queued status event without waiting.
    /// Returns the number of events applied.
    pub fn process_pending_events(&mut self) -> usize {
        let mut events = Vec::new();
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(event) = subscription.try_next() {
                events.push(event);
            }
        }

        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        count
    }

    /// Wait for one status event and apply it.
    ///
    /// Returns `None` once the subscription is closed or released.
    pub async fn next_event(&mut self) -> Option<StatusEvent> {
        let event = self.subscription.as_mut()?.next().await?;
        self.handle_event(event);
        Some(event)
    }

    /// Drive the manager from a command channel and the status
    /// subscription until `Shutdown` (or the command channel closes).
    ///
    /// Commands and events are applied one at a time.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ManagerCommand>) {
        // Held outside `self` so the loop can borrow both; still released if
        // this future is dropped mid-loop.
        let mut held = HeldSubscription {
            control: self.control.clone(),
            subscription: self.subscription.take(),
        };
        let mut events_open = held.subscription.is_some();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if command == ManagerCommand::Shutdown {
                        break;
                    }
                    if let Err(e) = self.execute(command).await {
                        warn!("{:?} rejected: {}", command, e);
                    }
                }
                event = next_status(&mut held.subscription), if events_open => {
                    match event {
                        Some(event) => {
                            self.handle_event(event);
                        }
                        None => {
                            debug!("Status subscription closed");
                            events_open = false;
                        }
                    }
                }
            }
        }

        self.subscription = held.subscription.take();
        self.shutdown();
    }

    async fn execute(&mut self, command: ManagerCommand) -> Result<(), VpnError> {
        match command {
            ManagerCommand::Toggle => self.toggle().await,
            ManagerCommand::Connect => self.connect().await,
            ManagerCommand::Disconnect => self.disconnect().await,
            ManagerCommand::Reload => self.load_configuration().await,
            ManagerCommand::Shutdown => Ok(()),
        }
    }

    /// Release the status subscription and drop the manager
    pub fn shutdown(mut self) {
        self.release_subscription();
        info!("VPN manager shut down ({})", self.state);
    }

    fn release_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            debug!("Releasing status subscription {:?}", subscription.id());
            self.control.unsubscribe(subscription.id());
        }
    }

    /// Record and publish a new state. Returns whether it changed.
    fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }

        debug!("State {} -> {}", self.state, state);
        self.state = state;
        self.status_tx.send_replace(ControllerStatus::from(state));
        true
    }
}

/// Which reported states may follow `current`
fn accepts_event(current: ConnectionState, reported: ConnectionState) -> bool {
    use ConnectionState::*;

    match reported {
        Disconnected | Invalid => true,
        Connecting => current == Connecting,
        Connected => matches!(current, Connecting | Connected | Reasserting | Disconnecting),
        Reasserting => matches!(current, Connecting | Connected | Reasserting),
        Disconnecting => matches!(current, Connected | Reasserting | Disconnecting),
    }
}

/// Subscription taken out of the manager by [`VpnManager::run`]
struct HeldSubscription {
    control: Arc<dyn TunnelControl>,
    subscription: Option<StatusSubscription>,
}

impl Drop for HeldSubscription {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            debug!("Releasing status subscription {:?} (run cancelled)", subscription.id());
            self.control.unsubscribe(subscription.id());
        }
    }
}

async fn next_status(subscription: &mut Option<StatusSubscription>) -> Option<StatusEvent> {
    match subscription.as_mut() {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

impl Drop for VpnManager {
    fn drop(&mut self) {
        self.release_subscription();
    }
}
