//! Tunnel Control Capability
//!
//! The seam between the lifecycle controller and whatever actually owns
//! the OS tunnel. Calls may suspend and complete later; status changes
//! arrive separately as [`StatusEvent`]s on a single-consumer channel.

use crate::bundle::TunnelConfiguration;
use crate::state::ConnectionState;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Opaque identity of one tunnel registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(pub u64);

impl TunnelHandle {
    /// Create a new handle
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tunnel({})", self.0)
    }
}

/// Status change for a tunnel registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub handle: TunnelHandle,
    pub state: ConnectionState,
}

impl StatusEvent {
    pub fn new(handle: TunnelHandle, state: ConnectionState) -> Self {
        Self { handle, state }
    }
}

/// An existing registration found at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRegistration {
    pub handle: TunnelHandle,
    pub state: ConnectionState,
}

/// Identity of a status subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of the status channel
#[derive(Debug)]
pub struct StatusSubscription {
    id: SubscriptionId,
    rx: UnboundedReceiver<StatusEvent>,
}

impl StatusSubscription {
    /// Create a subscription together with its sending half
    pub fn channel(id: SubscriptionId) -> (UnboundedSender<StatusEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { id, rx })
    }

    /// Subscription identity, used to unsubscribe
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event without waiting
    pub fn try_next(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the sender side is gone
    pub async fn next(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }
}

/// Capability failures
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ControlError(pub String);

impl ControlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Abstract tunnel control provider
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Find an existing registration, if any
    async fn load_existing(&self) -> Result<Option<TunnelRegistration>, ControlError>;

    /// Allocate a fresh, unregistered handle
    fn create_handle(&self) -> TunnelHandle;

    /// Persist `configuration` for `handle`
    async fn save(
        &self,
        handle: TunnelHandle,
        configuration: &TunnelConfiguration,
    ) -> Result<(), ControlError>;

    /// Reload a saved registration before starting it
    async fn reload(&self, handle: TunnelHandle) -> Result<(), ControlError>;

    /// Start the tunnel; completion is reported via status events
    async fn start(&self, handle: TunnelHandle) -> Result<(), ControlError>;

    /// Ask the tunnel to stop; completion is reported via status events
    async fn stop(&self, handle: TunnelHandle);

    /// Subscribe to status events for all registrations
    fn subscribe(&self) -> StatusSubscription;

    /// Release a subscription
    fn unsubscribe(&self, id: SubscriptionId);
}
