//! Cross-tab coordination
//!
//! Two pieces keep several open tabs from reacting to the same scanner:
//!
//! - [`broadcast`]: best-effort publish/subscribe between tabs, over a
//!   native channel or a shared-store relay behind one trait
//! - [`leader`]: lease-based election of the single tab allowed to capture
//!   keystrokes
//!
//! Both are optimistic. Failures are logged and degrade to "assume leader"
//! or "assume no peer".

pub mod broadcast;
pub mod leader;

pub use broadcast::{
    select_transport, BroadcastMessage, BroadcastSubscription, BroadcastTransport, Broadcaster,
    ChannelHub, ChannelTransport, StorageRelayTransport, TransportCapabilities, TransportReceiver,
};
pub use leader::{LeaderElection, LeaderRecord};

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Shared store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to encode broadcast message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No broadcast transport is available")]
    NoTransport,
}
