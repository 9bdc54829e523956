//! Tab-to-tab broadcast
//!
//! Messages carry `{type, data, timestamp, tabId}` over one of two
//! transports:
//!
//! - [`ChannelTransport`]: a native origin-wide channel ([`ChannelHub`])
//! - [`StorageRelayTransport`]: writes each message under a fresh key in the
//!   [`SharedStore`] and removes it straight away; peers read the message
//!   from the store's change event
//!
//! Delivery is at most once per send with no ordering guarantee, so
//! subscriptions drop their own tab's messages and recent duplicates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use super::CoordinatorError;
use crate::clock::Clock;
use crate::storage::{SharedStore, StorageEvent};

const HUB_CAPACITY: usize = 256;
const DEDUPE_WINDOW: usize = 64;

/// Wire format shared by every transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    /// Epoch milliseconds at send time
    pub timestamp: i64,
    pub tab_id: String,
}

/// Origin-wide native channel; every tab of the origin holds the same hub
#[derive(Debug, Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }
}

/// Raw message stream handed out by a transport
pub enum TransportReceiver {
    Channel(broadcast::Receiver<BroadcastMessage>),
    Storage {
        events: broadcast::Receiver<StorageEvent>,
        key_prefix: String,
    },
}

impl TransportReceiver {
    /// Next message, or `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self {
                TransportReceiver::Channel(rx) => match rx.recv().await {
                    Ok(message) => return Some(message),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Broadcast receiver lagged, {} message(s) lost", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
                TransportReceiver::Storage { events, key_prefix } => match events.recv().await {
                    Ok(event) => {
                        if !event.key.starts_with(key_prefix.as_str()) {
                            continue;
                        }
                        // The removal that follows every relay write carries no value
                        let Some(raw) = event.new_value else {
                            continue;
                        };
                        match serde_json::from_str::<BroadcastMessage>(&raw) {
                            Ok(message) => return Some(message),
                            Err(e) => tracing::warn!("Ignoring malformed relay message: {}", e),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Storage relay lagged, {} event(s) lost", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// A way of getting messages to the other tabs of the origin
pub trait BroadcastTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, message: &BroadcastMessage) -> Result<(), CoordinatorError>;

    fn subscribe(&self) -> TransportReceiver;
}

/// Transport over the native channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    hub: ChannelHub,
}

impl ChannelTransport {
    pub fn new(hub: ChannelHub) -> Self {
        Self { hub }
    }
}

impl BroadcastTransport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn send(&self, message: &BroadcastMessage) -> Result<(), CoordinatorError> {
        if self.hub.sender.send(message.clone()).is_err() {
            tracing::debug!("No broadcast listeners for '{}'", message.message_type);
        }
        Ok(())
    }

    fn subscribe(&self) -> TransportReceiver {
        TransportReceiver::Channel(self.hub.sender.subscribe())
    }
}

/// Transport that relays messages through shared-store change events
pub struct StorageRelayTransport {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
}

impl std::fmt::Debug for StorageRelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRelayTransport")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl StorageRelayTransport {
    pub fn new(store: Arc<dyn SharedStore>, namespace: &str) -> Self {
        Self {
            store,
            key_prefix: format!("{}:broadcast:", namespace),
        }
    }
}

impl BroadcastTransport for StorageRelayTransport {
    fn name(&self) -> &'static str {
        "storage-relay"
    }

    fn send(&self, message: &BroadcastMessage) -> Result<(), CoordinatorError> {
        let key = format!("{}{}:{}", self.key_prefix, message.tab_id, message.timestamp);
        let raw = serde_json::to_string(message)?;
        self.store.set(&message.tab_id, &key, &raw)?;
        self.store.remove(&message.tab_id, &key)?;
        Ok(())
    }

    fn subscribe(&self) -> TransportReceiver {
        TransportReceiver::Storage {
            events: self.store.subscribe(),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

/// What the host platform offers for cross-tab messaging
#[derive(Clone, Default)]
pub struct TransportCapabilities {
    pub channel: Option<ChannelHub>,
    pub shared_store: Option<Arc<dyn SharedStore>>,
}

/// Pick a transport from what is available: the native channel when
/// present (and preferred), otherwise the storage relay.
pub fn select_transport(
    capabilities: &TransportCapabilities,
    prefer_channel: bool,
    namespace: &str,
) -> Option<Arc<dyn BroadcastTransport>> {
    let channel = capabilities
        .channel
        .clone()
        .map(|hub| Arc::new(ChannelTransport::new(hub)) as Arc<dyn BroadcastTransport>);
    let relay = capabilities.shared_store.clone().map(|store| {
        Arc::new(StorageRelayTransport::new(store, namespace)) as Arc<dyn BroadcastTransport>
    });

    let selected = if prefer_channel {
        channel.or(relay)
    } else {
        relay.or(channel)
    };
    match &selected {
        Some(transport) => tracing::info!("Broadcast transport: {}", transport.name()),
        None => tracing::warn!("No broadcast transport available, running without peers"),
    }
    selected
}

/// Publishes this tab's messages and hands out filtered subscriptions
pub struct Broadcaster {
    tab_id: String,
    transport: Option<Arc<dyn BroadcastTransport>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("tab_id", &self.tab_id)
            .field("transport", &self.transport_name())
            .finish()
    }
}

impl Broadcaster {
    pub fn new(
        tab_id: impl Into<String>,
        transport: Option<Arc<dyn BroadcastTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tab_id: tab_id.into(),
            transport,
            clock,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn transport_name(&self) -> Option<&'static str> {
        self.transport.as_ref().map(|t| t.name())
    }

    /// Send a message to every other tab
    pub fn publish(&self, message_type: &str, data: Value) -> Result<(), CoordinatorError> {
        let transport = self.transport.as_ref().ok_or(CoordinatorError::NoTransport)?;
        let message = BroadcastMessage {
            message_type: message_type.to_string(),
            data,
            timestamp: self.clock.now_ms(),
            tab_id: self.tab_id.clone(),
        };
        transport.send(&message)
    }

    /// Fire-and-forget publish of a serialisable payload; failures are logged
    pub fn notify_peers<T: Serialize>(&self, message_type: &str, payload: &T) {
        if self.transport.is_none() {
            return;
        }
        let result = serde_json::to_value(payload)
            .map_err(CoordinatorError::from)
            .and_then(|data| self.publish(message_type, data));
        if let Err(e) = result {
            tracing::error!("Failed to broadcast '{}': {}", message_type, e);
        }
    }

    /// Messages from other tabs, or `None` without a transport
    pub fn subscribe(&self) -> Option<BroadcastSubscription> {
        self.transport.as_ref().map(|transport| BroadcastSubscription {
            receiver: transport.subscribe(),
            tab_id: self.tab_id.clone(),
            recent: VecDeque::with_capacity(DEDUPE_WINDOW),
        })
    }
}

/// Peer messages with own-tab echoes and recent duplicates removed
pub struct BroadcastSubscription {
    receiver: TransportReceiver,
    tab_id: String,
    recent: VecDeque<BroadcastMessage>,
}

impl BroadcastSubscription {
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            let message = self.receiver.recv().await?;
            if message.tab_id == self.tab_id {
                continue;
            }
            if self.recent.contains(&message) {
                tracing::debug!("Dropping duplicate '{}' from {}", message.message_type, message.tab_id);
                continue;
            }
            if self.recent.len() == DEDUPE_WINDOW {
                self.recent.pop_front();
            }
            self.recent.push_back(message.clone());
            return Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemorySharedStore;
    use serde_json::json;
    use std::time::Duration;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    async fn recv_soon(sub: &mut BroadcastSubscription) -> Option<BroadcastMessage> {
        tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_wire_format() {
        let message = BroadcastMessage {
            message_type: "mode-changed".to_string(),
            data: json!({"mode": "on"}),
            timestamp: 42,
            tab_id: "tab-a".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "mode-changed", "data": {"mode": "on"}, "timestamp": 42, "tabId": "tab-a"})
        );
    }

    #[tokio::test]
    async fn test_channel_delivers_to_peers_only() {
        let hub = ChannelHub::new();
        let a = Broadcaster::new("tab-a", Some(Arc::new(ChannelTransport::new(hub.clone()))), clock());
        let b = Broadcaster::new("tab-b", Some(Arc::new(ChannelTransport::new(hub))), clock());
        let mut sub_a = a.subscribe().unwrap();
        let mut sub_b = b.subscribe().unwrap();

        a.publish("ping", json!({"n": 1})).unwrap();

        let received = recv_soon(&mut sub_b).await.unwrap();
        assert_eq!(received.message_type, "ping");
        assert_eq!(received.tab_id, "tab-a");
        assert!(recv_soon(&mut sub_a).await.is_none());
    }

    #[tokio::test]
    async fn test_storage_relay_delivers_and_cleans_up() {
        let store = Arc::new(MemorySharedStore::new());
        let a = Broadcaster::new(
            "tab-a",
            Some(Arc::new(StorageRelayTransport::new(store.clone(), "scanfill"))),
            clock(),
        );
        let b = Broadcaster::new(
            "tab-b",
            Some(Arc::new(StorageRelayTransport::new(store.clone(), "scanfill"))),
            clock(),
        );
        let mut sub_b = b.subscribe().unwrap();

        a.publish("scan-processed", json!({"scan": "/01234"})).unwrap();

        let received = recv_soon(&mut sub_b).await.unwrap();
        assert_eq!(received.data["scan"], "/01234");
        assert_eq!(store.get("scanfill:broadcast:tab-a:1000").unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let hub = ChannelHub::new();
        let transport = ChannelTransport::new(hub.clone());
        let b = Broadcaster::new("tab-b", Some(Arc::new(ChannelTransport::new(hub))), clock());
        let mut sub_b = b.subscribe().unwrap();

        let message = BroadcastMessage {
            message_type: "ping".to_string(),
            data: Value::Null,
            timestamp: 5,
            tab_id: "tab-a".to_string(),
        };
        transport.send(&message).unwrap();
        transport.send(&message).unwrap();
        transport
            .send(&BroadcastMessage {
                timestamp: 6,
                ..message.clone()
            })
            .unwrap();

        assert_eq!(recv_soon(&mut sub_b).await.unwrap().timestamp, 5);
        assert_eq!(recv_soon(&mut sub_b).await.unwrap().timestamp, 6);
        assert!(recv_soon(&mut sub_b).await.is_none());
    }

    #[test]
    fn test_transport_selection() {
        let store: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new());
        let both = TransportCapabilities {
            channel: Some(ChannelHub::new()),
            shared_store: Some(store.clone()),
        };
        assert_eq!(select_transport(&both, true, "ns").unwrap().name(), "channel");
        assert_eq!(select_transport(&both, false, "ns").unwrap().name(), "storage-relay");

        let store_only = TransportCapabilities {
            channel: None,
            shared_store: Some(store),
        };
        assert_eq!(select_transport(&store_only, true, "ns").unwrap().name(), "storage-relay");

        assert!(select_transport(&TransportCapabilities::default(), true, "ns").is_none());
    }

    #[test]
    fn test_publish_without_transport() {
        let broadcaster = Broadcaster::new("tab-a", None, clock());
        assert!(matches!(
            broadcaster.publish("ping", Value::Null),
            Err(CoordinatorError::NoTransport)
        ));
        assert!(broadcaster.subscribe().is_none());
        // Logged and ignored
        broadcaster.notify_peers("ping", &json!({}));
    }

    #[tokio::test]
    async fn test_relay_send_fails_when_store_unavailable() {
        let store = Arc::new(MemorySharedStore::new());
        store.set_available(false);
        let transport = StorageRelayTransport::new(store, "scanfill");
        let broadcaster = Broadcaster::new("tab-a", Some(Arc::new(transport)), clock());
        assert!(matches!(
            broadcaster.publish("ping", Value::Null),
            Err(CoordinatorError::Storage(_))
        ));
    }
}
