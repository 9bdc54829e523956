//! Component wiring and lifecycle for one tab
//!
//! [`ScanRuntime`] builds every component from a [`Config`] and the host
//! collaborators, then runs the background tasks: the queue worker, the
//! leader election loop, the peer message listener and the idle-buffer
//! ticker. Each tab of an origin owns one runtime; tabs meet only through
//! the shared store and the broadcast channel.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureMode, HotkeyAction, KeyEvent, KeyOutcome, ModeChange, ScanCapture, ScanQueue};
use crate::clock::Clock;
use crate::config::{CaptureConfig, Config, ConfigError};
use crate::coordinator::{select_transport, BroadcastMessage, Broadcaster, ChannelHub, LeaderElection, TransportCapabilities};
use crate::events::{self, event_names, EventSink};
use crate::fields::FieldRegistry;
use crate::history::ScanHistory;
use crate::macros::{MacroError, MacroExecutor, MacroReport, MacroStore};
use crate::prefix::PrefixStore;
use crate::queue::{ProcessorParts, ScanError, ScanQueueProcessor};
use crate::rules::RuleEngine;
use crate::storage::{keys, Persistence, PersistenceExt, SharedStore};

/// Host-provided collaborators
#[derive(Clone)]
pub struct Collaborators {
    /// Namespaced store for rules, prefixes, history, macros and mode
    pub persistence: Arc<dyn Persistence>,
    /// The host form
    pub fields: Arc<dyn FieldRegistry>,
    /// Origin-wide store; without it this tab assumes it is alone
    pub shared_store: Option<Arc<dyn SharedStore>>,
    /// Native cross-tab channel, when the platform has one
    pub channel: Option<ChannelHub>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaderChange<'a> {
    tab_id: &'a str,
    is_leader: bool,
}

struct Inner {
    tab_id: String,
    config: Config,
    capture: Mutex<ScanCapture>,
    queue: Arc<ScanQueue>,
    engine: Arc<RuleEngine>,
    prefixes: Arc<PrefixStore>,
    history: Arc<ScanHistory>,
    macros: Arc<MacroStore>,
    macro_executor: MacroExecutor,
    processor: Arc<ScanQueueProcessor>,
    broadcaster: Arc<Broadcaster>,
    election: Option<Arc<LeaderElection>>,
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
}

impl Inner {
    /// Switch mode, persist it and (for local changes) tell the peers
    fn apply_mode(&self, mode: CaptureMode, notify_peers: bool) -> Option<ModeChange> {
        let change = self.capture.lock().set_mode(mode)?;
        if let Err(e) = self.persistence.save(keys::MODE, &change.mode) {
            tracing::error!("Failed to persist capture mode: {}", e);
        }
        if notify_peers {
            self.broadcaster.notify_peers(event_names::MODE_CHANGED, &change);
        }
        Some(change)
    }

    fn set_leader(&self, is_leader: bool) {
        self.capture.lock().set_leader(is_leader);
        let change = LeaderChange {
            tab_id: &self.tab_id,
            is_leader,
        };
        events::emit(self.events.as_ref(), event_names::LEADER_CHANGED, &change);
        self.broadcaster.notify_peers(event_names::LEADER_CHANGED, &change);
    }

    fn handle_peer_message(&self, message: BroadcastMessage) {
        match message.message_type.as_str() {
            event_names::MODE_CHANGED => match serde_json::from_value::<ModeChange>(message.data) {
                Ok(change) => {
                    tracing::info!("Peer {} switched capture to {}", message.tab_id, change.mode);
                    self.apply_mode(change.mode, false);
                }
                Err(e) => tracing::warn!("Ignoring malformed mode change from {}: {}", message.tab_id, e),
            },
            event_names::SCAN_PROCESSED => {
                tracing::debug!("Peer {} processed a scan", message.tab_id);
            }
            event_names::LEADER_CHANGED => {
                tracing::debug!("Peer {} leadership: {}", message.tab_id, message.data);
            }
            other => tracing::debug!("Ignoring peer message '{}'", other),
        }
    }
}

/// One tab's scan pipeline
pub struct ScanRuntime {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRuntime")
            .field("tab_id", &self.inner.tab_id)
            .field("mode", &self.mode())
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

impl ScanRuntime {
    /// Build every component. Stored rules, prefixes, history, macros and
    /// capture mode are loaded from `collab.persistence`.
    pub fn new(config: Config, collab: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        let tab_id = Uuid::new_v4().to_string();
        let persistence = collab.persistence.clone();

        let engine = Arc::new(RuleEngine::load(persistence.clone(), config.engine.match_mode));
        let prefixes = Arc::new(PrefixStore::load(persistence.clone()));
        let history = Arc::new(ScanHistory::load(persistence.clone(), config.queue.history_limit));
        let macros = Arc::new(MacroStore::load(persistence.clone()));

        let initial_mode: CaptureMode = persistence.load(keys::MODE, config.capture.initial_mode);
        let capture_config = CaptureConfig {
            initial_mode,
            ..config.capture.clone()
        };
        let queue = Arc::new(ScanQueue::new());
        let capture = ScanCapture::new(&capture_config, queue.clone(), collab.events.clone());

        let capabilities = TransportCapabilities {
            channel: collab.channel.clone(),
            shared_store: collab.shared_store.clone(),
        };
        let transport = select_transport(
            &capabilities,
            config.coordinator.prefer_channel,
            &config.coordinator.namespace,
        );
        let broadcaster = Arc::new(Broadcaster::new(tab_id.clone(), transport, collab.clock.clone()));

        let election = collab.shared_store.clone().map(|store| {
            Arc::new(LeaderElection::new(
                tab_id.clone(),
                store,
                collab.clock.clone(),
                &config.coordinator,
            ))
        });

        let processor = Arc::new(ScanQueueProcessor::new(
            ProcessorParts {
                queue: queue.clone(),
                engine: engine.clone(),
                fields: collab.fields.clone(),
                prefixes: prefixes.clone(),
                history: history.clone(),
                events: collab.events.clone(),
                broadcaster: Some(broadcaster.clone()),
                mode: capture.subscribe_mode(),
                clock: collab.clock.clone(),
            },
            Duration::from_millis(config.queue.throttle_ms),
            config.capture.allow_manual_in_off,
        ));

        let macro_executor = MacroExecutor::new(
            collab.fields.clone(),
            collab.events.clone(),
            Duration::from_millis(config.macros.step_delay_ms),
        );

        tracing::info!(
            "Tab {} ready: {} rule(s), {} prefix(es), mode {}",
            tab_id,
            engine.len(),
            prefixes.all().len(),
            initial_mode
        );

        Ok(Self {
            inner: Arc::new(Inner {
                tab_id,
                config,
                capture: Mutex::new(capture),
                queue,
                engine,
                prefixes,
                history,
                macros,
                macro_executor,
                processor,
                broadcaster,
                election,
                persistence,
                events: collab.events,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start background tasks. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("Runtime for tab {} already started", self.inner.tab_id);
            return;
        }

        match &self.inner.election {
            Some(election) => {
                let mut leader_rx = election.subscribe();
                election.start();
                self.inner.set_leader(*leader_rx.borrow_and_update());

                let inner = Arc::clone(&self.inner);
                tasks.push(tokio::spawn(async move {
                    while leader_rx.changed().await.is_ok() {
                        let is_leader = *leader_rx.borrow_and_update();
                        inner.set_leader(is_leader);
                    }
                }));
            }
            None => {
                tracing::info!("No shared store, tab {} assumes leadership", self.inner.tab_id);
                self.inner.set_leader(true);
            }
        }

        self.inner.processor.spawn_worker();

        if let Some(mut subscription) = self.inner.broadcaster.subscribe() {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    inner.handle_peer_message(message);
                }
            }));
        }

        let idle = Duration::from_millis(self.inner.config.capture.idle_timeout_ms.max(1));
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.capture.lock().tick(Instant::now());
            }
        }));

        tracing::info!("Tab {} started", self.inner.tab_id);
    }

    /// Stop background work and give up leadership (page unload)
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.processor.shutdown();
        if let Some(election) = &self.inner.election {
            election.shutdown();
        }
        self.inner.capture.lock().set_leader(false);
        tracing::info!("Tab {} shut down", self.inner.tab_id);
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn mode(&self) -> CaptureMode {
        self.inner.capture.lock().mode()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.capture.lock().is_leader()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.capture.lock().is_listening()
    }

    /// Switch capture mode and tell the other tabs
    pub fn set_mode(&self, mode: CaptureMode) -> Option<ModeChange> {
        self.inner.apply_mode(mode, true)
    }

    /// Parse and apply a mode name; an invalid name changes nothing
    pub fn set_mode_str(&self, mode: &str) -> Result<Option<ModeChange>, CaptureError> {
        match mode.parse::<CaptureMode>() {
            Ok(mode) => Ok(self.set_mode(mode)),
            Err(e) => {
                tracing::warn!("{}", e);
                Err(e)
            }
        }
    }

    /// Feed a host-page keydown. Mode hotkeys are applied here.
    pub fn handle_key(&self, event: &KeyEvent) -> KeyOutcome {
        let outcome = self.inner.capture.lock().handle_key(event, Instant::now());
        if let KeyOutcome::Hotkey(HotkeyAction::SetMode(mode)) = &outcome {
            self.set_mode(*mode);
        }
        outcome
    }

    pub fn submit_manual(&self, scan: &str) -> Result<usize, ScanError> {
        self.inner.processor.submit_manual(scan)
    }

    /// Drain the queue now instead of waiting for the worker
    pub async fn process_queue(&self) -> usize {
        self.inner.processor.process_queue().await
    }

    pub async fn run_macro(&self, id: &str) -> Result<MacroReport, MacroError> {
        let item = self
            .inner
            .macros
            .get(id)
            .ok_or_else(|| MacroError::NotFound(id.to_string()))?;
        self.inner.macro_executor.run(&item).await
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.inner.engine
    }

    pub fn prefixes(&self) -> &Arc<PrefixStore> {
        &self.inner.prefixes
    }

    pub fn history(&self) -> &Arc<ScanHistory> {
        &self.inner.history
    }

    pub fn macros(&self) -> &Arc<MacroStore> {
        &self.inner.macros
    }

    pub fn queue(&self) -> &Arc<ScanQueue> {
        &self.inner.queue
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.inner.broadcaster
    }
}

impl Drop for ScanRuntime {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.inner.processor.shutdown();
        if let Some(election) = &self.inner.election {
            election.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FocusTarget;
    use crate::clock::SystemClock;
    use crate::events::MemorySink;
    use crate::fields::{FieldCatalog, MemoryFieldRegistry};
    use crate::storage::{MemorySharedStore, MemoryStore};

    fn collaborators(persistence: Arc<dyn Persistence>) -> (Collaborators, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let collab = Collaborators {
            persistence,
            fields: Arc::new(MemoryFieldRegistry::new(FieldCatalog::with_defaults())),
            shared_store: Some(Arc::new(MemorySharedStore::new())),
            channel: Some(ChannelHub::new()),
            events: sink.clone(),
            clock: Arc::new(SystemClock),
        };
        (collab, sink)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.queue.history_limit = 0;
        let (collab, _) = collaborators(Arc::new(MemoryStore::new("t")));
        assert!(ScanRuntime::new(config, collab).is_err());
    }

    #[test]
    fn test_mode_is_persisted_and_restored() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryStore::new("t"));
        let (collab, _) = collaborators(persistence.clone());
        let runtime = ScanRuntime::new(Config::default(), collab).unwrap();
        assert_eq!(runtime.mode(), CaptureMode::Standby);
        runtime.set_mode(CaptureMode::Off);
        drop(runtime);

        let (collab, _) = collaborators(persistence);
        let restored = ScanRuntime::new(Config::default(), collab).unwrap();
        assert_eq!(restored.mode(), CaptureMode::Off);
    }

    #[test]
    fn test_invalid_mode_string_changes_nothing() {
        let (collab, sink) = collaborators(Arc::new(MemoryStore::new("t")));
        let runtime = ScanRuntime::new(Config::default(), collab).unwrap();
        assert!(runtime.set_mode_str("turbo").is_err());
        assert_eq!(runtime.mode(), CaptureMode::Standby);
        assert_eq!(sink.count(event_names::MODE_CHANGED), 0);
    }

    #[tokio::test]
    async fn test_start_claims_leadership_and_hotkey_turns_on() {
        let (collab, sink) = collaborators(Arc::new(MemoryStore::new("t")));
        let runtime = ScanRuntime::new(Config::default(), collab).unwrap();
        runtime.start();
        assert!(runtime.is_leader());
        assert!(!runtime.is_listening());

        let outcome = runtime.handle_key(&KeyEvent::alt_shift('o'));
        assert!(outcome.prevent_default());
        assert_eq!(runtime.mode(), CaptureMode::On);
        assert!(runtime.is_listening());
        assert_eq!(sink.count(event_names::LEADER_CHANGED), 1);

        // Typing into a form control is left alone
        let typed = runtime.handle_key(&KeyEvent::key("a").in_target(FocusTarget::TextArea));
        assert_eq!(typed, KeyOutcome::EditableTarget);
        runtime.shutdown();
        assert!(!runtime.is_leader());
    }

    #[tokio::test]
    async fn test_without_shared_store_tab_assumes_leadership() {
        let (mut collab, _) = collaborators(Arc::new(MemoryStore::new("t")));
        collab.shared_store = None;
        collab.channel = None;
        let runtime = ScanRuntime::new(Config::default(), collab).unwrap();
        runtime.start();
        assert!(runtime.is_leader());
        assert!(runtime.broadcaster().transport_name().is_none());
        runtime.shutdown();
    }
}
