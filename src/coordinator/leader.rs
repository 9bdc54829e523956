//! Lease-based leader election
//!
//! The leader record `{tabId, timestamp}` lives in the shared store. The
//! leader rewrites it every heartbeat; every tab checks it on the same
//! interval and claims leadership when the record is missing or older than
//! the timeout. A leader deletes the record when it unloads so peers can
//! take over without waiting for the lease to lapse.
//!
//! Brief windows where two tabs both believe they lead are tolerated.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::CoordinatorError;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::storage::SharedStore;

/// Shared record naming the current leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub tab_id: String,
    /// Last heartbeat, epoch milliseconds
    pub timestamp: i64,
}

pub struct LeaderElection {
    tab_id: String,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    key: String,
    heartbeat: Duration,
    timeout_ms: i64,
    leader: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("tab_id", &self.tab_id)
            .field("key", &self.key)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

impl LeaderElection {
    pub fn new(
        tab_id: impl Into<String>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: &CoordinatorConfig,
    ) -> Self {
        let (leader, _) = watch::channel(false);
        Self {
            tab_id: tab_id.into(),
            store,
            clock,
            key: format!("{}:leader", config.namespace),
            // interval() panics on a zero period
            heartbeat: Duration::from_millis(config.heartbeat_ms.max(1)),
            timeout_ms: config.leader_timeout_ms as i64,
            leader,
            task: Mutex::new(None),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Shared-store key holding the leader record
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    /// Observe leadership changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader.subscribe()
    }

    /// Current leader record, if any
    pub fn read_record(&self) -> Result<Option<LeaderRecord>, CoordinatorError> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable record is as good as none
                tracing::warn!("Ignoring malformed leader record: {}", e);
                Ok(None)
            }
        }
    }

    /// Write our own record and mark this tab as leader
    pub fn claim(&self) -> Result<(), CoordinatorError> {
        self.write_record()?;
        self.set_leader(true);
        Ok(())
    }

    /// Refresh the lease if this tab leads
    pub fn heartbeat(&self) {
        if !self.is_leader() {
            return;
        }
        if let Err(e) = self.write_record() {
            tracing::error!("Leader heartbeat failed: {}", e);
        }
    }

    /// Re-evaluate leadership against the shared record.
    ///
    /// Claims when the record is absent, ours, or stale; steps down when a
    /// fresh record belongs to another tab. Store failures degrade to
    /// assuming leadership.
    pub fn check_leader(&self) -> bool {
        let record = match self.read_record() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Leader record unreadable, assuming leadership: {}", e);
                self.set_leader(true);
                return true;
            }
        };

        let now = self.clock.now_ms();
        let should_claim = match &record {
            None => true,
            Some(r) if r.tab_id == self.tab_id => true,
            Some(r) if now - r.timestamp > self.timeout_ms => {
                tracing::info!(
                    "Leader {} silent for {}ms, taking over",
                    r.tab_id,
                    now - r.timestamp
                );
                true
            }
            Some(_) => false,
        };

        if should_claim {
            if let Err(e) = self.claim() {
                tracing::warn!("Failed to write leader record, assuming leadership: {}", e);
                self.set_leader(true);
            }
        } else {
            self.set_leader(false);
        }
        self.is_leader()
    }

    /// Give up leadership, deleting the record if it is still ours
    pub fn relinquish(&self) {
        if !self.is_leader() {
            return;
        }
        match self.read_record() {
            Ok(Some(record)) if record.tab_id == self.tab_id => {
                if let Err(e) = self.store.remove(&self.tab_id, &self.key) {
                    tracing::warn!("Failed to remove leader record: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to read leader record on relinquish: {}", e),
        }
        self.set_leader(false);
    }

    /// Check once, then keep checking every heartbeat interval and whenever
    /// a peer deletes the leader record.
    pub fn start(self: &Arc<Self>) {
        self.check_leader();

        let election = Arc::clone(self);
        let mut events = self.store.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(election.heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the initial check already ran
            ticker.tick().await;
            let mut watching_store = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        election.check_leader();
                    }
                    event = events.recv(), if watching_store => match event {
                        Ok(event) => {
                            if event.key == election.key
                                && event.new_value.is_none()
                                && event.origin != election.tab_id
                            {
                                tracing::debug!("Leader record released by {}", event.origin);
                                election.check_leader();
                            }
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => watching_store = false,
                    },
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!("Leader election started for tab {}", self.tab_id);
    }

    /// Stop the election loop, leaving the record to expire on its own
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Stop the election loop and relinquish
    pub fn shutdown(&self) {
        self.stop();
        self.relinquish();
        tracing::info!("Leader election stopped for tab {}", self.tab_id);
    }

    fn write_record(&self) -> Result<(), CoordinatorError> {
        let record = LeaderRecord {
            tab_id: self.tab_id.clone(),
            timestamp: self.clock.now_ms(),
        };
        let raw = serde_json::to_string(&record)?;
        self.store.set(&self.tab_id, &self.key, &raw)?;
        Ok(())
    }

    fn set_leader(&self, is_leader: bool) {
        let changed = self.leader.send_if_modified(|current| {
            if *current == is_leader {
                return false;
            }
            *current = is_leader;
            true
        });
        if changed {
            if is_leader {
                tracing::info!("Tab {} is now leader", self.tab_id);
            } else {
                tracing::info!("Tab {} is no longer leader", self.tab_id);
            }
        }
    }
}
