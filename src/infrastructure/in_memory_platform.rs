// In-memory host platform for driving data sources in tests
use crate::application::host_platform::{HostPlatform, StateFeed};
use crate::domain::telemetry::{EntityState, StateChangedEvent};
use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

struct Feed {
    entity_ids: Vec<String>,
    tx: mpsc::Sender<StateChangedEvent>,
}

#[derive(Default)]
struct PlatformState {
    feeds: Vec<Feed>,
    history: HashMap<String, Vec<EntityState>>,
    history_delays: HashMap<String, Duration>,
    history_fails: bool,
    subscribe_failures: usize,
    subscribe_attempts: usize,
}

#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<PlatformState>,
}

impl InMemoryPlatform {
    /// Epoch offset that `emit`/`state_at` offsets are relative to.
    pub const BASE_MS: i64 = 1_714_564_800_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_history(&self, entity_id: &str, records: Vec<EntityState>) {
        self.state
            .lock()
            .unwrap()
            .history
            .insert(entity_id.to_string(), records);
    }

    /// Hold history responses for `entity_id` back by `delay`.
    pub fn delay_history(&self, entity_id: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .history_delays
            .insert(entity_id.to_string(), delay);
    }

    pub fn fail_history(&self, fail: bool) {
        self.state.lock().unwrap().history_fails = fail;
    }

    /// Make the next `count` subscription attempts fail.
    pub fn fail_subscriptions(&self, count: usize) {
        self.state.lock().unwrap().subscribe_failures = count;
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.state.lock().unwrap().subscribe_attempts
    }

    /// Feeds whose receiving side is still open.
    pub fn open_feeds(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .feeds
            .iter()
            .filter(|f| !f.tx.is_closed())
            .count()
    }

    /// Drop every sender, ending all live feeds.
    pub fn disconnect_all(&self) {
        self.state.lock().unwrap().feeds.clear();
    }

    pub async fn emit(&self, entity_id: &str, state: &str, offset_ms: i64) {
        self.emit_state(entity_id, state_at(state, offset_ms)).await;
    }

    pub async fn emit_at_ms(&self, entity_id: &str, state: &str, timestamp_ms: i64) {
        self.emit_state(entity_id, state_at_epoch_ms(state, timestamp_ms))
            .await;
    }

    pub async fn emit_state(&self, entity_id: &str, state: EntityState) {
        let senders = self.senders(|feed| feed.entity_ids.iter().any(|id| id == entity_id));
        self.send(senders, entity_id, state).await;
    }

    /// Deliver to every feed regardless of its entity filter.
    pub async fn send_unfiltered(&self, entity_id: &str, state: &str, offset_ms: i64) {
        let senders = self.senders(|_| true);
        self.send(senders, entity_id, state_at(state, offset_ms)).await;
    }

    fn senders(&self, filter: impl Fn(&Feed) -> bool) -> Vec<mpsc::Sender<StateChangedEvent>> {
        let mut state = self.state.lock().unwrap();
        state.feeds.retain(|f| !f.tx.is_closed());
        state
            .feeds
            .iter()
            .filter(|f| filter(f))
            .map(|f| f.tx.clone())
            .collect()
    }

    async fn send(
        &self,
        senders: Vec<mpsc::Sender<StateChangedEvent>>,
        entity_id: &str,
        state: EntityState,
    ) {
        for tx in senders {
            let event = StateChangedEvent::new(entity_id, state.clone());
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl HostPlatform for InMemoryPlatform {
    async fn subscribe_state_changes(&self, entity_ids: &[String]) -> anyhow::Result<StateFeed> {
        let mut state = self.state.lock().unwrap();
        state.subscribe_attempts += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            bail!("connection refused");
        }
        let (tx, feed) = StateFeed::channel(64);
        state.feeds.push(Feed {
            entity_ids: entity_ids.to_vec(),
            tx,
        });
        Ok(feed)
    }

    async fn fetch_history(
        &self,
        entity_id: &str,
        _start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EntityState>> {
        let (records, delay) = {
            let state = self.state.lock().unwrap();
            if state.history_fails {
                bail!("history endpoint unavailable");
            }
            // Like the real host, the record in effect at `start` may predate it.
            let records: Vec<EntityState> = state
                .history
                .get(entity_id)
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r.last_changed <= end)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (records, state.history_delays.get(entity_id).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(records)
    }
}

pub fn state_at(state: &str, offset_ms: i64) -> EntityState {
    state_at_epoch_ms(state, InMemoryPlatform::BASE_MS + offset_ms)
}

pub fn state_at_epoch_ms(state: &str, timestamp_ms: i64) -> EntityState {
    EntityState {
        entity_id: None,
        state: state.to_string(),
        last_changed: Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now),
        last_updated: None,
        attributes: Map::new(),
    }
}
