// Data source - Live/historical data for a single entity
use crate::application::host_platform::{HostPlatform, StateFeed};
use crate::application::listeners::{ListenerList, Subscription};
use crate::domain::coalescer::{Coalescer, Rejection, Tick};
use crate::domain::rolling_buffer::{BufferArrays, RollingBuffer};
use crate::domain::telemetry::{EntitySnapshot, EntityState, Sample, StateChangedEvent};
use crate::infrastructure::config::{ConfigError, SourceConfig};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

/// Retries after the first failed subscription attempt.
const SUBSCRIBE_RETRIES: usize = 4;
const SUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("data source `{0}` has been destroyed")]
    Destroyed(String),
    #[error("data source `{0}` was already started")]
    AlreadyStarted(String),
    #[error("history fetch for `{entity}` failed: {message}")]
    History { entity: String, message: String },
    #[error("live subscription for `{entity}` failed: {message}")]
    Transport { entity: String, message: String },
}

/// Payload delivered to subscribers on every flush.
#[derive(Debug, Clone, Serialize)]
pub struct SourceUpdate {
    pub source: String,
    pub entity_id: String,
    pub sample: Sample,
    pub state: EntitySnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub received: u64,
    pub emitted: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub throttled: u64,
    pub filtered: u64,
    pub preloaded: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Inert,
    Preloading,
    Live,
    Reconnecting,
    Disconnected,
    Destroyed,
}

/// Point-in-time view of a source's buffered data.
#[derive(Debug, Clone, Serialize)]
pub struct SourceData {
    pub entity_id: String,
    pub last: Option<Sample>,
    pub buffer: BufferArrays,
    pub stats: SourceStats,
    pub status: LiveStatus,
}

/// Introspection record for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub entity_id: String,
    pub config: SourceConfig,
    pub status: LiveStatus,
    pub stats: SourceStats,
    pub buffered: usize,
    pub capacity: usize,
    pub subscribers: usize,
}

struct SourceState {
    buffer: RollingBuffer,
    coalescer: Coalescer<EntityState>,
    snapshot: EntitySnapshot,
    subscribers: ListenerList<SourceUpdate>,
    stats: SourceStats,
    status: LiveStatus,
    started: bool,
    destroyed: bool,
    task: Option<JoinHandle<()>>,
}

struct SourceInner {
    name: String,
    config: SourceConfig,
    platform: Arc<dyn HostPlatform>,
    state: Mutex<SourceState>,
}

/// Owns the rolling buffer and emission policy for one entity.
///
/// Created inert; `start` preloads history (when configured) and then spawns
/// the task that consumes the live feed. Dropping the source destroys it.
pub struct DataSource {
    inner: Arc<SourceInner>,
}

impl DataSource {
    pub fn new(
        name: impl Into<String>,
        config: SourceConfig,
        platform: Arc<dyn HostPlatform>,
    ) -> Result<Self, DataSourceError> {
        let name = name.into();
        config.validate(&name)?;

        let state = SourceState {
            buffer: RollingBuffer::new(config.buffer_capacity()),
            coalescer: Coalescer::new(config.emit_policy()),
            snapshot: EntitySnapshot::empty(config.entity.clone()),
            subscribers: ListenerList::new(),
            stats: SourceStats::default(),
            status: LiveStatus::Inert,
            started: false,
            destroyed: false,
            task: None,
        };

        Ok(Self {
            inner: Arc::new(SourceInner {
                name,
                config,
                platform,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn entity_id(&self) -> &str {
        &self.inner.config.entity
    }

    /// Preload history, then establish the live subscription.
    ///
    /// A failed history fetch is logged and does not stop the live
    /// subscription. When the subscription cannot be established the source
    /// keeps whatever history it loaded and the transport error is returned.
    pub async fn start(&self) -> Result<(), DataSourceError> {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if state.destroyed {
                return Err(DataSourceError::Destroyed(inner.name.clone()));
            }
            if state.started {
                return Err(DataSourceError::AlreadyStarted(inner.name.clone()));
            }
            state.started = true;
            state.status = LiveStatus::Preloading;
        }

        if let Some(hours) = inner.config.preload_hours() {
            match inner.preload_history(hours).await {
                Ok(count) => tracing::info!(
                    source = %inner.name,
                    entity = %inner.config.entity,
                    "Preloaded {} historical samples ({}h)",
                    count,
                    hours
                ),
                Err(DataSourceError::Destroyed(name)) => {
                    return Err(DataSourceError::Destroyed(name));
                }
                Err(e) => tracing::warn!(source = %inner.name, "{}", e),
            }
        }

        let mut feed = match inner.subscribe_with_retry().await {
            Ok(feed) => feed,
            Err(e) => {
                let mut state = inner.state();
                if state.destroyed {
                    return Err(DataSourceError::Destroyed(inner.name.clone()));
                }
                state.status = LiveStatus::Disconnected;
                drop(state);
                tracing::warn!(source = %inner.name, "{}", e);
                return Err(e);
            }
        };

        let mut state = inner.state();
        if state.destroyed {
            feed.unsubscribe();
            return Err(DataSourceError::Destroyed(inner.name.clone()));
        }
        state.status = LiveStatus::Live;
        state.task = Some(tokio::spawn(inner.clone().run(feed)));
        tracing::info!(source = %inner.name, entity = %inner.config.entity, "Live subscription established");
        Ok(())
    }

    /// Register a callback invoked on every flush. After `destroy` this
    /// returns an inert handle and the callback is never called.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SourceUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.inner.state();
        if state.destroyed {
            return Subscription::inert();
        }
        let id = state.subscribers.register(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state().subscribers.unregister(id);
            }
        })
    }

    pub fn get_current_data(&self) -> SourceData {
        let state = self.inner.state();
        SourceData {
            entity_id: self.inner.config.entity.clone(),
            last: state.buffer.last(),
            buffer: state.buffer.arrays(),
            stats: state.stats,
            status: state.status,
        }
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        self.inner.state().snapshot.clone()
    }

    pub fn last(&self) -> Option<Sample> {
        self.inner.state().buffer.last()
    }

    pub fn slice_since(&self, window_ms: i64) -> Vec<Sample> {
        self.inner.state().buffer.slice_since(window_ms)
    }

    pub fn stats(&self) -> SourceStats {
        self.inner.state().stats
    }

    pub fn status(&self) -> LiveStatus {
        self.inner.state().status
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state().destroyed
    }

    pub fn info(&self) -> SourceInfo {
        let state = self.inner.state();
        SourceInfo {
            name: self.inner.name.clone(),
            entity_id: self.inner.config.entity.clone(),
            config: self.inner.config.clone(),
            status: state.status,
            stats: state.stats,
            buffered: state.buffer.len(),
            capacity: state.buffer.capacity(),
            subscribers: state.subscribers.len(),
        }
    }

    /// Tear down the live feed, cancel pending timers and drop subscribers
    /// and buffered samples. Idempotent.
    pub fn destroy(&self) {
        let task = {
            let mut state = self.inner.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.status = LiveStatus::Destroyed;
            state.coalescer.cancel();
            state.subscribers.clear();
            state.buffer.clear();
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(source = %self.inner.name, "Data source destroyed");
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl SourceInner {
    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn preload_history(&self, hours: f64) -> Result<usize, DataSourceError> {
        let entity = &self.config.entity;
        let end = Utc::now();
        let start = chrono::Duration::try_milliseconds((hours * 3_600_000.0) as i64)
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or_else(|| DataSourceError::History {
                entity: entity.clone(),
                message: format!("history window of {}h is out of range", hours),
            })?;

        let records = self
            .platform
            .fetch_history(entity, start, end)
            .await
            .map_err(|e| DataSourceError::History {
                entity: entity.clone(),
                message: format!("{:#}", e),
            })?;

        let attribute = self.config.attribute.as_deref();
        let mut samples: Vec<(Sample, EntityState)> = records
            .into_iter()
            .filter(|record| record.observed_at(attribute) >= start)
            .filter_map(|record| {
                let value = record.numeric_value(attribute)?;
                Some((Sample::new(record.timestamp_ms(attribute), value), record))
            })
            .collect();
        samples.sort_by_key(|(sample, _)| sample.timestamp);

        let mut state = self.state();
        if state.destroyed {
            return Err(DataSourceError::Destroyed(self.name.clone()));
        }
        let floor = state.buffer.last().map(|s| s.timestamp).unwrap_or(i64::MIN);
        let mut pushed = 0;
        for (sample, _) in samples.iter().filter(|(s, _)| s.timestamp >= floor) {
            state.buffer.push(sample.timestamp, sample.value);
            pushed += 1;
        }
        if let Some((sample, raw)) = samples.last() {
            state.coalescer.seed(sample.value);
            state.snapshot.record(*sample, raw);
        }
        state.stats.preloaded += pushed as u64;
        Ok(pushed)
    }

    /// Bounded exponential backoff with jitter around the host subscription.
    async fn subscribe_with_retry(&self) -> Result<StateFeed, DataSourceError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(125)
            .max_delay(SUBSCRIBE_MAX_BACKOFF)
            .map(jitter)
            .take(SUBSCRIBE_RETRIES);
        let entity_ids = vec![self.config.entity.clone()];
        let entity_ids = &entity_ids;
        let platform = &self.platform;
        let name = &self.name;

        Retry::spawn(strategy, move || async move {
            let result = platform.subscribe_state_changes(entity_ids).await;
            if let Err(e) = &result {
                tracing::debug!(source = %name, "Subscription attempt failed: {:#}", e);
            }
            result
        })
        .await
        .map_err(|e| DataSourceError::Transport {
            entity: self.config.entity.clone(),
            message: format!("{:#}", e),
        })
    }

    /// Event loop for one source: the only place the pending cell is driven.
    async fn run(self: Arc<Self>, mut feed: StateFeed) {
        loop {
            let deadline = self.state().coalescer.deadline();
            tokio::select! {
                biased;
                _ = sleep_until_deadline(deadline) => self.on_tick(),
                event = feed.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => match self.reconnect().await {
                        Some(next) => feed = next,
                        None => break,
                    },
                },
            }
        }
    }

    async fn reconnect(&self) -> Option<StateFeed> {
        // Anything still pending is flushed on its own deadlines first.
        loop {
            let deadline = self.state().coalescer.deadline();
            let Some(deadline) = deadline else { break };
            sleep_until(deadline).await;
            self.on_tick();
        }

        {
            let mut state = self.state();
            if state.destroyed {
                return None;
            }
            state.status = LiveStatus::Reconnecting;
            state.stats.reconnects += 1;
        }
        tracing::warn!(source = %self.name, "Live feed ended, resubscribing");

        let result = self.subscribe_with_retry().await;
        let mut state = self.state();
        if state.destroyed {
            return None;
        }
        match result {
            Ok(feed) => {
                state.status = LiveStatus::Live;
                Some(feed)
            }
            Err(e) => {
                state.status = LiveStatus::Disconnected;
                drop(state);
                tracing::warn!(source = %self.name, "{}; serving buffered data only", e);
                None
            }
        }
    }

    fn on_event(&self, event: StateChangedEvent) {
        let mut state = self.state();
        if state.destroyed {
            return;
        }
        state.stats.received += 1;

        if event.entity_id != self.config.entity {
            state.stats.filtered += 1;
            return;
        }

        let value = event
            .new_state
            .numeric_value(self.config.attribute.as_deref())
            .unwrap_or(f64::NAN);
        match state.coalescer.offer(value, event.new_state, Instant::now()) {
            Ok(()) => {}
            Err(Rejection::NonFinite) => {
                state.stats.invalid += 1;
                tracing::trace!(source = %self.name, "Dropped non-numeric state");
            }
            Err(Rejection::Duplicate) => {
                state.stats.duplicates += 1;
                tracing::trace!(source = %self.name, value, "Dropped unchanged value");
            }
        }
    }

    fn on_tick(&self) {
        let (listeners, update) = {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            let (value, raw) = match state.coalescer.poll(Instant::now()) {
                Tick::NotDue => return,
                Tick::Throttled => {
                    state.stats.throttled += 1;
                    return;
                }
                Tick::Flush { value, payload } => (value, payload),
            };

            let floor = state.buffer.last().map(|s| s.timestamp).unwrap_or(i64::MIN);
            let observed = raw.timestamp_ms(self.config.attribute.as_deref());
            let sample = Sample::new(observed.max(floor), value);
            state.buffer.push(sample.timestamp, sample.value);
            state.snapshot.record(sample, &raw);
            state.stats.emitted += 1;

            let update = SourceUpdate {
                source: self.name.clone(),
                entity_id: self.config.entity.clone(),
                sample,
                state: state.snapshot.clone(),
            };
            (state.subscribers.snapshot(), update)
        };

        tracing::debug!(
            source = %self.name,
            value = update.sample.value,
            subscribers = listeners.len(),
            "Flushed update"
        );
        for listener in listeners {
            listener(&update);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
