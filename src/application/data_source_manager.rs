// Data source manager - Named sources, overlay bindings and change fan-out
use crate::application::data_source::{DataSource, SourceInfo, SourceUpdate};
use crate::application::host_platform::HostPlatform;
use crate::application::listeners::{ListenerList, Subscription};
use crate::domain::telemetry::EntitySnapshot;
use crate::infrastructure::config::SourceConfig;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("data source manager has been destroyed")]
    Destroyed,
    #[error("overlay `{overlay}` references unknown source `{source_name}`")]
    UnknownSource { overlay: String, source_name: String },
}

/// Visual element bound to a named source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayDescriptor {
    pub id: String,
    pub source: String,
}

impl OverlayDescriptor {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }
}

type ChangeListeners = Arc<Mutex<ListenerList<[String]>>>;
type OverlayCallback = Arc<dyn Fn(&OverlayDescriptor, &SourceUpdate) + Send + Sync>;

struct OverlayBinding {
    overlay: OverlayDescriptor,
    callback: OverlayCallback,
    subscription: Subscription,
}

impl OverlayBinding {
    fn bind(source: &DataSource, overlay: OverlayDescriptor, callback: OverlayCallback) -> Self {
        let subscription = {
            let overlay = overlay.clone();
            let callback = callback.clone();
            source.subscribe(move |update| callback(&overlay, update))
        };
        Self {
            overlay,
            callback,
            subscription,
        }
    }

    /// Move the binding onto a replacement source of the same name.
    fn rebind(&mut self, source: &DataSource) {
        self.subscription.unsubscribe();
        let callback = self.callback.clone();
        let overlay = self.overlay.clone();
        self.subscription = source.subscribe(move |update| callback(&overlay, update));
    }
}

#[derive(Default)]
struct ManagerState {
    sources: BTreeMap<String, Arc<DataSource>>,
    entity_index: BTreeMap<String, Vec<String>>,
    overlays: HashMap<String, OverlayBinding>,
    /// Per-source hooks feeding the change batcher, keyed by source name.
    change_hooks: BTreeMap<String, Subscription>,
    destroyed: bool,
}

/// Owns the data sources for one visual context and fans their updates out
/// to overlays and entity-change listeners.
///
/// Must be created inside a Tokio runtime: change batching runs on a task.
pub struct DataSourceManager {
    platform: Arc<dyn HostPlatform>,
    state: Mutex<ManagerState>,
    listeners: ChangeListeners,
    changes: mpsc::UnboundedSender<String>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl DataSourceManager {
    pub fn new(platform: Arc<dyn HostPlatform>) -> Self {
        let (changes, rx) = mpsc::unbounded_channel();
        let listeners: ChangeListeners = Arc::new(Mutex::new(ListenerList::new()));
        let batcher = tokio::spawn(batch_changes(rx, listeners.clone()));

        Self {
            platform,
            state: Mutex::new(ManagerState::default()),
            listeners,
            changes,
            batcher: Mutex::new(Some(batcher)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerList<[String]>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and start a source for every entry; returns how many started.
    ///
    /// Misconfigured entries are skipped. Sources whose start fails stay
    /// registered and serve whatever data they have.
    pub async fn initialize_from_config(&self, configs: &BTreeMap<String, SourceConfig>) -> usize {
        let mut created = Vec::new();
        for (name, config) in configs {
            let source = match DataSource::new(name.clone(), config.clone(), self.platform.clone()) {
                Ok(source) => Arc::new(source),
                Err(e) => {
                    tracing::warn!(source = %name, "Skipping data source: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.register(source.clone()) {
                tracing::warn!(source = %name, "Not registering data source: {}", e);
                return 0;
            }
            created.push(source);
        }

        let results = join_all(created.iter().map(|source| source.start())).await;
        let mut started = 0;
        for (source, result) in created.iter().zip(results) {
            match result {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(source = %source.name(), "Data source did not start: {}", e),
            }
        }

        if self.state().destroyed {
            // Torn down while starting; make sure nothing outlives the manager.
            for source in &created {
                source.destroy();
            }
            return 0;
        }

        tracing::info!("Started {} of {} data sources", started, configs.len());
        started
    }

    fn register(&self, source: Arc<DataSource>) -> Result<(), ManagerError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(ManagerError::Destroyed);
        }

        let changes = self.changes.clone();
        let hook = source.subscribe(move |update: &SourceUpdate| {
            let _ = changes.send(update.entity_id.clone());
        });

        let name = source.name().to_string();
        if let Some(previous) = state.sources.insert(name.clone(), source.clone()) {
            tracing::warn!(source = %name, "Replacing existing data source");
            if let Some(mut stale) = state.change_hooks.remove(&name) {
                stale.unsubscribe();
            }
            let mut rebound = 0;
            for binding in state.overlays.values_mut() {
                if binding.overlay.source == name {
                    binding.rebind(&source);
                    rebound += 1;
                }
            }
            if rebound > 0 {
                tracing::debug!(source = %name, overlays = rebound, "Overlays moved to replacement source");
            }
            previous.destroy();
            unindex(&mut state.entity_index, previous.entity_id(), &name);
        }
        state
            .entity_index
            .entry(source.entity_id().to_string())
            .or_default()
            .push(name.clone());
        state.change_hooks.insert(name, hook);
        Ok(())
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<EntitySnapshot> {
        let state = self.state();
        let names = state.entity_index.get(entity_id)?;
        let mut best: Option<EntitySnapshot> = None;
        for name in names {
            let Some(source) = state.sources.get(name) else {
                continue;
            };
            let snapshot = source.snapshot();
            let newer = match &best {
                None => true,
                Some(current) => snapshot.timestamp > current.timestamp,
            };
            if newer {
                best = Some(snapshot);
            }
        }
        best.map(|mut snapshot| {
            snapshot.sources = names.clone();
            snapshot
        })
    }

    /// Tracked entity ids, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        self.state().entity_index.keys().cloned().collect()
    }

    pub fn source(&self, name: &str) -> Option<Arc<DataSource>> {
        self.state().sources.get(name).cloned()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.state().sources.keys().cloned().collect()
    }

    pub fn introspect(&self) -> Vec<SourceInfo> {
        let sources: Vec<Arc<DataSource>> = self.state().sources.values().cloned().collect();
        sources.iter().map(|s| s.info()).collect()
    }

    /// Bind `overlay` to the source it names; `callback` runs on every flush.
    /// Rebinding an overlay id replaces its previous binding.
    pub fn subscribe_overlay(
        &self,
        overlay: OverlayDescriptor,
        callback: impl Fn(&OverlayDescriptor, &SourceUpdate) + Send + Sync + 'static,
    ) -> Result<(), ManagerError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(ManagerError::Destroyed);
        }
        let Some(source) = state.sources.get(&overlay.source).cloned() else {
            return Err(ManagerError::UnknownSource {
                overlay: overlay.id.clone(),
                source_name: overlay.source.clone(),
            });
        };

        let id = overlay.id.clone();
        let source_name = overlay.source.clone();
        let binding = OverlayBinding::bind(&source, overlay, Arc::new(callback));
        if let Some(mut previous) = state.overlays.insert(id.clone(), binding) {
            previous.subscription.unsubscribe();
        }
        tracing::debug!(overlay = %id, source = %source_name, "Overlay subscribed");
        Ok(())
    }

    pub fn unsubscribe_overlay(&self, overlay_id: &str) -> bool {
        let binding = self.state().overlays.remove(overlay_id);
        match binding {
            Some(mut binding) => {
                binding.subscription.unsubscribe();
                tracing::debug!(overlay = %overlay_id, source = %binding.overlay.source, "Overlay unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Register a listener for batches of changed entity ids.
    pub fn add_entity_change_listener(
        &self,
        listener: impl Fn(&[String]) + Send + Sync + 'static,
    ) -> Subscription {
        if self.state().destroyed {
            return Subscription::inert();
        }
        let id = self.listeners().register(Arc::new(listener));
        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unregister(id);
            }
        })
    }

    /// Destroy every source and drop all bindings. Idempotent.
    pub fn destroy(&self) {
        let (sources, overlays, hooks) = {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.entity_index.clear();
            (
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.overlays),
                std::mem::take(&mut state.change_hooks),
            )
        };

        self.listeners().clear();
        if let Some(batcher) = self
            .batcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            batcher.abort();
        }
        for (_, mut binding) in overlays {
            binding.subscription.unsubscribe();
        }
        for (_, mut hook) in hooks {
            hook.unsubscribe();
        }
        for source in sources.values() {
            source.destroy();
        }
        tracing::info!("Data source manager destroyed ({} sources)", sources.len());
    }
}

impl Drop for DataSourceManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn unindex(index: &mut BTreeMap<String, Vec<String>>, entity_id: &str, name: &str) {
    if let Some(names) = index.get_mut(entity_id) {
        names.retain(|n| n != name);
        if names.is_empty() {
            index.remove(entity_id);
        }
    }
}

/// Collect every change queued before this task runs into one batch.
async fn batch_changes(mut rx: mpsc::UnboundedReceiver<String>, listeners: ChangeListeners) {
    while let Some(first) = rx.recv().await {
        tokio::task::yield_now().await;

        let mut batch = vec![first];
        while let Ok(entity_id) = rx.try_recv() {
            if !batch.contains(&entity_id) {
                batch.push(entity_id);
            }
        }

        let snapshot = listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        tracing::trace!(changed = batch.len(), listeners = snapshot.len(), "Entity change batch");
        for listener in snapshot {
            listener(batch.as_slice());
        }
    }
}
