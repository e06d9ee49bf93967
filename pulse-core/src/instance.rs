//! The Pulse instance.
//!
//! A [`Pulse`] owns everything: the cell arena, the scheduler, the
//! subscription registry and the optional storage and integration
//! collaborators. Handles created from it hold a weak reference, so dropping
//! the last `Pulse` clone tears the graph down even while handles remain.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::collection::{Collection, CollectionConfig};
use crate::config::PulseConfig;
use crate::graph::{CellKind, Graph};
use crate::integration::Integration;
use crate::reactive::{Computed, RuntimeState, State, SubscriptionRegistry, TrackingStack};
use crate::storage::{AsyncStorageBackend, Storage, StorageBackend};

pub(crate) struct Inner {
    pub(crate) config: PulseConfig,
    pub(crate) graph: Mutex<Graph>,
    pub(crate) runtime: Mutex<RuntimeState>,
    pub(crate) tracking: TrackingStack,
    pub(crate) subs: Mutex<SubscriptionRegistry>,
    pub(crate) storage: Option<Storage>,
    /// Cleared after the first storage failure.
    pub(crate) storage_enabled: AtomicBool,
    pub(crate) integration: Option<Arc<dyn Integration>>,
    core_ready: AtomicBool,
    pub(crate) update_signal: Arc<Notify>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Wake the update loop so it sees the instance is gone.
        self.update_signal.notify_one();
    }
}

/// A reactive instance.
///
/// Cloning is cheap; all clones share the same graph.
#[derive(Clone)]
pub struct Pulse {
    pub(crate) inner: Arc<Inner>,
}

impl Pulse {
    /// Create an instance with the default configuration and no
    /// collaborators.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: PulseConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> PulseBuilder {
        PulseBuilder::default()
    }

    pub fn config(&self) -> &PulseConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Signal that initial setup is complete. The integration's
    /// `on_core_ready` hook runs on the first call only.
    pub fn ready(&self) {
        if self.inner.core_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("core ready");
        if let Some(integration) = &self.inner.integration {
            integration.on_core_ready();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.core_ready.load(Ordering::SeqCst)
    }

    /// Shorthand for [`State::new`].
    pub fn state(&self, initial: impl Into<Value>) -> State {
        State::new(self, initial)
    }

    /// Shorthand for [`Computed::new`].
    pub fn computed<F, R>(&self, func: F) -> Computed
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        Computed::new(self, func)
    }

    /// Shorthand for [`Collection::new`].
    pub fn collection(&self, config: CollectionConfig) -> Collection {
        Collection::new(self, config)
    }

    /// Look up a named state.
    pub fn get_state(&self, name: &str) -> Option<State> {
        let graph = self.inner.graph.lock();
        let id = *graph.named.get(name)?;
        match graph.get(id)?.kind() {
            CellKind::State => Some(State::from_id(self, id)),
            _ => None,
        }
    }

    /// Look up a collection by name.
    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        let graph = self.inner.graph.lock();
        graph
            .collections
            .iter()
            .find(|(_, store)| store.name == name)
            .map(|(id, _)| Collection::from_id(self, *id))
    }

    /// Names of all collections, in creation order.
    pub fn collection_names(&self) -> Vec<String> {
        let graph = self.inner.graph.lock();
        graph
            .collections
            .values()
            .map(|store| store.name.clone())
            .collect()
    }

    /// Number of live cells in the arena.
    pub fn cell_count(&self) -> usize {
        self.inner.graph.lock().len()
    }

    /// Whether persistence is configured and has not failed.
    pub fn storage_enabled(&self) -> bool {
        self.inner.storage.is_some() && self.inner.storage_enabled.load(Ordering::SeqCst)
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pulse")
            .field("config", &self.inner.config)
            .field("cells", &self.cell_count())
            .field("storage", &self.inner.storage.is_some())
            .field("integration", &self.inner.integration.is_some())
            .finish()
    }
}

/// Builder for a [`Pulse`] instance with collaborators attached.
#[derive(Default)]
pub struct PulseBuilder {
    config: PulseConfig,
    storage: Option<Storage>,
    integration: Option<Arc<dyn Integration>>,
}

impl PulseBuilder {
    pub fn config(mut self, config: PulseConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist through a synchronous backend.
    pub fn storage(mut self, backend: impl StorageBackend + 'static) -> Self {
        self.storage = Some(Storage::Sync(Arc::new(backend)));
        self
    }

    /// Persist through an asynchronous backend.
    pub fn async_storage(mut self, backend: impl AsyncStorageBackend + 'static) -> Self {
        self.storage = Some(Storage::Async(Arc::new(backend)));
        self
    }

    pub fn integration(mut self, integration: impl Integration + 'static) -> Self {
        self.integration = Some(Arc::new(integration));
        self
    }

    /// Build the instance. The integration's `on_pulse_ready` hook runs
    /// before this returns.
    pub fn build(self) -> Pulse {
        let pulse = Pulse {
            inner: Arc::new(Inner {
                config: self.config,
                graph: Mutex::new(Graph::new()),
                runtime: Mutex::new(RuntimeState::default()),
                tracking: TrackingStack::default(),
                subs: Mutex::new(SubscriptionRegistry::default()),
                storage_enabled: AtomicBool::new(self.storage.is_some()),
                storage: self.storage,
                integration: self.integration,
                core_ready: AtomicBool::new(false),
                update_signal: Arc::new(Notify::new()),
            }),
        };

        if let Some(integration) = &pulse.inner.integration {
            debug!(integration = integration.name(), "pulse ready");
            integration.on_pulse_ready();
        }
        pulse
    }
}
