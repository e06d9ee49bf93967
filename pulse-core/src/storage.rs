//! Persistence.
//!
//! The core consumes a small key/value contract and never implements a
//! durable store itself. Values are stored as JSON text under
//! `_<prefix>_<name>`.
//!
//! Persistence is best effort: the first failing call logs a warning and
//! disables storage for the instance, while the in-memory graph keeps
//! working. Writes issued from the scheduler are fire-and-forget; an
//! asynchronous write is spawned on the current tokio runtime and the drain
//! cycle does not wait for it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{PulseError, Result, StorageError};
use crate::graph::CellId;
use crate::instance::Pulse;
use crate::reactive::{IngestOptions, Reactive, State};

/// Synchronous storage contract.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Asynchronous storage contract.
pub trait AsyncStorageBackend: Send + Sync {
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<String>, StorageError>>;
    fn set(&self, key: String, value: String) -> BoxFuture<'static, Result<(), StorageError>>;
    fn remove(&self, key: String) -> BoxFuture<'static, Result<(), StorageError>>;
}

/// The configured backend, tagged by the caller rather than detected.
#[derive(Clone)]
pub enum Storage {
    Sync(Arc<dyn StorageBackend>),
    Async(Arc<dyn AsyncStorageBackend>),
}

/// In-memory backend, usable in both modes.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored text for `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

impl AsyncStorageBackend for MemoryStorage {
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<String>, StorageError>> {
        future::ready(StorageBackend::get(self, &key)).boxed()
    }

    fn set(&self, key: String, value: String) -> BoxFuture<'static, Result<(), StorageError>> {
        future::ready(StorageBackend::set(self, &key, &value)).boxed()
    }

    fn remove(&self, key: String) -> BoxFuture<'static, Result<(), StorageError>> {
        future::ready(StorageBackend::remove(self, &key)).boxed()
    }
}

impl State {
    /// Stop persisting this state and delete its stored value.
    pub fn unpersist(&self) -> &Self {
        if let Some(pulse) = self.instance() {
            pulse.forget_cell(self.id);
        }
        self
    }
}

impl Pulse {
    fn active_storage(&self) -> Option<&Storage> {
        if !self.inner.storage_enabled.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.storage.as_ref()
    }

    fn disable_storage(&self, err: &StorageError) {
        if self.inner.storage_enabled.swap(false, Ordering::SeqCst) {
            warn!(error = %err, "storage failed, persistence disabled");
        }
    }

    fn set_persist_key(&self, id: CellId, key: Option<String>) -> Option<Value> {
        let mut graph = self.inner.graph.lock();
        let cell = graph.get_mut(id)?;
        cell.persist_key = key;
        Some(cell.value.clone())
    }

    /// Restore a stored value or seed storage with the current one.
    pub(crate) fn persist_cell(&self, id: CellId, name: &str) {
        let backend = match self.active_storage() {
            Some(Storage::Sync(backend)) => backend.clone(),
            Some(Storage::Async(_)) => {
                warn!(name, "asynchronous storage requires persist_async");
                return;
            }
            None => {
                debug!(name, "no storage, persistence skipped");
                return;
            }
        };

        let key = self.inner.config.storage_key(name);
        let Some(current) = self.set_persist_key(id, Some(key.clone())) else {
            return;
        };

        let outcome = backend.get(&key).and_then(|stored| match stored {
            Some(text) => Ok(Some(serde_json::from_str::<Value>(&text)?)),
            None => {
                backend.set(&key, &serde_json::to_string(&current)?)?;
                Ok(None)
            }
        });

        match outcome {
            Ok(Some(stored)) => self.ingest_id(id, Some(stored), IngestOptions::background()),
            Ok(None) => {}
            Err(err) => self.disable_storage(&err),
        }
    }

    pub(crate) async fn persist_cell_async(&self, id: CellId, name: &str) -> Result<()> {
        let key = self.inner.config.storage_key(name);
        let storage = match self.active_storage() {
            Some(storage) => storage.clone(),
            None => return Ok(()),
        };
        let current = self
            .set_persist_key(id, Some(key.clone()))
            .ok_or(PulseError::DetachedCell(id))?;

        let outcome = match &storage {
            Storage::Sync(backend) => backend.get(&key),
            Storage::Async(backend) => backend.get(key.clone()).await,
        };
        let stored = match outcome {
            Ok(stored) => stored,
            Err(err) => {
                self.disable_storage(&err);
                return Err(err.into());
            }
        };

        match stored {
            Some(text) => {
                let value: Value = serde_json::from_str(&text).map_err(StorageError::from)?;
                self.ingest_id(id, Some(value), IngestOptions::background());
                Ok(())
            }
            None => {
                let text = serde_json::to_string(&current).map_err(StorageError::from)?;
                let written = match &storage {
                    Storage::Sync(backend) => backend.set(&key, &text),
                    Storage::Async(backend) => backend.set(key, text).await,
                };
                written.map_err(|err| {
                    self.disable_storage(&err);
                    err.into()
                })
            }
        }
    }

    /// Write a persisted cell's value. Called from `perform`.
    pub(crate) fn store_value(&self, key: &str, value: &Value) {
        let Some(storage) = self.active_storage() else {
            return;
        };
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(err) => return self.disable_storage(&err.into()),
        };

        match storage {
            Storage::Sync(backend) => {
                if let Err(err) = backend.set(key, &text) {
                    self.disable_storage(&err);
                }
            }
            Storage::Async(backend) => {
                let Ok(handle) = Handle::try_current() else {
                    warn!(key, "no tokio runtime, asynchronous write skipped");
                    return;
                };
                let write = backend.set(key.to_string(), text);
                let weak = self.downgrade();
                handle.spawn(async move {
                    if let Err(err) = write.await {
                        if let Some(pulse) = Pulse::from_weak(&weak) {
                            pulse.disable_storage(&err);
                        }
                    }
                });
            }
        }
    }

    fn forget_cell(&self, id: CellId) {
        let key = {
            let mut graph = self.inner.graph.lock();
            graph.get_mut(id).and_then(|cell| cell.persist_key.take())
        };
        let (Some(key), Some(storage)) = (key, self.active_storage()) else {
            return;
        };

        match storage {
            Storage::Sync(backend) => {
                if let Err(err) = backend.remove(&key) {
                    self.disable_storage(&err);
                }
            }
            Storage::Async(backend) => {
                if let Ok(handle) = Handle::try_current() {
                    handle.spawn(backend.remove(key).map(|_| ()));
                }
            }
        }
    }
}
