//! Server State
//!
//! Snapshot of an instance in the shape an SSR loader exchanges: named cell
//! values plus, per collection, its entities, group indexes and selections.
//!
//! Snapshots travel as JSON or MessagePack. Hydrating a snapshot writes
//! everything in the background: dependents settle, subscribers are not
//! notified.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::collection::{keys_of, Collection, CollectionConfig, CollectOptions, PrimaryKey};
use crate::error::Result;
use crate::graph::{Behavior, CellKind};
use crate::instance::Pulse;
use crate::reactive::{SetOptions, State};

/// One collection inside a [`ServerState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSnapshot {
    pub name: String,
    pub data: Vec<Value>,
    pub groups: IndexMap<String, Vec<PrimaryKey>>,
    pub selectors: IndexMap<String, PrimaryKey>,
}

/// Interchange snapshot of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerState {
    /// Values of named cells.
    pub state: IndexMap<String, Value>,
    pub collections: Vec<CollectionSnapshot>,
}

impl ServerState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode as MessagePack with field names, so the payload stays
    /// self-describing.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSnapshot> {
        self.collections.iter().find(|snapshot| snapshot.name == name)
    }
}

impl Pulse {
    /// Take a snapshot of every named cell and every collection.
    pub fn server_state(&self) -> ServerState {
        let graph = self.inner.graph.lock();

        let state = graph
            .named
            .iter()
            .filter_map(|(name, id)| {
                let cell = graph.get(*id)?;
                Some((name.clone(), cell.public_value()))
            })
            .collect();

        let collections = graph
            .collections
            .values()
            .map(|store| CollectionSnapshot {
                name: store.name.clone(),
                data: store
                    .data
                    .values()
                    .filter_map(|id| graph.get(*id).map(|cell| cell.value.clone()))
                    .collect(),
                groups: store
                    .groups
                    .iter()
                    .filter_map(|(name, id)| {
                        let cell = graph.get(*id)?;
                        Some((name.clone(), keys_of(&cell.value)))
                    })
                    .collect(),
                selectors: store
                    .selectors
                    .iter()
                    .filter_map(|(name, id)| match &graph.get(*id)?.behavior {
                        Behavior::Selector {
                            selected: Some(key),
                            ..
                        } => Some((name.clone(), key.clone())),
                        _ => None,
                    })
                    .collect(),
            })
            .collect();

        ServerState { state, collections }
    }

    /// Load a snapshot into this instance.
    ///
    /// Named states are written (or created); collections are created when
    /// unknown, then filled. Nothing is delivered to subscribers.
    pub fn hydrate(&self, snapshot: &ServerState) {
        self.in_background(|| {
            for (name, value) in &snapshot.state {
                self.hydrate_state(name, value.clone());
            }
            for collection in &snapshot.collections {
                self.hydrate_collection(collection);
            }
        });
        debug!(
            states = snapshot.state.len(),
            collections = snapshot.collections.len(),
            "hydrated"
        );
    }

    fn hydrate_state(&self, name: &str, value: Value) {
        let existing = {
            let graph = self.inner.graph.lock();
            graph
                .named
                .get(name)
                .and_then(|id| graph.get(*id).map(|cell| (*id, cell.kind())))
        };
        match existing {
            Some((id, CellKind::State)) => {
                // Ingest rather than write in the background so dependents
                // settle.
                if let Err(err) = self.write_cell(id, value, SetOptions::default()) {
                    warn!(name, error = %err, "rejected hydrated value");
                }
            }
            Some((_, kind)) => {
                warn!(name, ?kind, "hydrated value targets a derived cell");
            }
            None => {
                State::new(self, value).key(name);
            }
        }
    }

    fn hydrate_collection(&self, snapshot: &CollectionSnapshot) {
        let collection = self
            .get_collection(&snapshot.name)
            .unwrap_or_else(|| Collection::new(self, CollectionConfig::new(&snapshot.name)));

        collection.collect_with(Value::Array(snapshot.data.clone()), (), CollectOptions::default());
        for (name, keys) in &snapshot.groups {
            collection.group(name).set_index(keys.clone());
        }
        for (name, key) in &snapshot.selectors {
            collection.create_selector(name, key);
        }
    }
}
