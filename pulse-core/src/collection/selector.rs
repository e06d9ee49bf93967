//! Selectors
//!
//! A selector is a derived cell pointing at one entity. Its value is the
//! selected entity, rendered through the collection's compute function.
//! Selecting a key that was never collected resolves to a provisional
//! placeholder, so the selector starts tracking the entity before its data
//! arrives and updates when it does.

use std::fmt;
use std::sync::Weak;

use serde_json::Value;

use super::data::Data;
use super::key::PrimaryKey;
use super::CollectionId;
use crate::graph::{Behavior, Cell, CellId};
use crate::instance::{Inner, Pulse};
use crate::reactive::{inspect, IngestOptions, Reactive};

#[derive(Clone)]
pub struct Selector {
    id: CellId,
    collection: CollectionId,
    pulse: Weak<Inner>,
}

impl Selector {
    pub(crate) fn create(
        pulse: &Pulse,
        collection: CollectionId,
        selected: Option<PrimaryKey>,
    ) -> Self {
        let id = pulse.inner.graph.lock().insert(Cell::new(
            Value::Null,
            Behavior::Selector {
                collection,
                selected,
            },
        ));
        pulse.initialize_derived(id);
        Self::from_id(pulse, collection, id)
    }

    pub(crate) fn from_id(pulse: &Pulse, collection: CollectionId, id: CellId) -> Self {
        Self {
            id,
            collection,
            pulse: pulse.downgrade(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// The currently selected key.
    pub fn selected_key(&self) -> Option<PrimaryKey> {
        inspect(self.instance(), self.id, |cell| match &cell.behavior {
            Behavior::Selector { selected, .. } => selected.clone(),
            _ => None,
        })
        .flatten()
    }

    /// Point the selector at another key and recompute right away.
    pub fn select(&self, key: impl Into<PrimaryKey>) -> &Self {
        self.set_selected(Some(key.into()))
    }

    /// Drop the selection; the value becomes null.
    pub fn clear(&self) -> &Self {
        self.set_selected(None)
    }

    fn set_selected(&self, key: Option<PrimaryKey>) -> &Self {
        let Some(pulse) = self.instance() else {
            return self;
        };
        {
            let mut graph = pulse.inner.graph.lock();
            if let Some(Cell {
                behavior: Behavior::Selector { selected, .. },
                ..
            }) = graph.get_mut(self.id)
            {
                *selected = key;
            }
        }
        pulse.ingest_id(self.id, None, IngestOptions::default());
        self
    }

    /// The entity cell behind the selection, provisional if needed.
    pub fn data(&self) -> Option<Data> {
        let pulse = self.instance()?;
        let key = self.selected_key()?;
        let id = pulse.data_cell(self.collection, &key, true)?;
        Some(Data::from_id(&pulse, self.collection, id))
    }
}

impl Pulse {
    /// Resolve the value of a selector, re-tracking the entity it points at.
    pub(crate) fn resolve_selector(&self, id: CellId) -> Option<Value> {
        let (collection, selected) = {
            let graph = self.inner.graph.lock();
            match &graph.get(id)?.behavior {
                Behavior::Selector {
                    collection,
                    selected,
                } => (*collection, selected.clone()),
                _ => return None,
            }
        };

        let Some(key) = selected else {
            self.inner.graph.lock().clear_sources(id);
            return Some(Value::Null);
        };

        Some(self.compute_tracked(id, || {
            let Some(data) = self.data_cell(collection, &key, true) else {
                return Value::Null;
            };
            let value = self.read_cell(data, true);
            if value.is_null() {
                value
            } else {
                self.render_entity(collection, value)
            }
        }))
    }
}

impl Reactive for Selector {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn instance(&self) -> Option<Pulse> {
        Pulse::from_weak(&self.pulse)
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("id", &self.id)
            .field("selected", &self.selected_key())
            .field("value", &self.peek())
            .finish()
    }
}
