//! Collection entities.

use std::fmt;
use std::ops::Deref;

use serde_json::Value;

use super::key::PrimaryKey;
use super::CollectionId;
use crate::graph::{Behavior, CellId};
use crate::instance::Pulse;
use crate::reactive::{inspect, Reactive, State};

/// One entity of a collection.
///
/// A `Data` is a [`State`] that knows which collection and key it belongs
/// to. Placeholders handed out for keys that were never collected are
/// provisional; collecting the key later fills the same cell, so handles
/// and watchers taken on the placeholder keep working.
#[derive(Clone)]
pub struct Data {
    state: State,
    collection: CollectionId,
}

impl Data {
    pub(crate) fn from_id(pulse: &Pulse, collection: CollectionId, id: CellId) -> Self {
        Self {
            state: State::from_id(pulse, id),
            collection,
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection
    }

    /// The key this entity is stored under. Changes when the entity is
    /// re-keyed through `Collection::update`.
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        inspect(self.instance(), self.cell_id(), |cell| match &cell.behavior {
            Behavior::Data { key, .. } => Some(key.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Whether this is still a placeholder for a key with no data.
    pub fn is_provisional(&self) -> bool {
        inspect(self.instance(), self.cell_id(), |cell| {
            matches!(
                cell.behavior,
                Behavior::Data {
                    provisional: true,
                    ..
                }
            )
        })
        .unwrap_or(false)
    }

    /// The value passed through the collection's compute function.
    pub fn rendered(&self) -> Value {
        let value = self.value();
        match self.instance() {
            Some(pulse) if !value.is_null() => pulse.render_entity(self.collection, value),
            _ => value,
        }
    }
}

impl Deref for Data {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl Reactive for Data {
    fn cell_id(&self) -> CellId {
        self.state.id()
    }

    fn instance(&self) -> Option<Pulse> {
        self.state.instance()
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("id", &self.cell_id())
            .field("key", &self.primary_key())
            .field("provisional", &self.is_provisional())
            .field("value", &self.peek())
            .finish()
    }
}
