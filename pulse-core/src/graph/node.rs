//! Graph Nodes
//!
//! This module defines the cells that live in the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use super::Dep;
use crate::collection::{CollectionId, GroupIndex, PrimaryKey};
use crate::reactive::ValueType;

/// Callback invoked with a cell's new value after every write.
pub(crate) type Watcher = Arc<dyn Fn(&Value) + Send + Sync>;

/// Derivation function of a computed cell.
pub(crate) type ComputeFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Unique identifier for a cell in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of cell in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// A plain value container. Written only through `set`.
    State,

    /// A value derived from other cells by a pure function.
    Computed,

    /// A collection entity addressed by primary key.
    Data,

    /// An ordered index of primary keys with a materialized output.
    Group,

    /// A derived pointer to one collection entity.
    Selector,
}

/// Kind-specific state carried by a cell.
pub(crate) enum Behavior {
    State,
    Computed {
        func: ComputeFn,
        /// Dependencies were wired once at construction.
        static_deps: bool,
    },
    Data {
        collection: CollectionId,
        key: PrimaryKey,
        provisional: bool,
    },
    Group(GroupIndex),
    Selector {
        collection: CollectionId,
        selected: Option<PrimaryKey>,
    },
}

impl Behavior {
    pub(crate) fn kind(&self) -> CellKind {
        match self {
            Behavior::State => CellKind::State,
            Behavior::Computed { .. } => CellKind::Computed,
            Behavior::Data { .. } => CellKind::Data,
            Behavior::Group(_) => CellKind::Group,
            Behavior::Selector { .. } => CellKind::Selector,
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::State => f.write_str("State"),
            Behavior::Computed { static_deps, .. } => f
                .debug_struct("Computed")
                .field("static_deps", static_deps)
                .finish_non_exhaustive(),
            Behavior::Data {
                collection,
                key,
                provisional,
            } => f
                .debug_struct("Data")
                .field("collection", collection)
                .field("key", key)
                .field("provisional", provisional)
                .finish(),
            Behavior::Group(index) => f.debug_tuple("Group").field(index).finish(),
            Behavior::Selector {
                collection,
                selected,
            } => f
                .debug_struct("Selector")
                .field("collection", collection)
                .field("selected", selected)
                .finish(),
        }
    }
}

/// A reactive cell.
///
/// `next` is the staged value used when a job is performed without an
/// explicit value; `previous` is the value before the last write.
pub(crate) struct Cell {
    pub(crate) id: CellId,
    pub(crate) name: Option<String>,
    pub(crate) value: Value,
    pub(crate) previous: Value,
    pub(crate) next: Value,
    pub(crate) initial: Value,
    pub(crate) is_set: bool,
    pub(crate) type_lock: Option<ValueType>,
    pub(crate) persist_key: Option<String>,
    pub(crate) watchers: IndexMap<String, Watcher>,
    pub(crate) dep: Dep,
    /// Cells this one read during its last tracked computation.
    pub(crate) sources: IndexSet<CellId>,
    pub(crate) behavior: Behavior,
}

impl Cell {
    pub(crate) fn new(value: Value, behavior: Behavior) -> Self {
        Self {
            id: CellId::new(),
            name: None,
            previous: value.clone(),
            next: value.clone(),
            initial: value.clone(),
            value,
            is_set: false,
            type_lock: None,
            persist_key: None,
            watchers: IndexMap::new(),
            dep: Dep::new(),
            sources: IndexSet::new(),
            behavior,
        }
    }

    pub(crate) fn kind(&self) -> CellKind {
        self.behavior.kind()
    }

    /// Overwrite the value without going through the scheduler.
    pub(crate) fn write(&mut self, value: Value) {
        self.previous = std::mem::replace(&mut self.value, value);
        self.next = self.value.clone();
        self.is_set = true;
    }

    /// The value handed to subscribers: a group's materialized output,
    /// otherwise the stored value.
    pub(crate) fn public_value(&self) -> Value {
        match &self.behavior {
            Behavior::Group(index) => Value::Array(index.output.clone()),
            _ => self.value.clone(),
        }
    }

    pub(crate) fn group(&self) -> Option<&GroupIndex> {
        match &self.behavior {
            Behavior::Group(index) => Some(index),
            _ => None,
        }
    }

    pub(crate) fn group_mut(&mut self) -> Option<&mut GroupIndex> {
        match &mut self.behavior {
            Behavior::Group(index) => Some(index),
            _ => None,
        }
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("value", &self.value)
            .field("is_set", &self.is_set)
            .field("dependents", &self.dep.dependent_count())
            .field("subscribers", &self.dep.subscriber_count())
            .field("behavior", &self.behavior)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_ids_are_unique() {
        let id1 = CellId::new();
        let id2 = CellId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn new_cell_is_unset() {
        let cell = Cell::new(json!(1), Behavior::State);
        assert_eq!(cell.kind(), CellKind::State);
        assert!(!cell.is_set);
        assert_eq!(cell.previous, json!(1));
        assert_eq!(cell.next, json!(1));
    }

    #[test]
    fn write_tracks_previous_value() {
        let mut cell = Cell::new(json!("a"), Behavior::State);
        cell.write(json!("b"));

        assert!(cell.is_set);
        assert_eq!(cell.value, json!("b"));
        assert_eq!(cell.previous, json!("a"));
        assert_eq!(cell.next, json!("b"));
        assert_eq!(cell.initial, json!("a"));
    }
}
