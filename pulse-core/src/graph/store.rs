//! Cell Arena
//!
//! The arena owns every cell of an instance and maintains the edges between
//! them. Edges are stored on both ends: the source's [`Dep`](super::Dep)
//! lists its dependents, the dependent's `sources` list what it read.
//!
//! # Cycle safety
//!
//! Propagation re-ingests dependents until the queue drains, so a cycle
//! would never settle. Before an edge `source -> dependent` is added we
//! walk forward from `dependent`; if `source` is reachable the edge is
//! refused.
//!
//! # Aliases
//!
//! A cell folded into another by [`Graph::merge`] leaves its id behind as
//! an alias. Every lookup resolves aliases first, so handles holding the
//! old id keep reading and writing the surviving cell.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

use super::node::Cell;
use super::CellId;
use crate::collection::{CollectionId, CollectionStore};
use crate::error::{PulseError, Result};
use crate::reactive::SubscriptionId;

/// All cells and collections of one instance.
#[derive(Default)]
pub(crate) struct Graph {
    cells: IndexMap<CellId, Cell>,
    pub(crate) collections: IndexMap<CollectionId, CollectionStore>,
    /// Named cells, in registration order.
    pub(crate) named: IndexMap<String, CellId>,
    /// Merged-away ids and the cell they now stand for. Always one hop.
    aliases: HashMap<CellId, CellId>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a cell to the arena.
    pub(crate) fn insert(&mut self, cell: Cell) -> CellId {
        let id = cell.id;
        self.cells.insert(id, cell);
        id
    }

    /// Remove a cell from the arena.
    ///
    /// Also removes all edges involving this cell.
    pub(crate) fn remove(&mut self, id: CellId) -> Option<Cell> {
        let id = self.resolve(id);
        let cell = self.cells.swap_remove(&id)?;
        self.aliases.retain(|_, target| *target != id);

        for source in &cell.sources {
            if let Some(source) = self.cells.get_mut(source) {
                source.dep.undepend(id);
            }
        }

        for dependent in cell.dep.dependents() {
            if let Some(dependent) = self.cells.get_mut(&dependent) {
                dependent.sources.shift_remove(&id);
            }
        }

        if let Some(name) = &cell.name {
            if self.named.get(name) == Some(&id) {
                self.named.shift_remove(name);
            }
        }

        Some(cell)
    }

    /// The live id `id` stands for.
    pub(crate) fn resolve(&self, id: CellId) -> CellId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&self.resolve(id))
    }

    pub(crate) fn get_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        let id = self.resolve(id);
        self.cells.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&self.resolve(id))
    }

    /// Fold `from` into `into`.
    ///
    /// `from` is removed; its dependents, subscribers, watchers and persist
    /// key move to `into`, and `from` becomes an alias of `into`. Returns
    /// `false` if either cell is missing or they are the same cell.
    pub(crate) fn merge(&mut self, from: CellId, into: CellId) -> bool {
        let (from, into) = (self.resolve(from), self.resolve(into));
        if from == into || !self.cells.contains_key(&into) {
            return false;
        }
        for target in self.aliases.values_mut() {
            if *target == from {
                *target = into;
            }
        }
        let Some(cell) = self.remove(from) else {
            return false;
        };
        self.aliases.insert(from, into);

        for dependent in cell.dep.dependents() {
            // An edge that would close a cycle is dropped.
            let _ = self.depend(into, dependent);
        }
        if let Some(target) = self.cells.get_mut(&into) {
            for sub in cell.dep.subscribers() {
                target.dep.subscribe(sub);
            }
            for (name, watcher) in cell.watchers {
                target.watchers.entry(name).or_insert(watcher);
            }
            if target.persist_key.is_none() {
                target.persist_key = cell.persist_key;
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn collection(&self, id: CollectionId) -> Option<&CollectionStore> {
        self.collections.get(&id)
    }

    pub(crate) fn collection_mut(&mut self, id: CollectionId) -> Option<&mut CollectionStore> {
        self.collections.get_mut(&id)
    }

    /// Add a dependency edge: `dependent` is re-ingested when `source` changes.
    ///
    /// Returns `Ok(false)` if the edge already existed.
    pub(crate) fn depend(&mut self, source: CellId, dependent: CellId) -> Result<bool> {
        let (source, dependent) = (self.resolve(source), self.resolve(dependent));
        if source == dependent || self.reaches(dependent, source) {
            return Err(PulseError::Cycle {
                from: source,
                dependent,
            });
        }
        if !self.cells.contains_key(&dependent) {
            return Err(PulseError::DetachedCell(dependent));
        }

        let added = match self.cells.get_mut(&source) {
            Some(cell) => cell.dep.depend(dependent),
            None => return Err(PulseError::DetachedCell(source)),
        };
        if let Some(cell) = self.cells.get_mut(&dependent) {
            cell.sources.insert(source);
        }
        Ok(added)
    }

    /// Remove a dependency edge.
    pub(crate) fn undepend(&mut self, source: CellId, dependent: CellId) {
        let (source, dependent) = (self.resolve(source), self.resolve(dependent));
        if let Some(cell) = self.cells.get_mut(&source) {
            cell.dep.undepend(dependent);
        }
        if let Some(cell) = self.cells.get_mut(&dependent) {
            cell.sources.shift_remove(&source);
        }
    }

    /// Drop every edge pointing into `dependent`.
    ///
    /// Called before a dynamically tracked computation re-runs.
    pub(crate) fn clear_sources(&mut self, dependent: CellId) {
        let dependent = self.resolve(dependent);
        let sources = match self.cells.get_mut(&dependent) {
            Some(cell) => std::mem::take(&mut cell.sources),
            None => return,
        };
        for source in sources {
            if let Some(cell) = self.cells.get_mut(&source) {
                cell.dep.undepend(dependent);
            }
        }
    }

    /// Whether `to` can be reached from `from` by following dependents.
    pub(crate) fn reaches(&self, from: CellId, to: CellId) -> bool {
        let to = self.resolve(to);
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([self.resolve(from)]);

        while let Some(id) = queue.pop_front() {
            if id == to {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(cell) = self.cells.get(&id) {
                queue.extend(cell.dep.dependents());
            }
        }
        false
    }

    pub(crate) fn subscribe(&mut self, id: CellId, sub: SubscriptionId) -> bool {
        let id = self.resolve(id);
        self.cells
            .get_mut(&id)
            .map(|cell| cell.dep.subscribe(sub))
            .unwrap_or(false)
    }

    pub(crate) fn unsubscribe(&mut self, id: CellId, sub: SubscriptionId) {
        let id = self.resolve(id);
        if let Some(cell) = self.cells.get_mut(&id) {
            cell.dep.unsubscribe(sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Behavior;
    use serde_json::json;

    fn cell() -> Cell {
        Cell::new(json!(0), Behavior::State)
    }

    #[test]
    fn insert_and_remove_cells() {
        let mut graph = Graph::new();
        let a = graph.insert(cell());
        let b = graph.insert(cell());
        assert_eq!(graph.len(), 2);

        graph.remove(a);
        assert_eq!(graph.len(), 1);
        assert!(graph.get(a).is_none());
        assert!(graph.get(b).is_some());
    }

    #[test]
    fn depend_wires_both_ends() {
        let mut graph = Graph::new();
        let source = graph.insert(cell());
        let dependent = graph.insert(cell());

        assert!(graph.depend(source, dependent).unwrap());
        assert!(!graph.depend(source, dependent).unwrap());

        assert!(graph.get(source).unwrap().dep.has_dependent(dependent));
        assert!(graph.get(dependent).unwrap().sources.contains(&source));

        graph.undepend(source, dependent);
        assert!(!graph.get(source).unwrap().dep.has_dependent(dependent));
        assert!(graph.get(dependent).unwrap().sources.is_empty());
    }

    #[test]
    fn self_edges_and_cycles_are_refused() {
        let mut graph = Graph::new();
        let a = graph.insert(cell());
        let b = graph.insert(cell());
        let c = graph.insert(cell());

        assert!(matches!(graph.depend(a, a), Err(PulseError::Cycle { .. })));

        graph.depend(a, b).unwrap();
        graph.depend(b, c).unwrap();
        match graph.depend(c, a) {
            Err(PulseError::Cycle { from, dependent }) => {
                assert_eq!((from, dependent), (c, a));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
        assert!(graph.get(c).unwrap().dep.dependent_count() == 0);
    }

    #[test]
    fn removing_a_cell_drops_its_edges() {
        let mut graph = Graph::new();
        let a = graph.insert(cell());
        let b = graph.insert(cell());
        let c = graph.insert(cell());
        graph.depend(a, b).unwrap();
        graph.depend(b, c).unwrap();

        graph.remove(b);

        assert_eq!(graph.get(a).unwrap().dep.dependent_count(), 0);
        assert!(graph.get(c).unwrap().sources.is_empty());
    }

    #[test]
    fn merged_cells_resolve_to_the_survivor() {
        let mut graph = Graph::new();
        let from = graph.insert(cell());
        let into = graph.insert(Cell::new(json!(7), Behavior::State));
        let reader = graph.insert(cell());
        let sub = SubscriptionId::new();
        graph.depend(from, reader).unwrap();
        graph.subscribe(from, sub);

        assert!(graph.merge(from, into));
        assert!(!graph.merge(from, into));

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.resolve(from), into);
        assert_eq!(graph.get(from).unwrap().value, json!(7));
        assert!(graph.get(into).unwrap().dep.has_dependent(reader));
        assert!(graph.get(reader).unwrap().sources.contains(&into));
        assert_eq!(graph.get(into).unwrap().dep.subscriber_count(), 1);

        graph.unsubscribe(from, sub);
        assert_eq!(graph.get(into).unwrap().dep.subscriber_count(), 0);

        graph.remove(into);
        assert!(!graph.contains(from));
    }

    #[test]
    fn clear_sources_detaches_dependent() {
        let mut graph = Graph::new();
        let a = graph.insert(cell());
        let b = graph.insert(cell());
        let c = graph.insert(cell());
        graph.depend(a, c).unwrap();
        graph.depend(b, c).unwrap();

        graph.clear_sources(c);

        assert!(!graph.get(a).unwrap().dep.has_dependent(c));
        assert!(!graph.get(b).unwrap().dep.has_dependent(c));
    }
}
