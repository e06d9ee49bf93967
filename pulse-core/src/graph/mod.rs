//! Dependency Graph
//!
//! This module holds the arena that owns every reactive cell of an instance
//! together with the edges between them.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are cells: plain states, computed values, collection entities,
//!   groups and selectors
//! - Edges are dependencies: if B reads A, A's [`Dep`] lists B as a dependent
//!
//! When a cell is written, the runtime walks its dependents and re-ingests
//! them, so the whole affected subgraph settles before any subscriber is told.
//!
//! # Design Decisions
//!
//! 1. Cells live in one arena keyed by [`CellId`] instead of pointing at each
//!    other. Handles, dependents and subscriptions all refer to ids, which
//!    keeps ownership a tree even though the logical graph has back-edges.
//!
//! 2. Each cell also records its sources (the cells it read), so dynamic
//!    dependency discovery can drop stale edges before wiring new ones.
//!
//! 3. Edges that would close a cycle are refused at wiring time.

mod dep;
mod node;
mod store;

pub use dep::Dep;
pub use node::{CellId, CellKind};
pub(crate) use node::{Behavior, Cell, ComputeFn, Watcher};
pub(crate) use store::Graph;
