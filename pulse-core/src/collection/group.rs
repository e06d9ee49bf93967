//! Groups
//!
//! A group is a cell whose value is an ordered list of primary keys (the raw
//! index). Next to it the group keeps a materialized `output`: the rendered
//! entities of every key that resolves to data, in index order.
//!
//! # How a Group Builds
//!
//! 1. Writes to the raw index go through `add`, `remove` and `set_index`.
//!    Each write either records tracked changes (soft rebuild) or asks for
//!    a full rebuild.
//!
//! 2. When the group's job is performed, or its output is read while
//!    outdated, the output is rebuilt:
//!    a. Full: walk the whole raw index and render every key with data.
//!    b. Tracked: replay the recorded changes against the previous output,
//!       touching only the slots they name.
//!
//! 3. Both strategies produce the same output for the same raw index and
//!    data. The tracked one is O(changes) instead of O(group size).
//!
//! Keys without backing data never occupy a slot; they are remembered as
//! missing and picked up when their data is collected.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Weak;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::key::{index_value, keys_of, IntoKeys, PrimaryKey};
use super::CollectionId;
use crate::graph::{Behavior, Cell, CellId};
use crate::instance::{Inner, Pulse};
use crate::reactive::{inspect, IngestOptions, Reactive};

/// Kind of a tracked index change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMethod {
    Add,
    Remove,
    Update,
}

/// A queued diff operation, replayed on the next build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackedChange {
    pub(crate) method: ChangeMethod,
    /// Position at record time. Only a hint: replay locates keys itself.
    pub(crate) index: usize,
    pub(crate) key: PrimaryKey,
}

/// Where new keys go when no explicit position is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddMethod {
    #[default]
    Push,
    Unshift,
}

/// Options for [`Group::add_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOptions {
    /// Insert at this raw position instead of using `method`.
    pub at_index: Option<usize>,
    pub method: AddMethod,
    /// Move keys that are already present instead of skipping them.
    pub overwrite: bool,
    /// Record tracked changes instead of forcing a full rebuild.
    pub soft_rebuild: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            at_index: None,
            method: AddMethod::Push,
            overwrite: false,
            soft_rebuild: true,
        }
    }
}

/// Materialized state of a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Materialized {
    /// Raw index filtered to keys that resolved to data.
    pub(crate) precise: Vec<PrimaryKey>,
    pub(crate) output: Vec<Value>,
    pub(crate) missing: IndexSet<PrimaryKey>,
}

/// Group-specific state stored in the group's cell.
#[derive(Debug)]
pub(crate) struct GroupIndex {
    pub(crate) collection: CollectionId,
    pub(crate) name: String,
    pub(crate) output: Vec<Value>,
    pub(crate) precise: Vec<PrimaryKey>,
    pub(crate) missing: IndexSet<PrimaryKey>,
    pub(crate) changes: Vec<TrackedChange>,
    /// Keys of the staged raw index.
    pub(crate) members: HashSet<PrimaryKey>,
    pub(crate) outdated: bool,
    pub(crate) needs_full: bool,
}

impl GroupIndex {
    pub(crate) fn new(collection: CollectionId, name: String, keys: &[PrimaryKey]) -> Self {
        Self {
            collection,
            name,
            output: Vec::new(),
            precise: Vec::new(),
            missing: IndexSet::new(),
            changes: Vec::new(),
            members: keys.iter().cloned().collect(),
            outdated: true,
            needs_full: true,
        }
    }

    fn record(&mut self, method: ChangeMethod, index: usize, key: PrimaryKey, soft: bool) {
        if soft {
            self.changes.push(TrackedChange { method, index, key });
        } else {
            self.needs_full = true;
        }
        self.outdated = true;
    }

    fn precise_position(&self, key: &PrimaryKey) -> Option<usize> {
        self.precise.iter().position(|k| k == key)
    }

    /// Queue a one-slot refresh for a member whose data changed.
    pub(crate) fn touch(&mut self, key: &PrimaryKey) {
        let index = self.precise_position(key).unwrap_or(0);
        self.record(ChangeMethod::Update, index, key.clone(), true);
    }

    /// Insert `keys` into the staged index. Returns whether anything changed.
    pub(crate) fn stage_add(
        &mut self,
        staged: &mut Vec<PrimaryKey>,
        keys: Vec<PrimaryKey>,
        options: &AddOptions,
    ) -> bool {
        let mut changed = false;
        let mut offset = 0;

        for key in keys {
            if self.members.contains(&key) {
                if !options.overwrite {
                    continue;
                }
                if let Some(pos) = staged.iter().position(|k| *k == key) {
                    staged.remove(pos);
                    let index = self.precise_position(&key).unwrap_or(pos);
                    self.record(ChangeMethod::Remove, index, key.clone(), options.soft_rebuild);
                }
            }

            let at = match (options.at_index, options.method) {
                (Some(at), _) => (at + offset).min(staged.len()),
                (None, AddMethod::Unshift) => offset.min(staged.len()),
                (None, AddMethod::Push) => staged.len(),
            };
            staged.insert(at, key.clone());
            offset += 1;
            self.members.insert(key.clone());
            self.record(ChangeMethod::Add, at, key, options.soft_rebuild);
            changed = true;
        }
        changed
    }

    /// Remove `keys` from the staged index. Returns whether anything changed.
    pub(crate) fn stage_remove(
        &mut self,
        staged: &mut Vec<PrimaryKey>,
        keys: &[PrimaryKey],
        soft: bool,
    ) -> bool {
        let mut changed = false;
        for key in keys {
            if !self.members.remove(key) {
                continue;
            }
            let Some(pos) = staged.iter().position(|k| k == key) else {
                continue;
            };
            staged.remove(pos);
            let index = self.precise_position(key).unwrap_or(pos);
            self.record(ChangeMethod::Remove, index, key.clone(), soft);
            changed = true;
        }
        changed
    }

    /// Swap `old` for `new` at the same raw position.
    ///
    /// If `new` is already listed, `old` is dropped instead and the existing
    /// `new` slot is refreshed by the entity write that follows.
    pub(crate) fn stage_rekey(
        &mut self,
        staged: &mut Vec<PrimaryKey>,
        old: &PrimaryKey,
        new: &PrimaryKey,
    ) -> bool {
        if !self.members.contains(old) {
            return false;
        }
        let Some(pos) = staged.iter().position(|k| k == old) else {
            return false;
        };
        let index = self.precise_position(old).unwrap_or(pos);
        self.members.remove(old);
        self.record(ChangeMethod::Remove, index, old.clone(), true);

        if self.members.contains(new) {
            staged.remove(pos);
            return true;
        }
        staged[pos] = new.clone();
        self.members.insert(new.clone());
        self.record(ChangeMethod::Add, pos, new.clone(), true);
        true
    }

    /// Replace the staged index wholesale.
    pub(crate) fn stage_replace(&mut self, keys: &[PrimaryKey]) {
        self.members = keys.iter().cloned().collect();
        self.changes.clear();
        self.needs_full = true;
        self.outdated = true;
    }
}

/// Build the materialized state of `raw` from scratch.
pub(crate) fn full_build(
    raw: &[PrimaryKey],
    mut render: impl FnMut(&PrimaryKey) -> Option<Value>,
) -> Materialized {
    let mut built = Materialized::default();
    for key in raw {
        match render(key) {
            Some(value) => {
                built.precise.push(key.clone());
                built.output.push(value);
            }
            None => {
                built.missing.insert(key.clone());
            }
        }
    }
    built
}

/// Apply tracked changes, in recorded order, to a previous build.
///
/// `raw` is the final raw index. Inserted keys are placed after the last
/// settled key that precedes them in `raw`; keys with a later queued removal
/// are not settled and never serve as anchors.
///
/// A key leaves the raw index only through a recorded removal, so an update
/// to a key already in the build is rendered in place without consulting
/// `raw`. The position map is built on the first change that needs it.
pub(crate) fn replay(
    mut built: Materialized,
    changes: &[TrackedChange],
    raw: &[PrimaryKey],
    mut render: impl FnMut(&PrimaryKey) -> Option<Value>,
) -> Materialized {
    let mut positions: Option<HashMap<&PrimaryKey, usize>> = None;
    let mut pending: HashMap<&PrimaryKey, usize> = HashMap::new();
    for change in changes.iter().filter(|c| c.method == ChangeMethod::Remove) {
        *pending.entry(&change.key).or_default() += 1;
    }

    for change in changes {
        let key = &change.key;
        let existing = if built.precise.get(change.index) == Some(key) {
            Some(change.index)
        } else {
            built.precise.iter().position(|k| k == key)
        };

        if change.method == ChangeMethod::Remove {
            if let Some(count) = pending.get_mut(key) {
                *count = count.saturating_sub(1);
            }
            if let Some(pos) = existing {
                built.precise.remove(pos);
                built.output.remove(pos);
            }
            built.missing.shift_remove(key);
            continue;
        }

        if let (ChangeMethod::Update, Some(pos)) = (change.method, existing) {
            match render(key) {
                Some(value) => built.output[pos] = value,
                None => {
                    built.precise.remove(pos);
                    built.output.remove(pos);
                    built.missing.insert(key.clone());
                }
            }
            continue;
        }

        let positions = positions
            .get_or_insert_with(|| raw.iter().enumerate().map(|(i, key)| (key, i)).collect());
        let Some(&target) = positions.get(key) else {
            if let Some(pos) = existing {
                built.precise.remove(pos);
                built.output.remove(pos);
            }
            built.missing.shift_remove(key);
            continue;
        };

        match (render(key), existing) {
            (Some(value), Some(pos)) => {
                built.output[pos] = value;
                built.missing.shift_remove(key);
            }
            (Some(value), None) => {
                let at = anchor(&built.precise, positions, &pending, target);
                built.precise.insert(at, key.clone());
                built.output.insert(at, value);
                built.missing.shift_remove(key);
            }
            (None, existing) => {
                if let Some(pos) = existing {
                    built.precise.remove(pos);
                    built.output.remove(pos);
                }
                built.missing.insert(key.clone());
            }
        }
    }
    built
}

fn anchor(
    precise: &[PrimaryKey],
    positions: &HashMap<&PrimaryKey, usize>,
    pending: &HashMap<&PrimaryKey, usize>,
    target: usize,
) -> usize {
    for (i, key) in precise.iter().enumerate().rev() {
        if pending.get(key).copied().unwrap_or(0) > 0 {
            continue;
        }
        if let Some(&pos) = positions.get(key) {
            if pos < target {
                return i + 1;
            }
        }
    }
    0
}

fn has_duplicates(raw: &[PrimaryKey]) -> bool {
    let mut seen = HashSet::with_capacity(raw.len());
    !raw.iter().all(|key| seen.insert(key))
}

impl Pulse {
    /// Rebuild a group's output if it is outdated.
    ///
    /// The arena lock is released while entities are rendered, so render
    /// functions may read other cells.
    pub(crate) fn build_group(&self, id: CellId) {
        let threshold = self.inner.config.group_full_rebuild_threshold;

        let (raw, changes, previous, collection, name) = {
            let mut graph = self.inner.graph.lock();
            let Some(Cell {
                value,
                behavior: Behavior::Group(index),
                ..
            }) = graph.get_mut(id)
            else {
                return;
            };
            if !index.outdated {
                return;
            }
            index.outdated = false;

            let mut changes = std::mem::take(&mut index.changes);
            let mut full =
                index.needs_full || changes.is_empty() || changes.len() > threshold;
            // Refreshing slots already in the build never reads the raw index.
            let in_place = !full
                && changes.iter().all(|change| {
                    change.method == ChangeMethod::Update
                        && (index.precise.get(change.index) == Some(&change.key)
                            || index.precise.contains(&change.key))
                });
            let raw = if in_place {
                let mut seen = HashSet::new();
                changes.retain(|change| seen.insert(change.key.clone()));
                Vec::new()
            } else {
                keys_of(value)
            };
            full = full || has_duplicates(&raw);
            index.needs_full = false;

            let previous = (!full).then(|| Materialized {
                precise: std::mem::take(&mut index.precise),
                output: std::mem::take(&mut index.output),
                missing: std::mem::take(&mut index.missing),
            });
            (raw, changes, previous, index.collection, index.name.clone())
        };

        let needed: Vec<&PrimaryKey> = match previous {
            None => raw.iter().collect(),
            Some(_) => changes
                .iter()
                .filter(|change| change.method != ChangeMethod::Remove)
                .map(|change| &change.key)
                .collect(),
        };
        let (entities, compute) = self.entity_values(collection, needed);

        let render = |key: &PrimaryKey| {
            entities.get(key).map(|value| match &compute {
                Some(compute) => compute(value),
                None => value.clone(),
            })
        };
        let tracked = previous.is_some();
        let built = self.untracked(|| match previous {
            Some(previous) => replay(previous, &changes, &raw, render),
            None => full_build(&raw, render),
        });

        debug!(
            group = %name,
            tracked,
            changes = changes.len(),
            size = built.output.len(),
            "group built"
        );

        let mut graph = self.inner.graph.lock();
        if let Some(index) = graph.get_mut(id).and_then(Cell::group_mut) {
            index.precise = built.precise;
            index.output = built.output;
            index.missing = built.missing;
        }
    }

    /// Stage a change to a group's raw index and return the new index if
    /// anything changed.
    pub(crate) fn stage_group(
        &self,
        id: CellId,
        stage: impl FnOnce(&mut GroupIndex, &mut Vec<PrimaryKey>) -> bool,
    ) -> Option<Value> {
        let mut graph = self.inner.graph.lock();
        let Cell { next, behavior, .. } = graph.get_mut(id)?;
        let Behavior::Group(index) = behavior else {
            return None;
        };
        let mut staged = keys_of(next);
        if !stage(index, &mut staged) {
            return None;
        }
        *next = index_value(&staged);
        Some(next.clone())
    }
}

/// An ordered, incrementally materialized view of a collection.
#[derive(Clone)]
pub struct Group {
    id: CellId,
    pulse: Weak<Inner>,
}

impl Group {
    pub(crate) fn from_id(pulse: &Pulse, id: CellId) -> Self {
        Self {
            id,
            pulse: pulse.downgrade(),
        }
    }

    /// A handle that refers to no instance; every operation is a no-op.
    pub(crate) fn detached() -> Self {
        Self {
            id: CellId::new(),
            pulse: Weak::new(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    fn with_index<R>(&self, f: impl FnOnce(&GroupIndex) -> R) -> Option<R> {
        inspect(self.instance(), self.id, |cell| cell.group().map(f)).flatten()
    }

    pub fn group_name(&self) -> String {
        self.with_index(|index| index.name.clone()).unwrap_or_default()
    }

    /// The raw index. Tracked.
    pub fn index(&self) -> Vec<PrimaryKey> {
        keys_of(&self.value())
    }

    /// Rendered entities in index order. Tracked; rebuilds first if the
    /// output is outdated.
    pub fn output(&self) -> Vec<Value> {
        let Some(pulse) = self.instance() else {
            return Vec::new();
        };
        pulse.inner.tracking.track(self.id);
        pulse.build_group(self.id);
        self.with_index(|index| index.output.clone())
            .unwrap_or_default()
    }

    pub fn has(&self, key: impl Into<PrimaryKey>) -> bool {
        let key = key.into();
        self.with_index(|index| index.members.contains(&key))
            .unwrap_or(false)
    }

    /// Number of keys in the raw index.
    pub fn size(&self) -> usize {
        self.with_index(|index| index.members.len()).unwrap_or(0)
    }

    /// Keys in the raw index that have no data, in index order.
    pub fn missing_keys(&self) -> Vec<PrimaryKey> {
        if let Some(pulse) = self.instance() {
            pulse.build_group(self.id);
        }
        let missing = self
            .with_index(|index| index.missing.clone())
            .unwrap_or_default();
        keys_of(&self.peek())
            .into_iter()
            .filter(|key| missing.contains(key))
            .collect()
    }

    pub fn is_outdated(&self) -> bool {
        self.with_index(|index| index.outdated).unwrap_or(false)
    }

    /// Replace the raw index. Repeated keys keep their first position. The
    /// next build is a full rebuild.
    pub fn set_index(&self, keys: impl IntoKeys) -> &Self {
        let mut seen = HashSet::new();
        let keys: Vec<PrimaryKey> = keys
            .into_keys()
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();
        self.stage(|index, staged| {
            index.stage_replace(&keys);
            *staged = keys;
            true
        })
    }

    /// Add keys with the default options: push, skip present keys, soft
    /// rebuild.
    pub fn add(&self, keys: impl IntoKeys) -> &Self {
        self.add_with(keys, AddOptions::default())
    }

    pub fn add_with(&self, keys: impl IntoKeys, options: AddOptions) -> &Self {
        let keys = keys.into_keys();
        self.stage(|index, staged| index.stage_add(staged, keys, &options))
    }

    /// Remove keys with a soft rebuild.
    pub fn remove(&self, keys: impl IntoKeys) -> &Self {
        self.remove_with(keys, true)
    }

    pub fn remove_with(&self, keys: impl IntoKeys, soft_rebuild: bool) -> &Self {
        let keys = keys.into_keys();
        self.stage(|index, staged| index.stage_remove(staged, &keys, soft_rebuild))
    }

    /// Refresh one member's slot without changing membership.
    pub fn rebuild_one(&self, key: impl Into<PrimaryKey>) -> &Self {
        let key = key.into();
        let Some(pulse) = self.instance() else {
            return self;
        };
        let touched = {
            let mut graph = pulse.inner.graph.lock();
            match graph.get_mut(self.id).and_then(Cell::group_mut) {
                Some(index) if index.members.contains(&key) => {
                    index.touch(&key);
                    true
                }
                _ => false,
            }
        };
        if touched {
            pulse.ingest_id(self.id, None, IngestOptions::default());
        } else {
            warn!(group = %self.group_name(), key = %key, "rebuild of a key outside the group");
        }
        self
    }

    fn stage(&self, stage: impl FnOnce(&mut GroupIndex, &mut Vec<PrimaryKey>) -> bool) -> &Self {
        if let Some(pulse) = self.instance() {
            if let Some(index) = pulse.stage_group(self.id, stage) {
                pulse.ingest_id(self.id, Some(index), IngestOptions::default());
            }
        }
        self
    }
}

impl Reactive for Group {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn instance(&self) -> Option<Pulse> {
        Pulse::from_weak(&self.pulse)
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.group_name())
            .field("index", &self.peek())
            .finish()
    }
}
