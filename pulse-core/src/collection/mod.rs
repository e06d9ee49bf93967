//! Collections
//!
//! A collection is a keyed store of entities with ordered views on top.
//!
//! # Overview
//!
//! - Entities are [`Data`] cells addressed by a [`PrimaryKey`] read from a
//!   configurable field of each item.
//! - [`Group`]s are ordered lists of keys with an incrementally maintained
//!   output of rendered entities.
//! - [`Selector`]s point at one entity by key.
//!
//! Groups do not depend on entity cells through graph edges. Instead, every
//! entity write queues a one-slot refresh on each group that lists the
//! entity, which keeps group maintenance proportional to what changed.
//!
//! # Provisional entities
//!
//! Looking up a key that was never collected hands out a placeholder cell
//! holding null. Collecting the key later fills that same cell, so anything
//! bound to the placeholder sees the real data.

mod data;
mod group;
mod key;
mod selector;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, warn};

pub use data::Data;
pub use group::{AddMethod, AddOptions, ChangeMethod, Group};
pub use key::{IntoKeys, IntoNames, PrimaryKey};
pub use selector::Selector;

pub(crate) use group::GroupIndex;

use crate::error::PulseError;
use crate::graph::{Behavior, Cell, CellId};
use crate::instance::{Inner, Pulse};
use crate::reactive::{merge_values, IngestOptions, SetOptions};
pub(crate) use key::{index_value, keys_of};

/// Render function applied to entities on their way into group outputs and
/// selectors.
pub(crate) type RenderFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Per-item transform applied by `collect` before the key is read.
pub type ItemFn = Arc<dyn Fn(Value, usize) -> Value + Send + Sync>;

/// Name of the group every item lands in when `default_group` is on.
pub const DEFAULT_GROUP: &str = "default";

/// Unique identifier for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(u64);

impl CollectionId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Static configuration of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub name: String,
    /// Field of each item holding its primary key.
    pub primary_key: String,
    /// Put every collected item into the `default` group.
    pub default_group: bool,
    /// Groups created up front. They survive `reset`.
    pub groups: Vec<String>,
    /// Selectors created up front, with no selection.
    pub selectors: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "collection".to_string(),
            primary_key: "id".to_string(),
            default_group: false,
            groups: Vec::new(),
            selectors: Vec::new(),
        }
    }
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn default_group(mut self, enabled: bool) -> Self {
        self.default_group = enabled;
        self
    }

    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.groups.push(name.into());
        self
    }

    pub fn selector(mut self, name: impl Into<String>) -> Self {
        self.selectors.push(name.into());
        self
    }

    fn fixed_groups(&self) -> Vec<String> {
        let mut groups = Vec::new();
        if self.default_group {
            groups.push(DEFAULT_GROUP.to_string());
        }
        for name in &self.groups {
            if !groups.contains(name) {
                groups.push(name.clone());
            }
        }
        groups
    }
}

/// Arena-side state of a collection.
pub(crate) struct CollectionStore {
    pub(crate) name: String,
    pub(crate) config: CollectionConfig,
    pub(crate) data: IndexMap<PrimaryKey, CellId>,
    pub(crate) provisional: IndexMap<PrimaryKey, CellId>,
    pub(crate) groups: IndexMap<String, CellId>,
    pub(crate) selectors: IndexMap<String, CellId>,
    pub(crate) compute: Option<RenderFn>,
}

impl CollectionStore {
    fn new(config: CollectionConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            data: IndexMap::new(),
            provisional: IndexMap::new(),
            groups: IndexMap::new(),
            selectors: IndexMap::new(),
            compute: None,
        }
    }

    fn lookup(&self, key: &PrimaryKey) -> Option<CellId> {
        self.data
            .get(key)
            .or_else(|| self.provisional.get(key))
            .copied()
    }
}

impl fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionStore")
            .field("name", &self.name)
            .field("data", &self.data.len())
            .field("provisional", &self.provisional.len())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("selectors", &self.selectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Options for [`Collection::collect_with`].
#[derive(Clone)]
pub struct CollectOptions {
    /// Merge into existing entities instead of overwriting them.
    pub patch: bool,
    /// With `patch`, merge nested objects recursively.
    pub deep: bool,
    /// Where new keys go in the target groups.
    pub method: AddMethod,
    pub for_each_item: Option<ItemFn>,
    /// Write without notifying subscribers.
    pub background: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            patch: false,
            deep: true,
            method: AddMethod::Push,
            for_each_item: None,
            background: false,
        }
    }
}

impl CollectOptions {
    pub fn for_each_item<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, usize) -> Value + Send + Sync + 'static,
    {
        self.for_each_item = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for CollectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectOptions")
            .field("patch", &self.patch)
            .field("deep", &self.deep)
            .field("method", &self.method)
            .field("for_each_item", &self.for_each_item.is_some())
            .field("background", &self.background)
            .finish()
    }
}

/// Options for [`Collection::update_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub deep: bool,
    pub background: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            deep: true,
            background: false,
        }
    }
}

/// Handle to a collection.
#[derive(Clone)]
pub struct Collection {
    id: CollectionId,
    pulse: Weak<Inner>,
}

impl Collection {
    /// Create a collection with its configured groups and selectors.
    pub fn new(pulse: &Pulse, config: CollectionConfig) -> Self {
        let id = CollectionId::new();
        let groups = config.fixed_groups();
        let selectors = config.selectors.clone();
        debug!(collection = %config.name, "collection created");
        pulse
            .inner
            .graph
            .lock()
            .collections
            .insert(id, CollectionStore::new(config));

        let collection = Self::from_id(pulse, id);
        for name in groups {
            collection.create_group(&name, ());
        }
        for name in selectors {
            collection.register_selector(pulse, &name, None);
        }
        collection
    }

    pub(crate) fn from_id(pulse: &Pulse, id: CollectionId) -> Self {
        Self {
            id,
            pulse: pulse.downgrade(),
        }
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    fn instance(&self) -> Option<Pulse> {
        Pulse::from_weak(&self.pulse)
    }

    fn with_store<R>(&self, f: impl FnOnce(&CollectionStore) -> R) -> Option<R> {
        let pulse = self.instance()?;
        let graph = pulse.inner.graph.lock();
        graph.collection(self.id).map(f)
    }

    pub fn name(&self) -> String {
        self.with_store(|store| store.name.clone())
            .unwrap_or_default()
    }

    pub fn primary_key_field(&self) -> String {
        self.with_store(|store| store.config.primary_key.clone())
            .unwrap_or_default()
    }

    /// Install the render function used by group outputs and selectors.
    /// Every group rebuilds from scratch and every selector re-resolves.
    pub fn compute<F>(&self, f: F) -> &Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let Some(pulse) = self.instance() else {
            return self;
        };
        let (groups, selectors) = {
            let mut graph = pulse.inner.graph.lock();
            let Some(store) = graph.collection_mut(self.id) else {
                return self;
            };
            store.compute = Some(Arc::new(f));
            let groups: Vec<CellId> = store.groups.values().copied().collect();
            let selectors: Vec<CellId> = store.selectors.values().copied().collect();
            for id in &groups {
                if let Some(index) = graph.get_mut(*id).and_then(Cell::group_mut) {
                    index.needs_full = true;
                    index.outdated = true;
                }
            }
            (groups, selectors)
        };

        pulse.batch(|| {
            for id in groups.into_iter().chain(selectors) {
                pulse.ingest_id(id, None, IngestOptions::default());
            }
        });
        self
    }

    /// Collect items into the collection and, optionally, into groups.
    ///
    /// `items` is one object or an array of objects.
    pub fn collect(&self, items: impl Into<Value>, groups: impl IntoNames) -> &Self {
        self.collect_with(items, groups, CollectOptions::default())
    }

    pub fn collect_with(
        &self,
        items: impl Into<Value>,
        groups: impl IntoNames,
        options: CollectOptions,
    ) -> &Self {
        let Some(pulse) = self.instance() else {
            return self;
        };
        let Some((field, mut groups)) = self.with_store(|store| {
            (
                store.config.primary_key.clone(),
                store.config.default_group,
            )
        })
        .map(|(field, default_group)| {
            let mut names = groups.into_names();
            if default_group && !names.iter().any(|name| name == DEFAULT_GROUP) {
                names.push(DEFAULT_GROUP.to_string());
            }
            (field, names)
        }) else {
            return self;
        };
        let mut seen = HashSet::new();
        groups.retain(|name| seen.insert(name.clone()));

        let items = match items.into() {
            Value::Array(items) => items,
            item => vec![item],
        };

        pulse.batch(|| {
            let group_ids: Vec<CellId> = groups.iter().map(|name| self.group(name).id()).collect();

            let mut collected = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let item = match &options.for_each_item {
                    Some(transform) => transform(item, i),
                    None => item,
                };
                let key = match PrimaryKey::of_item(&item, &field) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(collection = %self.name(), error = %err, "skipped item");
                        continue;
                    }
                };
                self.save_data(&pulse, key.clone(), item, &options);
                collected.push(key);
            }

            let add = AddOptions {
                method: options.method,
                ..AddOptions::default()
            };
            let ingest = IngestOptions {
                perform: true,
                background: options.background,
            };
            for id in group_ids {
                let keys = collected.clone();
                let staged =
                    pulse.stage_group(id, |group, staged| group.stage_add(staged, keys, &add));
                if let Some(index) = staged {
                    pulse.ingest_id(id, Some(index), ingest);
                }
            }
        });
        self
    }

    /// Create or update the entity cell for one item.
    fn save_data(&self, pulse: &Pulse, key: PrimaryKey, item: Value, options: &CollectOptions) {
        enum Slot {
            Existing(CellId, Value),
            Promoted(CellId),
            Created(CellId),
        }

        let slot = {
            let mut graph = pulse.inner.graph.lock();
            let Some(store) = graph.collection_mut(self.id) else {
                return;
            };
            if let Some(&id) = store.data.get(&key) {
                let current = graph.get(id).map(|cell| cell.value.clone());
                Slot::Existing(id, current.unwrap_or(Value::Null))
            } else if let Some(id) = store.provisional.shift_remove(&key) {
                store.data.insert(key.clone(), id);
                if let Some(Cell {
                    behavior: Behavior::Data { provisional, .. },
                    ..
                }) = graph.get_mut(id)
                {
                    *provisional = false;
                }
                debug!(key = %key, "promoted provisional entity");
                Slot::Promoted(id)
            } else {
                let id = graph.insert(Cell::new(
                    item.clone(),
                    Behavior::Data {
                        collection: self.id,
                        key: key.clone(),
                        provisional: false,
                    },
                ));
                if let Some(store) = graph.collection_mut(self.id) {
                    store.data.insert(key.clone(), id);
                }
                Slot::Created(id)
            }
        };

        let set = SetOptions {
            background: options.background,
        };
        let (id, value) = match slot {
            Slot::Existing(id, mut current) if options.patch && current.is_object() => {
                merge_values(&mut current, &item, options.deep);
                (id, current)
            }
            Slot::Existing(id, _) | Slot::Promoted(id) | Slot::Created(id) => (id, item),
        };
        if let Err(err) = pulse.write_cell(id, value, set) {
            warn!(key = %key, error = %err, "rejected entity write");
        }
    }

    /// The entity for `key`, or a provisional placeholder if it was never
    /// collected. `None` only once the instance is gone.
    pub fn get_data(&self, key: impl Into<PrimaryKey>) -> Option<Data> {
        let pulse = self.instance()?;
        let id = pulse.data_cell(self.id, &key.into(), true)?;
        Some(Data::from_id(&pulse, self.id, id))
    }

    /// The entity for `key` if it has been collected.
    pub fn find_by_id(&self, key: impl Into<PrimaryKey>) -> Option<Data> {
        let pulse = self.instance()?;
        let key = key.into();
        let id = self.with_store(|store| store.data.get(&key).copied())??;
        Some(Data::from_id(&pulse, self.id, id))
    }

    /// Current value of an entity, rendered through the compute function.
    pub fn get_value(&self, key: impl Into<PrimaryKey>) -> Option<Value> {
        self.find_by_id(key).map(|data| data.rendered())
    }

    pub fn has(&self, key: impl Into<PrimaryKey>) -> bool {
        let key = key.into();
        self.with_store(|store| store.data.contains_key(&key))
            .unwrap_or(false)
    }

    /// Number of collected entities. Placeholders are not counted.
    pub fn size(&self) -> usize {
        self.with_store(|store| store.data.len()).unwrap_or(0)
    }

    /// Keys of collected entities, in collection order.
    pub fn keys(&self) -> Vec<PrimaryKey> {
        self.with_store(|store| store.data.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Create a group, or return the existing one with that name.
    pub fn create_group(&self, name: &str, keys: impl IntoKeys) -> Group {
        let keys = keys.into_keys();
        let Some(pulse) = self.instance() else {
            return Group::detached();
        };

        let mut graph = pulse.inner.graph.lock();
        if let Some(&id) = graph.collection(self.id).and_then(|store| store.groups.get(name)) {
            return Group::from_id(&pulse, id);
        }

        let id = graph.insert(Cell::new(
            index_value(&keys),
            Behavior::Group(GroupIndex::new(self.id, name.to_string(), &keys)),
        ));
        if let Some(store) = graph.collection_mut(self.id) {
            store.groups.insert(name.to_string(), id);
        }
        debug!(group = name, "group created");
        Group::from_id(&pulse, id)
    }

    /// The group called `name`, created empty if it does not exist yet.
    pub fn group(&self, name: &str) -> Group {
        self.create_group(name, ())
    }

    /// The group called `name`. Unknown names log a warning.
    pub fn get_group(&self, name: &str) -> Option<Group> {
        let pulse = self.instance()?;
        match self.with_store(|store| store.groups.get(name).copied())? {
            Some(id) => Some(Group::from_id(&pulse, id)),
            None => {
                warn!(error = %PulseError::UnknownGroup(name.to_string()), "group lookup");
                None
            }
        }
    }

    pub fn group_names(&self) -> Vec<String> {
        self.with_store(|store| store.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Create a selector pointing at `key`, replacing any selection held by
    /// an existing selector with the same name.
    pub fn create_selector(&self, name: &str, key: impl Into<PrimaryKey>) -> Option<Selector> {
        let pulse = self.instance()?;
        let key = key.into();
        match self.get_selector(name) {
            Some(selector) => {
                selector.select(key);
                Some(selector)
            }
            None => Some(self.register_selector(&pulse, name, Some(key))),
        }
    }

    fn register_selector(&self, pulse: &Pulse, name: &str, key: Option<PrimaryKey>) -> Selector {
        let selector = Selector::create(pulse, self.id, key);
        if let Some(store) = pulse.inner.graph.lock().collection_mut(self.id) {
            store.selectors.insert(name.to_string(), selector.id());
        }
        selector
    }

    pub fn get_selector(&self, name: &str) -> Option<Selector> {
        let pulse = self.instance()?;
        let id = self.with_store(|store| store.selectors.get(name).copied())??;
        Some(Selector::from_id(&pulse, self.id, id))
    }

    pub fn selector_names(&self) -> Vec<String> {
        self.with_store(|store| store.selectors.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Merge `changes` into an entity with a deep merge.
    pub fn update(&self, key: impl Into<PrimaryKey>, changes: Value) -> Option<Data> {
        self.update_with(key, changes, UpdateOptions::default())
    }

    /// Merge `changes` into an entity. If the merge changes the primary key
    /// field, the entity is re-keyed: groups swap the key in place and
    /// selectors follow it.
    pub fn update_with(
        &self,
        key: impl Into<PrimaryKey>,
        changes: Value,
        options: UpdateOptions,
    ) -> Option<Data> {
        let pulse = self.instance()?;
        let key = key.into();
        let (id, mut next, field) = {
            let graph = pulse.inner.graph.lock();
            let store = graph.collection(self.id)?;
            let Some(&id) = store.data.get(&key) else {
                warn!(
                    collection = %store.name,
                    key = %key,
                    "update of a key that was never collected"
                );
                return None;
            };
            let current = graph.get(id)?.value.clone();
            (id, current, store.config.primary_key.clone())
        };

        if !next.is_object() || !changes.is_object() {
            warn!(key = %key, "entity updates need object values");
            return None;
        }
        merge_values(&mut next, &changes, options.deep);
        let new_key = match PrimaryKey::of_item(&next, &field) {
            Ok(new_key) => new_key,
            Err(err) => {
                warn!(key = %key, error = %err, "rejected entity update");
                return None;
            }
        };

        let written = pulse.batch(|| {
            let id = if new_key != key {
                self.rekey(&pulse, id, &key, &new_key)?
            } else {
                id
            };
            match pulse.write_cell(id, next, SetOptions { background: options.background }) {
                Ok(()) => Some(id),
                Err(err) => {
                    warn!(key = %new_key, error = %err, "rejected entity update");
                    None
                }
            }
        });

        written.map(|id| Data::from_id(&pulse, self.id, id))
    }

    /// Move the entity `id` from `old` to `new`. Returns the cell that now
    /// holds the entity.
    ///
    /// A provisional placeholder waiting on `new` is promoted in place: the
    /// entity cell is merged into it, so handles to either keep working.
    fn rekey(
        &self,
        pulse: &Pulse,
        id: CellId,
        old: &PrimaryKey,
        new: &PrimaryKey,
    ) -> Option<CellId> {
        let (survivor, groups, selectors) = {
            let mut graph = pulse.inner.graph.lock();
            let store = graph.collection_mut(self.id)?;
            if store.data.contains_key(new) {
                warn!(from = %old, to = %new, "re-key target already exists");
                return None;
            }
            store.data.shift_remove(old);
            let placeholder = store.provisional.shift_remove(new);
            let survivor = placeholder.unwrap_or(id);
            store.data.insert(new.clone(), survivor);
            let group_ids: Vec<CellId> = store.groups.values().copied().collect();
            let selector_ids: Vec<CellId> = store.selectors.values().copied().collect();

            if survivor != id {
                let entity = graph.get(id).map(|cell| {
                    (
                        cell.value.clone(),
                        cell.initial.clone(),
                        cell.is_set,
                        cell.type_lock,
                    )
                });
                if let (Some((value, initial, is_set, type_lock)), Some(cell)) =
                    (entity, graph.get_mut(survivor))
                {
                    cell.value = value.clone();
                    cell.next = value;
                    cell.initial = initial;
                    cell.is_set = is_set;
                    cell.type_lock = cell.type_lock.or(type_lock);
                }
                graph.merge(id, survivor);
                debug!(key = %new, "provisional entity promoted by re-key");
            }
            if let Some(Cell {
                behavior: Behavior::Data {
                    key, provisional, ..
                },
                ..
            }) = graph.get_mut(survivor)
            {
                *key = new.clone();
                *provisional = false;
            }

            let mut selectors: SmallVec<[CellId; 4]> = SmallVec::new();
            for sid in selector_ids {
                if let Some(Cell {
                    behavior: Behavior::Selector { selected, .. },
                    ..
                }) = graph.get_mut(sid)
                {
                    if selected.as_ref() == Some(old) {
                        *selected = Some(new.clone());
                        selectors.push(sid);
                    } else if selected.as_ref() == Some(new) {
                        selectors.push(sid);
                    }
                }
            }
            (survivor, group_ids, selectors)
        };

        debug!(from = %old, to = %new, "entity re-keyed");
        for gid in groups {
            let staged =
                pulse.stage_group(gid, |group, staged| group.stage_rekey(staged, old, new));
            if let Some(index) = staged {
                pulse.ingest_id(gid, Some(index), IngestOptions::default());
            }
        }
        for sid in selectors {
            pulse.ingest_id(sid, None, IngestOptions::default());
        }
        Some(survivor)
    }

    /// Add existing keys to groups, creating the groups if needed.
    pub fn put(&self, keys: impl IntoKeys, groups: impl IntoNames, method: AddMethod) -> &Self {
        let keys = keys.into_keys();
        let options = AddOptions {
            method,
            ..AddOptions::default()
        };
        if let Some(pulse) = self.instance() {
            pulse.batch(|| {
                for name in groups.into_names() {
                    self.group(&name).add_with(keys.clone(), options);
                }
            });
        }
        self
    }

    /// Move keys from one group to another.
    pub fn move_keys(&self, keys: impl IntoKeys, from: &str, to: &str) -> &Self {
        let keys = keys.into_keys();
        if let Some(pulse) = self.instance() {
            pulse.batch(|| {
                if let Some(from) = self.get_group(from) {
                    from.remove(keys.clone());
                }
                self.group(to).add(keys);
            });
        }
        self
    }

    /// Start a removal; finish it with [`Removal::from_groups`] or
    /// [`Removal::everywhere`].
    pub fn remove(&self, keys: impl IntoKeys) -> Removal {
        Removal {
            collection: self.clone(),
            keys: keys.into_keys(),
        }
    }

    fn remove_everywhere(&self, keys: &[PrimaryKey]) {
        let Some(pulse) = self.instance() else {
            return;
        };
        pulse.batch(|| {
            for name in self.group_names() {
                if let Some(group) = self.get_group(&name) {
                    group.remove(keys.to_vec());
                }
            }

            let affected = {
                let mut graph = pulse.inner.graph.lock();
                let Some(store) = graph.collection_mut(self.id) else {
                    return;
                };
                let removed: Vec<CellId> = keys
                    .iter()
                    .filter_map(|key| store.data.shift_remove(key))
                    .collect();

                let mut affected: Vec<CellId> = Vec::new();
                for id in removed {
                    if let Some(cell) = graph.remove(id) {
                        affected.extend(cell.dep.dependents());
                    }
                }
                affected
            };

            debug!(collection = %self.name(), keys = keys.len(), "entities removed");
            for id in affected {
                pulse.ingest_id(id, None, IngestOptions::default());
            }
        });
    }

    /// Remove every entity and placeholder. Configured groups are emptied,
    /// groups created later are destroyed, selectors re-resolve.
    pub fn reset(&self) -> &Self {
        let Some(pulse) = self.instance() else {
            return self;
        };
        pulse.batch(|| {
            let (kept, selectors, affected) = {
                let mut graph = pulse.inner.graph.lock();
                let Some(store) = graph.collection_mut(self.id) else {
                    return;
                };
                let fixed = store.config.fixed_groups();
                let entities: Vec<CellId> = store
                    .data
                    .drain(..)
                    .chain(store.provisional.drain(..))
                    .map(|(_, id)| id)
                    .collect();
                let (kept, dropped): (Vec<_>, Vec<_>) = store
                    .groups
                    .drain(..)
                    .partition(|(name, _)| fixed.contains(name));
                store.groups.extend(kept.iter().cloned());
                let selectors: Vec<CellId> = store.selectors.values().copied().collect();

                let mut affected = Vec::new();
                for id in entities.into_iter().chain(dropped.into_iter().map(|(_, id)| id)) {
                    if let Some(cell) = graph.remove(id) {
                        affected.extend(cell.dep.dependents());
                    }
                }
                (kept, selectors, affected)
            };

            for (_, id) in kept {
                Group::from_id(&pulse, id).set_index(Vec::<PrimaryKey>::new());
            }
            for id in selectors.into_iter().chain(affected) {
                pulse.ingest_id(id, None, IngestOptions::default());
            }
            debug!(collection = %self.name(), "collection reset");
        });
        self
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

/// A pending removal of keys from a collection.
#[must_use = "a removal does nothing until `from_groups` or `everywhere` is called"]
pub struct Removal {
    collection: Collection,
    keys: Vec<PrimaryKey>,
}

impl Removal {
    /// Remove the keys from the named groups only; entities stay.
    pub fn from_groups(self, groups: impl IntoNames) {
        let Some(pulse) = self.collection.instance() else {
            return;
        };
        pulse.batch(|| {
            for name in groups.into_names() {
                if let Some(group) = self.collection.get_group(&name) {
                    group.remove(self.keys.clone());
                }
            }
        });
    }

    /// Delete the entities and remove their keys from every group.
    pub fn everywhere(self) {
        self.collection.remove_everywhere(&self.keys);
    }
}

impl Pulse {
    /// Cell of the entity for `key`, creating a provisional placeholder if
    /// asked to.
    pub(crate) fn data_cell(
        &self,
        collection: CollectionId,
        key: &PrimaryKey,
        create: bool,
    ) -> Option<CellId> {
        let mut graph = self.inner.graph.lock();
        let store = graph.collection(collection)?;
        if let Some(id) = store.lookup(key) {
            return Some(id);
        }
        if !create {
            return None;
        }

        let id = graph.insert(Cell::new(
            Value::Null,
            Behavior::Data {
                collection,
                key: key.clone(),
                provisional: true,
            },
        ));
        graph
            .collection_mut(collection)?
            .provisional
            .insert(key.clone(), id);
        debug!(key = %key, "provisional entity created");
        Some(id)
    }

    /// Pass an entity through its collection's render function.
    pub(crate) fn render_entity(&self, collection: CollectionId, value: Value) -> Value {
        let compute = self
            .inner
            .graph
            .lock()
            .collection(collection)
            .and_then(|store| store.compute.clone());
        match compute {
            Some(compute) => compute(&value),
            None => value,
        }
    }

    /// Values of the collected entities among `keys`, plus the render
    /// function, read under one lock.
    pub(crate) fn entity_values(
        &self,
        collection: CollectionId,
        keys: Vec<&PrimaryKey>,
    ) -> (HashMap<PrimaryKey, Value>, Option<RenderFn>) {
        let graph = self.inner.graph.lock();
        let Some(store) = graph.collection(collection) else {
            return (HashMap::new(), None);
        };
        let values = keys
            .into_iter()
            .filter_map(|key| {
                let id = store.data.get(key)?;
                graph.get(*id).map(|cell| (key.clone(), cell.value.clone()))
            })
            .collect();
        (values, store.compute.clone())
    }

    /// Queue a one-slot refresh on every group listing `key`.
    fn touch_groups(&self, collection: CollectionId, key: &PrimaryKey) -> SmallVec<[CellId; 4]> {
        let mut graph = self.inner.graph.lock();
        let Some(store) = graph.collection(collection) else {
            return SmallVec::new();
        };
        let groups: SmallVec<[CellId; 4]> = store.groups.values().copied().collect();

        let mut touched = SmallVec::new();
        for id in groups {
            if let Some(index) = graph.get_mut(id).and_then(Cell::group_mut) {
                if index.members.contains(key) {
                    index.touch(key);
                    touched.push(id);
                }
            }
        }
        touched
    }

    /// Called after an entity write: refresh its slot in every group.
    pub(crate) fn rebuild_groups_including(
        &self,
        collection: CollectionId,
        key: &PrimaryKey,
        background: bool,
    ) {
        for id in self.touch_groups(collection, key) {
            self.ingest_id(
                id,
                None,
                IngestOptions {
                    perform: false,
                    background,
                },
            );
        }
    }

    /// Called after a background entity write: the groups rebuild lazily on
    /// their next read.
    pub(crate) fn mark_groups_outdated(&self, collection: CollectionId, key: &PrimaryKey) {
        self.touch_groups(collection, key);
    }
}
