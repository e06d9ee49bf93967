//! State Implementation
//!
//! A State is the fundamental reactive cell. It holds a JSON value and the
//! [`Dep`](crate::graph::Dep) that records who depends on it.
//!
//! # How States Work
//!
//! 1. Reading `value()` inside an open tracking window registers the state
//!    as a source of the running computation.
//!
//! 2. `set()` stages the value and hands a job to the runtime, which writes
//!    it, runs watchers and re-ingests every dependent.
//!
//! 3. Subscribers are told once the whole affected subgraph has settled.
//!
//! A state whose type is locked rejects writes of another type: the write
//! is logged and dropped, the value stays as it was.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{PulseError, Result};
use crate::graph::{Behavior, Cell, CellId, CellKind};
use crate::instance::{Inner, Pulse};
use crate::reactive::IngestOptions;

/// Runtime type tag of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        f.write_str(name)
    }
}

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Write immediately, skipping the scheduler: no watchers, no dependent
    /// cascade, no subscriber notification.
    pub background: bool,
}

impl SetOptions {
    pub fn background() -> Self {
        Self { background: true }
    }
}

/// Read access shared by every kind of cell handle.
pub trait Reactive {
    /// The cell this handle points at.
    fn cell_id(&self) -> CellId;

    /// The owning instance, if it is still alive.
    fn instance(&self) -> Option<Pulse>;

    /// Current value. Registers a dependency when read inside a tracked
    /// computation.
    fn value(&self) -> Value {
        self.instance()
            .map(|pulse| pulse.read_cell(self.cell_id(), true))
            .unwrap_or(Value::Null)
    }

    /// Current value without dependency tracking.
    fn peek(&self) -> Value {
        self.instance()
            .map(|pulse| pulse.read_cell(self.cell_id(), false))
            .unwrap_or(Value::Null)
    }

    /// Tracked read deserialized into `T`.
    fn get<T: DeserializeOwned>(&self) -> Option<T>
    where
        Self: Sized,
    {
        serde_json::from_value(self.value()).ok()
    }

    /// Value before the last write.
    fn previous_value(&self) -> Value {
        inspect(self.instance(), self.cell_id(), |cell| cell.previous.clone())
            .unwrap_or(Value::Null)
    }

    /// Whether the cell has been written since creation.
    fn is_set(&self) -> bool {
        inspect(self.instance(), self.cell_id(), |cell| cell.is_set).unwrap_or(false)
    }

    fn name(&self) -> Option<String> {
        inspect(self.instance(), self.cell_id(), |cell| cell.name.clone()).flatten()
    }

    fn kind(&self) -> Option<CellKind> {
        inspect(self.instance(), self.cell_id(), |cell| cell.kind())
    }

    /// Cells re-ingested when this one changes.
    fn dependents(&self) -> Vec<CellId> {
        inspect(self.instance(), self.cell_id(), |cell| cell.dep.dependents().collect())
            .unwrap_or_default()
    }

    fn subscriber_count(&self) -> usize {
        inspect(self.instance(), self.cell_id(), |cell| cell.dep.subscriber_count())
            .unwrap_or(0)
    }

    /// Register a callback run with the new value after every write.
    /// A second watcher under the same key replaces the first.
    fn watch<F>(&self, key: impl Into<String>, callback: F) -> &Self
    where
        Self: Sized,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = key.into();
        if let Some(pulse) = self.instance() {
            let mut graph = pulse.inner.graph.lock();
            if let Some(cell) = graph.get_mut(self.cell_id()) {
                cell.watchers.insert(key, Arc::new(callback));
            }
        }
        self
    }

    fn remove_watcher(&self, key: &str) -> bool {
        self.instance()
            .and_then(|pulse| {
                let mut graph = pulse.inner.graph.lock();
                graph
                    .get_mut(self.cell_id())
                    .map(|cell| cell.watchers.shift_remove(key).is_some())
            })
            .unwrap_or(false)
    }
}

/// Run `f` against the cell behind `id`, if the instance and cell still exist.
pub(crate) fn inspect<R>(
    pulse: Option<Pulse>,
    id: CellId,
    f: impl FnOnce(&Cell) -> R,
) -> Option<R> {
    let pulse = pulse?;
    let graph = pulse.inner.graph.lock();
    graph.get(id).map(f)
}

/// A writable reactive value.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(&pulse, 0);
/// count.set(5);
/// assert_eq!(count.value(), json!(5));
/// ```
#[derive(Clone)]
pub struct State {
    pub(crate) id: CellId,
    pub(crate) pulse: Weak<Inner>,
}

impl State {
    /// Create a new state with the given initial value.
    pub fn new(pulse: &Pulse, initial: impl Into<Value>) -> Self {
        let id = pulse
            .inner
            .graph
            .lock()
            .insert(Cell::new(initial.into(), Behavior::State));
        Self::from_id(pulse, id)
    }

    pub(crate) fn from_id(pulse: &Pulse, id: CellId) -> Self {
        Self {
            id,
            pulse: pulse.downgrade(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// Write a new value through the scheduler.
    ///
    /// A write that violates the type lock is logged and ignored.
    pub fn set(&self, value: impl Into<Value>) -> &Self {
        self.set_with(value, SetOptions::default())
    }

    pub fn set_with(&self, value: impl Into<Value>, options: SetOptions) -> &Self {
        if let Err(err) = self.try_set_with(value, options) {
            warn!(cell = %self.id, error = %err, "rejected write");
        }
        self
    }

    /// Like [`set`](Self::set) but reports why a write was rejected.
    pub fn try_set(&self, value: impl Into<Value>) -> Result<()> {
        self.try_set_with(value, SetOptions::default())
    }

    pub fn try_set_with(&self, value: impl Into<Value>, options: SetOptions) -> Result<()> {
        let pulse = self.instance().ok_or(PulseError::InstanceDropped)?;
        pulse.write_cell(self.id, value.into(), options)
    }

    /// Write the result of `f` applied to the current value.
    pub fn update<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Value) -> Value,
    {
        let next = f(&self.peek());
        self.set(next)
    }

    /// Stage a value without committing it.
    pub fn stage(&self, value: impl Into<Value>) -> &Self {
        if let Some(pulse) = self.instance() {
            let mut graph = pulse.inner.graph.lock();
            if let Some(cell) = graph.get_mut(self.id) {
                cell.next = value.into();
            }
        }
        self
    }

    /// The staged value that [`commit`](Self::commit) would write.
    pub fn next_value(&self) -> Value {
        inspect(self.instance(), self.cell_id(), |cell| cell.next.clone())
            .unwrap_or(Value::Null)
    }

    /// Commit the staged value through the scheduler.
    pub fn commit(&self) -> &Self {
        let staged = self.next_value();
        self.set(staged)
    }

    /// Merge `changes` into an object value.
    pub fn patch(&self, changes: Value, deep: bool) -> &Self {
        let mut current = self.peek();
        if !current.is_object() {
            warn!(
                cell = %self.id,
                error = %PulseError::NotAnObject(ValueType::of(&current)),
                "rejected patch"
            );
            return self;
        }
        merge_values(&mut current, &changes, deep);
        self.set(current)
    }

    /// Flip a boolean value.
    pub fn toggle(&self) -> &Self {
        match self.peek() {
            Value::Bool(flag) => self.set(!flag),
            other => {
                warn!(
                    cell = %self.id,
                    found = %ValueType::of(&other),
                    "toggle on non-boolean state"
                );
                self
            }
        }
    }

    /// Restore the value from before the last write.
    pub fn undo(&self) -> &Self {
        let previous = self.previous_value();
        self.set(previous)
    }

    /// Restore the initial value.
    pub fn reset(&self) -> &Self {
        let initial = inspect(self.instance(), self.id, |cell| cell.initial.clone())
            .unwrap_or(Value::Null);
        self.set(initial)
    }

    /// Lock the runtime type of this state.
    pub fn lock_type(&self, value_type: ValueType) -> &Self {
        if let Some(pulse) = self.instance() {
            let mut graph = pulse.inner.graph.lock();
            if let Some(cell) = graph.get_mut(self.id) {
                cell.type_lock = Some(value_type);
            }
        }
        self
    }

    /// Name this state. Named states are included in server state.
    pub fn key(&self, name: impl Into<String>) -> &Self {
        if let Some(pulse) = self.instance() {
            pulse.name_cell(self.id, name.into());
        }
        self
    }

    /// Whether the value is anything but null.
    pub fn exists(&self) -> bool {
        !self.peek().is_null()
    }

    /// Persist this state under `name` using the configured synchronous
    /// storage. A stored value replaces the current one; otherwise the
    /// current value is written out.
    pub fn persist(&self, name: impl Into<String>) -> &Self {
        if let Some(pulse) = self.instance() {
            let name = name.into();
            pulse.name_cell(self.id, name.clone());
            pulse.persist_cell(self.id, &name);
        }
        self
    }

    /// Asynchronous counterpart of [`persist`](Self::persist).
    pub async fn persist_async(&self, name: impl Into<String>) -> Result<()> {
        let pulse = self.instance().ok_or(PulseError::InstanceDropped)?;
        let name = name.into();
        pulse.name_cell(self.id, name.clone());
        pulse.persist_cell_async(self.id, &name).await
    }
}

impl Reactive for State {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn instance(&self) -> Option<Pulse> {
        Pulse::from_weak(&self.pulse)
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("value", &self.peek())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl Pulse {
    /// Read a cell, recording the read in the innermost tracking frame.
    pub(crate) fn read_cell(&self, id: CellId, track: bool) -> Value {
        if track {
            self.inner.tracking.track(id);
        }
        self.inner
            .graph
            .lock()
            .get(id)
            .map(|cell| cell.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Validate and write a value into a cell.
    pub(crate) fn write_cell(&self, id: CellId, value: Value, options: SetOptions) -> Result<()> {
        let data_slot = {
            let mut graph = self.inner.graph.lock();
            let cell = graph.get_mut(id).ok_or(PulseError::DetachedCell(id))?;

            if let Some(expected) = cell.type_lock {
                let found = ValueType::of(&value);
                if found != expected {
                    return Err(PulseError::TypeMismatch { expected, found });
                }
            }

            if options.background {
                cell.write(value.clone());
                match &cell.behavior {
                    Behavior::Data { collection, key, .. } => Some((*collection, key.clone())),
                    _ => None,
                }
            } else {
                cell.next = value.clone();
                None
            }
        };

        if options.background {
            if let Some((collection, key)) = data_slot {
                self.mark_groups_outdated(collection, &key);
            }
            debug!(cell = %id, "background write");
            return Ok(());
        }

        self.ingest_id(id, Some(value), IngestOptions::default());
        Ok(())
    }

    pub(crate) fn name_cell(&self, id: CellId, name: String) {
        let mut graph = self.inner.graph.lock();
        if let Some(cell) = graph.get_mut(id) {
            cell.name = Some(name.clone());
        } else {
            return;
        }
        if let Some(previous) = graph.named.insert(name.clone(), id) {
            if previous != id {
                warn!(name = %name, "state name reassigned to a different cell");
            }
        }
    }
}

/// Merge `changes` into `target`. With `deep`, nested objects are merged
/// recursively; otherwise top-level keys are replaced.
pub(crate) fn merge_values(target: &mut Value, changes: &Value, deep: bool) {
    match (target, changes) {
        (Value::Object(target), Value::Object(changes)) => merge_maps(target, changes, deep),
        (target, changes) => *target = changes.clone(),
    }
}

fn merge_maps(target: &mut Map<String, Value>, changes: &Map<String, Value>, deep: bool) {
    for (key, change) in changes {
        match target.get_mut(key) {
            Some(existing) if deep && existing.is_object() && change.is_object() => {
                merge_values(existing, change, true)
            }
            _ => {
                target.insert(key.clone(), change.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotifyMode, PulseConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn pulse() -> Pulse {
        Pulse::with_config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
    }

    #[test]
    fn state_get_and_set() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        assert_eq!(state.value(), json!(0));

        state.set(42);
        assert_eq!(state.value(), json!(42));
        assert_eq!(state.previous_value(), json!(0));
        assert!(state.is_set());
    }

    #[test]
    fn type_lock_rejects_mismatch() {
        let pulse = pulse();
        let flag = State::new(&pulse, false);
        flag.lock_type(ValueType::Bool);

        flag.set(123);
        assert_eq!(flag.value(), json!(false));
        assert!(matches!(
            flag.try_set("no"),
            Err(PulseError::TypeMismatch { expected: ValueType::Bool, found: ValueType::String })
        ));

        flag.set(true);
        assert_eq!(flag.value(), json!(true));
        assert_eq!(flag.previous_value(), json!(false));
    }

    #[test]
    fn update_stage_and_commit() {
        let pulse = pulse();
        let state = State::new(&pulse, 10);
        state.update(|v| json!(v.as_i64().unwrap_or(0) + 5));
        assert_eq!(state.value(), json!(15));

        state.stage(json!([1, 2]));
        assert_eq!(state.value(), json!(15));
        assert_eq!(state.next_value(), json!([1, 2]));

        state.commit();
        assert_eq!(state.value(), json!([1, 2]));
    }

    #[test]
    fn undo_reset_and_toggle() {
        let pulse = pulse();
        let state = State::new(&pulse, true);
        state.toggle();
        assert_eq!(state.value(), json!(false));
        state.undo();
        assert_eq!(state.value(), json!(true));

        state.set(false).set(false);
        state.reset();
        assert_eq!(state.value(), json!(true));
    }

    #[test]
    fn patch_merges_objects() {
        let pulse = pulse();
        let state = State::new(&pulse, json!({"a": 1, "nested": {"x": 1, "y": 2}}));

        state.patch(json!({"nested": {"y": 3}}), true);
        assert_eq!(state.value(), json!({"a": 1, "nested": {"x": 1, "y": 3}}));

        state.patch(json!({"nested": {"z": 0}}), false);
        assert_eq!(state.value(), json!({"a": 1, "nested": {"z": 0}}));

        let number = State::new(&pulse, 1);
        number.patch(json!({"a": 1}), false);
        assert_eq!(number.value(), json!(1));
    }

    #[test]
    fn watchers_run_on_write() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();

        state.watch("log", move |value| {
            seen_clone.store(value.as_i64().unwrap_or(-1) as i32, Ordering::SeqCst);
        });

        state.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        assert!(state.remove_watcher("log"));
        state.set(8);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn background_write_skips_watchers() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        state.watch("count", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        state.set_with(3, SetOptions::background());
        assert_eq!(state.value(), json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn typed_get() {
        let pulse = pulse();
        let state = State::new(&pulse, json!({"name": "ada", "age": 36}));

        #[derive(Deserialize, PartialEq, Debug)]
        struct Person {
            name: String,
            age: u32,
        }

        let person: Person = state.get().unwrap();
        assert_eq!(
            person,
            Person {
                name: "ada".into(),
                age: 36
            }
        );
    }

    #[test]
    fn handle_outlives_instance() {
        let pulse = pulse();
        let state = State::new(&pulse, 1);
        drop(pulse);

        assert_eq!(state.value(), Value::Null);
        assert!(matches!(state.try_set(2), Err(PulseError::InstanceDropped)));
    }
}
