//! Reactive Runtime
//!
//! The runtime is the scheduler that connects writes to the cells that
//! depend on them and, eventually, to the external subscribers.
//!
//! # How It Works
//!
//! 1. A write hands a [`Job`] to [`Pulse::ingest`]. The job is queued and,
//!    unless `perform` is false, the queue is drained right away.
//!
//! 2. Performing a job writes the value into its cell, then runs the cell's
//!    side effects:
//!    a. Groups rebuild their output
//!    b. Collection entities refresh every group that lists them
//!    c. Watchers run with the new value
//!    d. Persisted cells are written to storage
//!
//! 3. Every dependent of the written cell is queued with `perform == false`,
//!    so the whole affected subgraph settles breadth-first inside one drain
//!    cycle.
//!
//! 4. When the outermost drain finishes, the cells written in this cycle are
//!    handed to the notify pass, either right away or on the host's next
//!    turn depending on [`NotifyMode`].
//!
//! # Locking
//!
//! The scheduler state and the arena sit behind separate mutexes. Neither is
//! ever held while a compute function, watcher or subscriber runs, which is
//! what lets side effects call back into the instance.

use std::collections::VecDeque;

use indexmap::IndexSet;
use serde_json::Value;
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Reactive;
use crate::collection::CollectionId;
use crate::collection::PrimaryKey;
use crate::config::NotifyMode;
use crate::graph::{Behavior, CellId, Watcher};
use crate::instance::Pulse;

/// A queued mutation awaiting the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// The cell to write.
    pub cell: CellId,

    /// The value to commit. `None` means "resolve at perform time": derived
    /// cells recompute, everything else takes its staged value.
    pub value: Option<Value>,

    /// Skip subscriber notification for this job and its cascade.
    pub background: bool,
}

/// How [`Pulse::ingest`] treats a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Drain the queue immediately.
    pub perform: bool,
    pub background: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            perform: true,
            background: false,
        }
    }
}

impl IngestOptions {
    /// Queue without draining.
    pub fn deferred() -> Self {
        Self {
            perform: false,
            ..Self::default()
        }
    }

    pub fn background() -> Self {
        Self {
            background: true,
            ..Self::default()
        }
    }
}

/// Scheduler state of one instance.
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    queue: VecDeque<Job>,
    current: Option<Job>,
    /// Cells written by non-background jobs since the last notify pass.
    to_render: IndexSet<CellId>,
    draining: usize,
    batch_depth: usize,
    background_depth: usize,
    /// A deferred notify was signalled and not yet flushed.
    signalled: bool,
}

/// Side effect chosen for a performed job.
enum SideEffect {
    None,
    Group,
    Data(CollectionId, PrimaryKey),
}

struct DrainGuard<'a>(&'a Pulse);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.runtime.lock().draining -= 1;
    }
}

struct BatchGuard<'a>(&'a Pulse);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.runtime.lock().batch_depth -= 1;
    }
}

struct BackgroundGuard<'a>(&'a Pulse);

impl Drop for BackgroundGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.runtime.lock().background_depth -= 1;
    }
}

impl Pulse {
    /// Queue a job for `cell` and, with `options.perform`, drain the queue.
    pub fn ingest(&self, cell: &dyn Reactive, value: Option<Value>, options: IngestOptions) {
        self.ingest_id(cell.cell_id(), value, options);
    }

    pub(crate) fn ingest_id(&self, id: CellId, value: Option<Value>, options: IngestOptions) {
        {
            let mut runtime = self.inner.runtime.lock();
            let background = options.background || runtime.background_depth > 0;
            let duplicate = value.is_none()
                && runtime
                    .queue
                    .iter()
                    .any(|job| {
                        job.cell == id && job.value.is_none() && job.background == background
                    });

            if !duplicate {
                runtime.queue.push_back(Job {
                    cell: id,
                    value,
                    background,
                });
            }
        }

        if options.perform {
            self.drain();
        }
    }

    /// Perform queued jobs in FIFO order until the queue is empty.
    ///
    /// A drain started from inside a side effect empties the same queue; only
    /// the outermost drain hands off to the notify pass.
    fn drain(&self) {
        let outermost = {
            let mut runtime = self.inner.runtime.lock();
            runtime.draining += 1;
            runtime.draining == 1
        };

        {
            let _guard = DrainGuard(self);
            loop {
                let job = self.inner.runtime.lock().queue.pop_front();
                match job {
                    Some(job) => self.perform(job),
                    None => break,
                }
            }
        }

        if outermost {
            self.schedule_updates();
        }
    }

    fn perform(&self, job: Job) {
        let Job {
            cell: id,
            value,
            background,
        } = job;

        let value = match value {
            Some(value) => value,
            None => match self.resolve_job_value(id) {
                Some(value) => value,
                None => return,
            },
        };

        if self.inner.config.trace_jobs {
            trace!(cell = %id, background, "perform job");
        }

        self.inner.runtime.lock().current = Some(Job {
            cell: id,
            value: Some(value.clone()),
            background,
        });

        let written = {
            let mut graph = self.inner.graph.lock();
            graph.get_mut(id).map(|cell| {
                cell.write(value.clone());
                let watchers: SmallVec<[Watcher; 4]> = cell.watchers.values().cloned().collect();
                let dependents: SmallVec<[CellId; 8]> = cell.dep.dependents().collect();
                let effect = match &cell.behavior {
                    Behavior::Group(_) => SideEffect::Group,
                    Behavior::Data {
                        collection,
                        key,
                        provisional: false,
                    } => SideEffect::Data(*collection, key.clone()),
                    _ => SideEffect::None,
                };
                (watchers, dependents, effect, cell.persist_key.clone())
            })
        };

        let Some((watchers, dependents, effect, persist_key)) = written else {
            debug!(cell = %id, "dropped job for removed cell");
            self.inner.runtime.lock().current = None;
            return;
        };

        match effect {
            SideEffect::Group => self.build_group(id),
            SideEffect::Data(collection, key) => {
                self.rebuild_groups_including(collection, &key, background)
            }
            SideEffect::None => {}
        }

        for watcher in &watchers {
            watcher(&value);
        }

        if let Some(key) = persist_key {
            self.store_value(&key, &value);
        }

        {
            let mut runtime = self.inner.runtime.lock();
            if !background {
                runtime.to_render.insert(id);
            }
            runtime.current = None;
        }

        for dependent in dependents {
            self.ingest_id(
                dependent,
                None,
                IngestOptions {
                    perform: false,
                    background,
                },
            );
        }
    }

    /// Value for a job queued without one.
    fn resolve_job_value(&self, id: CellId) -> Option<Value> {
        let derived = {
            let graph = self.inner.graph.lock();
            let cell = graph.get(id)?;
            match cell.behavior {
                Behavior::Computed { .. } | Behavior::Selector { .. } => true,
                _ => return Some(cell.next.clone()),
            }
        };
        if derived {
            self.compute_derived(id)
        } else {
            None
        }
    }

    /// Hand the finished drain cycle to the notify pass.
    fn schedule_updates(&self) {
        let signal = {
            let mut runtime = self.inner.runtime.lock();
            if runtime.batch_depth > 0 || runtime.draining > 0 || runtime.to_render.is_empty() {
                return;
            }
            match self.inner.config.notify {
                NotifyMode::Immediate => false,
                NotifyMode::Deferred => {
                    let first = !runtime.signalled;
                    runtime.signalled = true;
                    first
                }
            }
        };

        match self.inner.config.notify {
            NotifyMode::Immediate => {
                self.flush_updates();
            }
            NotifyMode::Deferred if signal => self.inner.update_signal.notify_one(),
            NotifyMode::Deferred => {}
        }
    }

    /// Run the notify pass for every cell written since the last one.
    ///
    /// Returns the number of subscriptions that were notified.
    pub fn flush_updates(&self) -> usize {
        let rendered: Vec<CellId> = {
            let mut runtime = self.inner.runtime.lock();
            runtime.signalled = false;
            runtime.to_render.drain(..).collect()
        };
        if rendered.is_empty() {
            return 0;
        }
        self.notify_subscribers(&rendered)
    }

    /// Group every mutation made by `f` into a single notify pass.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.runtime.lock().batch_depth += 1;
        let result = {
            let _guard = BatchGuard(self);
            f()
        };

        if self.inner.runtime.lock().batch_depth == 0 {
            self.schedule_updates();
        }
        result
    }

    /// Run `f` with every job it ingests marked as background.
    pub fn in_background<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.runtime.lock().background_depth += 1;
        let _guard = BackgroundGuard(self);
        f()
    }

    /// Whether written cells are waiting for the notify pass.
    pub fn has_pending_updates(&self) -> bool {
        !self.inner.runtime.lock().to_render.is_empty()
    }

    /// The job currently being performed, if any.
    pub fn current_job(&self) -> Option<Job> {
        self.inner.runtime.lock().current.clone()
    }

    /// Number of jobs waiting in the queue.
    pub fn queued_jobs(&self) -> usize {
        self.inner.runtime.lock().queue.len()
    }

    /// Spawn a task that runs the notify pass whenever a deferred drain
    /// completes. The task exits once the instance is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_update_loop(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let signal = self.inner.update_signal.clone();

        tokio::spawn(async move {
            loop {
                signal.notified().await;
                let Some(pulse) = Pulse::from_weak(&weak) else {
                    break;
                };
                pulse.flush_updates();
            }
            debug!("update loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PulseConfig;
    use crate::reactive::{Computed, State};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn immediate() -> Pulse {
        Pulse::with_config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
    }

    #[test]
    fn jobs_run_in_fifo_order() {
        let pulse = immediate();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = State::new(&pulse, 0);
        let b = State::new(&pulse, 0);

        for (name, state) in [("a", &a), ("b", &b)] {
            let order = order.clone();
            state.watch("order", move |_| order.lock().unwrap().push(name));
        }

        pulse.ingest(&a, Some(json!(1)), IngestOptions::deferred());
        pulse.ingest(&b, Some(json!(2)), IngestOptions::deferred());
        assert_eq!(pulse.queued_jobs(), 2);
        assert_eq!(a.value(), json!(0));

        pulse.ingest(&a, Some(json!(3)), IngestOptions::default());
        assert_eq!(pulse.queued_jobs(), 0);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "a"]);
        assert_eq!(a.value(), json!(3));
        assert_eq!(b.value(), json!(2));
    }

    #[test]
    fn value_less_job_takes_staged_value() {
        let pulse = immediate();
        let state = State::new(&pulse, 1);
        state.stage(9);
        pulse.ingest(&state, None, IngestOptions::default());
        assert_eq!(state.value(), json!(9));
    }

    #[test]
    fn current_job_is_visible_to_watchers() {
        let pulse = immediate();
        let state = State::new(&pulse, 0);
        let seen = Arc::new(Mutex::new(None));

        state.watch("job", {
            let (seen, weak) = (seen.clone(), pulse.downgrade());
            move |_| {
                let job = Pulse::from_weak(&weak).and_then(|pulse| pulse.current_job());
                *seen.lock().unwrap() = job;
            }
        });

        state.set(5);
        let job = seen.lock().unwrap().clone().unwrap();
        assert_eq!(job.cell, state.id());
        assert_eq!(job.value, Some(json!(5)));
        assert!(pulse.current_job().is_none());
    }

    #[test]
    fn side_effect_writes_settle_in_the_same_cycle() {
        let pulse = immediate();
        let source = State::new(&pulse, 0);
        let mirror = State::new(&pulse, 0);
        let doubled = Computed::new(&pulse, {
            let mirror = mirror.clone();
            move || mirror.value().as_i64().unwrap_or(0) * 2
        });

        source.watch("mirror", {
            let mirror = mirror.clone();
            move |value| {
                mirror.set(value.clone());
            }
        });

        source.set(4);
        assert_eq!(mirror.value(), json!(4));
        assert_eq!(doubled.value(), json!(8));
    }

    #[test]
    fn background_jobs_are_not_rendered() {
        let pulse = Pulse::new();
        let state = State::new(&pulse, 0);
        let dependent = Computed::new(&pulse, {
            let state = state.clone();
            move || state.value()
        });

        pulse.in_background(|| state.set(1));
        assert_eq!(dependent.value(), json!(1));
        assert!(!pulse.has_pending_updates());

        state.set(2);
        assert!(pulse.has_pending_updates());
    }

    #[test]
    fn batch_flushes_once() {
        let pulse = immediate();
        let a = State::new(&pulse, 0);
        let b = State::new(&pulse, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        pulse.subscribe_callback(&[("a", &a), ("b", &b)], {
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        pulse.batch(|| {
            a.set(1);
            b.set(2);
            pulse.batch(|| a.set(3));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.value(), json!(3));
    }

    #[test]
    fn deferred_mode_waits_for_flush() {
        let pulse = Pulse::new();
        let state = State::new(&pulse, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        pulse.subscribe_callback(&[("value", &state)], {
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        state.set(1);
        state.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pulse.has_pending_updates());

        assert_eq!(pulse.flush_updates(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pulse.flush_updates(), 0);
    }

    #[tokio::test]
    async fn update_loop_flushes_deferred_notifications() {
        let pulse = Pulse::new();
        let state = State::new(&pulse, 0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        pulse.subscribe_callback(&[("value", &state)], move |patch| {
            let _ = tx.send(patch.get("value").cloned());
        });

        let handle = pulse.spawn_update_loop();
        state.set(7);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, Some(json!(7)));

        drop(pulse);
        handle.await.unwrap();
    }
}
