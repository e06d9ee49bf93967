//! Computed Implementation
//!
//! A Computed is a cell whose value is produced by a function of other cells.
//!
//! # How Computeds Work
//!
//! 1. On creation the function runs once to produce the initial value.
//!
//! 2. Without explicit dependencies, the run happens inside a tracking
//!    window: every cell read is recorded and wired as a source. The window
//!    is re-opened on every recompute, so dependencies can change from run
//!    to run (a function reading `a ? b : c` tracks `b` or `c`).
//!
//! 3. With explicit dependencies the wiring happens once at construction
//!    and recomputes just call the function.
//!
//! 4. When a source is written, the runtime re-ingests this cell and the
//!    function runs again as part of the same drain cycle.
//!
//! A panic inside the function is not caught here; it unwinds to whoever
//! triggered the recompute.

use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::warn;

use super::context::ReactiveContext;
use super::{IngestOptions, Reactive};
use crate::graph::{Behavior, Cell, CellId, ComputeFn};
use crate::instance::{Inner, Pulse};

/// A derived reactive value.
///
/// # Example
///
/// ```rust,ignore
/// let a = State::new(&pulse, 1);
/// let b = Computed::new(&pulse, {
///     let a = a.clone();
///     move || a.value().as_i64().unwrap_or(0) + 2
/// });
/// a.set(5);
/// assert_eq!(b.value(), json!(7));
/// ```
#[derive(Clone)]
pub struct Computed {
    id: CellId,
    pulse: Weak<Inner>,
}

impl Computed {
    /// Create a computed that discovers its dependencies on every run.
    pub fn new<F, R>(pulse: &Pulse, func: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        Self::build(pulse, wrap(func), None)
    }

    /// Create a computed with a fixed dependency list.
    pub fn with_deps<F, R>(pulse: &Pulse, deps: &[&dyn Reactive], func: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        let deps: Vec<CellId> = deps.iter().map(|dep| dep.cell_id()).collect();
        Self::build(pulse, wrap(func), Some(deps))
    }

    fn build(pulse: &Pulse, func: ComputeFn, deps: Option<Vec<CellId>>) -> Self {
        let static_deps = deps.is_some();
        let id = {
            let mut graph = pulse.inner.graph.lock();
            let id = graph.insert(Cell::new(
                Value::Null,
                Behavior::Computed { func, static_deps },
            ));
            for source in deps.unwrap_or_default() {
                if let Err(err) = graph.depend(source, id) {
                    warn!(cell = %id, error = %err, "skipped computed dependency");
                }
            }
            id
        };

        pulse.initialize_derived(id);
        Self {
            id,
            pulse: pulse.downgrade(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// Re-run the function through the scheduler.
    pub fn recompute(&self) -> &Self {
        if let Some(pulse) = self.instance() {
            pulse.ingest_id(self.id, None, IngestOptions::default());
        }
        self
    }

    /// Whether dependencies were supplied at construction.
    pub fn is_static(&self) -> bool {
        super::state::inspect(self.instance(), self.id, |cell| {
            matches!(
                cell.behavior,
                Behavior::Computed {
                    static_deps: true,
                    ..
                }
            )
        })
        .unwrap_or(false)
    }
}

fn wrap<F, R>(func: F) -> ComputeFn
where
    F: Fn() -> R + Send + Sync + 'static,
    R: Into<Value>,
{
    Arc::new(move || func().into())
}

impl Reactive for Computed {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn instance(&self) -> Option<Pulse> {
        Pulse::from_weak(&self.pulse)
    }
}

impl PartialEq for Computed {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id)
            .field("value", &self.peek())
            .finish()
    }
}

impl Pulse {
    /// Run `f` in a tracking window and make `id` depend on exactly the
    /// cells it read.
    pub(crate) fn compute_tracked<R>(&self, id: CellId, f: impl FnOnce() -> R) -> R {
        let ctx = ReactiveContext::enter(&self.inner.tracking, true);
        let result = f();
        let found = ctx.finish();

        let mut graph = self.inner.graph.lock();
        graph.clear_sources(id);
        for source in found {
            if let Err(err) = graph.depend(source, id) {
                warn!(cell = %id, error = %err, "ignored tracked dependency");
            }
        }
        result
    }

    /// Run `f` with dependency tracking suspended.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let ctx = ReactiveContext::enter(&self.inner.tracking, false);
        let result = f();
        ctx.finish();
        result
    }

    /// Whether reads are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracking.is_tracking()
    }

    /// Produce the value a derived cell would hold now.
    ///
    /// Returns `None` for cells that are not derived or no longer exist.
    pub(crate) fn compute_derived(&self, id: CellId) -> Option<Value> {
        let func = {
            let graph = self.inner.graph.lock();
            match &graph.get(id)?.behavior {
                Behavior::Computed { func, static_deps } => Some((func.clone(), *static_deps)),
                Behavior::Selector { .. } => None,
                _ => return None,
            }
        };

        match func {
            Some((func, true)) => Some(self.untracked(|| func())),
            Some((func, false)) => Some(self.compute_tracked(id, || func())),
            None => self.resolve_selector(id),
        }
    }

    /// Compute the first value of a derived cell without scheduling a job.
    pub(crate) fn initialize_derived(&self, id: CellId) {
        let Some(value) = self.compute_derived(id) else {
            return;
        };
        let mut graph = self.inner.graph.lock();
        if let Some(cell) = graph.get_mut(id) {
            cell.previous = value.clone();
            cell.next = value.clone();
            cell.initial = value.clone();
            cell.value = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotifyMode, PulseConfig};
    use crate::reactive::State;
    use serde_json::json;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn pulse() -> Pulse {
        Pulse::with_config(PulseConfig {
            notify: NotifyMode::Immediate,
            ..PulseConfig::default()
        })
    }

    fn as_i64(value: Value) -> i64 {
        value.as_i64().unwrap_or(0)
    }

    #[test]
    fn computed_propagates_without_explicit_recompute() {
        let pulse = pulse();
        let a = State::new(&pulse, 1);
        let b = Computed::new(&pulse, {
            let a = a.clone();
            move || as_i64(a.value()) + 2
        });

        assert_eq!(b.value(), json!(3));
        a.set(5);
        assert_eq!(b.value(), json!(7));
    }

    #[test]
    fn computed_chain_settles() {
        let pulse = pulse();
        let base = State::new(&pulse, 5);
        let doubled = Computed::new(&pulse, {
            let base = base.clone();
            move || as_i64(base.value()) * 2
        });
        let plus_ten = Computed::new(&pulse, {
            let doubled = doubled.clone();
            move || as_i64(doubled.value()) + 10
        });

        assert_eq!(plus_ten.value(), json!(20));
        base.set(10);
        assert_eq!(doubled.value(), json!(20));
        assert_eq!(plus_ten.value(), json!(30));
    }

    #[test]
    fn dynamic_dependencies_follow_branches() {
        let pulse = pulse();
        let flag = State::new(&pulse, true);
        let left = State::new(&pulse, "left");
        let right = State::new(&pulse, "right");

        let picked = Computed::new(&pulse, {
            let (flag, left, right) = (flag.clone(), left.clone(), right.clone());
            move || {
                if flag.value() == json!(true) {
                    left.value()
                } else {
                    right.value()
                }
            }
        });

        assert!(left.dependents().contains(&picked.id()));
        assert!(!right.dependents().contains(&picked.id()));

        flag.set(false);
        assert_eq!(picked.value(), json!("right"));
        assert!(!left.dependents().contains(&picked.id()));
        assert!(right.dependents().contains(&picked.id()));
    }

    #[test]
    fn static_dependencies_are_wired_once() {
        let pulse = pulse();
        let a = State::new(&pulse, 1);
        let hidden = State::new(&pulse, 100);
        let runs = Arc::new(AtomicI32::new(0));

        let sum = Computed::with_deps(&pulse, &[&a], {
            let (a, hidden, runs) = (a.clone(), hidden.clone(), runs.clone());
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                as_i64(a.value()) + as_i64(hidden.value())
            }
        });

        assert!(sum.is_static());
        assert_eq!(sum.value(), json!(101));
        assert!(hidden.dependents().is_empty());

        hidden.set(200);
        assert_eq!(sum.value(), json!(101));

        a.set(2);
        assert_eq!(sum.value(), json!(202));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn diamond_recomputes_once_per_write() {
        let pulse = pulse();
        let root = State::new(&pulse, 1);
        let left = Computed::new(&pulse, {
            let root = root.clone();
            move || as_i64(root.value()) + 1
        });
        let right = Computed::new(&pulse, {
            let root = root.clone();
            move || as_i64(root.value()) * 10
        });
        let runs = Arc::new(AtomicI32::new(0));
        let joined = Computed::new(&pulse, {
            let (left, right, runs) = (left.clone(), right.clone(), runs.clone());
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                as_i64(left.value()) + as_i64(right.value())
            }
        });

        assert_eq!(joined.value(), json!(12));
        root.set(2);
        assert_eq!(joined.value(), json!(23));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn untracked_reads_do_not_wire() {
        let pulse = pulse();
        let a = State::new(&pulse, 1);
        let c = Computed::new(&pulse, {
            let (a, pulse) = (a.clone(), pulse.downgrade());
            move || {
                Pulse::from_weak(&pulse)
                    .map(|pulse| pulse.untracked(|| a.value()))
                    .unwrap_or(Value::Null)
            }
        });

        assert_eq!(c.value(), json!(1));
        assert!(a.dependents().is_empty());
    }

    #[test]
    fn explicit_recompute() {
        let pulse = pulse();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Computed::new(&pulse, {
            let counter = counter.clone();
            move || counter.fetch_add(1, Ordering::SeqCst)
        });

        assert_eq!(c.value(), json!(0));
        c.recompute();
        assert_eq!(c.value(), json!(1));
    }
}
