//! Subscriptions for the reactive system.
//!
//! A subscription binds something outside the graph (a UI component or a
//! plain callback) to the cells it displays. Subscriptions are not cells:
//! they never recompute, they only receive a patch after a drain cycle.
//!
//! Three binding forms exist:
//!
//! - prop-bound: an explicit `prop name -> cell` map; the patch carries the
//!   new public value of every changed prop
//! - callback: the same map, delivered to a closure instead of a component
//! - tracked: a render closure is run in a tracking frame and the
//!   subscription follows whatever it read; the patch is empty and the
//!   render closure is re-run after every delivery to refresh the cell set

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::{debug, warn};

use super::context::ReactiveContext;
use super::Reactive;
use crate::graph::{CellId, Graph};
use crate::instance::Pulse;

/// Changed props of one subscription, keyed by prop name.
pub type Patch = IndexMap<String, Value>;

/// Callback receiving a subscription's patch.
pub type UpdateCallback = Arc<dyn Fn(&Patch) + Send + Sync>;

type RenderFn = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle of an external component, passed back to
/// [`Integration::update_method`](crate::Integration::update_method).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

impl From<u64> for ComponentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Clone)]
pub(crate) enum Target {
    Component(ComponentId),
    Callback(UpdateCallback),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Component(id) => f.debug_tuple("Component").field(id).finish(),
            Target::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Binds one external target to the cells it cares about.
pub(crate) struct SubscriptionContainer {
    target: Target,
    props: Vec<(String, CellId)>,
    render: Option<RenderFn>,
    cells: IndexSet<CellId>,
}

/// A patch ready for delivery.
pub(crate) struct Delivery {
    id: SubscriptionId,
    target: Target,
    patch: Patch,
    render: Option<RenderFn>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    containers: IndexMap<SubscriptionId, SubscriptionContainer>,
}

impl SubscriptionRegistry {
    pub(crate) fn len(&self) -> usize {
        self.containers.len()
    }

    /// Accumulate one patch per subscription for the rendered cells.
    ///
    /// Subscriptions keep the order they were registered in.
    pub(crate) fn collect(&self, graph: &Graph, rendered: &[CellId]) -> Vec<Delivery> {
        let mut patches: IndexMap<SubscriptionId, Patch> = IndexMap::new();

        for &rendered_id in rendered {
            let cell_id = graph.resolve(rendered_id);
            let Some(cell) = graph.get(cell_id) else {
                continue;
            };
            for sub in cell.dep.subscribers() {
                let Some(container) = self.containers.get(&sub) else {
                    continue;
                };
                let patch = patches.entry(sub).or_default();
                let bound = container
                    .props
                    .iter()
                    .filter(|(_, id)| graph.resolve(*id) == cell_id);
                for (prop, _) in bound {
                    patch.insert(prop.clone(), cell.public_value());
                }
            }
        }

        let mut deliveries: Vec<Delivery> = patches
            .into_iter()
            .filter_map(|(id, patch)| {
                let container = self.containers.get(&id)?;
                Some(Delivery {
                    id,
                    target: container.target.clone(),
                    patch,
                    render: container.render.clone(),
                })
            })
            .collect();
        deliveries.sort_by_key(|delivery| self.containers.get_index_of(&delivery.id));
        deliveries
    }
}

impl Pulse {
    /// Bind a component to an explicit prop map.
    pub fn subscribe_props(
        &self,
        component: ComponentId,
        props: &[(&str, &dyn Reactive)],
    ) -> SubscriptionId {
        self.register_subscription(Target::Component(component), props)
    }

    /// Bind a callback to an explicit prop map.
    pub fn subscribe_callback<F>(
        &self,
        props: &[(&str, &dyn Reactive)],
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(&Patch) + Send + Sync + 'static,
    {
        self.register_subscription(Target::Callback(Arc::new(callback)), props)
    }

    /// Bind a component to whatever `render` reads.
    ///
    /// `render` runs once now inside a tracking frame and again after every
    /// delivery so the bound cells follow its current reads.
    pub fn subscribe_tracked<F>(&self, component: ComponentId, render: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let render: RenderFn = Arc::new(render);
        self.inner.subs.lock().containers.insert(
            id,
            SubscriptionContainer {
                target: Target::Component(component),
                props: Vec::new(),
                render: Some(render.clone()),
                cells: IndexSet::new(),
            },
        );
        self.retrack(id, &render);
        id
    }

    /// Detach a subscription from every cell. Returns `false` if it was
    /// already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut graph = self.inner.graph.lock();
        let mut subs = self.inner.subs.lock();
        let Some(container) = subs.containers.shift_remove(&id) else {
            return false;
        };
        for cell in container.cells {
            graph.unsubscribe(cell, id);
        }
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().len()
    }

    fn register_subscription(
        &self,
        target: Target,
        props: &[(&str, &dyn Reactive)],
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let props: Vec<(String, CellId)> = props
            .iter()
            .map(|(name, cell)| (name.to_string(), cell.cell_id()))
            .collect();

        let mut graph = self.inner.graph.lock();
        let mut subs = self.inner.subs.lock();
        let mut cells = IndexSet::new();
        for (name, cell) in &props {
            if graph.subscribe(*cell, id) || graph.contains(*cell) {
                cells.insert(*cell);
            } else {
                warn!(prop = %name, cell = %cell, "subscribed to a removed cell");
            }
        }
        subs.containers.insert(
            id,
            SubscriptionContainer {
                target,
                props,
                render: None,
                cells,
            },
        );
        id
    }

    /// Re-run a tracked render and rebind the subscription to its reads.
    fn retrack(&self, id: SubscriptionId, render: &RenderFn) {
        let ctx = ReactiveContext::enter(&self.inner.tracking, true);
        render();
        let found = ctx.finish();

        let mut graph = self.inner.graph.lock();
        let mut subs = self.inner.subs.lock();
        let Some(container) = subs.containers.get_mut(&id) else {
            return;
        };
        for cell in container.cells.drain(..) {
            graph.unsubscribe(cell, id);
        }
        for cell in found {
            if graph.subscribe(cell, id) || graph.contains(cell) {
                container.cells.insert(cell);
            }
        }
    }

    /// Deliver one patch per affected subscription.
    pub(crate) fn notify_subscribers(&self, rendered: &[CellId]) -> usize {
        let deliveries = {
            let graph = self.inner.graph.lock();
            let subs = self.inner.subs.lock();
            subs.collect(&graph, rendered)
        };

        for delivery in &deliveries {
            match &delivery.target {
                Target::Component(component) => match &self.inner.integration {
                    Some(integration) => integration.update_method(*component, &delivery.patch),
                    None => warn!(component = component.0, "no integration to deliver update"),
                },
                Target::Callback(callback) => callback(&delivery.patch),
            }
        }

        for delivery in &deliveries {
            if let Some(render) = &delivery.render {
                self.retrack(delivery.id, render);
            }
        }

        debug!(
            cells = rendered.len(),
            subscriptions = deliveries.len(),
            "notify pass"
        );
        deliveries.len()
    }
}
