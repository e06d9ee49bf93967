//! Contract with external UI bindings.
//!
//! The core never renders anything itself. Component subscriptions are
//! delivered through an [`Integration`] attached to the instance with
//! [`PulseBuilder::integration`](crate::PulseBuilder::integration).

use crate::reactive::{ComponentId, Patch};

/// Bridge between the reactive core and a UI framework.
pub trait Integration: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &str {
        "integration"
    }

    /// Apply a patch of changed props to a component. Called at most once
    /// per component per notify pass.
    fn update_method(&self, component: ComponentId, patch: &Patch);

    /// Called once when the instance is built.
    fn on_pulse_ready(&self) {}

    /// Called once by [`Pulse::ready`](crate::Pulse::ready).
    fn on_core_ready(&self) {}
}
