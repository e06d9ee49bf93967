//! Reactive Primitives
//!
//! This module implements the reactive core: states, computed values, the
//! scheduler that propagates writes, and the subscriptions that carry the
//! results to the outside world.
//!
//! # Concepts
//!
//! ## States
//!
//! A State is a container for a JSON value. When its value is read inside a
//! tracking frame (a computed function or a tracked render), the reader is
//! recorded as a dependent. Writing the state queues a job; performing the
//! job re-ingests every dependent.
//!
//! ## Computed values
//!
//! A Computed is a derived value. It re-evaluates as part of the drain cycle
//! that follows a write to any of its sources, so reading it never observes
//! a stale value once the write call has returned.
//!
//! ## Subscriptions
//!
//! Subscriptions are the edge of the graph. They are told about changes once
//! per drain cycle (or once per batch), with all changes of that cycle
//! coalesced into one patch.
//!
//! # Implementation Notes
//!
//! Every instance owns its own tracking stack. When a cell is read, the
//! innermost open frame records it; the computation that opened the frame
//! is wired as a dependent once it finishes.

mod computed;
mod context;
mod runtime;
mod state;
mod subscription;

pub use computed::Computed;
pub use runtime::{IngestOptions, Job};
pub use state::{Reactive, SetOptions, State, ValueType};
pub use subscription::{ComponentId, Patch, SubscriptionId, UpdateCallback};

pub(crate) use context::TrackingStack;
pub(crate) use runtime::RuntimeState;
pub(crate) use state::{inspect, merge_values};
pub(crate) use subscription::SubscriptionRegistry;
