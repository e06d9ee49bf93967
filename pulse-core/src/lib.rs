//! Pulse Core
//!
//! This crate provides a reactive dependency graph and an incrementally
//! indexed entity store built on top of it. It implements:
//!
//! - Reactive cells (states, computed values) with automatic dependency
//!   tracking
//! - A synchronous job scheduler that settles the graph and coalesces
//!   subscriber notifications
//! - Keyed collections with ordered, incrementally rebuilt groups and
//!   selectors
//! - Optional persistence, UI integration hooks and server-state snapshots
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: the cell arena and dependency edges
//! - `reactive`: states, computed values, the scheduler and subscriptions
//! - `collection`: collections, groups, selectors and entities
//! - `storage`, `integration`, `server_state`, `action`: collaborators at the
//!   edge of the graph
//!
//! # Example
//!
//! ```rust
//! use pulse_core::{CollectionConfig, Pulse, Reactive};
//! use serde_json::json;
//!
//! let pulse = Pulse::new();
//!
//! let count = pulse.state(1);
//! let doubled = pulse.computed({
//!     let count = count.clone();
//!     move || count.get::<i64>().unwrap_or(0) * 2
//! });
//! count.set(5);
//! assert_eq!(doubled.value(), json!(10));
//!
//! let posts = pulse.collection(CollectionConfig::new("posts"));
//! let feed = posts.create_group("feed", ());
//! posts.collect(json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}]), "feed");
//! feed.remove(1);
//! assert_eq!(feed.output(), vec![json!({"id": 2, "title": "b"})]);
//! ```

pub mod action;
pub mod collection;
pub mod config;
pub mod error;
pub mod graph;
pub mod instance;
pub mod integration;
pub mod reactive;
pub mod server_state;
pub mod storage;

pub use action::{Action, CatchHandler};
pub use collection::{
    AddMethod, AddOptions, ChangeMethod, CollectOptions, Collection, CollectionConfig,
    CollectionId, Data, Group, IntoKeys, IntoNames, PrimaryKey, Removal, Selector, UpdateOptions,
    DEFAULT_GROUP,
};
pub use config::{NotifyMode, PulseConfig};
pub use error::{PulseError, Result, StorageError};
pub use graph::{CellId, CellKind, Dep};
pub use instance::{Pulse, PulseBuilder};
pub use integration::Integration;
pub use reactive::{
    ComponentId, Computed, IngestOptions, Job, Patch, Reactive, SetOptions, State, SubscriptionId,
    UpdateCallback, ValueType,
};
pub use server_state::{CollectionSnapshot, ServerState};
pub use storage::{AsyncStorageBackend, MemoryStorage, Storage, StorageBackend};
