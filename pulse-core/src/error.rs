//! Error types.
//!
//! Most graph operations treat bad input as a soft reject: they log a warning
//! and leave state untouched. The `try_*` entry points and the persistence and
//! interchange layers surface the reason through [`PulseError`].

use serde_json::Value;
use thiserror::Error;

use crate::graph::CellId;
use crate::reactive::ValueType;

/// Crate-wide result alias.
pub type Result<T, E = PulseError> = std::result::Result<T, E>;

/// Errors produced by the reactive core and its collaborators.
#[derive(Debug, Error)]
pub enum PulseError {
    /// A write did not match the cell's locked type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },

    /// An item handed to a collection has no primary key field.
    #[error("item has no primary key field `{field}`")]
    MissingPrimaryKey { field: String },

    /// A primary key field holds something other than an integer or string.
    #[error("invalid primary key value: {0}")]
    InvalidPrimaryKey(Value),

    /// A group name was referenced that the collection does not know.
    #[error("group `{0}` does not exist")]
    UnknownGroup(String),

    /// The cell was removed from the arena.
    #[error("cell {0} no longer exists")]
    DetachedCell(CellId),

    /// The owning instance has been dropped.
    #[error("pulse instance has been dropped")]
    InstanceDropped,

    /// Wiring the edge would close a dependency cycle.
    #[error("dependency from {from} to {dependent} would create a cycle")]
    Cycle { from: CellId, dependent: CellId },

    /// `patch` was applied to a non-object value.
    #[error("cannot patch a value of type {0}")]
    NotAnObject(ValueType),

    /// Persistence layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An action body failed.
    #[error("action failed: {0}")]
    Action(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl PulseError {
    /// Build an action failure from anything printable.
    pub fn action(message: impl std::fmt::Display) -> Self {
        Self::Action(message.to_string())
    }
}

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached or refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("storage serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
