//! Error types for the live-query engine.

use crate::collection::CollectionStatus;
use crate::{CollectionId, CollectionName, Key};
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Collection state errors
    #[error("collection id already in use: {0}")]
    DuplicateCollection(CollectionName),

    #[error("invalid status transition for collection '{collection}': {from} -> {to}")]
    InvalidStatusTransition {
        collection: CollectionName,
        from: CollectionStatus,
        to: CollectionStatus,
    },

    #[error("collection '{0}' is derived from a live query and cannot be mutated directly")]
    DerivedCollectionReadOnly(CollectionName),

    #[error("collection '{0}' has been dropped")]
    CollectionDropped(CollectionName),

    // Operation errors
    #[error("could not derive a key for row in collection '{0}'")]
    UndefinedKey(CollectionName),

    #[error("row with key {0} already exists")]
    DuplicateKey(Key),

    #[error("cannot update row {0}: key not found")]
    UpdateKeyNotFound(Key),

    #[error("cannot delete row {0}: key not found")]
    DeleteKeyNotFound(Key),

    #[error("updating the key of a row is not allowed: {from} -> {to}")]
    KeyUpdateNotAllowed { from: Key, to: Key },

    #[error("mutation targets collection {actual}, not {expected}")]
    MutationCollectionMismatch {
        expected: CollectionId,
        actual: CollectionId,
    },

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Optimistic layer errors
    #[error("unknown optimistic handle: {0}")]
    UnknownHandle(u64),

    #[error("optimistic handle already confirmed: {0}")]
    HandleAlreadyConfirmed(u64),

    // Transaction errors
    #[error("transaction {0} is not pending")]
    TransactionNotPending(String),

    #[error("transaction {0} is already completed and cannot be rolled back")]
    TransactionAlreadyCompleted(String),

    // Query builder errors
    #[error("alias '{0}' is used more than once in the query")]
    DuplicateAlias(String),

    #[error("unknown alias '{0}' referenced in the query")]
    UnknownAlias(String),

    #[error("invalid join condition for '{alias}': {reason}")]
    InvalidJoinCondition { alias: String, reason: String },

    #[error("limit and offset require an order by clause")]
    LimitOffsetRequireOrderBy,

    #[error("invalid aggregation: {0}")]
    InvalidAggregation(String),

    // Registry errors
    #[error("collection '{0}' already has a registered builder")]
    AlreadyRegistered(CollectionName),

    #[error("live query dependency cycle through collection '{0}'")]
    DependencyCycle(CollectionName),

    #[error("scheduler detected unresolved dependencies: {0}")]
    UnresolvedDependencies(String),

    // Source errors
    #[error("source error: {0}")]
    Source(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::DuplicateKey(Key::from("todo-1"));
        assert_eq!(err.to_string(), "row with key todo-1 already exists");

        let err = Error::InvalidStatusTransition {
            collection: "todos".into(),
            from: CollectionStatus::Ready,
            to: CollectionStatus::Loading,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for collection 'todos': ready -> loading"
        );

        let err = Error::TypeMismatch {
            field: "done".into(),
            expected: "Bool".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'done': expected Bool, got String"
        );
    }
}
