//! Mutation records for optimistic writes.
//!
//! Writes are expressed as mutations, never as direct edits of row storage.
//! A mutation carries both the row value it was prepared against and the
//! value it produces, so it can be applied optimistically, sent to a remote
//! system, and later confirmed or retracted.

use crate::{CollectionId, Key};
use serde::{Deserialize, Serialize};

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

/// A single row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    #[serde(rename = "type")]
    pub mutation_type: MutationType,
    /// Collection the mutation targets
    pub collection: CollectionId,
    /// Key of the target row
    pub key: Key,
    /// Visible value of the row before the mutation (None for inserts)
    pub original: Option<serde_json::Value>,
    /// Value of the row after the mutation (None for deletes)
    pub modified: Option<serde_json::Value>,
    /// Top-level fields that changed
    pub changes: serde_json::Value,
}

impl Mutation {
    /// Create an insert mutation.
    pub fn insert(collection: CollectionId, key: Key, value: serde_json::Value) -> Self {
        Self {
            mutation_type: MutationType::Insert,
            collection,
            key,
            original: None,
            changes: value.clone(),
            modified: Some(value),
        }
    }

    /// Create an update mutation from the full before/after rows.
    pub fn update(
        collection: CollectionId,
        key: Key,
        original: serde_json::Value,
        modified: serde_json::Value,
    ) -> Self {
        let changes = shallow_changes(&original, &modified);
        Self {
            mutation_type: MutationType::Update,
            collection,
            key,
            original: Some(original),
            modified: Some(modified),
            changes,
        }
    }

    /// Create a delete mutation.
    pub fn delete(collection: CollectionId, key: Key, original: serde_json::Value) -> Self {
        Self {
            mutation_type: MutationType::Delete,
            collection,
            key,
            original: Some(original),
            modified: None,
            changes: serde_json::Value::Null,
        }
    }

    /// Whether two mutations address the same row.
    pub fn same_row(&self, other: &Mutation) -> bool {
        self.collection == other.collection && self.key == other.key
    }

    /// Fold a later mutation on the same row into this one.
    ///
    /// Returns `None` when the pair cancels out (a row inserted and deleted
    /// within the same transaction).
    pub fn merge(self, later: Mutation) -> Option<Mutation> {
        use MutationType::*;

        match (self.mutation_type, later.mutation_type) {
            (Insert, Update) => Some(Mutation {
                changes: later.modified.clone().unwrap_or(serde_json::Value::Null),
                modified: later.modified,
                ..self
            }),
            (Insert, Delete) => None,
            (Update, Update) => {
                let changes = merge_objects(&self.changes, &later.changes);
                Some(Mutation {
                    modified: later.modified,
                    changes,
                    ..self
                })
            }
            (Update, Delete) | (Delete, Delete) => Some(Mutation {
                mutation_type: Delete,
                modified: None,
                changes: serde_json::Value::Null,
                ..self
            }),
            (Delete, Insert) => match (self.original, later.modified) {
                (Some(original), Some(modified)) => Some(Mutation::update(
                    self.collection,
                    self.key,
                    original,
                    modified,
                )),
                (_, modified) => Some(Mutation {
                    mutation_type: Insert,
                    original: None,
                    changes: modified.clone().unwrap_or(serde_json::Value::Null),
                    modified,
                    ..later
                }),
            },
            // Anything else replaces the earlier mutation outright.
            _ => Some(later),
        }
    }
}

/// Collect the top-level fields of `modified` that differ from `original`.
fn shallow_changes(
    original: &serde_json::Value,
    modified: &serde_json::Value,
) -> serde_json::Value {
    match (original, modified) {
        (serde_json::Value::Object(before), serde_json::Value::Object(after)) => {
            let mut changes = serde_json::Map::new();
            for (field, value) in after {
                if before.get(field) != Some(value) {
                    changes.insert(field.clone(), value.clone());
                }
            }
            for field in before.keys() {
                if !after.contains_key(field) {
                    changes.insert(field.clone(), serde_json::Value::Null);
                }
            }
            serde_json::Value::Object(changes)
        }
        _ => modified.clone(),
    }
}

fn merge_objects(first: &serde_json::Value, second: &serde_json::Value) -> serde_json::Value {
    match (first, second) {
        (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => second.clone(),
    }
}

/// Merge a mutation into an ordered list, folding it into an earlier
/// mutation on the same row.
pub(crate) fn push_merged(mutations: &mut Vec<Mutation>, mutation: Mutation) {
    match mutations.iter().position(|m| m.same_row(&mutation)) {
        Some(idx) => {
            let earlier = mutations.remove(idx);
            if let Some(merged) = earlier.merge(mutation) {
                mutations.insert(idx, merged);
            }
        }
        None => mutations.push(mutation),
    }
}
