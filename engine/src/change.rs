//! Change messages delivered to subscribers and written by sync sources.

use crate::{CollectionId, CollectionName, Key, Version};
use serde::{Deserialize, Serialize};

/// Kind of change applied to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// A single row change as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    pub key: Key,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// New value, or the last visible value for deletes
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<serde_json::Value>,
}

impl ChangeMessage {
    /// Compute the change between two visible states of a row, if any.
    pub(crate) fn between(
        key: &Key,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Option<Self> {
        match (before, after) {
            (None, None) => None,
            (None, Some(value)) => Some(Self {
                key: key.clone(),
                change_type: ChangeType::Insert,
                value,
                previous_value: None,
            }),
            (Some(value), None) => Some(Self {
                key: key.clone(),
                change_type: ChangeType::Delete,
                value,
                previous_value: None,
            }),
            (Some(prev), Some(value)) if prev != value => Some(Self {
                key: key.clone(),
                change_type: ChangeType::Update,
                value,
                previous_value: Some(prev),
            }),
            (Some(_), Some(_)) => None,
        }
    }
}

/// A row excluded from a live query because evaluating it failed.
///
/// Reported to subscribers alongside the changes of the same commit; the rest
/// of the live query keeps working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowDiagnostic {
    pub collection: CollectionName,
    pub key: Key,
    pub message: String,
}

/// Everything one commit changed in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub collection: CollectionId,
    /// Collection version after the commit
    pub version: Version,
    pub changes: Vec<ChangeMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<RowDiagnostic>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.diagnostics.is_empty()
    }

    pub fn inserted(&self) -> impl Iterator<Item = &ChangeMessage> {
        self.of_type(ChangeType::Insert)
    }

    pub fn updated(&self) -> impl Iterator<Item = &ChangeMessage> {
        self.of_type(ChangeType::Update)
    }

    pub fn removed(&self) -> impl Iterator<Item = &ChangeMessage> {
        self.of_type(ChangeType::Delete)
    }

    fn of_type(&self, change_type: ChangeType) -> impl Iterator<Item = &ChangeMessage> {
        self.changes
            .iter()
            .filter(move |c| c.change_type == change_type)
    }
}

/// A message written by a sync source into a base collection's confirmed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Insert or replace a row; the key is derived by the collection
    Upsert { value: serde_json::Value },
    Delete { key: Key },
    /// Remove every confirmed row
    Truncate,
}

impl SyncMessage {
    pub fn upsert(value: serde_json::Value) -> Self {
        SyncMessage::Upsert { value }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        SyncMessage::Delete { key: key.into() }
    }
}
