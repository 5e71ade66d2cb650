//! Reconciliation of optimistic writes with confirmed state.
//!
//! Each call to `apply_optimistic` pushes a layer of mutations on top of a
//! collection's confirmed rows. The visible value of a row is the confirmed
//! value overlaid with every layer in submission order.
//!
//! # Settling
//!
//! Layers leave the stack in submission order only:
//!
//! 1. `rollback` removes a layer immediately, wherever it sits
//! 2. `confirm` replaces a layer's rows with authoritative rows, but the layer
//!    stays in place until every earlier layer is settled
//! 3. `settle` pops confirmed layers from the front and hands their rows to
//!    the collection to merge into confirmed state
//!
//! A later confirmation therefore never lands in confirmed state before an
//! earlier pending write to the same row, and when it does land it is
//! applied last.
//!
//! A feed write to a row is newer than any confirmation still waiting to
//! settle, so it drops that row from confirmed layers (`supersede`). Pending
//! layers are left alone and keep overlaying the row.

use crate::{error::Result, Error, Key, Mutation, MutationType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Handle to one optimistic layer.
///
/// Handles are allocated from a store-wide sequence, so their order is the
/// submission order across all collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptimisticHandle(pub u64);

impl std::fmt::Display for OptimisticHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rows written by a layer: `None` means the row is absent.
pub type LayerRows = Vec<(Key, Option<serde_json::Value>)>;

#[derive(Debug, Clone, PartialEq)]
enum LayerState {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
struct Layer {
    rows: LayerRows,
    state: LayerState,
}

impl Layer {
    fn row(&self, key: &Key) -> Option<&Option<serde_json::Value>> {
        // Last write within the layer wins
        self.rows.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// What the optimistic layers say about one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Overlay<'a> {
    Upsert(&'a serde_json::Value),
    Deleted,
}

/// Stack of optimistic layers for one collection.
#[derive(Debug, Default)]
pub(crate) struct OptimisticLayers {
    layers: BTreeMap<OptimisticHandle, Layer>,
}

impl OptimisticLayers {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn contains(&self, handle: OptimisticHandle) -> bool {
        self.layers.contains_key(&handle)
    }

    /// Push a new pending layer built from mutations.
    pub fn push(&mut self, handle: OptimisticHandle, mutations: &[Mutation]) {
        let rows = mutations
            .iter()
            .map(|m| {
                let value = match m.mutation_type {
                    MutationType::Delete => None,
                    MutationType::Insert | MutationType::Update => m.modified.clone(),
                };
                (m.key.clone(), value)
            })
            .collect();

        self.layers.insert(
            handle,
            Layer {
                rows,
                state: LayerState::Pending,
            },
        );
    }

    /// Topmost overlay for a key, if any layer touches it.
    pub fn overlay(&self, key: &Key) -> Option<Overlay<'_>> {
        self.layers
            .values()
            .rev()
            .find_map(|layer| layer.row(key))
            .map(|row| match row {
                Some(value) => Overlay::Upsert(value),
                None => Overlay::Deleted,
            })
    }

    /// Keys touched by one layer, in write order.
    pub fn keys_of(&self, handle: OptimisticHandle) -> Result<Vec<Key>> {
        let layer = self
            .layers
            .get(&handle)
            .ok_or(Error::UnknownHandle(handle.0))?;
        Ok(layer.rows.iter().map(|(k, _)| k.clone()).collect())
    }

    /// Keys touched by any layer.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.layers
            .values()
            .flat_map(|layer| layer.rows.iter().map(|(k, _)| k))
    }

    /// Replace a pending layer's rows with authoritative rows.
    pub fn confirm(&mut self, handle: OptimisticHandle, rows: LayerRows) -> Result<()> {
        let layer = self
            .layers
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle.0))?;

        if layer.state == LayerState::Confirmed {
            return Err(Error::HandleAlreadyConfirmed(handle.0));
        }

        layer.rows = rows;
        layer.state = LayerState::Confirmed;
        Ok(())
    }

    /// Remove a layer entirely, returning the keys it touched.
    pub fn rollback(&mut self, handle: OptimisticHandle) -> Result<Vec<Key>> {
        let layer = self
            .layers
            .remove(&handle)
            .ok_or(Error::UnknownHandle(handle.0))?;
        Ok(layer.rows.into_iter().map(|(k, _)| k).collect())
    }

    /// Pop confirmed layers from the front of the stack.
    ///
    /// Returns their rows in the order they must be written to confirmed state.
    pub fn settle(&mut self) -> LayerRows {
        let mut settled = Vec::new();

        while let Some(entry) = self.layers.first_entry() {
            if entry.get().state != LayerState::Confirmed {
                break;
            }
            settled.extend(entry.remove().rows);
        }

        settled
    }

    /// Drop `key` from every confirmed layer.
    pub fn supersede(&mut self, key: &Key) {
        for layer in self.confirmed_mut() {
            layer.rows.retain(|(k, _)| k != key);
        }
    }

    /// Drop the rows of every confirmed layer.
    pub fn supersede_all(&mut self) {
        for layer in self.confirmed_mut() {
            layer.rows.clear();
        }
    }

    /// Keys written by confirmed layers that have not settled yet.
    pub fn confirmed_keys(&self) -> impl Iterator<Item = &Key> {
        self.layers
            .values()
            .filter(|l| l.state == LayerState::Confirmed)
            .flat_map(|l| l.rows.iter().map(|(k, _)| k))
    }

    fn confirmed_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers
            .values_mut()
            .filter(|l| l.state == LayerState::Confirmed)
    }

    pub fn clear(&mut self) -> Vec<Key> {
        let keys = self.keys().cloned().collect();
        self.layers.clear();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollectionId;
    use serde_json::json;

    fn update(key: &str, before: serde_json::Value, after: serde_json::Value) -> Mutation {
        Mutation::update(CollectionId(1), Key::from(key), before, after)
    }

    #[test]
    fn overlay_uses_latest_layer() {
        let mut layers = OptimisticLayers::default();
        layers.push(
            OptimisticHandle(1),
            &[update("1", json!({"v": 0}), json!({"v": 1}))],
        );
        layers.push(
            OptimisticHandle(2),
            &[update("1", json!({"v": 1}), json!({"v": 2}))],
        );

        assert_eq!(
            layers.overlay(&Key::from("1")),
            Some(Overlay::Upsert(&json!({"v": 2})))
        );
        assert_eq!(layers.overlay(&Key::from("2")), None);
    }

    #[test]
    fn delete_overlays_as_deleted() {
        let mut layers = OptimisticLayers::default();
        layers.push(
            OptimisticHandle(1),
            &[Mutation::delete(CollectionId(1), Key::from("1"), json!({}))],
        );
        assert_eq!(layers.overlay(&Key::from("1")), Some(Overlay::Deleted));
    }

    #[test]
    fn later_confirmation_waits_for_earlier_layer() {
        let mut layers = OptimisticLayers::default();
        layers.push(
            OptimisticHandle(1),
            &[update("1", json!({"v": 0}), json!({"v": 1}))],
        );
        layers.push(
            OptimisticHandle(2),
            &[update("1", json!({"v": 1}), json!({"v": 2}))],
        );

        layers
            .confirm(OptimisticHandle(2), vec![(Key::from("1"), Some(json!({"v": 20})))])
            .unwrap();
        assert!(layers.settle().is_empty());
        assert_eq!(layers.len(), 2);

        layers
            .confirm(OptimisticHandle(1), vec![(Key::from("1"), Some(json!({"v": 10})))])
            .unwrap();
        let settled = layers.settle();
        assert_eq!(
            settled,
            vec![
                (Key::from("1"), Some(json!({"v": 10}))),
                (Key::from("1"), Some(json!({"v": 20}))),
            ]
        );
        assert!(layers.is_empty());
    }

    #[test]
    fn feed_write_supersedes_confirmed_rows_only() {
        let mut layers = OptimisticLayers::default();
        layers.push(
            OptimisticHandle(1),
            &[update("1", json!({"v": 0}), json!({"v": 1}))],
        );
        layers.push(
            OptimisticHandle(2),
            &[
                update("1", json!({"v": 1}), json!({"v": 2})),
                update("2", json!({"v": 0}), json!({"v": 2})),
            ],
        );
        layers
            .confirm(
                OptimisticHandle(2),
                vec![
                    (Key::from("1"), Some(json!({"v": 2}))),
                    (Key::from("2"), Some(json!({"v": 2}))),
                ],
            )
            .unwrap();

        layers.supersede(&Key::from("1"));
        // The pending layer still overlays the row
        assert_eq!(
            layers.overlay(&Key::from("1")),
            Some(Overlay::Upsert(&json!({"v": 1})))
        );
        assert_eq!(layers.confirmed_keys().collect::<Vec<_>>(), vec![&Key::from("2")]);

        layers.supersede_all();
        assert_eq!(layers.confirmed_keys().count(), 0);
        assert_eq!(layers.len(), 2);
    }

    #[test]
    fn rollback_exposes_lower_layer() {
        let mut layers = OptimisticLayers::default();
        layers.push(
            OptimisticHandle(1),
            &[update("1", json!({"v": 0}), json!({"v": 1}))],
        );
        layers.push(
            OptimisticHandle(2),
            &[update("1", json!({"v": 1}), json!({"v": 2}))],
        );

        let keys = layers.rollback(OptimisticHandle(2)).unwrap();
        assert_eq!(keys, vec![Key::from("1")]);
        assert_eq!(
            layers.overlay(&Key::from("1")),
            Some(Overlay::Upsert(&json!({"v": 1})))
        );
    }

    #[test]
    fn confirm_twice_fails() {
        let mut layers = OptimisticLayers::default();
        layers.push(OptimisticHandle(1), &[]);
        layers.push(OptimisticHandle(0), &[]);
        layers.confirm(OptimisticHandle(1), vec![]).unwrap();
        assert_eq!(
            layers.confirm(OptimisticHandle(1), vec![]),
            Err(Error::HandleAlreadyConfirmed(1))
        );
        assert_eq!(
            layers.confirm(OptimisticHandle(9), vec![]),
            Err(Error::UnknownHandle(9))
        );
    }
}
