//! Transactions: groups of optimistic writes reconciled as one unit.
//!
//! A transaction applies each write to its collection immediately as an
//! optimistic layer and records the mutation. Once the writes have been
//! persisted remotely the transaction is completed, confirming every layer
//! with authoritative rows; if persisting fails it is rolled back, removing
//! every layer. A transaction is never partially confirmed.
//!
//! Dropping a transaction that is still pending or persisting rolls it back.

use crate::mutation::push_merged;
use crate::{error::Result, Collection, Error, Key, Mutation, OptimisticHandle, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// Accepting writes
    Pending,
    /// Handed to a mutation function; no more writes
    Persisting,
    Completed,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Pending => write!(f, "pending"),
            TransactionState::Persisting => write!(f, "persisting"),
            TransactionState::Completed => write!(f, "completed"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

/// One optimistic layer owned by a transaction.
struct Applied {
    collection: Collection,
    handle: OptimisticHandle,
    mutations: Vec<Mutation>,
}

/// A group of optimistic writes across one or more collections.
pub struct Transaction {
    id: Uuid,
    sequence: u64,
    created_at: DateTime<Utc>,
    store: Store,
    state: TransactionState,
    mutations: Vec<Mutation>,
    applied: Vec<Applied>,
}

impl Transaction {
    pub(crate) fn new(store: &Store) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: store.inner().next_transaction(),
            created_at: Utc::now(),
            store: store.clone(),
            state: TransactionState::Pending,
            mutations: Vec::new(),
            applied: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Position of this transaction in its store's submission order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Submitted mutations, with writes to the same row merged.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Collections written by this transaction, in first-write order.
    pub fn collections(&self) -> Vec<Collection> {
        let mut collections: Vec<Collection> = Vec::new();
        for applied in &self.applied {
            if !collections.contains(&applied.collection) {
                collections.push(applied.collection.clone());
            }
        }
        collections
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.state != TransactionState::Pending {
            return Err(Error::TransactionNotPending(self.id.to_string()));
        }
        Ok(())
    }

    /// Insert a row. Returns its key.
    pub fn insert(&mut self, collection: &Collection, value: Value) -> Result<Key> {
        self.ensure_pending()?;
        let mutation = collection.prepare_insert(value)?;
        let key = mutation.key.clone();
        self.apply(collection, vec![mutation])?;
        Ok(key)
    }

    /// Update a row by editing a draft of its visible value.
    pub fn update(
        &mut self,
        collection: &Collection,
        key: &Key,
        edit: impl FnOnce(&mut Value),
    ) -> Result<()> {
        self.ensure_pending()?;
        let mutation = collection.prepare_update(key, edit)?;
        self.apply(collection, vec![mutation])
    }

    /// Delete a row.
    pub fn delete(&mut self, collection: &Collection, key: &Key) -> Result<()> {
        self.ensure_pending()?;
        let mutation = collection.prepare_delete(key)?;
        self.apply(collection, vec![mutation])
    }

    /// Apply prepared mutations to a collection as one optimistic layer.
    pub fn apply(&mut self, collection: &Collection, mutations: Vec<Mutation>) -> Result<()> {
        self.ensure_pending()?;
        if mutations.is_empty() {
            return Ok(());
        }

        let handle = collection.apply_optimistic(mutations.clone())?;
        for mutation in &mutations {
            push_merged(&mut self.mutations, mutation.clone());
        }
        self.applied.push(Applied {
            collection: collection.clone(),
            handle,
            mutations,
        });
        Ok(())
    }

    /// Stop accepting writes; the mutations are being persisted.
    pub fn begin_persisting(&mut self) -> Result<()> {
        self.ensure_pending()?;
        self.state = TransactionState::Persisting;
        tracing::debug!(transaction = %self.id, mutations = self.mutations.len(), "Persisting");
        Ok(())
    }

    /// Confirm every layer with authoritative rows.
    ///
    /// `authoritative` returns the confirmed value of a row written by a
    /// mutation, `None` if the row is absent. Live queries observe the
    /// confirmation of all collections as one diff.
    pub fn complete(
        &mut self,
        mut authoritative: impl FnMut(&Collection, &Key, &Mutation) -> Option<Value>,
    ) -> Result<()> {
        match self.state {
            TransactionState::Pending | TransactionState::Persisting => {}
            TransactionState::Completed => {
                return Err(Error::TransactionAlreadyCompleted(self.id.to_string()))
            }
            TransactionState::Failed => {
                return Err(Error::TransactionNotPending(self.id.to_string()))
            }
        }

        let applied = &self.applied;
        self.store.batch(|| {
            for layer in applied {
                let rows = layer
                    .mutations
                    .iter()
                    .map(|m| (m.key.clone(), authoritative(&layer.collection, &m.key, m)))
                    .collect();
                layer.collection.confirm(layer.handle, rows)?;
            }
            Ok::<_, Error>(())
        })?;

        self.state = TransactionState::Completed;
        tracing::debug!(transaction = %self.id, "Completed");
        Ok(())
    }

    /// Confirm every layer with the rows the mutations wrote locally.
    pub fn complete_locally(&mut self) -> Result<()> {
        self.complete(|_, _, mutation| match mutation.mutation_type {
            crate::MutationType::Delete => None,
            _ => mutation.modified.clone(),
        })
    }

    /// Remove every layer, newest first.
    ///
    /// Rolling back a failed transaction again is a no-op.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Completed => {
                return Err(Error::TransactionAlreadyCompleted(self.id.to_string()))
            }
            TransactionState::Failed => return Ok(()),
            TransactionState::Pending | TransactionState::Persisting => {}
        }

        let applied = &self.applied;
        let result = self.store.batch(|| {
            let mut first_error = None;
            for layer in applied.iter().rev() {
                if let Err(err) = layer.collection.rollback(layer.handle) {
                    tracing::warn!(
                        collection = %layer.collection.name(),
                        handle = %layer.handle,
                        error = %err,
                        "Failed to roll back layer"
                    );
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        });

        self.state = TransactionState::Failed;
        tracing::debug!(transaction = %self.id, "Rolled back");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let unfinished = matches!(
            self.state,
            TransactionState::Pending | TransactionState::Persisting
        );
        if unfinished && !self.applied.is_empty() {
            tracing::debug!(
                transaction = %self.id,
                state = %self.state,
                "Dropped unfinished transaction"
            );
            let _ = self.rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .field("mutations", &self.mutations)
            .finish()
    }
}
