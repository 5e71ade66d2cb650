//! Transaction commit executor.
//!
//! Drives a [`Transaction`] through the remote write protocol:
//!
//! 1. The transaction stops accepting writes and its mutations are handed to
//!    a [`MutationHandler`], which returns the sync tokens of the remote write.
//! 2. Every written collection waits until its source has observed the
//!    tokens (`await_txid`), or re-fetches its rows (`refetch`) if it cannot
//!    wait for tokens. Collections with neither capability are confirmed with
//!    the locally written rows.
//! 3. A collection whose initial load has not finished is loaded first, so
//!    feed rows held back during the load reach confirmed state.
//! 4. The transaction is completed with the rows now confirmed by the
//!    sources. Any failure or timeout rolls the whole transaction back.

use crate::error::{RemoteError, Result, SyncError};
use crate::Config;
use chrono::{DateTime, Utc};
use futures::future::{self, AbortHandle, LocalBoxFuture};
use futures::FutureExt;
use livequery_engine::{
    Collection, CollectionId, CollectionName, Mutation, MutationType, Transaction, Txid,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use uuid::Uuid;

/// One mutation as sent to the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMutation {
    /// Name of the target collection
    pub collection_name: CollectionName,
    #[serde(flatten)]
    pub mutation: Mutation,
}

/// The mutations of one transaction, as handed to a [`MutationHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationBatch {
    pub transaction_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mutations: Vec<BatchMutation>,
}

impl MutationBatch {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let collections = tx.collections();
        let name_of = |id: CollectionId| {
            collections
                .iter()
                .find(|c| c.id() == id)
                .map(|c| c.name().to_string())
                .unwrap_or_default()
        };

        Self {
            transaction_id: tx.id(),
            created_at: tx.created_at(),
            mutations: tx
                .mutations()
                .iter()
                .map(|m| BatchMutation {
                    collection_name: name_of(m.collection),
                    mutation: m.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Performs the remote write of a transaction.
///
/// Resolves once the write has been dispatched, with the sync tokens that
/// identify it in the sources' change feeds.
pub trait MutationHandler {
    fn persist(&self, batch: MutationBatch) -> PersistFuture;
}

/// Future returned by [`MutationHandler::persist`].
pub type PersistFuture =
    LocalBoxFuture<'static, std::result::Result<Vec<Txid>, RemoteError>>;

impl<F, Fut> MutationHandler for F
where
    F: Fn(MutationBatch) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<Txid>, RemoteError>> + 'static,
{
    fn persist(&self, batch: MutationBatch) -> PersistFuture {
        self(batch).boxed_local()
    }
}

/// How a collection's rows were confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Confirmation {
    /// The source observed every sync token
    AwaitedTxid,
    /// The source re-fetched its rows
    Refetched,
    /// No capability to wait on; the local rows were kept
    Local,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub transaction_id: Uuid,
    pub txids: Vec<Txid>,
    pub collections: Vec<(CollectionName, Confirmation)>,
}

/// Commits transactions through a [`MutationHandler`].
pub struct TransactionExecutor<H> {
    handler: H,
    config: Config,
}

impl<H: MutationHandler> TransactionExecutor<H> {
    pub fn new(handler: H, config: Config) -> Self {
        Self { handler, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Persist a transaction and reconcile its optimistic writes.
    ///
    /// On error the transaction has been rolled back. Dropping the returned
    /// future before it completes also rolls the transaction back.
    pub async fn commit(&self, mut tx: Transaction) -> Result<CommitReport> {
        tx.begin_persisting()?;
        let batch = MutationBatch::from_transaction(&tx);
        let transaction_id = tx.id();

        let txids = if batch.is_empty() {
            Vec::new()
        } else {
            match self.handler.persist(batch).await {
                Ok(txids) => txids,
                Err(err) => {
                    tracing::info!(
                        transaction = %transaction_id,
                        error = %err,
                        "Remote mutation failed, rolling back"
                    );
                    return Err(rollback(&mut tx, err.into()));
                }
            }
        };

        let collections = tx.collections();
        let confirmations = future::try_join_all(
            collections
                .iter()
                .map(|collection| self.reconcile(collection, &txids)),
        )
        .await;
        let confirmations = match confirmations {
            Ok(confirmations) => confirmations,
            Err(err) => {
                tracing::info!(
                    transaction = %transaction_id,
                    error = %err,
                    "Reconciliation failed, rolling back"
                );
                return Err(rollback(&mut tx, err));
            }
        };

        let synced: HashSet<CollectionId> = collections
            .iter()
            .zip(&confirmations)
            .filter(|(_, confirmation)| **confirmation != Confirmation::Local)
            .map(|(collection, _)| collection.id())
            .collect();

        let completed = tx.complete(|collection, key, mutation| {
            if synced.contains(&collection.id()) {
                collection.synced_value(key)
            } else {
                match mutation.mutation_type {
                    MutationType::Delete => None,
                    MutationType::Insert | MutationType::Update => mutation.modified.clone(),
                }
            }
        });
        if let Err(err) = completed {
            return Err(rollback(&mut tx, err.into()));
        }

        tracing::info!(
            transaction = %transaction_id,
            mutations = tx.mutations().len(),
            txids = txids.len(),
            "Transaction committed"
        );

        Ok(CommitReport {
            transaction_id,
            txids,
            collections: collections
                .iter()
                .map(|c| c.name().to_string())
                .zip(confirmations)
                .collect(),
        })
    }

    /// Like [`TransactionExecutor::commit`], with a handle that cancels the
    /// commit and rolls the transaction back.
    pub fn commit_cancellable(
        &self,
        tx: Transaction,
    ) -> (impl Future<Output = Result<CommitReport>> + '_, AbortHandle) {
        let (commit, handle) = future::abortable(self.commit(tx));
        let commit = async move {
            commit.await.unwrap_or_else(|_| {
                tracing::info!("Commit cancelled");
                Err(SyncError::Cancelled)
            })
        };
        (commit, handle)
    }

    async fn reconcile(&self, collection: &Collection, txids: &[Txid]) -> Result<Confirmation> {
        let confirmation = self.observe(collection, txids).await?;
        self.await_load(collection).await?;
        Ok(confirmation)
    }

    /// Wait for an unfinished initial load, joining one in flight.
    ///
    /// Until the load lands, feed rows are held back from confirmed state and
    /// confirming against it would drop the written rows.
    async fn await_load(&self, collection: &Collection) -> Result<()> {
        if collection.is_ready() {
            return Ok(());
        }
        tracing::debug!(
            collection = %collection.name(),
            status = %collection.status(),
            "Waiting for initial load before confirming"
        );
        match tokio::time::timeout(self.config.refetch_timeout, collection.preload()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::LoadTimeout(collection.name().to_string())),
        }
    }

    async fn observe(&self, collection: &Collection, txids: &[Txid]) -> Result<Confirmation> {
        let utils = collection.utils();

        if let Some(await_txid) = utils.await_txid.as_ref().filter(|_| !txids.is_empty()) {
            for txid in txids {
                match tokio::time::timeout(self.config.txid_timeout, await_txid(txid.clone())).await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SyncError::TxidTimeout {
                            collection: collection.name().to_string(),
                            txid: txid.clone(),
                        })
                    }
                }
            }
            tracing::debug!(
                collection = %collection.name(),
                txids = txids.len(),
                "Sync tokens observed"
            );
            return Ok(Confirmation::AwaitedTxid);
        }

        if let Some(refetch) = &utils.refetch {
            match tokio::time::timeout(self.config.refetch_timeout, refetch()).await {
                Ok(result) => result?,
                Err(_) => return Err(SyncError::RefetchTimeout(collection.name().to_string())),
            }
            tracing::debug!(collection = %collection.name(), "Refetched");
            return Ok(Confirmation::Refetched);
        }

        Ok(Confirmation::Local)
    }
}

fn rollback(tx: &mut Transaction, err: SyncError) -> SyncError {
    if let Err(rollback_err) = tx.rollback() {
        tracing::warn!(transaction = %tx.id(), error = %rollback_err, "Rollback failed");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use livequery_engine::{field_key, CollectionConfig, Key, Store, SyncMessage};
    use serde_json::json;

    fn todos(store: &Store) -> Collection {
        store
            .create_collection(CollectionConfig::new("todos", field_key("id")))
            .unwrap()
    }

    #[test]
    fn batch_carries_collection_names() {
        let store = Store::new();
        let todos = todos(&store);
        let mut tx = store.transaction();
        tx.insert(&todos, json!({"id": "1"})).unwrap();

        let batch = MutationBatch::from_transaction(&tx);
        assert_eq!(batch.transaction_id, tx.id());
        assert_eq!(batch.mutations.len(), 1);
        assert_eq!(batch.mutations[0].collection_name, "todos");

        let encoded = serde_json::to_value(&batch).unwrap();
        assert_eq!(encoded["mutations"][0]["collectionName"], json!("todos"));
        assert_eq!(encoded["mutations"][0]["type"], json!("insert"));
    }

    #[tokio::test]
    async fn local_collections_confirm_written_rows() {
        let store = Store::new();
        let todos = todos(&store);
        todos
            .write_synced(vec![SyncMessage::upsert(json!({"id": "1", "done": false}))])
            .unwrap();

        let executor = TransactionExecutor::new(
            |_batch: MutationBatch| async { Ok::<_, RemoteError>(vec![Txid::from(1)]) },
            Config::default(),
        );
        let mut tx = store.transaction();
        tx.update(&todos, &Key::from("1"), |row| row["done"] = json!(true))
            .unwrap();

        let report = executor.commit(tx).await.unwrap();
        assert_eq!(
            report.collections,
            vec![("todos".to_string(), Confirmation::Local)]
        );
        assert_eq!(todos.synced_value(&Key::from("1")).unwrap()["done"], json!(true));
        assert_eq!(todos.pending_count(), 0);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back() {
        let store = Store::new();
        let todos = todos(&store);
        let executor = TransactionExecutor::new(
            |_batch: MutationBatch| async { Err::<Vec<Txid>, _>(RemoteError::new("NetworkError")) },
            Config::default(),
        );

        let mut tx = store.transaction();
        tx.insert(&todos, json!({"id": "1"})).unwrap();
        assert!(todos.has(&Key::from("1")));

        let err = executor.commit(tx).await.unwrap_err();
        assert_eq!(err, SyncError::Remote(RemoteError::new("NetworkError")));
        assert!(todos.is_empty());
    }

    #[tokio::test]
    async fn empty_transactions_skip_the_handler() {
        let store = Store::new();
        let executor = TransactionExecutor::new(
            |_batch: MutationBatch| async { Err::<Vec<Txid>, _>(RemoteError::new("unreachable")) },
            Config::default(),
        );
        let report = executor.commit(store.transaction()).await.unwrap();
        assert!(report.txids.is_empty());
        assert!(report.collections.is_empty());
    }
}
