//! In-memory backend.
//!
//! Stands in for a remote database with a change feed. Tables hold the
//! authoritative rows; every remote write is assigned a monotonically
//! increasing txid and its changes are queued for delivery to the change
//! feeds of the table's subscribers. Delivery is either immediate or driven
//! by the caller, which lets tests interleave feed traffic with commits.

use crate::error::RemoteError;
use crate::executor::{MutationBatch, MutationHandler, PersistFuture};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use livequery_engine::{
    Capability, Error, Key, MutationType, SyncMessage, SyncSink, SyncSource, Txid, Unsubscribe,
    Utils,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// When queued feed messages reach subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Deliver as part of the remote write
    #[default]
    Auto,
    /// Deliver on [`MemoryBackend::deliver_next`] / [`MemoryBackend::deliver_all`]
    Manual,
}

/// Server-side rewrite applied to every written row.
pub type RowTransform = Rc<dyn Fn(&str, Value) -> Value>;

struct Table {
    key_field: String,
    rows: BTreeMap<Key, Value>,
    sinks: Vec<(u64, SyncSink)>,
}

impl Table {
    fn key_of(&self, row: &Value) -> Option<Key> {
        row.get(&self.key_field).and_then(Key::from_value)
    }
}

/// Feed messages of one remote write, awaiting delivery.
struct Outgoing {
    txid: u64,
    messages: Vec<(String, Vec<SyncMessage>)>,
}

#[derive(Default)]
struct BackendInner {
    tables: RefCell<HashMap<String, Table>>,
    next_txid: Cell<u64>,
    next_sink: Cell<u64>,
    delivered: RefCell<BTreeSet<u64>>,
    delivered_notify: Notify,
    outbox: RefCell<VecDeque<Outgoing>>,
    delivery: Cell<Delivery>,
    latency: Cell<Option<Duration>>,
    fail_mutation: RefCell<Option<String>>,
    fail_fetch: RefCell<Option<String>>,
    transform: RefCell<Option<RowTransform>>,
    /// Sinks unsubscribed while the tables were borrowed
    detached: RefCell<Vec<(String, u64)>>,
}

/// Shared handle to an in-memory backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Rc<BackendInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery(delivery: Delivery) -> Self {
        let backend = Self::new();
        backend.set_delivery(delivery);
        backend
    }

    pub fn set_delivery(&self, delivery: Delivery) {
        self.inner.delivery.set(delivery);
    }

    /// Delay every remote write and fetch.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.latency.set(latency);
    }

    /// Rewrite rows as the server stores them, e.g. to fill defaults.
    pub fn set_transform(&self, transform: impl Fn(&str, Value) -> Value + 'static) {
        *self.inner.transform.borrow_mut() = Some(Rc::new(transform));
    }

    /// Fail the next remote write with `message`.
    pub fn fail_next_mutation(&self, message: impl Into<String>) {
        *self.inner.fail_mutation.borrow_mut() = Some(message.into());
    }

    /// Fail the next fetch or refetch with `message`.
    pub fn fail_next_fetch(&self, message: impl Into<String>) {
        *self.inner.fail_fetch.borrow_mut() = Some(message.into());
    }

    /// Source for a table, creating the table if needed.
    ///
    /// The source exposes both `await_txid` and `refetch`.
    pub fn table(&self, name: impl Into<String>, key_field: impl Into<String>) -> MemoryTable {
        let name = name.into();
        self.inner
            .tables
            .borrow_mut()
            .entry(name.clone())
            .or_insert_with(|| Table {
                key_field: key_field.into(),
                rows: BTreeMap::new(),
                sinks: Vec::new(),
            });
        MemoryTable {
            backend: self.clone(),
            name,
            capabilities: vec![Capability::AwaitTxid, Capability::Refetch],
        }
    }

    /// Authoritative rows of a table, in key order.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .tables
            .borrow()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        self.prune();
        self.inner
            .tables
            .borrow()
            .get(table)
            .map_or(0, |t| t.sinks.len())
    }

    /// Write a row as another client would, and push it to the feed now.
    pub fn server_upsert(&self, table: &str, row: Value) -> Result<(), RemoteError> {
        let row = self.transformed(table, row);
        {
            let mut tables = self.inner.tables.borrow_mut();
            let t = tables
                .get_mut(table)
                .ok_or_else(|| RemoteError::new(format!("unknown table {table}")))?;
            let key = t
                .key_of(&row)
                .ok_or_else(|| RemoteError::new(format!("row without key in {table}")))?;
            t.rows.insert(key, row.clone());
        }
        self.broadcast(table, vec![SyncMessage::upsert(row)]);
        Ok(())
    }

    /// Delete a row as another client would, and push it to the feed now.
    pub fn server_delete(&self, table: &str, key: &Key) -> Result<(), RemoteError> {
        let removed = self
            .inner
            .tables
            .borrow_mut()
            .get_mut(table)
            .ok_or_else(|| RemoteError::new(format!("unknown table {table}")))?
            .rows
            .remove(key);
        if removed.is_some() {
            self.broadcast(table, vec![SyncMessage::delete(key.clone())]);
        }
        Ok(())
    }

    /// Number of remote writes whose feed messages are still queued.
    pub fn pending_deliveries(&self) -> usize {
        self.inner.outbox.borrow().len()
    }

    pub fn is_delivered(&self, txid: &Txid) -> bool {
        txid.0
            .parse::<u64>()
            .is_ok_and(|n| self.inner.delivered.borrow().contains(&n))
    }

    /// Deliver the feed messages of the oldest queued write.
    pub fn deliver_next(&self) -> Option<Txid> {
        let outgoing = self.inner.outbox.borrow_mut().pop_front()?;
        for (table, messages) in outgoing.messages {
            self.broadcast(&table, messages);
        }
        self.inner.delivered.borrow_mut().insert(outgoing.txid);
        self.inner.delivered_notify.notify_waiters();
        tracing::debug!(txid = outgoing.txid, "Delivered");
        Some(Txid::from(outgoing.txid))
    }

    /// Deliver every queued write, oldest first.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next().is_some() {
            delivered += 1;
        }
        delivered
    }

    /// Resolve once the feed messages of `txid` have been delivered.
    pub fn await_txid(&self, txid: Txid) -> LocalBoxFuture<'static, Result<(), Error>> {
        let inner = self.inner.clone();
        async move {
            let target = txid
                .0
                .parse::<u64>()
                .map_err(|_| Error::Source(format!("unknown txid {txid}")))?;
            loop {
                let notified = inner.delivered_notify.notified();
                if inner.delivered.borrow().contains(&target) {
                    return Ok(());
                }
                notified.await;
            }
        }
        .boxed_local()
    }

    async fn apply_batch(&self, batch: MutationBatch) -> Result<Vec<Txid>, RemoteError> {
        self.sleep().await;
        if let Some(message) = self.inner.fail_mutation.borrow_mut().take() {
            tracing::debug!(
                transaction = %batch.transaction_id,
                %message,
                "Injected mutation failure"
            );
            return Err(RemoteError::new(message));
        }

        let rows: Vec<(String, MutationType, Key, Option<Value>)> = batch
            .mutations
            .into_iter()
            .map(|m| {
                let table = m.collection_name;
                let modified = m
                    .mutation
                    .modified
                    .map(|row| self.transformed(&table, row));
                (table, m.mutation.mutation_type, m.mutation.key, modified)
            })
            .collect();

        let messages = {
            let mut tables = self.inner.tables.borrow_mut();
            for (table, mutation_type, key, _) in &rows {
                let t = tables
                    .get(table)
                    .ok_or_else(|| RemoteError::new(format!("unknown table {table}")))?;
                if *mutation_type == MutationType::Insert && t.rows.contains_key(key) {
                    return Err(RemoteError::new(format!("duplicate key {key} in {table}")));
                }
            }

            let mut messages: Vec<(String, Vec<SyncMessage>)> = Vec::new();
            for (table, _, key, modified) in rows {
                let Some(t) = tables.get_mut(&table) else {
                    continue;
                };
                let message = match modified {
                    Some(row) => {
                        t.rows.insert(key, row.clone());
                        SyncMessage::upsert(row)
                    }
                    None => {
                        t.rows.remove(&key);
                        SyncMessage::delete(key)
                    }
                };
                match messages.iter_mut().find(|(name, _)| *name == table) {
                    Some((_, batch)) => batch.push(message),
                    None => messages.push((table, vec![message])),
                }
            }
            messages
        };

        let txid = self.inner.next_txid.get() + 1;
        self.inner.next_txid.set(txid);
        self.inner
            .outbox
            .borrow_mut()
            .push_back(Outgoing { txid, messages });
        tracing::debug!(transaction = %batch.transaction_id, txid, "Remote write applied");

        if self.inner.delivery.get() == Delivery::Auto {
            self.deliver_all();
        }
        Ok(vec![Txid::from(txid)])
    }

    async fn fetch(&self, table: &str) -> Result<Vec<Value>, Error> {
        self.sleep().await;
        if let Some(message) = self.inner.fail_fetch.borrow_mut().take() {
            return Err(Error::Source(message));
        }
        match self.inner.tables.borrow().get(table) {
            Some(t) => Ok(t.rows.values().cloned().collect()),
            None => Err(Error::Source(format!("unknown table {table}"))),
        }
    }

    async fn sleep(&self) {
        if let Some(latency) = self.inner.latency.get() {
            tokio::time::sleep(latency).await;
        }
    }

    fn transformed(&self, table: &str, row: Value) -> Value {
        let transform = self.inner.transform.borrow().clone();
        match transform {
            Some(transform) => transform(table, row),
            None => row,
        }
    }

    fn broadcast(&self, table: &str, messages: Vec<SyncMessage>) {
        self.prune();
        let sinks: Vec<SyncSink> = match self.inner.tables.borrow().get(table) {
            Some(t) => t.sinks.iter().map(|(_, sink)| sink.clone()).collect(),
            None => return,
        };
        tracing::debug!(
            table,
            messages = messages.len(),
            recipients = sinks.len(),
            "Broadcast"
        );
        for sink in sinks {
            sink.write(messages.clone());
        }
    }

    fn register(&self, table: &str, sink: SyncSink) -> u64 {
        self.prune();
        let id = self.inner.next_sink.get();
        self.inner.next_sink.set(id + 1);
        if let Some(t) = self.inner.tables.borrow_mut().get_mut(table) {
            t.sinks.push((id, sink));
        }
        tracing::debug!(table, sink = id, "Feed subscribed");
        id
    }

    fn unregister(&self, table: &str, id: u64) {
        match self.inner.tables.try_borrow_mut() {
            Ok(mut tables) => {
                if let Some(t) = tables.get_mut(table) {
                    t.sinks.retain(|(sink, _)| *sink != id);
                }
                tracing::debug!(table, sink = id, "Feed unsubscribed");
            }
            Err(_) => {
                tracing::debug!(table, sink = id, "Tables busy, deferring unsubscribe");
                self.inner
                    .detached
                    .borrow_mut()
                    .push((table.to_string(), id));
            }
        }
    }

    /// Remove sinks whose unsubscribe was deferred by `unregister`.
    fn prune(&self) {
        let detached = std::mem::take(&mut *self.inner.detached.borrow_mut());
        for (table, id) in detached {
            self.unregister(&table, id);
        }
    }
}

impl MutationHandler for MemoryBackend {
    fn persist(&self, batch: MutationBatch) -> PersistFuture {
        let backend = self.clone();
        async move { backend.apply_batch(batch).await }.boxed_local()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tables: Vec<_> = self.inner.tables.borrow().keys().cloned().collect();
        tables.sort();
        f.debug_struct("MemoryBackend")
            .field("tables", &tables)
            .field("next_txid", &self.inner.next_txid.get())
            .field("pending_deliveries", &self.pending_deliveries())
            .field("delivery", &self.inner.delivery.get())
            .finish()
    }
}

/// A [`SyncSource`] reading one table of a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryTable {
    backend: MemoryBackend,
    name: String,
    capabilities: Vec<Capability>,
}

impl MemoryTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restrict the capabilities the source exposes.
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn into_source(self) -> Rc<dyn SyncSource> {
        Rc::new(self)
    }

    fn refetch(&self) -> LocalBoxFuture<'static, Result<(), Error>> {
        let backend = self.backend.clone();
        let name = self.name.clone();
        async move {
            let rows = backend.fetch(&name).await?;
            let mut messages = Vec::with_capacity(rows.len() + 1);
            messages.push(SyncMessage::Truncate);
            messages.extend(rows.into_iter().map(SyncMessage::upsert));
            backend.broadcast(&name, messages);
            Ok(())
        }
        .boxed_local()
    }
}

impl SyncSource for MemoryTable {
    fn fetch_initial(&self) -> LocalBoxFuture<'static, Result<Vec<Value>, Error>> {
        let backend = self.backend.clone();
        let name = self.name.clone();
        async move { backend.fetch(&name).await }.boxed_local()
    }

    fn subscribe_to_changes(&self, sink: SyncSink) -> Unsubscribe {
        let id = self.backend.register(&self.name, sink);
        let backend = self.backend.clone();
        let name = self.name.clone();
        Box::new(move || backend.unregister(&name, id))
    }

    fn utils(&self) -> Utils {
        let mut utils = Utils::default();
        if self.capabilities.contains(&Capability::AwaitTxid) {
            let backend = self.backend.clone();
            utils = utils.with_await_txid(Rc::new(move |txid| backend.await_txid(txid)));
        }
        if self.capabilities.contains(&Capability::Refetch) {
            let table = self.clone();
            utils = utils.with_refetch(Rc::new(move || table.refetch()));
        }
        utils
    }
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BatchMutation;
    use chrono::Utc;
    use livequery_engine::{field_key, CollectionConfig, CollectionId, Mutation, Store};
    use serde_json::json;
    use uuid::Uuid;

    fn batch(mutations: Vec<(&str, Mutation)>) -> MutationBatch {
        MutationBatch {
            transaction_id: Uuid::new_v4(),
            created_at: Utc::now(),
            mutations: mutations
                .into_iter()
                .map(|(table, mutation)| BatchMutation {
                    collection_name: table.to_string(),
                    mutation,
                })
                .collect(),
        }
    }

    fn insert(id: &str) -> Mutation {
        Mutation::insert(CollectionId(1), Key::from(id), json!({"id": id}))
    }

    #[tokio::test]
    async fn txids_increase_per_write() {
        let backend = MemoryBackend::new();
        backend.table("todos", "id");

        let first = backend.persist(batch(vec![("todos", insert("1"))])).await;
        let second = backend.persist(batch(vec![("todos", insert("2"))])).await;
        assert_eq!(first, Ok(vec![Txid::from(1)]));
        assert_eq!(second, Ok(vec![Txid::from(2)]));
        assert_eq!(backend.rows("todos").len(), 2);
        assert!(backend.is_delivered(&Txid::from(2)));
    }

    #[tokio::test]
    async fn manual_delivery_queues_writes() {
        let backend = MemoryBackend::with_delivery(Delivery::Manual);
        backend.table("todos", "id");

        backend
            .persist(batch(vec![("todos", insert("1"))]))
            .await
            .unwrap();
        assert_eq!(backend.pending_deliveries(), 1);
        assert!(!backend.is_delivered(&Txid::from(1)));

        assert_eq!(backend.deliver_next(), Some(Txid::from(1)));
        assert!(backend.is_delivered(&Txid::from(1)));
        assert_eq!(backend.deliver_next(), None);
    }

    #[tokio::test]
    async fn unknown_tables_reject_the_whole_batch() {
        let backend = MemoryBackend::new();
        backend.table("todos", "id");

        let result = backend
            .persist(batch(vec![("todos", insert("1")), ("missing", insert("2"))]))
            .await;
        assert_eq!(result, Err(RemoteError::new("unknown table missing")));
        assert!(backend.rows("todos").is_empty());
        assert_eq!(backend.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let backend = MemoryBackend::new();
        let table = backend.table("todos", "id");

        backend.fail_next_mutation("NetworkError");
        let result = backend.persist(batch(vec![("todos", insert("1"))])).await;
        assert_eq!(result, Err(RemoteError::new("NetworkError")));
        assert!(backend
            .persist(batch(vec![("todos", insert("1"))]))
            .await
            .is_ok());

        backend.fail_next_fetch("offline");
        assert_eq!(
            table.fetch_initial().await,
            Err(Error::Source("offline".into()))
        );
        assert_eq!(table.fetch_initial().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transform_rewrites_stored_rows() {
        let backend = MemoryBackend::new();
        backend.table("todos", "id");
        backend.set_transform(|_, mut row| {
            row["createdBy"] = json!("server");
            row
        });

        backend
            .persist(batch(vec![("todos", insert("1"))]))
            .await
            .unwrap();
        assert_eq!(
            backend.rows("todos"),
            vec![json!({"id": "1", "createdBy": "server"})]
        );
    }

    #[tokio::test]
    async fn await_txid_resolves_on_delivery() {
        let backend = MemoryBackend::with_delivery(Delivery::Manual);
        backend.table("todos", "id");
        backend
            .persist(batch(vec![("todos", insert("1"))]))
            .await
            .unwrap();

        let waiting = backend.await_txid(Txid::from(1));
        let (result, delivered) = tokio::join!(waiting, async {
            tokio::task::yield_now().await;
            backend.deliver_next()
        });
        assert_eq!(result, Ok(()));
        assert_eq!(delivered, Some(Txid::from(1)));

        assert!(backend.await_txid(Txid::from("abc")).await.is_err());
    }

    #[test]
    fn capabilities_are_configurable() {
        let backend = MemoryBackend::new();
        let table = backend.table("todos", "id");
        let utils = table.utils();
        assert!(utils.supports(Capability::AwaitTxid));
        assert!(utils.supports(Capability::Refetch));

        let utils = table.with_capabilities(&[Capability::Refetch]).utils();
        assert!(!utils.supports(Capability::AwaitTxid));
        assert!(utils.supports(Capability::Refetch));
    }

    #[tokio::test]
    async fn unsubscribe_while_tables_are_borrowed_is_deferred() {
        let backend = MemoryBackend::new();
        let table = backend.table("todos", "id");
        let store = Store::new();
        let todos = store
            .create_collection(
                CollectionConfig::new("todos", field_key("id")).with_source(table.into_source()),
            )
            .unwrap();
        todos.preload().await.unwrap();
        assert_eq!(backend.subscriber_count("todos"), 1);

        {
            let _tables = backend.inner.tables.borrow();
            drop(todos);
        }
        assert_eq!(backend.inner.detached.borrow().len(), 1);

        assert_eq!(backend.subscriber_count("todos"), 0);
        assert!(backend.inner.detached.borrow().is_empty());
    }
}
