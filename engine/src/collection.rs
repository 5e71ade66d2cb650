//! Collections: keyed rows with optimistic layers and change subscriptions.
//!
//! A collection's visible state is its confirmed rows overlaid with pending
//! optimistic layers. Every commit computes the diff between the visible
//! state before and after, bumps the version if anything changed, and
//! notifies subscribers once.
//!
//! Commits are serialized store-wide: a write issued from inside a
//! subscriber callback is queued and processed after the current commit has
//! been delivered to every subscriber.

use crate::change::{ChangeMessage, ChangeSet, RowDiagnostic, SyncMessage};
use crate::query::pipeline::{Pipeline, PipelineOutput, SourceChange};
use crate::query::{CollectionConfigBuilder, SortKey};
use crate::reconcile::{LayerRows, OptimisticHandle, OptimisticLayers, Overlay};
use crate::source::{SyncSink, SyncSource, Unsubscribe, Utils};
use crate::store::StoreInner;
use crate::{
    error::Result, ChangeType, CollectionId, CollectionName, CollectionSchema, Error, Key, KeyFn,
    Mutation, Store, Version,
};
use futures::future::{self, LocalBoxFuture, Shared, WeakShared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

/// Lifecycle status of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    /// Not loaded yet, or a load was cancelled
    Idle,
    Loading,
    Ready,
    Error,
}

impl CollectionStatus {
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        use CollectionStatus::*;

        matches!(
            (self, next),
            (Idle, Loading)
                | (Idle, Error)
                | (Loading, Ready)
                | (Loading, Error)
                | (Loading, Idle)
                | (Ready, Error)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Idle => write!(f, "idle"),
            CollectionStatus::Loading => write!(f, "loading"),
            CollectionStatus::Ready => write!(f, "ready"),
            CollectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Configuration of a base collection.
#[derive(Clone)]
pub struct CollectionConfig {
    /// Collection name, unique among live collections of a store
    pub id: CollectionName,
    pub key: KeyFn,
    pub schema: Option<CollectionSchema>,
    pub source: Option<Rc<dyn SyncSource>>,
    pub utils: Utils,
}

impl CollectionConfig {
    pub fn new(id: impl Into<CollectionName>, key: KeyFn) -> Self {
        Self {
            id: id.into(),
            key,
            schema: None,
            source: None,
            utils: Utils::default(),
        }
    }

    pub fn with_schema(mut self, schema: CollectionSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Back the collection by a sync source. The source's capabilities
    /// become the collection's utils.
    pub fn with_source(mut self, source: Rc<dyn SyncSource>) -> Self {
        self.utils = source.utils();
        self.source = Some(source);
        self
    }

    pub fn with_utils(mut self, utils: Utils) -> Self {
        self.utils = utils;
        self
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("source", &self.source.is_some())
            .field("utils", &self.utils)
            .finish()
    }
}

/// Work item applied to one collection's state.
pub(crate) enum Command {
    Optimistic {
        handle: OptimisticHandle,
        mutations: Vec<Mutation>,
    },
    Confirm {
        handle: OptimisticHandle,
        rows: LayerRows,
    },
    Rollback {
        handle: OptimisticHandle,
    },
    Sync(Vec<SyncMessage>),
    /// Initial rows of a preload; completes the load
    Loaded(Vec<Value>),
    Derived(PipelineOutput),
}

/// Ordered index of a derived collection with `order_by`.
#[derive(Default)]
struct OrderIndex {
    ordered: BTreeSet<(SortKey, Key)>,
    sort_of: HashMap<Key, SortKey>,
}

struct CollectionState {
    status: CollectionStatus,
    synced: BTreeMap<Key, Value>,
    layers: OptimisticLayers,
    order: Option<OrderIndex>,
    version: Version,
    /// Feed messages received while the initial fetch is in flight
    buffered: Vec<SyncMessage>,
    feed: Option<Unsubscribe>,
    last_error: Option<Error>,
}

impl CollectionState {
    fn transition(&mut self, collection: &str, next: CollectionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStatusTransition {
                collection: collection.to_string(),
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(collection, from = %self.status, to = %next, "Status transition");
        self.status = next;
        Ok(())
    }

    fn get(&self, key: &Key) -> Option<&Value> {
        match self.layers.overlay(key) {
            Some(Overlay::Upsert(value)) => Some(value),
            Some(Overlay::Deleted) => None,
            None => self.synced.get(key),
        }
    }

    fn keys(&self) -> Vec<Key> {
        if let Some(order) = &self.order {
            return order.ordered.iter().map(|(_, k)| k.clone()).collect();
        }
        if self.layers.is_empty() {
            return self.synced.keys().cloned().collect();
        }
        let mut keys: BTreeSet<&Key> = self.synced.keys().collect();
        keys.extend(self.layers.keys());
        keys.into_iter()
            .filter(|k| self.get(k).is_some())
            .cloned()
            .collect()
    }

    fn snapshot(&self, keys: &BTreeSet<Key>) -> Vec<Option<Value>> {
        keys.iter().map(|k| self.get(k).cloned()).collect()
    }

    /// Diff the visible state of `keys` against `before`.
    fn commit(
        &mut self,
        collection: CollectionId,
        keys: BTreeSet<Key>,
        before: Vec<Option<Value>>,
        diagnostics: Vec<RowDiagnostic>,
    ) -> ChangeSet {
        let changes: Vec<ChangeMessage> = keys
            .iter()
            .zip(before)
            .filter_map(|(key, before)| ChangeMessage::between(key, before, self.get(key).cloned()))
            .collect();

        if !changes.is_empty() {
            self.version += 1;
        }

        ChangeSet {
            collection,
            version: self.version,
            changes,
            diagnostics,
        }
    }

    /// Move settled layers into confirmed state.
    fn settle(&mut self) {
        for (key, value) in self.layers.settle() {
            match value {
                Some(value) => self.synced.insert(key, value),
                None => self.synced.remove(&key),
            };
        }
    }

    fn sync_keys(
        &self,
        collection: &str,
        key_fn: &KeyFn,
        messages: &[SyncMessage],
    ) -> BTreeSet<Key> {
        let mut keys = BTreeSet::new();
        for message in messages {
            match message {
                SyncMessage::Upsert { value } => match key_fn(value) {
                    Some(key) => {
                        keys.insert(key);
                    }
                    None => {
                        tracing::warn!(collection, "Dropping synced row without a key");
                    }
                },
                SyncMessage::Delete { key } => {
                    keys.insert(key.clone());
                }
                SyncMessage::Truncate => {
                    keys.extend(self.synced.keys().cloned());
                    keys.extend(self.layers.confirmed_keys().cloned());
                }
            }
        }
        keys
    }

    /// Write sync messages into confirmed state.
    ///
    /// Feed writes also supersede confirmed layers that have not settled, so
    /// an older confirmation cannot overwrite them. Initial fetch rows do not.
    fn apply_sync(&mut self, key_fn: &KeyFn, messages: Vec<SyncMessage>, from_feed: bool) {
        for message in messages {
            match message {
                SyncMessage::Upsert { value } => {
                    if let Some(key) = key_fn(&value) {
                        if from_feed {
                            self.layers.supersede(&key);
                        }
                        self.synced.insert(key, value);
                    }
                }
                SyncMessage::Delete { key } => {
                    if from_feed {
                        self.layers.supersede(&key);
                    }
                    self.synced.remove(&key);
                }
                SyncMessage::Truncate => {
                    if from_feed {
                        self.layers.supersede_all();
                    }
                    self.synced.clear();
                }
            }
        }
    }

    fn write_derived(&mut self, key: Key, row: Option<(Value, Option<SortKey>)>) {
        if let Some(order) = &mut self.order {
            if let Some(sort) = order.sort_of.remove(&key) {
                order.ordered.remove(&(sort, key.clone()));
            }
        }
        match row {
            Some((value, sort)) => {
                if let (Some(order), Some(sort)) = (&mut self.order, sort) {
                    order.ordered.insert((sort.clone(), key.clone()));
                    order.sort_of.insert(key.clone(), sort);
                }
                self.synced.insert(key, value);
            }
            None => {
                self.synced.remove(&key);
            }
        }
    }
}

struct Subscriber {
    id: u64,
    callback: Rc<RefCell<dyn FnMut(&ChangeSet)>>,
}

/// Live query state of a derived collection.
pub(crate) struct LiveQuery {
    builder: Rc<CollectionConfigBuilder>,
    pipeline: RefCell<Pipeline>,
    /// Source changes not yet run through the pipeline
    pending: RefCell<Vec<SourceChange>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl LiveQuery {
    pub(crate) fn new(builder: Rc<CollectionConfigBuilder>, pipeline: Pipeline) -> Self {
        Self {
            builder,
            pipeline: RefCell::new(pipeline),
            pending: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(Vec::new()),
        }
    }
}

type PreloadFuture = Shared<LocalBoxFuture<'static, Result<()>>>;

pub(crate) struct CollectionInner {
    pub(crate) id: CollectionId,
    pub(crate) name: CollectionName,
    pub(crate) store: Rc<StoreInner>,
    key: KeyFn,
    schema: Option<CollectionSchema>,
    source: Option<Rc<dyn SyncSource>>,
    utils: Utils,
    state: RefCell<CollectionState>,
    subscribers: RefCell<Vec<Subscriber>>,
    next_subscriber: Cell<u64>,
    preload: RefCell<Option<WeakShared<LocalBoxFuture<'static, Result<()>>>>>,
    live: Option<LiveQuery>,
}

impl CollectionInner {
    pub(crate) fn new(
        id: CollectionId,
        store: Rc<StoreInner>,
        config: CollectionConfig,
        live: Option<LiveQuery>,
    ) -> Rc<Self> {
        // Collections without a source have nothing to load
        let status = if config.source.is_some() {
            CollectionStatus::Idle
        } else {
            CollectionStatus::Ready
        };
        let order = live
            .as_ref()
            .filter(|l| l.pipeline.borrow().is_ordered())
            .map(|_| OrderIndex::default());

        Rc::new(Self {
            id,
            name: config.id,
            store,
            key: config.key,
            schema: config.schema,
            source: config.source,
            utils: config.utils,
            state: RefCell::new(CollectionState {
                status,
                synced: BTreeMap::new(),
                layers: OptimisticLayers::default(),
                order,
                version: 0,
                buffered: Vec::new(),
                feed: None,
                last_error: None,
            }),
            subscribers: RefCell::new(Vec::new()),
            next_subscriber: Cell::new(0),
            preload: RefCell::new(None),
            live,
        })
    }

    /// Apply one command and notify subscribers of the resulting diff.
    pub(crate) fn process(&self, command: Command) -> Result<()> {
        let changes = {
            let mut state = self.state.borrow_mut();
            match command {
                Command::Optimistic { handle, mutations } => {
                    let keys: BTreeSet<Key> = mutations.iter().map(|m| m.key.clone()).collect();
                    let before = state.snapshot(&keys);
                    state.layers.push(handle, &mutations);
                    state.commit(self.id, keys, before, Vec::new())
                }
                Command::Confirm { handle, rows } => {
                    let mut keys: BTreeSet<Key> =
                        state.layers.keys_of(handle)?.into_iter().collect();
                    keys.extend(rows.iter().map(|(k, _)| k.clone()));
                    let before = state.snapshot(&keys);
                    state.layers.confirm(handle, rows)?;
                    state.settle();
                    state.commit(self.id, keys, before, Vec::new())
                }
                Command::Rollback { handle } => {
                    let keys: BTreeSet<Key> = state.layers.keys_of(handle)?.into_iter().collect();
                    let before = state.snapshot(&keys);
                    state.layers.rollback(handle)?;
                    state.settle();
                    state.commit(self.id, keys, before, Vec::new())
                }
                Command::Sync(messages) => {
                    let keys = state.sync_keys(&self.name, &self.key, &messages);
                    let before = state.snapshot(&keys);
                    state.apply_sync(&self.key, messages, true);
                    state.commit(self.id, keys, before, Vec::new())
                }
                Command::Loaded(rows) => {
                    state.transition(&self.name, CollectionStatus::Ready)?;
                    state.last_error = None;
                    let initial: Vec<SyncMessage> =
                        rows.into_iter().map(SyncMessage::upsert).collect();
                    let buffered = std::mem::take(&mut state.buffered);
                    let mut keys = state.sync_keys(&self.name, &self.key, &initial);
                    keys.extend(state.sync_keys(&self.name, &self.key, &buffered));
                    let before = state.snapshot(&keys);
                    state.apply_sync(&self.key, initial, false);
                    state.apply_sync(&self.key, buffered, true);
                    state.commit(self.id, keys, before, Vec::new())
                }
                Command::Derived(output) => {
                    let keys: BTreeSet<Key> = output.rows.iter().map(|(k, _)| k.clone()).collect();
                    let before = state.snapshot(&keys);
                    for (key, row) in output.rows {
                        state.write_derived(key, row);
                    }
                    state.commit(self.id, keys, before, output.diagnostics)
                }
            }
        };

        if !changes.is_empty() {
            tracing::debug!(
                collection = %self.name,
                version = changes.version,
                changes = changes.changes.len(),
                "Commit"
            );
            self.emit(&changes);
        }
        Ok(())
    }

    fn emit(&self, changes: &ChangeSet) {
        // Subscribers may subscribe or unsubscribe while being notified
        let callbacks: Vec<_> = self
            .subscribers
            .borrow()
            .iter()
            .map(|s| s.callback.clone())
            .collect();
        for callback in callbacks {
            (&mut *callback.borrow_mut())(changes);
        }
    }

    /// Entry point of a source's change feed.
    pub(crate) fn receive_sync(self: &Rc<Self>, messages: Vec<SyncMessage>) {
        {
            let mut state = self.state.borrow_mut();
            if state.status == CollectionStatus::Loading {
                state.buffered.extend(messages);
                return;
            }
        }
        if let Err(err) = self.store.dispatch(self, Command::Sync(messages)) {
            tracing::warn!(collection = %self.name, error = %err, "Failed to apply synced changes");
        }
    }

    /// Subscribe to the sources of a live query and evaluate it over their
    /// current rows.
    pub(crate) fn attach_sources(self: &Rc<Self>) -> Result<()> {
        let Some(live) = &self.live else {
            return Ok(());
        };

        // A collection bound under several aliases feeds every slot
        let mut by_source: Vec<(Collection, Vec<usize>)> = Vec::new();
        for (slot, (_, source)) in live.builder.query().sources().into_iter().enumerate() {
            match by_source.iter_mut().find(|(c, _)| c.id() == source.id()) {
                Some((_, slots)) => slots.push(slot),
                None => by_source.push((source.clone(), vec![slot])),
            }
        }

        let mut initial = Vec::new();
        let mut subscriptions = Vec::with_capacity(by_source.len());
        for (source, slots) in by_source {
            for (key, value) in source.entries() {
                for &slot in &slots {
                    initial.push(SourceChange {
                        slot,
                        key: key.clone(),
                        value: Some(value.clone()),
                    });
                }
            }

            let derived = Rc::downgrade(self);
            subscriptions.push(source.subscribe(move |changes| {
                if let Some(derived) = derived.upgrade() {
                    derived.receive_source_changes(&slots, changes);
                }
            }));
        }
        *live.subscriptions.borrow_mut() = subscriptions;

        let output = live.pipeline.borrow_mut().process(initial);
        self.store.dispatch(self, Command::Derived(output))
    }

    fn receive_source_changes(self: &Rc<Self>, slots: &[usize], changes: &ChangeSet) {
        let Some(live) = &self.live else {
            return;
        };
        if changes.changes.is_empty() {
            return;
        }

        {
            let mut pending = live.pending.borrow_mut();
            for change in &changes.changes {
                let value = match change.change_type {
                    ChangeType::Delete => None,
                    ChangeType::Insert | ChangeType::Update => Some(change.value.clone()),
                };
                for &slot in slots {
                    pending.push(SourceChange {
                        slot,
                        key: change.key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        let derived = Rc::downgrade(self);
        self.store.schedule(
            self,
            Rc::new(move || {
                if let Some(derived) = derived.upgrade() {
                    derived.run_live_query();
                }
            }),
        );
    }

    fn run_live_query(self: &Rc<Self>) {
        let Some(live) = &self.live else {
            return;
        };
        let pending = std::mem::take(&mut *live.pending.borrow_mut());
        if pending.is_empty() {
            return;
        }

        let output = live.pipeline.borrow_mut().process(pending);
        if let Err(err) = self.store.dispatch(self, Command::Derived(output)) {
            tracing::warn!(
                collection = %self.name,
                error = %err,
                "Failed to commit live query results"
            );
        }
    }

    fn preload(self: &Rc<Self>) -> LocalBoxFuture<'static, Result<()>> {
        if let Some(live) = &self.live {
            let loads: Vec<_> = live.builder.sources().iter().map(Collection::preload).collect();
            return async move { future::try_join_all(loads).await.map(|_| ()) }.boxed_local();
        }

        let Some(source) = self.source.clone() else {
            return future::ready(Ok(())).boxed_local();
        };
        if self.state.borrow().status == CollectionStatus::Ready {
            return future::ready(Ok(())).boxed_local();
        }

        // Join a load in flight; a finished one is never reused
        let in_flight = self
            .preload
            .borrow()
            .as_ref()
            .and_then(WeakShared::upgrade)
            .filter(|shared| shared.peek().is_none());
        if let Some(shared) = in_flight {
            return shared.boxed_local();
        }

        let collection = Rc::downgrade(self);
        let load: PreloadFuture = async move {
            let guard = LoadGuard::start(&collection, &source)?;
            let result = source.fetch_initial().await;
            guard.finish(result)
        }
        .boxed_local()
        .shared();

        *self.preload.borrow_mut() = load.downgrade();
        load.boxed_local()
    }
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.state.get_mut().feed.take() {
            unsubscribe();
        }
        self.store.forget(self.id, &self.name);
        tracing::debug!(collection = %self.name, "Collection dropped");
    }
}

/// Marks a collection as loading for the lifetime of one initial fetch.
///
/// Dropped before completion (the preload was cancelled), it detaches the
/// change feed and returns the collection to `Idle`.
struct LoadGuard {
    collection: Weak<CollectionInner>,
    armed: bool,
}

impl LoadGuard {
    fn start(collection: &Weak<CollectionInner>, source: &Rc<dyn SyncSource>) -> Result<Self> {
        let inner = collection
            .upgrade()
            .ok_or_else(|| Error::Source("collection dropped before loading".into()))?;

        {
            let mut state = inner.state.borrow_mut();
            if state.status == CollectionStatus::Error {
                state.transition(&inner.name, CollectionStatus::Idle)?;
            }
            state.transition(&inner.name, CollectionStatus::Loading)?;
        }

        let unsubscribe = source.subscribe_to_changes(SyncSink {
            collection: collection.clone(),
        });
        inner.state.borrow_mut().feed = Some(unsubscribe);

        Ok(Self {
            collection: collection.clone(),
            armed: true,
        })
    }

    fn finish(mut self, result: Result<Vec<Value>>) -> Result<()> {
        self.armed = false;
        let inner = self
            .collection
            .upgrade()
            .ok_or_else(|| Error::Source("collection dropped while loading".into()))?;

        match result {
            Ok(rows) => {
                let count = rows.len();
                inner.store.dispatch(&inner, Command::Loaded(rows))?;
                tracing::debug!(collection = %inner.name, rows = count, "Initial rows loaded");
                Ok(())
            }
            Err(err) => {
                let feed = {
                    let mut state = inner.state.borrow_mut();
                    state.transition(&inner.name, CollectionStatus::Error)?;
                    state.buffered.clear();
                    state.last_error = Some(err.clone());
                    state.feed.take()
                };
                if let Some(unsubscribe) = feed {
                    unsubscribe();
                }
                tracing::warn!(collection = %inner.name, error = %err, "Initial fetch failed");
                Err(err)
            }
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.collection.upgrade() else {
            return;
        };
        let feed = match inner.state.try_borrow_mut() {
            Ok(mut state) => {
                if state.status == CollectionStatus::Loading {
                    state.status = CollectionStatus::Idle;
                }
                state.buffered.clear();
                state.feed.take()
            }
            Err(_) => None,
        };
        if let Some(unsubscribe) = feed {
            unsubscribe();
        }
        tracing::debug!(collection = %inner.name, "Preload cancelled");
    }
}

/// Handle to a collection.
///
/// Cheap to clone; all clones address the same rows. Dropping the last
/// handle removes the collection from its store.
#[derive(Clone)]
pub struct Collection {
    pub(crate) inner: Rc<CollectionInner>,
}

impl Collection {
    pub(crate) fn from_inner(inner: Rc<CollectionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> CollectionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The store this collection belongs to.
    pub fn store(&self) -> Store {
        Store::from_inner(self.inner.store.clone())
    }

    /// Whether this collection is the output of a live query.
    pub fn is_derived(&self) -> bool {
        self.inner.live.is_some()
    }

    /// Current status. Derived collections report the combined status of
    /// their sources.
    pub fn status(&self) -> CollectionStatus {
        let Some(live) = &self.inner.live else {
            return self.inner.state.borrow().status;
        };
        let statuses: Vec<_> = live.builder.sources().iter().map(Collection::status).collect();
        if statuses.contains(&CollectionStatus::Error) {
            CollectionStatus::Error
        } else if statuses.iter().all(|s| *s == CollectionStatus::Ready) {
            CollectionStatus::Ready
        } else {
            CollectionStatus::Loading
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    /// Error of the last failed preload, if the collection is in `Error`.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.state.borrow().last_error.clone()
    }

    /// Number of commits that changed the visible state.
    pub fn version(&self) -> Version {
        self.inner.state.borrow().version
    }

    /// Visible value of a row.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.state.borrow().get(key).cloned()
    }

    /// Confirmed value of a row, ignoring optimistic layers.
    pub fn synced_value(&self, key: &Key) -> Option<Value> {
        self.inner.state.borrow().synced.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.inner.state.borrow().get(key).is_some()
    }

    /// Visible keys, in result order for ordered live queries and key
    /// order otherwise.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.state.borrow().keys()
    }

    /// Visible rows with their keys, in the order of [`Collection::keys`].
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let state = self.inner.state.borrow();
        state
            .keys()
            .into_iter()
            .filter_map(|k| state.get(&k).cloned().map(|v| (k, v)))
            .collect()
    }

    /// Visible rows, in the order of [`Collection::keys`].
    pub fn to_vec(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// First visible row; the result of a single-result live query.
    pub fn first(&self) -> Option<Value> {
        let state = self.inner.state.borrow();
        state
            .keys()
            .into_iter()
            .find_map(|k| state.get(&k).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.state.borrow().keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of optimistic layers not yet settled.
    pub fn pending_count(&self) -> usize {
        self.inner.state.borrow().layers.len()
    }

    pub fn utils(&self) -> &Utils {
        &self.inner.utils
    }

    pub fn schema(&self) -> Option<&CollectionSchema> {
        self.inner.schema.as_ref()
    }

    /// Configuration this collection was created from.
    pub fn config(&self) -> CollectionConfig {
        CollectionConfig {
            id: self.inner.name.clone(),
            key: self.inner.key.clone(),
            schema: self.inner.schema.clone(),
            source: self.inner.source.clone(),
            utils: self.inner.utils.clone(),
        }
    }

    /// Derive a row's key with the collection's key function.
    pub fn key_of(&self, row: &Value) -> Option<Key> {
        (self.inner.key)(row)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_derived() {
            return Err(Error::DerivedCollectionReadOnly(self.inner.name.clone()));
        }
        Ok(())
    }

    fn validate(&self, row: &Value) -> Result<()> {
        match &self.inner.schema {
            Some(schema) => schema.validate_row(row),
            None => Ok(()),
        }
    }

    /// Prepare an insert of a new row.
    pub fn prepare_insert(&self, value: Value) -> Result<Mutation> {
        self.ensure_writable()?;
        let key = self
            .key_of(&value)
            .ok_or_else(|| Error::UndefinedKey(self.inner.name.clone()))?;
        if self.has(&key) {
            return Err(Error::DuplicateKey(key));
        }
        self.validate(&value)?;
        Ok(Mutation::insert(self.inner.id, key, value))
    }

    /// Prepare an update by editing a draft of the visible row.
    pub fn prepare_update(&self, key: &Key, edit: impl FnOnce(&mut Value)) -> Result<Mutation> {
        self.ensure_writable()?;
        let original = self
            .get(key)
            .ok_or_else(|| Error::UpdateKeyNotFound(key.clone()))?;

        let mut draft = original.clone();
        edit(&mut draft);

        match self.key_of(&draft) {
            Some(next) if &next == key => {}
            next => {
                return Err(Error::KeyUpdateNotAllowed {
                    from: key.clone(),
                    to: next.unwrap_or(Key::Null),
                })
            }
        }
        self.validate(&draft)?;
        Ok(Mutation::update(self.inner.id, key.clone(), original, draft))
    }

    /// Prepare a delete of a visible row.
    pub fn prepare_delete(&self, key: &Key) -> Result<Mutation> {
        self.ensure_writable()?;
        let original = self
            .get(key)
            .ok_or_else(|| Error::DeleteKeyNotFound(key.clone()))?;
        Ok(Mutation::delete(self.inner.id, key.clone(), original))
    }

    /// Apply mutations as a new optimistic layer and notify subscribers.
    pub fn apply_optimistic(&self, mutations: Vec<Mutation>) -> Result<OptimisticHandle> {
        self.ensure_writable()?;
        for mutation in &mutations {
            if mutation.collection != self.inner.id {
                return Err(Error::MutationCollectionMismatch {
                    expected: self.inner.id,
                    actual: mutation.collection,
                });
            }
            if let Some(schema) = &self.inner.schema {
                schema.validate_mutation(mutation)?;
            }
        }

        let handle = self.inner.store.next_handle();
        self.inner.store.dispatch(
            &self.inner,
            Command::Optimistic { handle, mutations },
        )?;
        Ok(handle)
    }

    /// Replace an optimistic layer with authoritative rows.
    ///
    /// The rows reach confirmed state once every earlier layer of this
    /// collection has been confirmed or rolled back.
    pub fn confirm(&self, handle: OptimisticHandle, rows: LayerRows) -> Result<()> {
        self.ensure_writable()?;
        self.inner
            .store
            .dispatch(&self.inner, Command::Confirm { handle, rows })
    }

    /// Discard an optimistic layer.
    pub fn rollback(&self, handle: OptimisticHandle) -> Result<()> {
        self.ensure_writable()?;
        self.inner
            .store
            .dispatch(&self.inner, Command::Rollback { handle })
    }

    /// Write confirmed changes directly, as a source's change feed would.
    pub fn write_synced(&self, messages: Vec<SyncMessage>) -> Result<()> {
        self.ensure_writable()?;
        self.inner.store.dispatch(&self.inner, Command::Sync(messages))
    }

    /// Listen to change sets. Dropping the returned guard unsubscribes.
    pub fn subscribe(&self, callback: impl FnMut(&ChangeSet) + 'static) -> Subscription {
        let id = self.inner.next_subscriber.get();
        self.inner.next_subscriber.set(id + 1);
        self.inner.subscribers.borrow_mut().push(Subscriber {
            id,
            callback: Rc::new(RefCell::new(callback)),
        });
        Subscription {
            collection: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Like [`Collection::subscribe`], but first delivers the current rows
    /// as inserts.
    pub fn subscribe_with_state(
        &self,
        mut callback: impl FnMut(&ChangeSet) + 'static,
    ) -> Subscription {
        let initial = ChangeSet {
            collection: self.inner.id,
            version: self.version(),
            changes: self
                .entries()
                .into_iter()
                .filter_map(|(key, value)| ChangeMessage::between(&key, None, Some(value)))
                .collect(),
            diagnostics: Vec::new(),
        };
        callback(&initial);
        self.subscribe(callback)
    }

    /// Load the collection's initial rows.
    ///
    /// Concurrent calls share one load. A failed load moves the collection
    /// to `Error` and is only retried by calling `preload` again. For a
    /// derived collection this preloads every source.
    pub fn preload(&self) -> LocalBoxFuture<'static, Result<()>> {
        self.inner.preload()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Collection {}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("derived", &self.is_derived())
            .finish()
    }
}

/// Subscription guard returned by [`Collection::subscribe`].
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    collection: Weak<CollectionInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        self.collection
            .upgrade()
            .is_some_and(|c| c.subscribers.borrow().iter().any(|s| s.id == self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.collection.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.try_borrow_mut() {
                subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
