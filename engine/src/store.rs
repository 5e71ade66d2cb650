//! Store - the runtime context shared by a set of collections.
//!
//! The store allocates collection ids and optimistic handles, owns the
//! builder registry and the live query scheduler, and serializes commits:
//! a command issued while another commit is being delivered is queued and
//! processed once delivery completes. Scheduled live query runs are flushed
//! after the outermost commit or [`Store::batch`] returns.

use crate::collection::{CollectionInner, Command, LiveQuery};
use crate::query::{CollectionConfigBuilder, Query};
use crate::registry::{BuilderLookup, CollectionRegistry};
use crate::scheduler::{Job, Scheduler};
use crate::{
    error::Result, Collection, CollectionConfig, CollectionId, CollectionName, Error,
    OptimisticHandle, Transaction, Utils,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

/// Sets a flag for the lifetime of the guard.
struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Holds one level of [`Store::batch`] nesting, released even on unwind.
struct DepthGuard<'a>(&'a Cell<usize>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

pub(crate) struct StoreInner {
    next_collection: Cell<u64>,
    next_handle: Cell<u64>,
    next_transaction: Cell<u64>,
    next_live_query: Cell<u64>,
    names: RefCell<HashMap<CollectionName, Weak<CollectionInner>>>,
    registry: RefCell<CollectionRegistry>,
    scheduler: RefCell<Scheduler>,
    queue: RefCell<VecDeque<(Rc<CollectionInner>, Command)>>,
    dispatching: Cell<bool>,
    flushing: Cell<bool>,
    batch_depth: Cell<usize>,
    /// Dropped collections whose cleanup found the store borrowed
    forgotten: RefCell<Vec<(CollectionId, CollectionName)>>,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            next_collection: Cell::new(1),
            next_handle: Cell::new(1),
            next_transaction: Cell::new(1),
            next_live_query: Cell::new(1),
            names: RefCell::new(HashMap::new()),
            registry: RefCell::new(CollectionRegistry::default()),
            scheduler: RefCell::new(Scheduler::default()),
            queue: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
            flushing: Cell::new(false),
            batch_depth: Cell::new(0),
            forgotten: RefCell::new(Vec::new()),
        }
    }

    fn bump(counter: &Cell<u64>) -> u64 {
        let n = counter.get();
        counter.set(n + 1);
        n
    }

    pub(crate) fn next_handle(&self) -> OptimisticHandle {
        OptimisticHandle(Self::bump(&self.next_handle))
    }

    pub(crate) fn next_transaction(&self) -> u64 {
        Self::bump(&self.next_transaction)
    }

    /// Process a command against a collection, or queue it if a commit is
    /// already being delivered.
    ///
    /// Queued commands report their errors through logging only.
    pub(crate) fn dispatch(&self, target: &Rc<CollectionInner>, command: Command) -> Result<()> {
        if self.dispatching.get() {
            self.queue.borrow_mut().push_back((target.clone(), command));
            return Ok(());
        }

        let result = {
            let _dispatching = FlagGuard::set(&self.dispatching);
            let result = target.process(command);
            loop {
                let next = self.queue.borrow_mut().pop_front();
                let Some((collection, command)) = next else {
                    break;
                };
                if let Err(err) = collection.process(command) {
                    tracing::warn!(
                        collection = %collection.name,
                        error = %err,
                        "Deferred command failed"
                    );
                }
            }
            result
        };

        self.flush_logged();
        result
    }

    /// Schedule a live query run after the current commit.
    pub(crate) fn schedule(&self, collection: &Rc<CollectionInner>, run: Job) {
        let dependencies = self
            .registry
            .borrow()
            .dependencies_of(&Collection::from_inner(collection.clone()));
        let dependencies = match dependencies {
            Ok(collections) => collections
                .iter()
                .filter(|c| c.is_derived())
                .map(Collection::id)
                .collect(),
            Err(err) => {
                tracing::error!(
                    collection = %collection.name,
                    error = %err,
                    "Cannot resolve live query dependencies"
                );
                Vec::new()
            }
        };
        self.scheduler
            .borrow_mut()
            .schedule(collection.id, dependencies, run);
    }

    /// Run scheduled live queries until none is left.
    pub(crate) fn flush(&self) -> Result<()> {
        self.reap();
        if self.flushing.get() || self.dispatching.get() || self.batch_depth.get() > 0 {
            return Ok(());
        }

        let _flushing = FlagGuard::set(&self.flushing);
        let mut runs = 0usize;
        loop {
            let next = self.scheduler.borrow_mut().next_ready()?;
            match next {
                Some(run) => {
                    run();
                    runs += 1;
                }
                None => break,
            }
        }
        if runs > 0 {
            tracing::debug!(runs, "Flushed live queries");
        }
        Ok(())
    }

    fn flush_logged(&self) {
        if let Err(err) = self.flush() {
            tracing::error!(error = %err, "Live query flush failed");
        }
    }

    /// Lifecycle hook of a dropped collection.
    ///
    /// A drop that happens while the store's indexes are borrowed further up
    /// the stack is cleaned up on the next flush or collection insert.
    pub(crate) fn forget(&self, id: CollectionId, name: &str) {
        if !self.try_forget(id, name) {
            tracing::debug!(collection = %name, %id, "Store busy, deferring cleanup");
            self.forgotten.borrow_mut().push((id, name.to_string()));
        }
    }

    fn try_forget(&self, id: CollectionId, name: &str) -> bool {
        let (Ok(mut names), Ok(mut registry), Ok(mut scheduler)) = (
            self.names.try_borrow_mut(),
            self.registry.try_borrow_mut(),
            self.scheduler.try_borrow_mut(),
        ) else {
            return false;
        };

        if names.get(name).is_some_and(|w| w.strong_count() == 0) {
            names.remove(name);
        }
        scheduler.clear(id);
        let builder = registry.remove(id);

        // Dropping the builder may drop source collections, so release the
        // borrows first
        drop((names, registry, scheduler));
        drop(builder);
        true
    }

    /// Retry cleanups deferred by [`StoreInner::forget`].
    fn reap(&self) {
        let pending = std::mem::take(&mut *self.forgotten.borrow_mut());
        for (id, name) in pending {
            if self.try_forget(id, &name) {
                tracing::debug!(collection = %name, %id, "Deferred cleanup done");
            } else {
                self.forgotten.borrow_mut().push((id, name));
            }
        }
    }
}

/// Runtime context for collections and live queries.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(StoreInner::new()),
        }
    }

    pub(crate) fn from_inner(inner: Rc<StoreInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<StoreInner> {
        &self.inner
    }

    /// Create a base collection.
    pub fn create_collection(&self, config: CollectionConfig) -> Result<Collection> {
        self.insert(config, None)
    }

    fn insert(&self, config: CollectionConfig, live: Option<LiveQuery>) -> Result<Collection> {
        self.inner.reap();
        let mut names = self.inner.names.borrow_mut();
        if names.get(&config.id).is_some_and(|w| w.strong_count() > 0) {
            return Err(Error::DuplicateCollection(config.id));
        }

        let id = CollectionId(StoreInner::bump(&self.inner.next_collection));
        let inner = CollectionInner::new(id, self.inner.clone(), config, live);
        names.insert(inner.name.clone(), Rc::downgrade(&inner));
        tracing::debug!(collection = %inner.name, %id, "Collection created");

        Ok(Collection::from_inner(inner))
    }

    /// Look up a live collection by name.
    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.inner
            .names
            .borrow()
            .get(name)
            .and_then(Weak::upgrade)
            .map(Collection::from_inner)
    }

    /// Create a derived collection kept up to date with `query`.
    pub fn live_query(&self, query: Query) -> Result<Collection> {
        let n = StoreInner::bump(&self.inner.next_live_query);
        self.live_query_with_id(format!("live-query-{}", n), query)
    }

    /// Like [`Store::live_query`], naming the derived collection.
    pub fn live_query_with_id(
        &self,
        id: impl Into<CollectionName>,
        query: Query,
    ) -> Result<Collection> {
        let builder = Rc::new(CollectionConfigBuilder::new(id, query)?);
        self.live_query_from_builder(builder)
    }

    /// Create the derived collection described by a builder.
    pub fn live_query_from_builder(
        &self,
        builder: Rc<CollectionConfigBuilder>,
    ) -> Result<Collection> {
        let pipeline = builder.compile()?;
        let config = CollectionConfig {
            id: builder.id().to_string(),
            key: Rc::new(|_| None),
            schema: None,
            source: None,
            utils: Utils {
                live_query: Some(builder.clone()),
                ..Utils::default()
            },
        };

        let collection = self.insert(config, Some(LiveQuery::new(builder.clone(), pipeline)))?;
        self.register_collection_builder(&collection, builder)?;
        collection.inner.attach_sources()?;
        Ok(collection)
    }

    /// Associate a live query builder with a collection.
    pub fn register_collection_builder(
        &self,
        collection: &Collection,
        builder: Rc<CollectionConfigBuilder>,
    ) -> Result<()> {
        self.inner.registry.borrow_mut().register(collection, builder)
    }

    /// Builder registered for a collection.
    pub fn collection_builder(
        &self,
        collection: &Collection,
    ) -> Option<Rc<CollectionConfigBuilder>> {
        self.inner.registry.borrow().lookup(collection)
    }

    /// Builder carried by a collection config.
    pub fn builder_from_config(&self, config: &CollectionConfig) -> BuilderLookup {
        self.inner.registry.borrow().builder_from_config(config)
    }

    /// Every collection `collection` transitively reads from, parents first.
    pub fn dependencies_of(&self, collection: &Collection) -> Result<Vec<Collection>> {
        self.inner.registry.borrow().dependencies_of(collection)
    }

    /// Number of live collections with a registered builder.
    pub fn registered_builders(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Run `f`, deferring live query runs until it returns.
    ///
    /// Writes to several collections inside one batch reach a live query
    /// over all of them as a single diff.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _depth = DepthGuard::enter(&self.inner.batch_depth);
            f()
        };
        self.inner.flush_logged();
        result
    }

    /// Run scheduled live queries now.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Start a transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("collections", &self.inner.names.borrow().len())
            .field("builders", &self.inner.registry.borrow().len())
            .finish()
    }
}
