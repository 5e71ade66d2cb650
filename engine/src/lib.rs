//! # Live Query Engine
//!
//! An incremental live-query collection cache for local-first applications.
//!
//! This crate keeps reactive collections of keyed rows in sync with their
//! backing sources, evaluates queries over them incrementally, and applies
//! local writes optimistically until a remote system confirms them.
//!
//! ## Design Principles
//!
//! - **No IO**: Sources are traits; the engine never touches files or network
//! - **No runtime**: Async surfaces are plain futures, driven by any executor
//! - **Incremental**: A source change costs work proportional to its effect
//! - **Consistent**: Subscribers see every commit once, in commit order
//!
//! ## Core Concepts
//!
//! ### Collections
//!
//! A [`Collection`] holds rows keyed by [`Key`]. Its visible state is its
//! confirmed rows overlaid with pending optimistic layers:
//! - [`Collection::apply_optimistic`] - Push a layer of [`Mutation`]s
//! - [`Collection::confirm`] - Replace a layer with authoritative rows
//! - [`Collection::rollback`] - Discard a layer
//!
//! Every commit emits one [`ChangeSet`] to subscribers.
//!
//! ### Live Queries
//!
//! A [`Query`] reads one or more collections with joins, filters,
//! projections and ordering. [`Store::live_query`] turns it into a derived
//! collection updated incrementally as its sources change. Live queries may
//! read other live queries; the [`CollectionRegistry`] orders their
//! evaluation so a live query runs once per commit, after its parents.
//!
//! ### Transactions
//!
//! A [`Transaction`] groups optimistic writes across collections. It is
//! completed or rolled back as a unit.
//!
//! ## Quick Start
//!
//! ```rust
//! use livequery_engine::query::{col, eq, val, Query};
//! use livequery_engine::{field_key, CollectionConfig, Key, Store};
//! use serde_json::json;
//!
//! // 1. Create a store and a collection keyed by "id"
//! let store = Store::new();
//! let todos = store
//!     .create_collection(CollectionConfig::new("todos", field_key("id")))
//!     .unwrap();
//!
//! // 2. Declare a live query
//! let open = store
//!     .live_query(Query::from("t", &todos).filter(eq(col("t", "done"), val(false))))
//!     .unwrap();
//!
//! // 3. Write optimistically
//! let mut tx = store.transaction();
//! let key = tx.insert(&todos, json!({"id": "1", "done": false})).unwrap();
//! assert_eq!(open.keys(), vec![Key::from("1")]);
//!
//! // 4. Confirm once persisted
//! tx.begin_persisting().unwrap();
//! tx.complete_locally().unwrap();
//! assert!(todos.synced_value(&key).is_some());
//! ```

pub mod change;
pub mod collection;
pub mod error;
pub mod key;
pub mod mutation;
pub mod query;
pub mod reconcile;
pub mod registry;
mod scheduler;
pub mod schema;
pub mod source;
pub mod store;
pub mod transaction;

// Re-export main types at crate root
pub use change::{ChangeMessage, ChangeSet, ChangeType, RowDiagnostic, SyncMessage};
pub use collection::{Collection, CollectionConfig, CollectionStatus, Subscription};
pub use error::Error;
pub use key::{field_key, Key, KeyFn};
pub use mutation::{Mutation, MutationType};
pub use query::{CollectionConfigBuilder, Query};
pub use reconcile::{LayerRows, OptimisticHandle};
pub use registry::{BuilderLookup, CollectionRegistry};
pub use schema::{CollectionSchema, FieldDef, FieldType};
pub use source::{
    AwaitTxidFn, Capability, RefetchFn, SyncSink, SyncSource, Txid, Unsubscribe, Utils,
};
pub use store::Store;
pub use transaction::{Transaction, TransactionState};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned collection identity.
///
/// Never reused within a store, even after the collection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type aliases for clarity
pub type CollectionName = String;
pub type Version = u64;
