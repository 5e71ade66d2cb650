//! # Live Query Sync
//!
//! Async integration layer for `livequery_engine`.
//!
//! The engine applies writes optimistically and leaves the remote half of a
//! transaction to its caller. This crate supplies that half:
//!
//! - [`TransactionExecutor`] - Persists a transaction through a
//!   [`MutationHandler`], waits until the written collections' sources have
//!   observed the write, then confirms or rolls back
//! - [`MemoryBackend`] - An in-memory database with a change feed, usable as
//!   both the remote write target and the collections' [`SyncSource`]s
//! - [`Config`] - Timeouts and log filter loaded from the environment
//!
//! [`SyncSource`]: livequery_engine::SyncSource

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod memory;

pub use config::{Config, ConfigError};
pub use error::{RemoteError, Result, SyncError};
pub use executor::{
    BatchMutation, CommitReport, Confirmation, MutationBatch, MutationHandler, PersistFuture,
    TransactionExecutor,
};
pub use memory::{Delivery, MemoryBackend, MemoryTable, RowTransform};
