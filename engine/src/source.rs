//! Contracts between base collections and the systems that feed them.
//!
//! A base collection is backed by a [`SyncSource`]: it fetches the initial
//! rows, pushes subsequent changes through a [`SyncSink`], and exposes a
//! [`Utils`] bag of optional capabilities that transaction reconciliation
//! invokes by [`Capability`].

use crate::collection::CollectionInner;
use crate::query::CollectionConfigBuilder;
use crate::{error::Result, SyncMessage};
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::{Rc, Weak};

/// Opaque sync token returned by a remote write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Txid(pub String);

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Txid {
    fn from(n: u64) -> Self {
        Txid(n.to_string())
    }
}

impl From<&str> for Txid {
    fn from(s: &str) -> Self {
        Txid(s.to_string())
    }
}

/// Detach callback returned by [`SyncSource::subscribe_to_changes`].
pub type Unsubscribe = Box<dyn FnOnce()>;

/// Wait until a sync token has been observed by the collection's source.
pub type AwaitTxidFn = Rc<dyn Fn(Txid) -> LocalBoxFuture<'static, Result<()>>>;

/// Re-fetch the collection's authoritative rows.
pub type RefetchFn = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<()>>>;

/// A backing integration for a base collection.
pub trait SyncSource {
    /// Fetch the initial authoritative rows.
    fn fetch_initial(&self) -> LocalBoxFuture<'static, Result<Vec<serde_json::Value>>>;

    /// Start pushing changes into `sink`. The returned callback detaches it.
    fn subscribe_to_changes(&self, sink: SyncSink) -> Unsubscribe;

    /// Capabilities exposed by this source.
    fn utils(&self) -> Utils {
        Utils::default()
    }
}

/// Well-known capability keys of a [`Utils`] bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    AwaitTxid,
    Refetch,
}

/// Named capabilities exposed by a collection's source integration.
///
/// The engine never interprets these; it only hands them to whoever
/// reconciles transactions.
#[derive(Clone, Default)]
pub struct Utils {
    pub await_txid: Option<AwaitTxidFn>,
    pub refetch: Option<RefetchFn>,
    pub(crate) live_query: Option<Rc<CollectionConfigBuilder>>,
}

impl Utils {
    pub fn with_await_txid(mut self, f: AwaitTxidFn) -> Self {
        self.await_txid = Some(f);
        self
    }

    pub fn with_refetch(mut self, f: RefetchFn) -> Self {
        self.refetch = Some(f);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::AwaitTxid => self.await_txid.is_some(),
            Capability::Refetch => self.refetch.is_some(),
        }
    }

    /// Builder of the live query that produced this collection, if any.
    pub fn live_query_builder(&self) -> Option<&Rc<CollectionConfigBuilder>> {
        self.live_query.as_ref()
    }
}

impl fmt::Debug for Utils {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utils")
            .field("await_txid", &self.await_txid.is_some())
            .field("refetch", &self.refetch.is_some())
            .field("live_query", &self.live_query.as_ref().map(|b| b.id()))
            .finish()
    }
}

/// Write end handed to a source's change feed.
///
/// Holds the collection weakly: a feed outliving its collection writes into
/// nothing.
#[derive(Clone)]
pub struct SyncSink {
    pub(crate) collection: Weak<CollectionInner>,
}

impl SyncSink {
    /// Commit a batch of confirmed changes.
    ///
    /// While the collection is still fetching its initial rows the batch is
    /// buffered and applied after them.
    pub fn write(&self, messages: Vec<SyncMessage>) {
        if let Some(inner) = self.collection.upgrade() {
            CollectionInner::receive_sync(&inner, messages);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.collection.strong_count() > 0
    }
}

impl fmt::Debug for SyncSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSink")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn supports_reports_present_capabilities() {
        let utils = Utils::default();
        assert!(!utils.supports(Capability::AwaitTxid));
        assert!(!utils.supports(Capability::Refetch));

        let utils = utils.with_refetch(Rc::new(|| async { Ok(()) }.boxed_local()));
        assert!(utils.supports(Capability::Refetch));
        assert!(!utils.supports(Capability::AwaitTxid));
        assert!(utils.live_query_builder().is_none());
    }

    #[test]
    fn txid_conversions() {
        assert_eq!(Txid::from(42), Txid("42".into()));
        assert_eq!(serde_json::to_string(&Txid::from("t1")).unwrap(), r#""t1""#);
    }
}
