//! Registry of live query builders.
//!
//! Maps each derived collection to the [`CollectionConfigBuilder`] that
//! produced it. The scheduler asks the registry for a collection's
//! transitive upstream collections so that a live query only runs after
//! every live query it reads from.

use crate::collection::CollectionInner;
use crate::query::CollectionConfigBuilder;
use crate::{error::Result, Collection, CollectionConfig, CollectionId, Error};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

/// What [`CollectionRegistry::builder_from_config`] found for a config.
#[derive(Debug, Clone)]
pub enum BuilderLookup {
    /// A base collection, not produced by a live query
    Base,
    Derived(Rc<CollectionConfigBuilder>),
}

impl BuilderLookup {
    pub fn builder(&self) -> Option<&Rc<CollectionConfigBuilder>> {
        match self {
            BuilderLookup::Base => None,
            BuilderLookup::Derived(builder) => Some(builder),
        }
    }
}

struct Entry {
    collection: Weak<CollectionInner>,
    builder: Rc<CollectionConfigBuilder>,
}

#[derive(Default)]
pub struct CollectionRegistry {
    entries: HashMap<CollectionId, Entry>,
}

impl CollectionRegistry {
    /// Associate a builder with a collection.
    ///
    /// Fails if the collection already has a builder, or if the builder
    /// would make the collection depend on itself.
    pub fn register(
        &mut self,
        collection: &Collection,
        builder: Rc<CollectionConfigBuilder>,
    ) -> Result<()> {
        self.entries.retain(|_, entry| entry.collection.strong_count() > 0);

        if self.entries.contains_key(&collection.id()) {
            tracing::warn!(
                collection = %collection.name(),
                builder = %builder.id(),
                "Collection already has a registered builder"
            );
            return Err(Error::AlreadyRegistered(collection.name().to_string()));
        }

        self.entries.insert(
            collection.id(),
            Entry {
                collection: Rc::downgrade(&collection.inner),
                builder,
            },
        );

        if let Err(err) = self.dependencies_of(collection) {
            self.entries.remove(&collection.id());
            return Err(err);
        }

        tracing::debug!(collection = %collection.name(), "Builder registered");
        Ok(())
    }

    /// Builder registered for a live collection.
    pub fn lookup(&self, collection: &Collection) -> Option<Rc<CollectionConfigBuilder>> {
        self.entries
            .get(&collection.id())
            .filter(|entry| entry.collection.strong_count() > 0)
            .map(|entry| entry.builder.clone())
    }

    /// Builder carried by a collection config, for integrations that only
    /// hold the config.
    pub fn builder_from_config(&self, config: &CollectionConfig) -> BuilderLookup {
        match config.utils.live_query_builder() {
            Some(builder) => BuilderLookup::Derived(builder.clone()),
            None => BuilderLookup::Base,
        }
    }

    /// Every collection `collection` transitively reads from, parents
    /// before children. The collection itself is not included.
    pub fn dependencies_of(&self, collection: &Collection) -> Result<Vec<Collection>> {
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        let mut out = Vec::new();
        self.visit(collection, &mut visiting, &mut done, &mut out)?;
        out.pop();
        Ok(out)
    }

    fn visit(
        &self,
        collection: &Collection,
        visiting: &mut HashSet<CollectionId>,
        done: &mut HashSet<CollectionId>,
        out: &mut Vec<Collection>,
    ) -> Result<()> {
        let id = collection.id();
        if done.contains(&id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(Error::DependencyCycle(collection.name().to_string()));
        }

        let builder = self
            .lookup(collection)
            .or_else(|| collection.utils().live_query_builder().cloned());
        if let Some(builder) = builder {
            for source in builder.sources() {
                self.visit(&source, visiting, done, out)?;
            }
        }

        visiting.remove(&id);
        done.insert(id);
        out.push(collection.clone());
        Ok(())
    }

    /// Remove a collection's entry, returning its builder.
    pub(crate) fn remove(&mut self, id: CollectionId) -> Option<Rc<CollectionConfigBuilder>> {
        self.entries.remove(&id).map(|entry| entry.builder)
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.collection.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{col, eq, Query};
    use crate::{field_key, Store};

    fn base(store: &Store, name: &str) -> Collection {
        store
            .create_collection(CollectionConfig::new(name, field_key("id")))
            .unwrap()
    }

    #[test]
    fn dependencies_are_parents_first() {
        let store = Store::new();
        let a = base(&store, "a");
        let b = store
            .live_query_with_id("b", Query::from("a", &a))
            .unwrap();
        let c = store
            .live_query_with_id("c", Query::from("a", &a))
            .unwrap();
        let d = store
            .live_query_with_id(
                "d",
                Query::from("b", &b).join("c", &c, eq(col("b", "id"), col("c", "id"))),
            )
            .unwrap();

        let deps: Vec<_> = store
            .dependencies_of(&d)
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(deps, vec!["a", "b", "c"]);
        assert!(store.dependencies_of(&a).unwrap().is_empty());
    }

    #[test]
    fn registering_twice_fails() {
        let store = Store::new();
        let a = base(&store, "a");
        let b = store.live_query_with_id("b", Query::from("a", &a)).unwrap();

        let builder = Rc::new(CollectionConfigBuilder::new("b2", Query::from("a", &a)).unwrap());
        assert_eq!(
            store.register_collection_builder(&b, builder),
            Err(Error::AlreadyRegistered("b".into()))
        );
    }

    #[test]
    fn lookup_and_config_agree() {
        let store = Store::new();
        let a = base(&store, "a");
        let b = store.live_query_with_id("b", Query::from("a", &a)).unwrap();

        let registered = store.collection_builder(&b).unwrap();
        let from_config = store.builder_from_config(&b.config());
        assert!(Rc::ptr_eq(&registered, from_config.builder().unwrap()));
        assert!(matches!(store.builder_from_config(&a.config()), BuilderLookup::Base));
        assert!(store.collection_builder(&a).is_none());
    }

    #[test]
    fn dropped_collections_leave_the_registry() {
        let store = Store::new();
        let a = base(&store, "a");
        let b = store.live_query_with_id("b", Query::from("a", &a)).unwrap();
        assert_eq!(store.registered_builders(), 1);
        drop(b);
        assert_eq!(store.registered_builders(), 0);
    }
}
