//! # Set Facade
//!
//! A persistent set is a store whose entries carry empty values. The
//! facade keeps the underlying [`Store`] reachable for configuration,
//! statistics, and flushing.

use eyre::Result;

use crate::store::Store;

/// A set of byte-string elements backed by a [`Store`].
#[derive(Debug)]
pub struct StoreSet {
    store: Store,
}

impl StoreSet {
    /// Wraps a store. Works with any configuration whose value sizing
    /// admits empty values (any variable layout; fixed layouts need
    /// `constant_value_size` chosen accordingly).
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Adds the element; returns whether it was newly inserted.
    pub fn insert(&self, element: &[u8]) -> Result<bool> {
        Ok(self.store.put(element, b"")?.is_none())
    }

    pub fn contains(&self, element: &[u8]) -> Result<bool> {
        self.store.contains_key(element)
    }

    /// Removes the element; returns whether it was present.
    pub fn remove(&self, element: &[u8]) -> Result<bool> {
        self.store.remove(element)
    }

    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Visits every element.
    pub fn for_each(&self, mut visitor: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.store.for_each_entry(|entry| visitor(entry.key))
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn into_store(self) -> Store {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let set = StoreSet::new(Store::builder().create_in_memory().unwrap());

        assert!(set.insert(b"a").unwrap());
        assert!(!set.insert(b"a").unwrap());
        assert!(set.contains(b"a").unwrap());
        assert_eq!(set.len(), 1);

        assert!(set.remove(b"a").unwrap());
        assert!(!set.remove(b"a").unwrap());
        assert!(set.is_empty());
    }

    #[test]
    fn for_each_sees_all_elements() {
        let set = StoreSet::new(Store::builder().create_in_memory().unwrap());
        for i in 0..10u32 {
            set.insert(&i.to_le_bytes()).unwrap();
        }

        let mut count = 0;
        set.for_each(|_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 10);
    }
}
