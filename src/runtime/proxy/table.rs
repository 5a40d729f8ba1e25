//! Weak registry of the invokers behind live proxies.

use super::invoker::Invoker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Maps proxy keys to invokers without keeping the invokers alive.
///
/// An entry expires as soon as the host drops its last `Arc<Invoker>`.
/// Expired entries are pruned lazily on lookup and registration.
#[derive(Default)]
pub(crate) struct ManagedObjectTable {
    entries: Mutex<HashMap<String, Weak<Invoker>>>,
}

impl ManagedObjectTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, key: String, invoker: &Arc<Invoker>) {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.insert(key, Arc::downgrade(invoker));
    }

    /// The invoker for `key`, if the host still holds it.
    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<Invoker>> {
        let mut entries = self.entries.lock();
        let invoker = entries.get(key)?.upgrade();
        if invoker.is_none() {
            entries.remove(key);
        }
        invoker
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire_with_invoker() {
        let table = ManagedObjectTable::new();
        let invoker = Arc::new(Invoker::new());
        table.register("a".to_string(), &invoker);
        assert!(table.lookup("a").is_some());
        assert!(table.lookup("b").is_none());

        drop(invoker);
        assert!(table.lookup("a").is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_register_prunes_expired_entries() {
        let table = ManagedObjectTable::new();
        let dropped = Arc::new(Invoker::new());
        table.register("old".to_string(), &dropped);
        drop(dropped);
        let kept = Arc::new(Invoker::new());
        table.register("new".to_string(), &kept);
        assert_eq!(table.len(), 1);
        assert!(table.lookup("new").is_some());
    }

    #[test]
    fn test_table_does_not_keep_invoker_alive() {
        let table = ManagedObjectTable::new();
        let invoker = Arc::new(Invoker::new());
        table.register("k".to_string(), &invoker);
        assert_eq!(Arc::strong_count(&invoker), 1);
        let found = table.lookup("k").unwrap();
        assert!(Arc::ptr_eq(&found, &invoker));
    }
}
