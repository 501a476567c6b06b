//! Memoization of pure worker calls.
//!
//! Each memoized operation gets its own [`MemoCache`] keyed by the operation's
//! identifying parameters. The first call for a key dispatches; every later
//! call with the same key gets a handle to that same call, in flight or
//! settled. Entries live as long as the dispatcher.

use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::dispatcher::SharedCall;

pub(crate) struct MemoCache<K> {
    operation: &'static str,
    entries: DashMap<K, SharedCall>,
}

impl<K: Hash + Eq> MemoCache<K> {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            entries: DashMap::new(),
        }
    }

    /// Return the cached call for `key`, or run `dispatch` and cache its call.
    ///
    /// `dispatch` runs under the shard lock for `key`, so concurrent first
    /// calls with the same key dispatch exactly once.
    pub(crate) fn get_or_dispatch(
        &self,
        key: K,
        dispatch: impl FnOnce() -> SharedCall,
    ) -> SharedCall {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                let call = entry.get().clone();
                tracing::trace!(
                    operation = self.operation,
                    id = ?call.id(),
                    "Memoized call hit"
                );
                call
            }
            Entry::Vacant(entry) => {
                let call = dispatch();
                entry.insert(call.clone());
                call
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Key for `getFileHash`: the path and the hash algorithm name.
pub(crate) fn file_hash_key(path: &str, hash_name: &str) -> (String, String) {
    (path.to_string(), hash_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_key_dispatches_once() {
        let cache = MemoCache::new("hashFn");
        let mut dispatched = 0;

        let first = cache.get_or_dispatch("abc".to_string(), || {
            dispatched += 1;
            SharedCall::ready(Some(1), Ok(json!("h1")))
        });
        let second = cache.get_or_dispatch("abc".to_string(), || {
            dispatched += 1;
            SharedCall::ready(Some(2), Ok(json!("h2")))
        });

        assert_eq!(dispatched, 1);
        assert_eq!(first.id(), Some(1));
        assert_eq!(second.id(), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_keys_are_independent() {
        let cache = MemoCache::new("getFileHash");
        let a = cache.get_or_dispatch(file_hash_key("/a.txt", "sha256"), || {
            SharedCall::ready(Some(1), Ok(json!("x")))
        });
        let b = cache.get_or_dispatch(file_hash_key("/a.txt", "md5"), || {
            SharedCall::ready(Some(2), Ok(json!("y")))
        });
        assert_ne!(a.id(), b.id());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn file_hash_key_is_unambiguous() {
        assert_ne!(file_hash_key("a:b", "c"), file_hash_key("a", "b:c"));
    }
}
