//! Prepared procedure cache.
//!
//! Handles created inside a transaction vanish on the server when that
//! transaction, or the savepoint they were created after, rolls back. Every
//! key learned while a transaction is open is therefore recorded in the
//! innermost scope, so a rollback can evict exactly what it undid.
use std::num::NonZeroUsize;

use lru::LruCache;

/// Prepared handles keyed by SQL text and parameter declarations.
pub(crate) struct ProcCache {
    entries: LruCache<String, i32>,
    /// Transaction scope first, then one scope per savepoint.
    scopes: Vec<Scope>,
}

struct Scope {
    savepoint: Option<u32>,
    keys: Vec<String>,
}

impl Scope {
    fn new(savepoint: Option<u32>) -> Scope {
        Scope { savepoint, keys: Vec::new() }
    }
}

impl ProcCache {
    pub(crate) fn new(capacity: usize) -> ProcCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ProcCache { entries: LruCache::new(capacity), scopes: Vec::new() }
    }

    pub(crate) fn key(sql: &str, declarations: &str) -> String {
        let mut key = String::with_capacity(sql.len() + declarations.len() + 1);
        key.push_str(sql);
        key.push('\0');
        key.push_str(declarations);
        key
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<i32> {
        self.entries.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: String, handle: i32) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.keys.push(key.clone());
        }
        self.entries.put(key, handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Outermost transaction started.
    pub(crate) fn begin(&mut self) {
        self.scopes.clear();
        self.scopes.push(Scope::new(None));
    }

    /// Outermost transaction committed, learned keys stay valid.
    pub(crate) fn commit(&mut self) {
        self.scopes.clear();
    }

    /// Whole transaction rolled back.
    pub(crate) fn rollback(&mut self) {
        for scope in std::mem::take(&mut self.scopes) {
            self.evict(scope.keys);
        }
    }

    pub(crate) fn savepoint(&mut self, id: u32) {
        if self.scopes.is_empty() {
            self.scopes.push(Scope::new(None));
        }
        self.scopes.push(Scope::new(Some(id)));
    }

    /// Savepoint released, its keys now belong to the enclosing scope.
    pub(crate) fn release(&mut self, id: u32) {
        let Some(at) = self.position(id) else { return };
        let merged: Vec<String> = self.scopes.drain(at..).flat_map(|s| s.keys).collect();
        if let Some(parent) = self.scopes.last_mut() {
            parent.keys.extend(merged);
        }
    }

    /// Rolled back to savepoint, keys learned after it are gone.
    pub(crate) fn rollback_to(&mut self, id: u32) {
        let Some(at) = self.position(id) else { return };
        let undone: Vec<Scope> = self.scopes.drain(at..).collect();
        for scope in undone {
            self.evict(scope.keys);
        }
    }

    fn position(&self, id: u32) -> Option<usize> {
        self.scopes.iter().position(|s| s.savepoint == Some(id))
    }

    fn evict(&mut self, keys: Vec<String>) {
        for key in keys {
            self.entries.pop(&key);
        }
    }
}

impl std::fmt::Debug for ProcCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcCache")
            .field("entries", &self.entries.len())
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache() -> ProcCache {
        let mut cache = ProcCache::new(16);
        cache.insert("before".into(), 1);
        cache.begin();
        cache.insert("tx".into(), 2);
        cache.savepoint(1);
        cache.insert("sp1".into(), 3);
        cache.savepoint(2);
        cache.insert("sp2".into(), 4);
        cache
    }

    #[test]
    fn rollback_to_evicts_later_keys() {
        let mut cache = cache();
        cache.rollback_to(2);
        assert_eq!(cache.get("sp2"), None);
        assert_eq!(cache.get("sp1"), Some(3));

        cache.rollback_to(1);
        assert_eq!(cache.get("sp1"), None);
        assert_eq!(cache.get("tx"), Some(2));
        assert_eq!(cache.get("before"), Some(1));
    }

    #[test]
    fn release_merges_into_parent() {
        let mut cache = cache();
        cache.release(2);
        cache.rollback_to(1);
        assert_eq!(cache.get("sp2"), None);
        assert_eq!(cache.get("sp1"), None);
        assert_eq!(cache.get("tx"), Some(2));
    }

    #[test]
    fn full_rollback_keeps_outside_keys() {
        let mut cache = cache();
        cache.rollback();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("before"), Some(1));
    }

    #[test]
    fn commit_keeps_everything() {
        let mut cache = cache();
        cache.commit();
        cache.rollback();
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn unknown_savepoint_is_ignored() {
        let mut cache = cache();
        cache.rollback_to(9);
        assert_eq!(cache.len(), 4);
    }
}
