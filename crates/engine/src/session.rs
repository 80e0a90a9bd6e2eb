//! Per-symbol state store for stateful scan strategies
//!
//! Each symbol gets its own `Mutex`, so updates to one symbol are atomic
//! while different symbols can be evaluated concurrently. The outer map lock
//! is only held long enough to find or insert the entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Shared, cloneable map of symbol -> state
pub struct SessionStore<S> {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<S>>>>>,
}

impl<S> Clone for SessionStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Default> Default for SessionStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Default> SessionStore<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn entry(&self, symbol: &str) -> Arc<Mutex<S>> {
        if let Some(existing) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
        {
            return Arc::clone(existing);
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(symbol.to_string()).or_default())
    }

    /// Run `f` against the state of `symbol`, creating it on first use.
    /// The symbol's lock is held for the whole call.
    pub fn update<R>(&self, symbol: &str, f: impl FnOnce(&mut S) -> R) -> R {
        let entry = self.entry(symbol);
        let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl<S> SessionStore<S> {
    /// Forget one symbol. Returns true if it had state.
    pub fn reset(&self, symbol: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol)
            .is_some()
    }

    pub fn reset_all(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Clone> SessionStore<S> {
    pub fn get(&self, symbol: &str) -> Option<S> {
        let entry = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()?;
        let state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.clone())
    }

    /// Copy of every symbol's state, ordered by symbol
    pub fn snapshot(&self) -> BTreeMap<String, S> {
        let entries: Vec<(String, Arc<Mutex<S>>)> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        entries
            .into_iter()
            .map(|(symbol, entry)| {
                let state = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (symbol, state)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_update_creates_and_mutates() {
        let store: SessionStore<u32> = SessionStore::new();
        assert!(store.get("KRW-BTC").is_none());
        store.update("KRW-BTC", |n| *n += 2);
        let seen = store.update("KRW-BTC", |n| {
            *n += 1;
            *n
        });
        assert_eq!(seen, 3);
        assert_eq!(store.get("KRW-BTC"), Some(3));
    }

    #[test]
    fn test_reset_and_snapshot() {
        let store: SessionStore<u32> = SessionStore::new();
        store.update("KRW-ETH", |n| *n = 5);
        store.update("KRW-BTC", |n| *n = 7);

        let snap = store.snapshot();
        assert_eq!(snap.keys().collect::<Vec<_>>(), vec!["KRW-BTC", "KRW-ETH"]);

        assert!(store.reset("KRW-ETH"));
        assert!(!store.reset("KRW-ETH"));
        assert_eq!(store.len(), 1);

        store.reset_all();
        assert!(store.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let store: SessionStore<u32> = SessionStore::new();
        let other = store.clone();
        other.update("KRW-XRP", |n| *n = 9);
        assert_eq!(store.get("KRW-XRP"), Some(9));
    }

    #[test]
    fn test_concurrent_updates_are_atomic_per_symbol() {
        let store: SessionStore<u64> = SessionStore::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update("KRW-BTC", |n| *n += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("KRW-BTC"), Some(8000));
    }
}
