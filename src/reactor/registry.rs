//! Single-owner continuation slots.
//!
//! [`ContinuationRegistry`] maps a key (typically a resource token paired with
//! a readiness kind) to exactly one suspended waiter. Registering a second
//! waiter under an occupied key is refused, and resolving a key always removes
//! the entry before the waiter runs so a waiter invoked re-entrantly never
//! observes itself as still registered.

use std::{collections::HashMap, fmt, hash::Hash};

/// A waiter rejected because its key already holds one.
///
/// The rejected waiter is handed back so the caller can resolve it instead of
/// dropping it silently.
pub struct Occupied<K, W> {
    /// Key that was already taken.
    pub key: K,
    /// The waiter that could not be registered.
    pub waiter: W,
}

impl<K: fmt::Debug, W> fmt::Debug for Occupied<K, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Occupied").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Map from key to at most one pending waiter.
pub struct ContinuationRegistry<K, W> {
    waiters: HashMap<K, W>,
}

impl<K, W> Default for ContinuationRegistry<K, W> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }
}

impl<K, W> ContinuationRegistry<K, W>
where
    K: Copy + Eq + Hash,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `waiter` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Occupied`] carrying the rejected waiter if `key` already holds
    /// one.
    pub fn insert(&mut self, key: K, waiter: W) -> Result<(), Occupied<K, W>> {
        if self.waiters.contains_key(&key) {
            return Err(Occupied { key, waiter });
        }
        self.waiters.insert(key, waiter);
        Ok(())
    }

    /// Returns `true` if a waiter is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool { self.waiters.contains_key(key) }

    /// Remove and return the waiter registered under `key`.
    pub fn take(&mut self, key: &K) -> Option<W> { self.waiters.remove(key) }

    /// Remove the waiter under `key` and invoke it with `resume`.
    ///
    /// Returns `None` if no waiter was registered.
    pub fn resume<R>(&mut self, key: &K, resume: impl FnOnce(W) -> R) -> Option<R> {
        let waiter = self.waiters.remove(key)?;
        Some(resume(waiter))
    }

    /// Remove every waiter whose key matches `predicate`.
    pub fn drain_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> Vec<(K, W)> {
        let keys: Vec<K> = self.waiters.keys().filter(|k| predicate(k)).copied().collect();
        keys.into_iter()
            .filter_map(|key| self.waiters.remove(&key).map(|w| (key, w)))
            .collect()
    }

    /// Number of outstanding waiters.
    #[must_use]
    pub fn len(&self) -> usize { self.waiters.len() }

    /// Returns `true` when no waiter is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.waiters.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[test]
    fn second_waiter_for_the_same_key_is_rejected() {
        let mut registry = ContinuationRegistry::new();
        registry.insert(1u8, "first").expect("empty slot");
        let Err(occupied) = registry.insert(1u8, "second") else {
            panic!("duplicate waiter accepted");
        };
        assert_eq!(occupied.key, 1);
        assert_eq!(occupied.waiter, "second");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn taken_waiter_no_longer_observes_itself() {
        type Slot = Rc<RefCell<ContinuationRegistry<u8, Box<dyn FnOnce()>>>>;
        let registry: Slot = Rc::new(RefCell::new(ContinuationRegistry::new()));
        let seen = Rc::new(RefCell::new(None));

        let probe = Rc::clone(&registry);
        let record = Rc::clone(&seen);
        registry
            .borrow_mut()
            .insert(
                7,
                Box::new(move || {
                    *record.borrow_mut() = Some(probe.borrow().contains(&7));
                }),
            )
            .expect("empty slot");

        let waiter = registry.borrow_mut().take(&7).expect("registered");
        waiter();
        assert_eq!(*seen.borrow(), Some(false));
    }

    #[test]
    fn drain_where_only_takes_matching_keys() {
        let mut registry = ContinuationRegistry::new();
        for key in [(1, 'r'), (1, 'w'), (2, 'r')] {
            registry.insert(key, ()).expect("empty slot");
        }
        let drained = registry.drain_where(|(token, _)| *token == 1);
        assert_eq!(drained.len(), 2);
        assert!(registry.contains(&(2, 'r')));
    }
}
