//! Bookkeeping for the children of a watched root.
//!
//! Each tracked member owns the subscriptions watching its nodes. A member is
//! claimed before its watches are armed and the subscriptions are attached
//! afterwards; if the member was released in between, the attach is refused
//! and the caller drops the late subscriptions.

use std::collections::BTreeMap;

use coordination::Subscription;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct Members {
    inner: Mutex<MembersInner>,
}

#[derive(Debug, Default)]
struct MembersInner {
    next_generation: u64,
    map: BTreeMap<String, Member>,
}

#[derive(Debug)]
struct Member {
    generation: u64,
    subscriptions: Vec<Subscription>,
}

impl Members {
    /// Start tracking `name`. Returns the claim's generation, or `None` if
    /// the member is already tracked.
    pub(crate) fn claim(&self, name: &str) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(name) {
            return None;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.map.insert(
            name.to_owned(),
            Member {
                generation,
                subscriptions: Vec::new(),
            },
        );
        Some(generation)
    }

    /// Hand the member's subscriptions over. Fails, returning them, when the
    /// claim identified by `generation` is no longer current.
    pub(crate) fn attach(
        &self,
        name: &str,
        generation: u64,
        subscriptions: Vec<Subscription>,
    ) -> Result<(), Vec<Subscription>> {
        let mut inner = self.inner.lock();
        match inner.map.get_mut(name) {
            Some(member) if member.generation == generation => {
                member.subscriptions.extend(subscriptions);
                Ok(())
            }
            _ => Err(subscriptions),
        }
    }

    /// Whether the claim identified by `generation` is still current.
    pub(crate) fn is_current(&self, name: &str, generation: u64) -> bool {
        self.inner
            .lock()
            .map
            .get(name)
            .is_some_and(|m| m.generation == generation)
    }

    /// Run `f` while holding the membership lock, only if the claim
    /// identified by `generation` is still current. A concurrent `release`
    /// either completes before `f` runs or waits until it returns.
    pub(crate) fn if_current<T>(
        &self,
        name: &str,
        generation: u64,
        f: impl FnOnce() -> T,
    ) -> Option<T> {
        let inner = self.inner.lock();
        match inner.map.get(name) {
            Some(member) if member.generation == generation => Some(f()),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.inner.lock().map.contains_key(name)
    }

    /// Stop tracking `name`, returning its subscriptions.
    pub(crate) fn release(&self, name: &str) -> Option<Vec<Subscription>> {
        self.inner
            .lock()
            .map
            .remove(name)
            .map(|m| m.subscriptions)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.inner.lock().map.keys().cloned().collect()
    }

    /// Stop tracking everything, returning every subscription.
    pub(crate) fn clear(&self) -> Vec<Subscription> {
        let map = std::mem::take(&mut self.inner.lock().map);
        map.into_values().flat_map(|m| m.subscriptions).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_once() {
        let members = Members::default();
        let generation = members.claim("a").unwrap();
        assert!(members.claim("a").is_none());
        assert!(members.is_current("a", generation));
        assert!(members.attach("a", generation, Vec::new()).is_ok());
        assert_eq!(members.names(), vec!["a"]);
    }

    #[test]
    fn test_stale_attach_refused() {
        let members = Members::default();
        let first = members.claim("a").unwrap();
        assert!(members.release("a").is_some());
        let second = members.claim("a").unwrap();
        assert_ne!(first, second);
        assert!(!members.is_current("a", first));
        assert!(members.attach("a", first, Vec::new()).is_err());
        assert!(members.attach("a", second, Vec::new()).is_ok());

        assert_eq!(members.if_current("a", first, || 1), None);
        assert_eq!(members.if_current("a", second, || 2), Some(2));

        assert!(members.clear().is_empty());
        assert_eq!(members.if_current("a", second, || 3), None);
        assert!(!members.contains("a"));
    }
}
