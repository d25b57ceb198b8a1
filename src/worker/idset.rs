use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ids of the jobs this worker is currently processing.
///
/// Cheap to clone; all clones share the same set. The handler registers a job
/// with [`IdSet::register`] and the heartbeat task reads [`IdSet::snapshot`].
#[derive(Debug, Clone, Default)]
pub struct IdSet {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the set until the returned guard is dropped.
    pub fn register(&self, id: i64) -> IdGuard {
        self.lock().insert(id);
        IdGuard {
            set: self.clone(),
            id,
        }
    }

    pub fn add(&self, id: i64) {
        self.lock().insert(id);
    }

    pub fn remove(&self, id: i64) {
        self.lock().remove(&id);
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current ids in ascending order.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        // The set holds plain integers; a poisoned lock still guards valid data.
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its job id from the owning [`IdSet`] on drop.
#[derive(Debug)]
pub struct IdGuard {
    set: IdSet,
    id: i64,
}

impl IdGuard {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_sorted() {
        let set = IdSet::new();
        for id in [42, 7, 19] {
            set.add(id);
        }
        assert_eq!(set.snapshot(), vec![7, 19, 42]);
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let set = IdSet::new();
        {
            let guard = set.register(3);
            assert_eq!(guard.id(), 3);
            assert!(set.contains(3));
        }
        assert!(!set.contains(3));
        assert!(set.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let set = IdSet::new();
        let other = set.clone();
        let _guard = set.register(1);
        assert_eq!(other.snapshot(), vec![1]);
        other.remove(1);
        assert_eq!(set.len(), 0);
    }
}
