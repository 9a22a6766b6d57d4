use std::collections::HashMap;
use std::hash::Hash;

/// Remembers the highest version seen per document so a consumer can ignore
/// duplicate and out-of-order snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotCursor<K> {
    seen: HashMap<K, u64>,
}

impl<K> Default for SnapshotCursor<K> {
    fn default() -> Self {
        Self { seen: HashMap::new() }
    }
}

impl<K> SnapshotCursor<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `version` is newer than anything seen for `key`.
    pub fn accept(&mut self, key: K, version: u64) -> bool {
        match self.seen.get(&key) {
            Some(last) if *last >= version => false,
            _ => {
                self.seen.insert(key, version);
                true
            }
        }
    }

    pub fn last_seen(&self, key: &K) -> Option<u64> {
        self.seen.get(key).copied()
    }

    /// Drops bookkeeping for a retired document.
    pub fn forget(&mut self, key: &K) {
        self.seen.remove(key);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
