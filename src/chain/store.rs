//! Committed multi-store and copy-on-write branches
//!
//! `MultiStore` is the committed state of one chain: a set of named
//! key/value sub-stores plus the commit info recorded for every height.
//! `BranchedState` caches writes on top of any `KvStore` and only touches its
//! base when committed, so dropping a branch discards everything it wrote.

use crate::types::ChainId;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pending writes per sub-store; `None` marks a deletion
pub type ChangeSet = BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

/// Committed contents per sub-store
pub type StoreSnapshot = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Read and write-through access shared by the committed store and branches
pub trait KvStore: Send + Sync {
    fn get(&self, store: &str, key: &[u8]) -> Option<Vec<u8>>;

    fn write(&self, changes: ChangeSet);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub app_hash: [u8; 32],
}

/// Synthetic header an execution runs under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub chain_id: ChainId,
    pub height: u64,
    pub time: DateTime<Utc>,
    pub app_hash: [u8; 32],
}

#[derive(Debug, Default)]
pub struct MultiStore {
    stores: RwLock<StoreSnapshot>,
    commits: RwLock<BTreeMap<u64, CommitInfo>>,
}

impl MultiStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest committed height, 0 before the first block
    pub fn latest_height(&self) -> u64 {
        self.commits
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub fn commit_info(&self, height: u64) -> Option<CommitInfo> {
        self.commits.read().get(&height).cloned()
    }

    /// Record a new block height over the current contents
    pub fn commit_block(&self, timestamp: DateTime<Utc>) -> CommitInfo {
        let mut commits = self.commits.write();
        let height = commits.keys().next_back().copied().unwrap_or(0) + 1;
        let info = CommitInfo {
            height,
            timestamp,
            app_hash: self.root_hash(),
        };
        commits.insert(height, info.clone());
        info
    }

    /// Start the chain at a given height, as if genesis had been replayed up to it
    pub fn init_genesis(&self, height: u64, timestamp: DateTime<Utc>) {
        let app_hash = self.root_hash();
        let mut commits = self.commits.write();
        for h in 1..=height {
            commits.insert(
                h,
                CommitInfo {
                    height: h,
                    timestamp,
                    app_hash,
                },
            );
        }
    }

    /// Hash over the full committed contents
    pub fn root_hash(&self) -> [u8; 32] {
        let stores = self.stores.read();
        let mut hasher = Keccak256::new();
        for (name, entries) in stores.iter() {
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            for (key, value) in entries {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key);
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value);
            }
        }
        hasher.finalize().into()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.stores.read().clone()
    }

    pub fn set(&self, store: &str, key: &[u8], value: Vec<u8>) {
        self.stores
            .write()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_vec(), value);
    }
}

impl KvStore for MultiStore {
    fn get(&self, store: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.stores
            .read()
            .get(store)
            .and_then(|entries| entries.get(key).cloned())
    }

    fn write(&self, changes: ChangeSet) {
        let mut stores = self.stores.write();
        for (name, entries) in changes {
            let target = stores.entry(name).or_default();
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        target.insert(key, value);
                    }
                    None => {
                        target.remove(&key);
                    }
                }
            }
        }
        stores.retain(|_, entries| !entries.is_empty());
    }
}

/// Copy-on-write view over a base store
pub struct BranchedState {
    base: Arc<dyn KvStore>,
    writes: Mutex<ChangeSet>,
}

impl BranchedState {
    pub fn new(base: Arc<dyn KvStore>) -> Self {
        Self {
            base,
            writes: Mutex::new(ChangeSet::new()),
        }
    }

    pub fn get(&self, store: &str, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(cached) = self
            .writes
            .lock()
            .get(store)
            .and_then(|entries| entries.get(key))
        {
            return cached.clone();
        }
        self.base.get(store, key)
    }

    pub fn set(&self, store: &str, key: &[u8], value: Vec<u8>) {
        self.writes
            .lock()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value));
    }

    pub fn delete(&self, store: &str, key: &[u8]) {
        self.writes
            .lock()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_vec(), None);
    }

    pub fn is_dirty(&self) -> bool {
        self.writes.lock().values().any(|entries| !entries.is_empty())
    }

    /// Sub-stores this branch has written to
    pub fn tracked_stores(&self) -> Vec<String> {
        self.writes.lock().keys().cloned().collect()
    }

    /// Nested branch whose commit lands in this branch, not in the base
    pub fn branch(self: &Arc<Self>) -> BranchedState {
        BranchedState::new(self.clone())
    }

    /// Write all cached changes through to the base store, per tracked sub-store
    pub fn commit(&self) {
        let changes = std::mem::take(&mut *self.writes.lock());
        if !changes.is_empty() {
            self.base.write(changes);
        }
    }
}

impl KvStore for BranchedState {
    fn get(&self, store: &str, key: &[u8]) -> Option<Vec<u8>> {
        BranchedState::get(self, store, key)
    }

    fn write(&self, changes: ChangeSet) {
        let mut writes = self.writes.lock();
        for (name, entries) in changes {
            writes.entry(name).or_default().extend(entries);
        }
    }
}

impl std::fmt::Debug for BranchedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchedState")
            .field("tracked_stores", &self.tracked_stores())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(key: &[u8], value: &[u8]) -> Arc<MultiStore> {
        let store = Arc::new(MultiStore::new());
        store.set("bank", key, value.to_vec());
        store
    }

    #[test]
    fn test_branch_reads_through_and_isolates_writes() {
        let store = store_with(b"alice", b"100");
        let branch = BranchedState::new(store.clone());

        assert_eq!(branch.get("bank", b"alice"), Some(b"100".to_vec()));
        branch.set("bank", b"alice", b"90".to_vec());
        branch.delete("bank", b"bob");

        assert_eq!(branch.get("bank", b"alice"), Some(b"90".to_vec()));
        assert_eq!(store.get("bank", b"alice"), Some(b"100".to_vec()));
        assert!(branch.is_dirty());
    }

    #[test]
    fn test_commit_writes_through() {
        let store = store_with(b"alice", b"100");
        let before = store.root_hash();
        let branch = BranchedState::new(store.clone());
        branch.set("bank", b"alice", b"90".to_vec());
        branch.set("meta", b"k", b"v".to_vec());
        branch.commit();

        assert_eq!(store.get("bank", b"alice"), Some(b"90".to_vec()));
        assert_eq!(store.get("meta", b"k"), Some(b"v".to_vec()));
        assert_ne!(store.root_hash(), before);
        assert!(!branch.is_dirty());
    }

    #[test]
    fn test_dropped_branch_leaves_store_untouched() {
        let store = store_with(b"alice", b"100");
        let before = store.snapshot();
        {
            let branch = BranchedState::new(store.clone());
            branch.set("bank", b"alice", b"0".to_vec());
        }
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_nested_branch_commits_into_parent_only() {
        let store = store_with(b"alice", b"100");
        let parent = Arc::new(BranchedState::new(store.clone()));
        let child = parent.branch();
        child.set("bank", b"alice", b"50".to_vec());
        child.commit();

        assert_eq!(parent.get("bank", b"alice"), Some(b"50".to_vec()));
        assert_eq!(store.get("bank", b"alice"), Some(b"100".to_vec()));
    }

    #[test]
    fn test_commit_info_per_height() {
        let store = MultiStore::new();
        assert_eq!(store.latest_height(), 0);
        let now = Utc::now();
        store.init_genesis(2, now);
        let info = store.commit_block(now);

        assert_eq!(info.height, 3);
        assert_eq!(store.latest_height(), 3);
        assert_eq!(store.commit_info(1).unwrap().timestamp, now);
    }
}
