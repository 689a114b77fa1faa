//! # Local Key/Value Store
//!
//! Values are content-addressed: the key is the 20-byte SHA-1 digest of the
//! value, computed identically on every node. Each entry carries two
//! deadlines — one for periodic re-publication to the current closest
//! peers, one for dropping the entry — plus a flag marking whether this
//! node is the original publisher. Only publisher-owned entries are
//! offered for replication.
//!
//! [`MemoryStorage`] is internally synchronized; the engine holds it as
//! `Arc<dyn Storage>` so alternative backends can be injected.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::DhtError;
use crate::id::ID_LENGTH;

/// A store key: the content hash of the stored value.
pub type Key = [u8; ID_LENGTH];

/// Content hash used for store keys.
pub fn key_for(data: &[u8]) -> Key {
    sha1_smol::Sha1::from(data).digest().bytes()
}

/// Storage backend consumed by the DHT engine.
pub trait Storage: Send + Sync {
    /// Insert or overwrite the entry for `key`.
    fn store(
        &self,
        key: Key,
        value: Vec<u8>,
        replication: Instant,
        expiration: Instant,
        publisher: bool,
    ) -> Result<(), DhtError>;

    fn retrieve(&self, key: &Key) -> Option<Vec<u8>>;

    /// Publisher-owned keys whose replication deadline has elapsed. Each
    /// returned key's deadline is advanced by one replication period so the
    /// one-second maintenance tick republishes it once per period.
    fn keys_ready_to_replicate(&self) -> Vec<Key>;

    /// Drop every entry whose expiration deadline has elapsed.
    fn expire_keys(&self);
}

struct StoredEntry {
    value: Vec<u8>,
    replication: Instant,
    expiration: Instant,
    publisher: bool,
}

/// In-memory storage backend.
pub struct MemoryStorage {
    entries: Mutex<HashMap<Key, StoredEntry>>,
    replicate_interval: Duration,
}

impl MemoryStorage {
    /// `replicate_interval` should match the engine's `ReplicateTime`; it
    /// is the amount by which a replicated key's deadline advances.
    pub fn new(replicate_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            replicate_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("storage lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl Storage for MemoryStorage {
    fn store(
        &self,
        key: Key,
        value: Vec<u8>,
        replication: Instant,
        expiration: Instant,
        publisher: bool,
    ) -> Result<(), DhtError> {
        let mut entries = self.entries.lock().expect("storage lock");
        entries.insert(
            key,
            StoredEntry {
                value,
                replication,
                expiration,
                publisher,
            },
        );
        Ok(())
    }

    fn retrieve(&self, key: &Key) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("storage lock");
        entries.get(key).map(|e| e.value.clone())
    }

    fn keys_ready_to_replicate(&self) -> Vec<Key> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("storage lock");
        let mut ready = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if entry.publisher && entry.replication <= now {
                entry.replication = now + self.replicate_interval;
                ready.push(*key);
            }
        }
        ready
    }

    fn expire_keys(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("storage lock");
        entries.retain(|_, entry| entry.expiration > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn key_is_deterministic_and_twenty_bytes() {
        let a = key_for(b"hello");
        let b = key_for(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_LENGTH);
        assert_ne!(a, key_for(b"hello!"));
    }

    #[test]
    fn store_and_retrieve_round_trip() {
        let storage = MemoryStorage::default();
        let key = key_for(b"value");

        assert!(storage.retrieve(&key).is_none());
        storage
            .store(key, b"value".to_vec(), far_future(), far_future(), true)
            .unwrap();
        assert_eq!(storage.retrieve(&key).as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn store_overwrites_existing_entry() {
        let storage = MemoryStorage::default();
        let key = key_for(b"original");

        storage
            .store(key, b"original".to_vec(), far_future(), far_future(), true)
            .unwrap();
        storage
            .store(key, b"replaced".to_vec(), far_future(), far_future(), false)
            .unwrap();

        assert_eq!(storage.retrieve(&key).as_deref(), Some(&b"replaced"[..]));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_keys_drops_only_elapsed_entries() {
        let storage = MemoryStorage::default();
        let stale = key_for(b"stale");
        let fresh = key_for(b"fresh");
        let now = Instant::now();

        storage
            .store(stale, b"stale".to_vec(), far_future(), now + Duration::from_secs(1), false)
            .unwrap();
        storage
            .store(fresh, b"fresh".to_vec(), far_future(), now + Duration::from_secs(60), false)
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        storage.expire_keys();

        assert!(storage.retrieve(&stale).is_none());
        assert!(storage.retrieve(&fresh).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn replication_returns_only_publisher_keys_and_advances_deadline() {
        let storage = MemoryStorage::new(Duration::from_secs(30));
        let mine = key_for(b"mine");
        let theirs = key_for(b"theirs");
        let now = Instant::now();

        storage
            .store(mine, b"mine".to_vec(), now + Duration::from_secs(1), far_future(), true)
            .unwrap();
        storage
            .store(theirs, b"theirs".to_vec(), now + Duration::from_secs(1), far_future(), false)
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.keys_ready_to_replicate(), vec![mine]);

        // Deadline advanced: nothing is ready again until the interval passes.
        assert!(storage.keys_ready_to_replicate().is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(storage.keys_ready_to_replicate(), vec![mine]);
    }
}
