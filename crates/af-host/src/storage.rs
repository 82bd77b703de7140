//! Script storage persisted across sends of the same request node.
//!
//! `localStorage` lives as long as the cache entry. `sessionStorage` expires
//! after the configured TTL without a write.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Local and session storage of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStorage {
    /// `af.localStorage`.
    pub local: BTreeMap<String, String>,
    /// `af.sessionStorage`.
    pub session: BTreeMap<String, String>,
}

/// Persisted key/value cache keyed by node id.
#[async_trait::async_trait]
pub trait StorageCache: Send + Sync {
    /// Storage for `node_id`; empty when nothing is cached.
    async fn load(&self, node_id: &str) -> NodeStorage;

    /// Replace the cached storage for `node_id`.
    async fn store(&self, node_id: &str, storage: NodeStorage);
}

/// Configuration for [`MemoryStorageCache`].
#[derive(Debug, Clone)]
pub struct StorageCacheConfig {
    /// Maximum number of nodes kept (default: 1024). The least recently
    /// written node is evicted first.
    pub max_nodes: usize,
    /// How long session storage survives without a write (default: 1 hour).
    pub session_ttl: Duration,
}

impl Default for StorageCacheConfig {
    fn default() -> Self {
        Self {
            max_nodes: 1024,
            session_ttl: Duration::from_secs(3600),
        }
    }
}

struct CacheEntry {
    local: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
    written_at: Instant,
}

impl CacheEntry {
    fn session_expired(&self, ttl: Duration) -> bool {
        self.written_at.elapsed() >= ttl
    }
}

/// In-memory [`StorageCache`].
pub struct MemoryStorageCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: StorageCacheConfig,
}

impl MemoryStorageCache {
    /// Create an empty cache.
    pub fn new(config: StorageCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Number of nodes currently cached.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for MemoryStorageCache {
    fn default() -> Self {
        Self::new(StorageCacheConfig::default())
    }
}

#[async_trait::async_trait]
impl StorageCache for MemoryStorageCache {
    async fn load(&self, node_id: &str) -> NodeStorage {
        let entries = self.entries.lock().await;
        match entries.get(node_id) {
            Some(entry) => {
                let session = if entry.session_expired(self.config.session_ttl) {
                    tracing::debug!(node_id, "session storage expired");
                    BTreeMap::new()
                } else {
                    entry.session.clone()
                };
                NodeStorage {
                    local: entry.local.clone(),
                    session,
                }
            }
            None => NodeStorage::default(),
        }
    }

    async fn store(&self, node_id: &str, storage: NodeStorage) {
        let mut entries = self.entries.lock().await;

        if !entries.contains_key(node_id) && entries.len() >= self.config.max_nodes {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.written_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(evicted = %oldest, "storage cache full, evicting");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            node_id.to_string(),
            CacheEntry {
                local: storage.local,
                session: storage.session,
                written_at: Instant::now(),
            },
        );
    }
}
