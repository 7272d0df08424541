// =============================================================================
// Snapshot cache — namespaced string-keyed store with per-entry TTL
// =============================================================================
//
// Production backs this with Redis (per SPEC_FULL.md §6.3). The bundled
// implementation is an in-memory map behind `parking_lot::RwLock`, good
// enough for a single-process deployment and for tests; entries past their
// TTL read back as a miss instead of being eagerly swept.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String, ttl: Duration);
    async fn remove(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemorySnapshotCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// Snapshot cache key for a strategy instance's persistent state, per
/// SPEC_FULL.md §4.7.7: keyed by (user, symbol, strategy_type).
pub fn strategy_snapshot_key(user_id: i64, symbol: &str, strategy_type: crate::types::StrategyType) -> String {
    format!("strategy_snapshot:{user_id}:{symbol}:{strategy_type}")
}

pub const STRATEGY_SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = InMemorySnapshotCache::new();
        cache.put("k", "v".to_string(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = InMemorySnapshotCache::new();
        cache.put("k", "v".to_string(), Duration::from_millis(0)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let cache = InMemorySnapshotCache::new();
        cache.put("k", "v".to_string(), Duration::from_secs(60)).await;
        cache.remove("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
