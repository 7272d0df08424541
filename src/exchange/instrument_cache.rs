// =============================================================================
// Instrument cache — paginated symbol metadata, refreshed on a TTL
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::domain::Instrument;
use crate::error::ExchangeError;
use crate::exchange::ExchangeClient;

struct Inner {
    by_symbol: HashMap<String, Arc<Instrument>>,
    fetched_at: Option<Instant>,
}

/// Shared, process-wide cache of instrument trading rules. Refetches the
/// full paginated instrument list when the TTL expires; concurrent callers
/// racing a refresh coalesce onto a single in-flight fetch via the async
/// mutex (double-checked under the read lock first).
pub struct InstrumentCache {
    inner: RwLock<Inner>,
    refresh_lock: AsyncMutex<()>,
    ttl: Duration,
}

impl InstrumentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_symbol: HashMap::new(),
                fetched_at: None,
            }),
            refresh_lock: AsyncMutex::new(()),
            ttl,
        }
    }

    fn is_stale(&self) -> bool {
        let inner = self.inner.read();
        match inner.fetched_at {
            None => true,
            Some(t) => t.elapsed() >= self.ttl,
        }
    }

    /// Return the instrument for `symbol`, refreshing the whole cache first
    /// if it is stale or the symbol is unknown.
    pub async fn get(
        &self,
        client: &ExchangeClient,
        symbol: &str,
    ) -> Result<Option<Arc<Instrument>>, ExchangeError> {
        let known = { self.inner.read().by_symbol.get(symbol).cloned() };
        if known.is_some() && !self.is_stale() {
            return Ok(known);
        }
        self.refresh(client).await?;
        Ok(self.inner.read().by_symbol.get(symbol).cloned())
    }

    async fn refresh(&self, client: &ExchangeClient) -> Result<(), ExchangeError> {
        let _guard = self.refresh_lock.lock().await;
        // Double-check: another caller may have just finished refreshing.
        if !self.is_stale() {
            return Ok(());
        }
        let fetched = client.get_instruments().await?;
        let mut inner = self.inner.write();
        inner.by_symbol = fetched
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
        inner.fetched_at = Some(Instant::now());
        info!(count = inner.by_symbol.len(), "instrument cache refreshed");
        debug!("instrument cache TTL is {:?}", self.ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_is_stale_until_first_fetch() {
        let cache = InstrumentCache::new(Duration::from_secs(300));
        assert!(cache.is_stale());
    }
}
