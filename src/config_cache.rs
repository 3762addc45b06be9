//! Per-tenant LLM-client cache.
//!
//! Keyed by tenant id; lazily loaded from the [`crate::store::Store`],
//! refreshed past a TTL, evicted past an idle horizon, invalidated on
//! demand. One lock, held only for the map mutation, with all I/O
//! performed outside it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::DefaultLlmConfig;
use crate::error::AppResult;
use crate::llm_client::{HttpLlmClient, LLMClient};
use crate::store::{Store, TenantId};

static DEFAULTS: OnceCell<DefaultLlmConfig> = OnceCell::new();

/// The immutable process-wide defaults record, materialised exactly once.
pub fn process_defaults() -> &'static DefaultLlmConfig {
    DEFAULTS.get_or_init(DefaultLlmConfig::from_env)
}

struct CacheEntry {
    client: Arc<dyn LLMClient>,
    loaded_at: Instant,
    last_used: Instant,
}

/// Resolves `tenant_id -> Arc<dyn LLMClient>` with TTL-based refresh and
/// idle eviction.
pub struct ClientConfigCache {
    entries: RwLock<HashMap<TenantId, CacheEntry>>,
    ttl: Duration,
    idle_horizon: Duration,
    store: Arc<dyn Store>,
}

impl ClientConfigCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration, idle_horizon: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            idle_horizon,
            store,
        }
    }

    /// Resolve the LLM client for `tenant_id`, loading or refreshing as
    /// needed.
    pub async fn get(&self, tenant_id: &str) -> AppResult<Arc<dyn LLMClient>> {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(tenant_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    entry.last_used = Instant::now();
                    return Ok(entry.client.clone());
                }
            }
        }
        self.load(tenant_id).await
    }

    /// Single-flight-by-best-effort load: fetch the tenant row, fall back
    /// to process defaults field-by-field, materialise a client, probe it
    /// (best-effort), insert. Two concurrent misses may both load; the
    /// later insert wins — either winner is acceptable, tests must not
    /// assume one.
    async fn load(&self, tenant_id: &str) -> AppResult<Arc<dyn LLMClient>> {
        let row = self.store.get_tenant_config(tenant_id).await?;
        let defaults = process_defaults();

        let api_key = row
            .as_ref()
            .and_then(|r| r.api_key.clone())
            .unwrap_or_else(|| defaults.api_key.clone());
        let base_url = row
            .as_ref()
            .and_then(|r| r.base_url.clone())
            .or_else(|| defaults.base_url.clone())
            .unwrap_or_default();
        let model = row
            .as_ref()
            .and_then(|r| r.model.clone())
            .unwrap_or_else(|| defaults.model.clone());

        let client: Arc<dyn LLMClient> = Arc::new(HttpLlmClient::new(base_url, api_key, model));

        if let Err(e) = client.probe().await {
            tracing::warn!(tenant_id, error = %e, "LLM client probe failed, continuing anyway");
        }

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            tenant_id.to_string(),
            CacheEntry {
                client: client.clone(),
                loaded_at: now,
                last_used: now,
            },
        );
        tracing::info!(tenant_id, "loaded LLM client config");
        Ok(client)
    }

    /// Remove a tenant's entry unconditionally; the next lookup performs a
    /// fresh load.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.entries.write().await.remove(tenant_id);
        tracing::info!(tenant_id, "invalidated LLM client config cache entry");
    }

    /// Evict entries whose `last_used` exceeds the idle horizon. Intended
    /// to be driven by a background sweeper task (see
    /// [`ClientConfigCache::spawn_sweeper`]).
    pub async fn sweep_idle(&self) {
        let mut entries = self.entries.write().await;
        let idle_horizon = self.idle_horizon;
        entries.retain(|tenant_id, entry| {
            let keep = entry.last_used.elapsed() < idle_horizon;
            if !keep {
                tracing::debug!(tenant_id, "evicting idle LLM client config entry");
            }
            keep
        });
    }

    /// Spawn a periodic background sweeper that calls [`Self::sweep_idle`]
    /// on a tick shorter than the idle horizon.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.sweep_idle().await;
            }
        })
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> ClientConfigCache {
        ClientConfigCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn loads_defaults_when_tenant_row_missing() {
        let cache = cache();
        let client = cache.get("t1").await.unwrap();
        assert_eq!(client.model(), process_defaults().model);
    }

    #[tokio::test]
    async fn invalidate_then_lookup_performs_fresh_load() {
        let cache = cache();
        cache.get("t1").await.unwrap();
        assert_eq!(cache.len().await, 1);
        cache.invalidate("t1").await;
        assert_eq!(cache.len().await, 0);
        cache.get("t1").await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_idle_evicts_past_horizon() {
        let cache = ClientConfigCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(300),
            Duration::from_millis(1),
        );
        cache.get("t1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep_idle().await;
        assert_eq!(cache.len().await, 0);
    }
}
