use std::collections::HashMap;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tokio::sync::{Mutex, RwLock};

use crate::db::tenant::schema_name;
use crate::services::metrics;

/// Registry of live per-tenant database handles.
///
/// Each handle is a small `PgPool` whose connections run
/// `SET search_path TO "<tenant schema>", public` on establishment, so every
/// query issued through it is routed against that tenant's schema only.
/// Entries are created lazily on first resolution and live until explicit
/// invalidation or process exit.
///
/// Locking discipline: the warm path takes only the map's read lock. A miss
/// goes through a per-tenant creation gate so concurrent first-requests for
/// the same tenant open exactly one pool; pool construction (the slow part)
/// happens while holding only that tenant's gate, never the map-wide lock.
pub struct TenantPools {
    database_url: String,
    max_connections: u32,
    pools: RwLock<HashMap<String, PgPool>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TenantPools {
    pub fn new(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections,
            pools: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `slug`, creating it on first use.
    pub async fn get_or_create(&self, slug: &str) -> anyhow::Result<PgPool> {
        if let Some(pool) = self.pools.read().await.get(slug) {
            metrics::HANDLE_CACHE_HITS.with_label_values(&[slug]).inc();
            return Ok(pool.clone());
        }

        metrics::HANDLE_CACHE_MISSES.with_label_values(&[slug]).inc();
        let gate = self.creation_gate(slug).await;
        let _guard = gate.lock().await;

        // Lost the race: another task finished creation while we waited.
        if let Some(pool) = self.pools.read().await.get(slug) {
            return Ok(pool.clone());
        }

        let pool = self.connect(slug).await?;
        let mut pools = self.pools.write().await;
        pools.insert(slug.to_string(), pool.clone());
        metrics::HANDLES_CACHED.set(pools.len() as f64);
        drop(pools);

        tracing::info!("Opened schema-bound handle for tenant '{slug}'");
        Ok(pool)
    }

    /// Evict one tenant's handle. The next `get_or_create` re-resolves it.
    /// Used after deactivation, soft delete, or an administrative cache clear.
    pub async fn invalidate(&self, slug: &str) {
        let removed = {
            let mut pools = self.pools.write().await;
            let removed = pools.remove(slug);
            metrics::HANDLES_CACHED.set(pools.len() as f64);
            removed
        };
        self.gates.lock().await.remove(slug);

        if let Some(pool) = removed {
            // Close outside the map lock: close() waits for checked-out connections.
            pool.close().await;
            tracing::info!("Evicted cached handle for tenant '{slug}'");
        }
    }

    /// Evict every cached handle.
    pub async fn invalidate_all(&self) {
        let drained: Vec<(String, PgPool)> = {
            let mut pools = self.pools.write().await;
            let drained = pools.drain().collect();
            metrics::HANDLES_CACHED.set(0.0);
            drained
        };
        self.gates.lock().await.clear();

        let count = drained.len();
        for (_, pool) in drained {
            pool.close().await;
        }
        tracing::info!("Cleared tenant handle cache ({count} entries)");
    }

    pub async fn cached_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// One creation gate per tenant, shared by all tasks racing on the same miss.
    async fn creation_gate(&self, slug: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn connect(&self, slug: &str) -> anyhow::Result<PgPool> {
        let schema = schema_name(slug);
        let set_path = format!("SET search_path TO \"{schema}\", public");
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .after_connect(move |conn, _meta| {
                let set_path = set_path.clone();
                Box::pin(async move {
                    conn.execute(set_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&self.database_url)
            .await?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creation_gate_is_shared_per_tenant() {
        let pools = TenantPools::new("postgres://unused", 1);
        let (a, b) = tokio::join!(pools.creation_gate("acme"), pools.creation_gate("acme"));
        assert!(Arc::ptr_eq(&a, &b));

        let other = pools.creation_gate("beta").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn gate_serializes_concurrent_creators() {
        let pools = Arc::new(TenantPools::new("postgres://unused", 1));
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pools = pools.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let gate = pools.creation_gate("acme").await;
                let _guard = gate.lock().await;
                let inside = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(inside, 0, "two tasks inside the creation section");
                tokio::task::yield_now().await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn invalidate_unknown_tenant_is_a_noop() {
        let pools = TenantPools::new("postgres://unused", 1);
        pools.invalidate("ghost").await;
        assert_eq!(pools.cached_count().await, 0);
        pools.invalidate_all().await;
    }
}
