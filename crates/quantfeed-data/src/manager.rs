//! 데이터 계층 구성.
//!
//! 설정으로부터 연결 풀(TimescaleDB), 캐시(Redis 또는 메모리), 파사드를
//! 조립합니다. Redis에 연결할 수 없으면 인메모리 캐시로 계속 진행합니다.

use crate::cache::{BarCache, CacheStats};
use crate::error::Result;
use crate::executor::{BarDecoder, QueryExecutor};
use crate::facade::DataAccess;
use crate::gaps::GapPolicy;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::retry::RetryPolicy;
use crate::storage::memory::MemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::timescale::TimescaleStore;
use crate::storage::{AnalyticalStore, CacheStore};
use quantfeed_core::{AppConfig, CacheConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// 연결 상태.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// 분석 저장소 서버 버전 (실패 시 None)
    pub store_version: Option<String>,
    /// 캐시 백엔드 이름
    pub cache_backend: &'static str,
    pub cache_ok: bool,
    pub pool: PoolStatus,
    pub cache: CacheStats,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_version.is_some() && self.cache_ok
    }
}

/// 구성된 데이터 계층.
pub struct DataLayer<S: AnalyticalStore> {
    access: Arc<DataAccess<S>>,
    pool: ConnectionPool<S>,
    cache: Arc<BarCache>,
}

impl DataLayer<TimescaleStore> {
    /// 설정으로 TimescaleDB + Redis 데이터 계층을 구성합니다.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        info!("Initializing data layer...");
        config.validate()?;

        let store = Arc::new(TimescaleStore::new(&config.store)?);
        let pool = ConnectionPool::connect(store, config.store.pool.clone()).await?;
        let cache_store = connect_cache_store(&config.cache).await;

        let layer = Self::assemble(config, pool, cache_store)?;
        info!("Data layer initialized successfully");
        Ok(layer)
    }
}

impl<S: AnalyticalStore> DataLayer<S> {
    /// 이미 만든 풀과 캐시 저장소로 데이터 계층을 조립합니다.
    pub fn assemble(
        config: &AppConfig,
        pool: ConnectionPool<S>,
        cache_store: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        let cache = Arc::new(BarCache::new(cache_store, config.cache.clone()));
        let decoder = BarDecoder::new(config.store.columns.clone());
        let executor = QueryExecutor::with_decoder(pool.clone(), decoder);
        let access = DataAccess::new(executor, cache.clone())
            .with_retry(RetryPolicy::from(&config.retry))
            .with_gap_policy(GapPolicy::from_config(&config.gaps)?);

        Ok(Self {
            access: Arc::new(access),
            pool,
            cache,
        })
    }

    pub fn access(&self) -> &Arc<DataAccess<S>> {
        &self.access
    }

    pub fn pool(&self) -> &ConnectionPool<S> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<BarCache> {
        &self.cache
    }

    /// 저장소와 캐시 상태를 확인합니다. 실패는 로그만 남깁니다.
    pub async fn health_check(&self) -> HealthReport {
        let store_version = match self.pool.health_check().await {
            Ok(version) => {
                info!(version = %version, "Analytical store healthy");
                Some(version)
            }
            Err(e) => {
                warn!(error = %e, "Analytical store health check failed");
                None
            }
        };

        let cache_ok = match self.cache.ping().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "Cache health check failed");
                false
            }
        };

        HealthReport {
            store_version,
            cache_backend: self.cache.backend(),
            cache_ok,
            pool: self.pool.status(),
            cache: self.cache.stats(),
        }
    }
}

/// 캐시 저장소에 연결합니다. Redis가 없거나 실패하면 인메모리 저장소를 사용합니다.
pub async fn connect_cache_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    let Some(url) = config.redis_url.as_deref() else {
        info!("No Redis URL configured, using in-memory cache");
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::connect(url).await {
        Ok(store) => {
            info!("Redis cache connected");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                "Failed to connect to Redis cache: {}. Continuing with in-memory cache.",
                e
            );
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_falls_back_to_memory() {
        let config = CacheConfig::default();
        assert_eq!(connect_cache_store(&config).await.backend(), "memory");

        let config = CacheConfig {
            redis_url: Some("not-a-url".to_string()),
            ..CacheConfig::default()
        };
        assert_eq!(connect_cache_store(&config).await.backend(), "memory");
    }
}
