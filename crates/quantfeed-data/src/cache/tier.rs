//! 바 범위 캐시 계층.
//!
//! `RangeKey` 단위로 직렬화된 바 목록을 캐시 저장소(Redis 또는 메모리)에 보관합니다.
//!
//! - 정확히 같은 키만 히트 (범위 포함 관계는 보지 않음)
//! - TTL은 `get` 시점에 지연 확인
//! - 전체 바이트가 예산을 넘으면 `put` 시점에 LRU 제거
//! - 시계열별 상주 범위는 서로 겹치지 않도록 유지 (겹치는 `put`이 기존 항목을 대체)
//! - 같은 키에 대한 `get`/`put`/`invalidate`는 키별 RwLock으로 직렬화
//!
//! 캐시는 원본 저장소가 아니므로 언제든 버려도 안전합니다.

use crate::error::{DataError, Result};
use crate::storage::CacheStore;
use chrono::{DateTime, Utc};
use quantfeed_core::{Bar, CacheConfig, RangeKey, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// 키별 잠금 맵.
type KeyLockMap = RwLock<HashMap<String, Arc<RwLock<()>>>>;

/// 하나의 `RangeKey`에 대한 캐시 항목.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RangeKey,
    pub bars: Vec<Bar>,
    /// 저장 시각
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// 캐시 통계.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub bytes: usize,
    pub capacity_bytes: usize,
    pub entries: usize,
    pub hit_rate: f64,
}

struct IndexEntry {
    key: RangeKey,
    size: usize,
    expires_at: Instant,
    tick: u64,
}

/// 상주 항목 인덱스. 모든 필드는 하나의 mutex 아래에서만 변경됩니다.
#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    /// LRU 순서 (tick → 키)
    lru: BTreeMap<u64, String>,
    /// 시계열별 상주 범위 (시작 시각 → 키)
    resident: HashMap<(String, Timeframe), BTreeMap<DateTime<Utc>, String>>,
    total_bytes: usize,
    next_tick: u64,
    hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
}

impl CacheIndex {
    fn touch(&mut self, id: &str) {
        self.next_tick += 1;
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(id) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            self.lru.insert(tick, id.to_string());
        }
    }

    fn insert(&mut self, id: String, key: RangeKey, size: usize, expires_at: Instant) {
        self.remove(&id);
        self.next_tick += 1;
        let tick = self.next_tick;
        self.resident
            .entry((key.symbol.clone(), key.timeframe))
            .or_default()
            .insert(key.start, id.clone());
        self.lru.insert(tick, id.clone());
        self.total_bytes += size;
        self.entries.insert(
            id,
            IndexEntry {
                key,
                size,
                expires_at,
                tick,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(id)?;
        self.lru.remove(&entry.tick);
        self.total_bytes -= entry.size;

        let series = (entry.key.symbol.clone(), entry.key.timeframe);
        if let Some(ranges) = self.resident.get_mut(&series) {
            if ranges.get(&entry.key.start).map(String::as_str) == Some(id) {
                ranges.remove(&entry.key.start);
            }
            if ranges.is_empty() {
                self.resident.remove(&series);
            }
        }
        Some(entry)
    }

    /// 범위와 겹치는 상주 항목 ID (시작 시각 순).
    fn overlapping(&self, window: &RangeKey) -> Vec<String> {
        let series = (window.symbol.clone(), window.timeframe);
        let Some(ranges) = self.resident.get(&series) else {
            return Vec::new();
        };
        ranges
            .range(..window.end)
            .filter_map(|(_, id)| self.entries.get(id).map(|entry| (id, entry)))
            .filter(|(_, entry)| entry.key.overlaps(window))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 예산을 넘는 동안 가장 오래 사용되지 않은 항목을 제거합니다.
    fn evict_to(&mut self, capacity: usize, keep: &str) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.total_bytes > capacity {
            let victim = self
                .lru
                .values()
                .find(|id| id.as_str() != keep)
                .cloned();
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
            self.evictions += 1;
            evicted.push(victim);
        }
        evicted
    }
}

/// 바 범위 캐시.
pub struct BarCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    key_locks: KeyLockMap,
}

impl BarCache {
    /// 새 캐시 계층 생성.
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            index: Mutex::new(CacheIndex::default()),
            key_locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// 타임프레임에 설정된 TTL.
    pub fn ttl_for(&self, timeframe: Timeframe) -> Duration {
        self.config.ttl_for(timeframe)
    }

    /// 저장소 키 (`<prefix>:symbol|timeframe|start|end`).
    pub fn store_key(&self, key: &RangeKey) -> String {
        format!("{}:{}", self.config.key_prefix, key.cache_key())
    }

    fn symbol_store_prefix(&self, symbol: &str) -> String {
        format!("{}:{}", self.config.key_prefix, RangeKey::symbol_prefix(symbol))
    }

    fn lock_index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 동시성 제어를 위한 Lock 획득 또는 생성.
    async fn get_or_create_lock(&self, id: &str) -> Arc<RwLock<()>> {
        let locks = self.key_locks.read().await;
        if let Some(lock) = locks.get(id) {
            return lock.clone();
        }
        drop(locks);

        let mut locks = self.key_locks.write().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 더 이상 사용되지 않는 키 잠금을 정리합니다.
    async fn prune_locks(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut locks = self.key_locks.write().await;
        for id in ids {
            if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(id);
            }
        }
    }

    /// 저장소에서 키들을 삭제합니다. 실패는 로그만 남깁니다.
    async fn purge(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.delete(ids).await {
            warn!(count = ids.len(), error = %e, "Failed to delete cache keys");
        }
        self.prune_locks(ids).await;
    }

    // =========================================================================
    // 조회
    // =========================================================================

    /// 정확히 일치하는 키의 항목을 조회합니다.
    ///
    /// 만료되었거나 저장소에서 사라졌거나 해석할 수 없는 항목은 인덱스에서
    /// 제거되고 미스로 처리됩니다.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &RangeKey) -> Result<Option<CacheEntry>> {
        let id = self.store_key(key);

        let indexed = self.lock_index().entries.contains_key(&id);
        if !indexed {
            self.lock_index().misses += 1;
            return Ok(None);
        }

        let lock = self.get_or_create_lock(&id).await;
        let guard = lock.read().await;

        let expired = {
            let mut index = self.lock_index();
            match index.entries.get(&id) {
                None => {
                    index.misses += 1;
                    return Ok(None);
                }
                Some(entry) if entry.expires_at <= Instant::now() => {
                    index.remove(&id);
                    index.expirations += 1;
                    index.misses += 1;
                    true
                }
                Some(_) => {
                    index.touch(&id);
                    false
                }
            }
        };
        if expired {
            debug!("Cache entry expired");
            drop(guard);
            self.purge(std::slice::from_ref(&id)).await;
            return Ok(None);
        }

        let payload = match self.store.get(&id).await? {
            Some(payload) => payload,
            None => {
                let mut index = self.lock_index();
                index.remove(&id);
                index.misses += 1;
                return Ok(None);
            }
        };

        match serde_json::from_str::<CacheEntry>(&payload) {
            Ok(entry) if entry.key == *key => {
                self.lock_index().hits += 1;
                debug!(bars = entry.bars.len(), "Cache hit");
                Ok(Some(entry))
            }
            Ok(_) | Err(_) => {
                warn!("Discarding undecodable cache entry");
                {
                    let mut index = self.lock_index();
                    index.remove(&id);
                    index.misses += 1;
                }
                drop(guard);
                self.purge(std::slice::from_ref(&id)).await;
                Ok(None)
            }
        }
    }

    /// 범위와 겹치는 상주(만료되지 않은) 키를 시작 시각 순으로 반환합니다.
    pub fn resident_ranges(&self, window: &RangeKey) -> Vec<RangeKey> {
        let now = Instant::now();
        let index = self.lock_index();
        index
            .overlapping(window)
            .iter()
            .filter_map(|id| index.entries.get(id))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.key.clone())
            .collect()
    }

    // =========================================================================
    // 저장 / 무효화
    // =========================================================================

    /// 바 목록을 캐시에 저장합니다.
    ///
    /// 겹치는 기존 항목은 대체되고, 예산을 넘으면 LRU 항목이 제거됩니다.
    /// 전체 예산보다 큰 항목은 저장하지 않으며 `false`를 반환합니다.
    #[instrument(skip(self, bars), fields(key = %key, bars = bars.len()))]
    pub async fn put(&self, key: &RangeKey, bars: &[Bar], ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return Ok(false);
        }

        let entry = CacheEntry {
            key: key.clone(),
            bars: bars.to_vec(),
            stored_at: Utc::now(),
            ttl,
        };
        let payload = serde_json::to_string(&entry)?;
        let size = payload.len();
        if size > self.config.capacity_bytes {
            warn!(
                size = size,
                capacity = self.config.capacity_bytes,
                "Entry exceeds cache budget, not caching"
            );
            return Ok(false);
        }

        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| DataError::CacheError(format!("ttl {:?} out of range", ttl)))?;

        let id = self.store_key(key);
        let lock = self.get_or_create_lock(&id).await;
        let guard = lock.write().await;

        self.store.set_ex(&id, &payload, ttl).await?;

        let removed = {
            let mut index = self.lock_index();
            let mut removed: Vec<String> = index
                .overlapping(key)
                .into_iter()
                .filter(|other| *other != id)
                .collect();
            for other in &removed {
                index.remove(other);
            }
            index.insert(id.clone(), key.clone(), size, expires_at);
            removed.extend(index.evict_to(self.config.capacity_bytes, &id));
            removed
        };
        drop(guard);

        if !removed.is_empty() {
            debug!(removed = removed.len(), "Superseded or evicted cache entries");
        }
        self.purge(&removed).await;
        Ok(true)
    }

    /// 하나의 범위를 무효화합니다.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn invalidate(&self, key: &RangeKey) -> Result<bool> {
        let id = self.store_key(key);
        let lock = self.get_or_create_lock(&id).await;
        let guard = lock.write().await;

        let was_indexed = self.lock_index().remove(&id).is_some();
        let deleted = self.store.delete(std::slice::from_ref(&id)).await?;
        drop(guard);
        drop(lock);

        self.prune_locks(std::slice::from_ref(&id)).await;
        Ok(was_indexed || deleted > 0)
    }

    /// 심볼의 모든 타임프레임 항목을 무효화하고 제거된 수를 반환합니다.
    #[instrument(skip(self))]
    pub async fn invalidate_symbol(&self, symbol: &str) -> Result<usize> {
        let removed: Vec<String> = {
            let mut index = self.lock_index();
            let ids: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.key.symbol == symbol)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                index.remove(id);
            }
            ids
        };

        // 재시작 이전에 기록된 키까지 접두사로 삭제
        let deleted = self
            .store
            .delete_prefix(&self.symbol_store_prefix(symbol))
            .await?;
        self.prune_locks(&removed).await;

        let count = removed.len().max(deleted);
        info!(symbol = symbol, removed = count, "Invalidated symbol cache");
        Ok(count)
    }

    /// 캐시 통계를 가져옵니다.
    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        let total = index.hits + index.misses;
        let hit_rate = if total > 0 {
            index.hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits: index.hits,
            misses: index.misses,
            expirations: index.expirations,
            evictions: index.evictions,
            bytes: index.total_bytes,
            capacity_bytes: self.config.capacity_bytes,
            entries: index.entries.len(),
            hit_rate,
        }
    }

    /// 저장소 상태를 확인합니다.
    pub async fn ping(&self) -> Result<bool> {
        self.store.ping().await
    }
}

impl std::fmt::Debug for BarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarCache")
            .field("backend", &self.store.backend())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn key(symbol: &str, from_min: i64, to_min: i64) -> RangeKey {
        RangeKey::new(
            symbol,
            Timeframe::M1,
            t0() + ChronoDuration::minutes(from_min),
            t0() + ChronoDuration::minutes(to_min),
        )
        .unwrap()
    }

    fn bars_for(key: &RangeKey) -> Vec<Bar> {
        key.slots()
            .map(|ts| {
                Bar::new(
                    key.symbol.clone(),
                    key.timeframe,
                    ts,
                    dec!(10),
                    dec!(11),
                    dec!(9),
                    dec!(10.5),
                    dec!(100),
                )
            })
            .collect()
    }

    fn cache_with(capacity_bytes: usize) -> (Arc<MemoryStore>, BarCache) {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            capacity_bytes,
            ..CacheConfig::default()
        };
        (store.clone(), BarCache::new(store, config))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let (_, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);
        let bars = bars_for(&k);

        assert!(cache.put(&k, &bars, HOUR).await.unwrap());
        let entry = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.bars, bars);
        assert_eq!(entry.ttl, HOUR);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.bytes > 0);
    }

    #[tokio::test]
    async fn test_exact_key_only() {
        let (_, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 10);
        cache.put(&k, &bars_for(&k), HOUR).await.unwrap();

        assert!(cache.get(&key("AAPL", 0, 5)).await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_on_get() {
        let (_, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);
        cache
            .put(&k, &bars_for(&k), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.resident_ranges(&k).is_empty());
        assert!(cache.get(&k).await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_under_budget() {
        let a = key("AAPL", 0, 5);
        let b = key("AAPL", 10, 15);
        let c = key("AAPL", 20, 25);
        let entry_size = serde_json::to_string(&CacheEntry {
            key: a.clone(),
            bars: bars_for(&a),
            stored_at: Utc::now(),
            ttl: HOUR,
        })
        .unwrap()
        .len();

        // 두 항목과 약간의 여유
        let (_, cache) = cache_with(entry_size * 2 + entry_size / 2);
        cache.put(&a, &bars_for(&a), HOUR).await.unwrap();
        cache.put(&b, &bars_for(&b), HOUR).await.unwrap();
        // a를 최근 사용으로 갱신
        assert!(cache.get(&a).await.unwrap().is_some());
        cache.put(&c, &bars_for(&c), HOUR).await.unwrap();

        assert!(cache.get(&b).await.unwrap().is_none());
        assert!(cache.get(&a).await.unwrap().is_some());
        assert!(cache.get(&c).await.unwrap().is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.stats().bytes <= cache.stats().capacity_bytes);
    }

    #[tokio::test]
    async fn test_oversized_entry_not_cached() {
        let (_, cache) = cache_with(64);
        let k = key("AAPL", 0, 30);
        assert!(!cache.put(&k, &bars_for(&k), HOUR).await.unwrap());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_overlapping_put_supersedes() {
        let (store, cache) = cache_with(1 << 20);
        let old = key("AAPL", 0, 10);
        let newer = key("AAPL", 5, 15);
        cache.put(&old, &bars_for(&old), HOUR).await.unwrap();
        cache.put(&newer, &bars_for(&newer), HOUR).await.unwrap();

        let window = key("AAPL", 0, 60);
        assert_eq!(cache.resident_ranges(&window), vec![newer]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_resident_ranges_ordered_and_filtered() {
        let (_, cache) = cache_with(1 << 20);
        let late = key("AAPL", 30, 40);
        let early = key("AAPL", 0, 10);
        let other = key("MSFT", 0, 10);
        for k in [&late, &early, &other] {
            cache.put(k, &bars_for(k), HOUR).await.unwrap();
        }

        let found = cache.resident_ranges(&key("AAPL", 5, 35));
        assert_eq!(found, vec![early, late]);
        assert!(cache.resident_ranges(&key("AAPL", 10, 30)).is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_symbol_across_timeframes() {
        let (store, cache) = cache_with(1 << 20);
        let minute = key("AAPL", 0, 5);
        let daily = RangeKey::new(
            "AAPL",
            Timeframe::D1,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let kept = key("AAPLX", 0, 5);
        for k in [&minute, &daily, &kept] {
            cache.put(k, &bars_for(k), HOUR).await.unwrap();
        }

        assert_eq!(cache.invalidate_symbol("AAPL").await.unwrap(), 2);
        assert!(cache.get(&minute).await.unwrap().is_none());
        assert!(cache.get(&daily).await.unwrap().is_none());
        assert!(cache.get(&kept).await.unwrap().is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_single_key() {
        let (_, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);
        cache.put(&k, &bars_for(&k), HOUR).await.unwrap();

        assert!(cache.invalidate(&k).await.unwrap());
        assert!(!cache.invalidate(&k).await.unwrap());
        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_a_miss() {
        let (store, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);
        cache.put(&k, &bars_for(&k), HOUR).await.unwrap();
        store
            .set_ex(&cache.store_key(&k), "{not json", HOUR)
            .await
            .unwrap();

        assert!(cache.get(&k).await.unwrap().is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_store_key_format() {
        let (_, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);
        assert_eq!(
            cache.store_key(&k),
            format!("bars:AAPL|1m|{}|{}", k.start.timestamp(), k.end.timestamp())
        );
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_not_cached() {
        let (store, cache) = cache_with(1 << 20);
        let k = key("AAPL", 0, 5);

        let result = cache
            .put(&k, &bars_for(&k), Duration::from_secs(u64::MAX))
            .await;
        assert!(matches!(result, Err(DataError::CacheError(_))));
        assert!(cache.resident_ranges(&k).is_empty());
        assert!(store.is_empty().await);
    }

    // =========================================================================
    // 동시성
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_put_get() {
        let (_, cache) = cache_with(1 << 20);
        let cache = Arc::new(cache);
        let k = key("AAPL", 0, 5);

        // 거래량만 다른 여러 버전
        let versions: Vec<Vec<Bar>> = (0..8)
            .map(|i| {
                bars_for(&k)
                    .into_iter()
                    .map(|mut bar| {
                        bar.volume += rust_decimal::Decimal::from(i);
                        bar
                    })
                    .collect()
            })
            .collect();

        let handles: Vec<_> = versions
            .iter()
            .cloned()
            .map(|bars| {
                let cache = cache.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    cache.put(&k, &bars, HOUR).await.unwrap();
                    cache.get(&k).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            // 같은 키의 put 사이에서도 읽기는 항상 완전한 한 버전을 본다
            let entry = handle.await.unwrap().expect("entry stays resident");
            assert!(versions.contains(&entry.bars));
        }

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(cache.resident_ranges(&k), vec![k.clone()]);
    }
}
