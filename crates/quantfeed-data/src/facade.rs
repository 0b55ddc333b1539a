//! 데이터 접근 진입점.
//!
//! 캐시 히트/미스를 판단하고, 캐시에 없는 부분 범위만 저장소에서 가져와
//! 병합한 뒤 순서/중복/갭 불변식을 검증합니다. 자체적인 영속 상태는 없습니다.
//!
//! # 흐름
//!
//! 1. 요청을 기간 격자로 정규화
//! 2. 상주 범위 인덱스로 캐시에 없는 최소 부분 범위 계산
//! 3. 부분 범위를 동시에 조회 (일시적 오류는 백오프 후 재시도), 성공 시 캐시에 저장
//! 4. 타임스탬프 기준 병합, 중복 거부, 갭 정책 적용

use crate::cache::BarCache;
use crate::error::{DataError, Result};
use crate::executor::{ensure_strictly_increasing, QueryExecutor};
use crate::feed::{BarFeed, BarSource};
use crate::gaps::{check_gaps, Gap, GapPolicy};
use crate::retry::{Attempted, RetryPolicy};
use crate::storage::AnalyticalStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use quantfeed_core::{range_span, Bar, RangeKey, Timeframe};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// 검증된 바 시퀀스.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarSeries {
    /// 정규화된 요청 범위
    pub key: RangeKey,
    /// 시간순 바
    pub bars: Vec<Bar>,
    /// 허용된 갭
    pub gaps: Vec<Gap>,
}

impl BarSeries {
    pub fn empty(key: RangeKey) -> Self {
        Self {
            key,
            bars: Vec::new(),
            gaps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// 워밍업 요청 항목.
#[derive(Debug, Clone)]
pub struct WarmupRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 데이터 접근 파사드.
pub struct DataAccess<S: AnalyticalStore> {
    executor: QueryExecutor<S>,
    cache: Arc<BarCache>,
    retry: RetryPolicy,
    gap_policy: GapPolicy,
}

impl<S: AnalyticalStore> DataAccess<S> {
    pub fn new(executor: QueryExecutor<S>, cache: Arc<BarCache>) -> Self {
        Self {
            executor,
            cache,
            retry: RetryPolicy::default(),
            gap_policy: GapPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_gap_policy(mut self, gap_policy: GapPolicy) -> Self {
        self.gap_policy = gap_policy;
        self
    }

    pub fn cache(&self) -> &Arc<BarCache> {
        &self.cache
    }

    pub fn executor(&self) -> &QueryExecutor<S> {
        &self.executor
    }

    pub fn gap_policy(&self) -> &GapPolicy {
        &self.gap_policy
    }

    // =========================================================================
    // 조회
    // =========================================================================

    /// `[start, end)` 범위의 정렬/검증된 바를 가져옵니다.
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries> {
        let key = RangeKey::new(symbol, timeframe, start, end)?;
        self.get_range(&key).await
    }

    /// 범위 키로 바를 가져옵니다. 키는 기간 격자로 정규화됩니다.
    pub async fn get_range(&self, key: &RangeKey) -> Result<BarSeries> {
        let window = key.normalized();
        if window.is_empty() {
            return Ok(BarSeries::empty(window));
        }

        let span = range_span!("get_bars", window);
        self.load_window(window).instrument(span).await
    }

    async fn load_window(&self, window: RangeKey) -> Result<BarSeries> {
        let (mut bars, covered) = self.read_cached(&window).await;
        let missing = window.subtract(&covered);

        debug!(
            cached_ranges = covered.len(),
            missing_ranges = missing.len(),
            "Decomposed request"
        );

        let fetched = try_join_all(missing.iter().map(|sub| self.fetch_and_cache(sub))).await?;
        for chunk in fetched {
            bars.extend(chunk);
        }

        bars.sort_by_key(|bar| bar.timestamp);
        ensure_strictly_increasing(&bars)?;

        let gaps = check_gaps(&window, &bars, &self.gap_policy)?;
        for gap in &gaps {
            warn!(
                symbol = %window.symbol,
                timeframe = %window.timeframe,
                gap = %gap,
                "데이터 갭 허용 (거래 없음)"
            );
        }

        Ok(BarSeries {
            key: window,
            bars,
            gaps,
        })
    }

    /// 상주 범위를 캐시에서 읽습니다. 실제로 읽은 범위만 커버로 간주합니다.
    async fn read_cached(&self, window: &RangeKey) -> (Vec<Bar>, Vec<RangeKey>) {
        let mut bars = Vec::new();
        let mut covered = Vec::new();

        for resident in self.cache.resident_ranges(window) {
            match self.cache.get(&resident).await {
                Ok(Some(entry)) => {
                    bars.extend(
                        entry
                            .bars
                            .into_iter()
                            .filter(|bar| window.contains(bar.timestamp)),
                    );
                    covered.push(resident);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %resident, error = %e, "Cache read failed, treating as miss");
                }
            }
        }
        (bars, covered)
    }

    /// 부분 범위를 재시도 정책에 따라 조회하고 캐시에 저장합니다.
    async fn fetch_and_cache(&self, sub: &RangeKey) -> Result<Vec<Bar>> {
        let label = sub.to_string();
        let bars = match self.retry.run(&label, || self.executor.fetch(sub)).await {
            Ok(bars) => bars,
            Err(Attempted {
                error: DataError::DataIntegrity(msg),
                ..
            }) => return Err(DataError::DataIntegrity(msg)),
            Err(Attempted { attempts, error }) => {
                warn!(key = %sub, attempts = attempts, error = %error, "Range unavailable");
                return Err(DataError::DataUnavailable {
                    key: label,
                    attempts,
                    source: Box::new(error),
                });
            }
        };

        let ttl = self.cache.ttl_for(sub.timeframe);
        if let Err(e) = self.cache.put(sub, &bars, ttl).await {
            warn!(key = %sub, error = %e, "Cache write failed");
        }
        Ok(bars)
    }

    // =========================================================================
    // 무효화 / 워밍업
    // =========================================================================

    /// 범위와 겹치는 캐시 항목을 무효화하고 제거된 수를 반환합니다.
    pub async fn invalidate_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let window = RangeKey::new(symbol, timeframe, start, end)?.normalized();
        let mut removed = 0;
        for resident in self.cache.resident_ranges(&window) {
            if self.cache.invalidate(&resident).await? {
                removed += 1;
            }
        }
        info!(key = %window, removed = removed, "Invalidated cached range");
        Ok(removed)
    }

    /// 심볼의 모든 캐시 항목을 무효화합니다 (늦게 도착한 정정 데이터용).
    pub async fn invalidate_symbol(&self, symbol: &str) -> Result<usize> {
        self.cache.invalidate_symbol(symbol).await
    }

    /// 캐시를 미리 채웁니다. 항목별 실패는 로그만 남기고 계속합니다.
    pub async fn warmup(&self, requests: &[WarmupRequest]) -> usize {
        let mut total = 0;
        for req in requests {
            match self
                .get_bars(&req.symbol, req.timeframe, req.start, req.end)
                .await
            {
                Ok(series) => {
                    total += series.len();
                    info!(symbol = %req.symbol, count = series.len(), "Warmup 완료");
                }
                Err(e) => {
                    warn!(symbol = %req.symbol, error = %e, "Warmup 실패");
                }
            }
        }
        total
    }
}

impl<S: AnalyticalStore> DataAccess<S> {
    /// 하나의 심볼에 대한 피드를 생성합니다.
    pub fn feed(
        self: &Arc<Self>,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BarFeed {
        BarFeed::new(self.clone(), symbol, timeframe, start, end)
    }

    /// 여러 심볼의 피드를 생성합니다. 빈 심볼과 중복은 건너뜁니다.
    pub fn feeds(
        self: &Arc<Self>,
        symbols: &[&str],
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<BarFeed> {
        let mut seen = std::collections::HashSet::new();
        let mut feeds = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let symbol = symbol.trim();
            if symbol.is_empty() {
                warn!("Skipping empty symbol");
                continue;
            }
            if !seen.insert(symbol) {
                continue;
            }
            feeds.push(self.feed(symbol, timeframe, start, end));
        }
        feeds
    }
}

#[async_trait]
impl<S: AnalyticalStore> BarSource for DataAccess<S> {
    async fn load_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries> {
        self.get_bars(symbol, timeframe, start, end).await
    }
}
