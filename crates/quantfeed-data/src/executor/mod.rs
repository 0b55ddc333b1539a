//! 쿼리 실행기.
//!
//! 풀에서 연결을 하나 임대해 범위 쿼리를 한 번 실행하고, 행을 검증된 바로
//! 변환합니다. 중간에 실패하면 부분 결과는 버려집니다.

mod decoder;

pub use decoder::{ensure_strictly_increasing, BarColumns, BarDecoder};

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::storage::AnalyticalStore;
use quantfeed_core::{Bar, RangeKey};
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// 범위 쿼리 실행기.
pub struct QueryExecutor<S: AnalyticalStore> {
    pool: ConnectionPool<S>,
    decoder: BarDecoder,
}

impl<S: AnalyticalStore> Clone for QueryExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            decoder: self.decoder.clone(),
        }
    }
}

impl<S: AnalyticalStore> QueryExecutor<S> {
    pub fn new(pool: ConnectionPool<S>) -> Self {
        Self::with_decoder(pool, BarDecoder::default())
    }

    pub fn with_decoder(pool: ConnectionPool<S>, decoder: BarDecoder) -> Self {
        Self { pool, decoder }
    }

    pub fn pool(&self) -> &ConnectionPool<S> {
        &self.pool
    }

    pub fn decoder(&self) -> &BarDecoder {
        &self.decoder
    }

    /// `[start, end)` 범위의 바를 시간순으로 조회합니다.
    ///
    /// 전송 계층 오류가 난 연결은 폐기되고, 쿼리 오류가 난 연결은 풀에 반환됩니다.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn fetch(&self, key: &RangeKey) -> Result<Vec<Bar>> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await?;

        let rows = match self.pool.store().query_range(&mut *conn, key).await {
            Ok(rows) => rows,
            Err(e) => {
                if e.is_transport() {
                    conn.discard();
                }
                warn!(error = %e, "Range query failed");
                return Err(e);
            }
        };
        drop(conn);

        let bars = self.decoder.decode(key, &rows)?;
        debug!(
            bars = bars.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Range query completed"
        );
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use crate::storage::{ColumnValue, StoreRow};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use quantfeed_core::{PoolConfig, Timeframe};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// 미리 정해진 응답을 순서대로 돌려주는 저장소.
    #[derive(Default)]
    struct ScriptedStore {
        next_conn: AtomicU32,
        replies: Mutex<Vec<Result<Vec<StoreRow>>>>,
    }

    impl ScriptedStore {
        fn push(&self, reply: Result<Vec<StoreRow>>) {
            self.replies.lock().unwrap().insert(0, reply);
        }
    }

    #[async_trait]
    impl AnalyticalStore for ScriptedStore {
        type Connection = u32;

        async fn connect(&self) -> Result<u32> {
            Ok(self.next_conn.fetch_add(1, Ordering::SeqCst))
        }

        async fn query_range(&self, _conn: &mut u32, _key: &RangeKey) -> Result<Vec<StoreRow>> {
            self.replies.lock().unwrap().pop().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn server_version(&self, _conn: &mut u32) -> Result<String> {
            Ok("scripted".to_string())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap()
    }

    fn rows(count: i64) -> Vec<StoreRow> {
        (0..count)
            .map(|i| {
                StoreRow::new()
                    .with("open_time", ColumnValue::Timestamp(start() + Duration::minutes(i)))
                    .with("open", ColumnValue::Decimal(dec!(10)))
                    .with("high", ColumnValue::Decimal(dec!(11)))
                    .with("low", ColumnValue::Decimal(dec!(9)))
                    .with("close", ColumnValue::Decimal(dec!(10)))
                    .with("volume", ColumnValue::Decimal(dec!(5)))
            })
            .collect()
    }

    fn executor(store: Arc<ScriptedStore>) -> QueryExecutor<ScriptedStore> {
        let config = PoolConfig {
            min_size: 0,
            max_size: 2,
            ..PoolConfig::default()
        };
        QueryExecutor::new(ConnectionPool::new(store, config).unwrap())
    }

    fn key() -> RangeKey {
        RangeKey::new("AAPL", Timeframe::M1, start(), start() + Duration::minutes(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_ordered_bars() {
        let store = Arc::new(ScriptedStore::default());
        store.push(Ok(rows(5)));
        let exec = executor(store);

        let bars = exec.fetch(&key()).await.unwrap();
        assert_eq!(bars.len(), 5);
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(exec.pool().status().leased, 0);
    }

    #[tokio::test]
    async fn test_transport_error_discards_connection() {
        let store = Arc::new(ScriptedStore::default());
        store.push(Err(DataError::ConnectionError("reset by peer".into())));
        store.push(Ok(rows(1)));
        let exec = executor(store);

        assert!(exec.fetch(&key()).await.unwrap_err().is_transport());
        let status = exec.pool().status();
        assert_eq!(status.discarded, 1);
        assert_eq!(status.live, 0);

        assert_eq!(exec.fetch(&key()).await.unwrap().len(), 1);
        assert_eq!(exec.pool().status().created, 2);
    }

    #[tokio::test]
    async fn test_query_error_keeps_connection() {
        let store = Arc::new(ScriptedStore::default());
        store.push(Err(DataError::QueryError("relation does not exist".into())));
        let exec = executor(store);

        assert!(matches!(exec.fetch(&key()).await, Err(DataError::QueryError(_))));
        let status = exec.pool().status();
        assert_eq!(status.discarded, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_integrity_violation_returns_no_bars() {
        let store = Arc::new(ScriptedStore::default());
        let mut bad = rows(3);
        bad.swap(0, 2);
        store.push(Ok(bad));
        let exec = executor(store);

        assert!(matches!(exec.fetch(&key()).await, Err(DataError::DataIntegrity(_))));
    }
}
