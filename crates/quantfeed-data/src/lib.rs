//! 과거 시세 데이터 접근 및 캐싱.
//!
//! 이 crate는 다음을 제공합니다:
//! - 분석 저장소(TimescaleDB) 연결 풀과 범위 쿼리 실행기
//! - Redis/인메모리 캐시 계층 (TTL, LRU, 상주 범위 인덱스)
//! - 캐시와 저장소를 조정하는 데이터 접근 파사드
//! - 백테스트 엔진용 풀 방식 바 피드

pub mod cache;
pub mod error;
pub mod executor;
pub mod facade;
pub mod feed;
pub mod gaps;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod storage;

pub use error::{DataError, Result};
pub use manager::*;

pub use cache::{BarCache, CacheEntry, CacheStats};
pub use executor::{BarColumns, BarDecoder, QueryExecutor};
pub use facade::{BarSeries, DataAccess, WarmupRequest};
pub use feed::{BarFeed, BarSource};
pub use gaps::{Gap, GapPolicy};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use retry::RetryPolicy;

// 저장소 타입 재내보내기
pub use storage::memory::MemoryStore;
pub use storage::redis::RedisStore;
pub use storage::timescale::TimescaleStore;
pub use storage::{AnalyticalStore, CacheStore, ColumnValue, StoreRow};
