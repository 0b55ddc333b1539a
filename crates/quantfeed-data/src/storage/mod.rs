//! 저장소 계층.
//!
//! - 분석 저장소(`AnalyticalStore`): 범위 쿼리를 처리하는 원본 데이터 저장소
//! - 캐시 저장소(`CacheStore`): TTL 기반 휘발성 키/값 저장소
//!
//! 운영 구현은 TimescaleDB와 Redis이며, 테스트 및 Redis 미사용 환경을 위해
//! 인메모리 캐시 저장소를 제공합니다.

pub mod memory;
pub mod redis;
pub mod row;
pub mod timescale;

use crate::error::Result;
use async_trait::async_trait;
use quantfeed_core::RangeKey;
use std::time::Duration;

pub use row::{ColumnValue, StoreRow};

/// 분석 저장소 연결을 만들고 범위 쿼리를 실행하는 백엔드.
///
/// 연결 수명 관리는 `ConnectionPool`이 담당하며, 백엔드는 연결 생성과
/// 단일 쿼리 실행만 구현합니다. 전송 계층 오류는 `DataError::ConnectionError`로
/// 반환해야 풀이 해당 연결을 폐기할 수 있습니다.
#[async_trait]
pub trait AnalyticalStore: Send + Sync + 'static {
    /// 풀이 관리하는 연결 타입.
    type Connection: Send + 'static;

    /// 새 연결을 엽니다.
    async fn connect(&self) -> Result<Self::Connection>;

    /// `[start, end)` 범위의 행을 타임스탬프 순으로 조회합니다.
    async fn query_range(
        &self,
        conn: &mut Self::Connection,
        key: &RangeKey,
    ) -> Result<Vec<StoreRow>>;

    /// 서버 버전 문자열을 조회합니다 (상태 확인용).
    async fn server_version(&self, conn: &mut Self::Connection) -> Result<String>;
}

/// 휘발성 키/값 캐시 저장소 프로토콜 (`GET`, `SET` with expiry, `DEL`).
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// 로그용 백엔드 이름.
    fn backend(&self) -> &'static str;

    /// 값을 가져옵니다.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 만료 시간과 함께 값을 설정합니다.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 키들을 삭제하고 삭제된 수를 반환합니다.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// 접두사와 일치하는 모든 키를 삭제합니다.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// 저장소 상태를 확인합니다.
    async fn ping(&self) -> Result<bool>;
}
