//! 데이터 모듈 오류 타입.

use quantfeed_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// 데이터 접근 관련 오류.
#[derive(Debug, Error)]
pub enum DataError {
    /// 타임아웃 안에 사용 가능한 연결이 없음 (호출자가 재시도 가능)
    #[error("Connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    /// 전송 계층 오류 (연결은 폐기됨)
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// 쿼리 실행 오류
    #[error("Query error: {0}")]
    QueryError(String),

    /// 순서/중복/예상치 못한 갭 등 데이터 무결성 위반 (재시도하지 않음)
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// 재시도 후에도 요청 범위를 완성하지 못함
    #[error("Data unavailable for {key} after {attempts} attempt(s): {source}")]
    DataUnavailable {
        key: String,
        attempts: u32,
        #[source]
        source: Box<DataError>,
    },

    /// 캐시 오류
    #[error("Cache error: {0}")]
    CacheError(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// 잘못된 요청 범위
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// 설정 오류
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DataError {
    /// 다시 시도할 수 있는 일시적 오류인지 확인합니다.
    ///
    /// `DataUnavailable`은 마지막 원인 오류를 따릅니다.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::PoolExhausted(_) | DataError::ConnectionError(_) | DataError::QueryError(_) => {
                true
            }
            DataError::DataUnavailable { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 연결 자체가 손상된 전송 계층 오류인지 확인합니다.
    pub fn is_transport(&self) -> bool {
        matches!(self, DataError::ConnectionError(_))
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DataError::ConnectionError(err.to_string()),
            sqlx::Error::Database(db_err) => DataError::QueryError(db_err.message().to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DataError::DataIntegrity(err.to_string())
            }
            _ => DataError::QueryError(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for DataError {
    fn from(err: redis::RedisError) -> Self {
        DataError::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::SerializationError(err.to_string())
    }
}

impl From<CoreError> for DataError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Config(msg) => DataError::ConfigError(msg),
            CoreError::InvalidInput(msg) => DataError::InvalidRange(msg),
            CoreError::InvalidBar(msg) => DataError::DataIntegrity(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DataError::PoolExhausted(Duration::from_secs(1)).is_retryable());
        assert!(DataError::ConnectionError("reset".into()).is_retryable());
        assert!(DataError::QueryError("syntax".into()).is_retryable());
        assert!(!DataError::DataIntegrity("dup".into()).is_retryable());
        assert!(!DataError::CacheError("down".into()).is_retryable());
    }

    #[test]
    fn test_sqlx_mapping() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(DataError::from(io).is_transport());
        assert!(matches!(DataError::from(sqlx::Error::PoolTimedOut), DataError::ConnectionError(_)));
        assert!(matches!(DataError::from(sqlx::Error::RowNotFound), DataError::QueryError(_)));
    }

    #[test]
    fn test_unavailable_keeps_source() {
        let err = DataError::DataUnavailable {
            key: "AAPL|1m|0|60".to_string(),
            attempts: 2,
            source: Box::new(DataError::QueryError("timeout".into())),
        };
        assert!(err.to_string().contains("after 2 attempt(s)"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_unavailable_follows_source_retryability() {
        let exhausted = DataError::DataUnavailable {
            key: "AAPL|1m|0|60".to_string(),
            attempts: 2,
            source: Box::new(DataError::PoolExhausted(Duration::from_millis(50))),
        };
        assert!(exhausted.is_retryable());

        let broken = DataError::DataUnavailable {
            key: "AAPL|1m|0|60".to_string(),
            attempts: 1,
            source: Box::new(DataError::CacheError("down".into())),
        };
        assert!(!broken.is_retryable());
    }

    #[test]
    fn test_core_error_mapping() {
        let err: DataError = CoreError::InvalidInput("empty symbol".into()).into();
        assert!(matches!(err, DataError::InvalidRange(_)));
    }
}
