//! 핵심 도메인 에러 타입.
//!
//! 범위 키 검증, 설정 검증 등 코어 크레이트에서 발생하는 에러를 정의합니다.

use thiserror::Error;

/// 코어 도메인 에러.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 잘못된 입력
    #[error("잘못된 입력: {0}")]
    InvalidInput(String),

    /// 잘못된 바 데이터
    #[error("잘못된 바: {0}")]
    InvalidBar(String),
}

/// 코어 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;
