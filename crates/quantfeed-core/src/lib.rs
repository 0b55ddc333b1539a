//! # Quantfeed Core
//!
//! 과거 시세 데이터 접근 계층의 핵심 도메인 모델 및 타입을 제공합니다.
//!
//! 이 크레이트는 데이터 계층 전반에서 사용되는 기본 타입을 제공합니다:
//! - OHLCV 바(`Bar`) 및 타임프레임 정의
//! - 반개구간 범위 키(`RangeKey`)
//! - 거래 캘린더 정책 (갭 허용 판단)
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use self::config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
