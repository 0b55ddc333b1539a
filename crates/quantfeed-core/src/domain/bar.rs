//! OHLCV 바 데이터.
//!
//! 하나의 (심볼, 타임프레임) 시계열 안에서 바의 타임스탬프는 엄격하게 증가하며
//! 타임프레임 기간 경계에 정렬되어야 합니다.

use crate::error::{CoreError, CoreResult};
use crate::types::{Price, Timeframe, Volume};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV 바.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// 거래 심볼
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 바 시작 시간 (UTC, 기간 경계 정렬)
    pub timestamp: DateTime<Utc>,
    /// 시가
    pub open: Price,
    /// 고가
    pub high: Price,
    /// 저가
    pub low: Price,
    /// 종가
    pub close: Price,
    /// 거래량
    pub volume: Volume,
}

impl Bar {
    /// 새 바를 생성합니다.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Volume,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// 바 종료 시간(다음 바의 시작 시간)을 반환합니다.
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timestamp + self.timeframe.period()
    }

    /// OHLC 일관성과 기간 정렬을 검증합니다.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.timeframe.is_aligned(self.timestamp) {
            return Err(CoreError::InvalidBar(format!(
                "{} {} not aligned to {}",
                self.symbol, self.timestamp, self.timeframe
            )));
        }
        if self.low > self.high {
            return Err(CoreError::InvalidBar(format!(
                "{} {}: low {} > high {}",
                self.symbol, self.timestamp, self.low, self.high
            )));
        }
        if self.open.max(self.close) > self.high || self.open.min(self.close) < self.low {
            return Err(CoreError::InvalidBar(format!(
                "{} {}: open/close outside [low, high]",
                self.symbol, self.timestamp
            )));
        }
        if self.volume < Volume::ZERO {
            return Err(CoreError::InvalidBar(format!(
                "{} {}: negative volume {}",
                self.symbol, self.timestamp, self.volume
            )));
        }
        Ok(())
    }
}
