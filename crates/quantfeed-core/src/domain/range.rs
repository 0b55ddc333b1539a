//! 반개구간 바 범위 키.
//!
//! `RangeKey`는 (심볼, 타임프레임, [start, end)) 로 하나의 연속된 범위를 식별하며,
//! 캐시 키와 쿼리 조건 양쪽에 사용됩니다.

use crate::error::{CoreError, CoreResult};
use crate::types::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 캐시 키 구성 요소 구분자.
pub const KEY_SEPARATOR: char = '|';

/// 연속된 반개구간 바 범위.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeKey {
    /// 거래 심볼
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 시작 시간 (포함)
    pub start: DateTime<Utc>,
    /// 종료 시간 (제외)
    pub end: DateTime<Utc>,
}

impl RangeKey {
    /// 새 범위 키를 생성합니다.
    ///
    /// 심볼이 비어 있거나 구분자(`|`)를 포함하거나, `start >= end` 이면 실패합니다.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(CoreError::InvalidInput("symbol must not be empty".to_string()));
        }
        if symbol.contains(KEY_SEPARATOR) {
            return Err(CoreError::InvalidInput(format!(
                "symbol '{}' must not contain '{}'",
                symbol, KEY_SEPARATOR
            )));
        }
        if start >= end {
            return Err(CoreError::InvalidInput(format!(
                "range start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self {
            symbol,
            timeframe,
            start,
            end,
        })
    }

    /// 같은 시계열에서 경계만 바꾼 범위를 반환합니다.
    pub fn with_bounds(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start,
            end,
        }
    }

    /// 양 끝을 기간 격자로 올림한 정규화 범위를 반환합니다.
    ///
    /// `[ceil(start), ceil(end))` 는 원래 범위와 정확히 같은 바 슬롯을 가집니다.
    pub fn normalized(&self) -> Self {
        self.with_bounds(
            self.timeframe.align_ceil(self.start),
            self.timeframe.align_ceil(self.end),
        )
    }

    /// 바 슬롯이 하나도 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// 같은 (심볼, 타임프레임) 시계열인지 확인합니다.
    pub fn same_series(&self, other: &RangeKey) -> bool {
        self.symbol == other.symbol && self.timeframe == other.timeframe
    }

    /// 타임스탬프가 범위 안에 있는지 확인합니다.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// 다른 범위를 완전히 포함하는지 확인합니다.
    pub fn covers(&self, other: &RangeKey) -> bool {
        self.same_series(other) && self.start <= other.start && other.end <= self.end
    }

    /// 두 범위가 겹치는지 확인합니다.
    pub fn overlaps(&self, other: &RangeKey) -> bool {
        self.same_series(other) && self.start < other.end && other.start < self.end
    }

    /// 두 범위의 교집합을 반환합니다.
    pub fn intersect(&self, other: &RangeKey) -> Option<RangeKey> {
        if !self.overlaps(other) {
            return None;
        }
        Some(self.with_bounds(self.start.max(other.start), self.end.min(other.end)))
    }

    /// 주어진 범위들로 덮이지 않는 부분 범위를 시간순으로 반환합니다.
    pub fn subtract(&self, covered: &[RangeKey]) -> Vec<RangeKey> {
        let mut pieces: Vec<&RangeKey> = covered.iter().filter(|c| self.overlaps(c)).collect();
        pieces.sort_by_key(|c| c.start);

        let mut missing = Vec::new();
        let mut cursor = self.start;
        for piece in pieces {
            if piece.start > cursor {
                missing.push(self.with_bounds(cursor, piece.start.min(self.end)));
            }
            cursor = cursor.max(piece.end);
            if cursor >= self.end {
                break;
            }
        }
        if cursor < self.end {
            missing.push(self.with_bounds(cursor, self.end));
        }
        missing
    }

    /// 범위 안의 정렬된 바 슬롯을 순회합니다.
    pub fn slots(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let period = self.timeframe.period();
        let first = self.timeframe.align_ceil(self.start);
        std::iter::successors(Some(first), move |ts| Some(*ts + period))
            .take_while(move |ts| *ts < self.end)
    }

    /// 범위 안의 바 슬롯 수를 반환합니다.
    pub fn slot_count(&self) -> i64 {
        let first = self.timeframe.align_ceil(self.start);
        if first >= self.end {
            return 0;
        }
        let span = (self.end - first).num_seconds();
        (span + self.timeframe.as_secs() - 1) / self.timeframe.as_secs()
    }

    /// 결정적인 캐시 키 문자열 (`symbol|timeframe|start|end`, 시간은 unix 초).
    pub fn cache_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.symbol,
            self.timeframe,
            self.start.timestamp(),
            self.end.timestamp(),
            sep = KEY_SEPARATOR
        )
    }

    /// 심볼의 모든 캐시 키가 공유하는 접두사.
    pub fn symbol_prefix(symbol: &str) -> String {
        format!("{}{}", symbol, KEY_SEPARATOR)
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}, {})",
            self.symbol,
            self.timeframe,
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}
