//! 바 시퀀스 갭 검증.
//!
//! 갭은 절대 채우지 않습니다. 정책이 허용하면 보고하고, 아니면 무결성 오류입니다.

use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use quantfeed_core::{Bar, GapConfig, GapPolicyKind, RangeKey, SessionCalendar, TradingCalendar};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// 허용된 갭. `[from, to)` 구간의 슬롯에 바가 없습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// 빠진 슬롯 수
    pub missing_slots: i64,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}) {} slot(s)", self.from, self.to, self.missing_slots)
    }
}

/// 갭 허용 정책.
#[derive(Debug, Clone, Default)]
pub enum GapPolicy {
    /// 모든 갭은 무결성 오류
    #[default]
    Strict,
    /// 모든 갭을 허용하고 보고
    TolerateAll,
    /// 빠진 슬롯이 모두 거래 세션 밖일 때만 허용
    Calendar(Arc<dyn TradingCalendar>),
}

impl GapPolicy {
    /// 캘린더 정책 생성.
    pub fn calendar(calendar: impl TradingCalendar + 'static) -> Self {
        GapPolicy::Calendar(Arc::new(calendar))
    }

    /// 설정에서 정책을 생성합니다.
    pub fn from_config(config: &GapConfig) -> Result<Self> {
        Ok(match config.policy {
            GapPolicyKind::Strict => GapPolicy::Strict,
            GapPolicyKind::Tolerate => GapPolicy::TolerateAll,
            GapPolicyKind::Calendar => {
                GapPolicy::calendar(SessionCalendar::from_config(&config.calendar)?)
            }
        })
    }

    /// 갭에서 정책이 허용하지 않는 첫 슬롯. 전부 허용되면 `None`.
    fn first_untolerated_slot(&self, missing: &RangeKey) -> Option<DateTime<Utc>> {
        match self {
            GapPolicy::Strict => Some(missing.start),
            GapPolicy::TolerateAll => None,
            GapPolicy::Calendar(calendar) => missing
                .slots()
                .find(|slot| calendar.is_trading_slot(*slot, missing.timeframe)),
        }
    }
}

/// 정렬된 바 목록의 갭을 검사합니다.
///
/// `window`는 정규화된 요청 범위이며, 앞뒤 가장자리 갭도 내부 갭과 같은 정책으로
/// 판단합니다. 허용된 갭 목록을 반환하고, 허용되지 않는 갭이 있으면
/// `DataIntegrity`를 반환합니다.
pub fn check_gaps(window: &RangeKey, bars: &[Bar], policy: &GapPolicy) -> Result<Vec<Gap>> {
    let period = window.timeframe.period();
    let mut gaps = Vec::new();
    let mut cursor = window.start;

    let mut visit = |from: DateTime<Utc>, to: DateTime<Utc>| -> Result<()> {
        let missing = window.with_bounds(from, to);
        if let Some(slot) = policy.first_untolerated_slot(&missing) {
            return Err(DataError::DataIntegrity(format!(
                "unexpected gap in {} {}: [{}, {}) missing trading slot {}",
                window.symbol, window.timeframe, from, to, slot
            )));
        }
        gaps.push(Gap {
            from,
            to,
            missing_slots: missing.slot_count(),
        });
        Ok(())
    };

    for bar in bars {
        if bar.timestamp > cursor {
            visit(cursor, bar.timestamp)?;
        }
        cursor = bar.timestamp + period;
    }
    if cursor < window.end {
        visit(cursor, window.end)?;
    }

    Ok(gaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use quantfeed_core::{CalendarConfig, Timeframe};
    use rust_decimal_macros::dec;

    fn bar(ts: DateTime<Utc>, tf: Timeframe) -> Bar {
        Bar::new("AAPL", tf, ts, dec!(1), dec!(1), dec!(1), dec!(1), dec!(0))
    }

    fn nyse() -> SessionCalendar {
        SessionCalendar::from_config(&CalendarConfig::default()).unwrap()
    }

    fn daily_window() -> RangeKey {
        // 2024-03-01 (금) ~ 2024-03-05 (화)
        RangeKey::new(
            "AAPL",
            Timeframe::D1,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn weekday_bars() -> Vec<Bar> {
        [1, 4, 5]
            .iter()
            .map(|d| bar(Utc.with_ymd_and_hms(2024, 3, *d, 0, 0, 0).unwrap(), Timeframe::D1))
            .collect()
    }

    #[test]
    fn test_contiguous_series_has_no_gaps() {
        let window = daily_window();
        let bars: Vec<Bar> = window.slots().map(|ts| bar(ts, Timeframe::D1)).collect();
        assert!(check_gaps(&window, &bars, &GapPolicy::Strict).unwrap().is_empty());
    }

    #[test]
    fn test_first_untolerated_slot_per_policy() {
        let day = |d: u32| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap();
        let weekend = daily_window().with_bounds(day(2), day(4));
        let weekend_and_monday = daily_window().with_bounds(day(2), day(5));

        assert_eq!(GapPolicy::Strict.first_untolerated_slot(&weekend), Some(day(2)));
        assert_eq!(GapPolicy::TolerateAll.first_untolerated_slot(&weekend_and_monday), None);

        let calendar = GapPolicy::calendar(nyse());
        assert_eq!(calendar.first_untolerated_slot(&weekend), None);
        assert_eq!(calendar.first_untolerated_slot(&weekend_and_monday), Some(day(4)));
    }

    #[test]
    fn test_weekend_gap_strict_fails() {
        let err = check_gaps(&daily_window(), &weekday_bars(), &GapPolicy::Strict).unwrap_err();
        assert!(matches!(err, DataError::DataIntegrity(_)));
    }

    #[test]
    fn test_weekend_gap_tolerated_by_calendar() {
        let gaps =
            check_gaps(&daily_window(), &weekday_bars(), &GapPolicy::calendar(nyse())).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from, Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(gaps[0].missing_slots, 2);
    }

    #[test]
    fn test_missing_weekday_fails_calendar() {
        let mut bars = weekday_bars();
        bars.remove(1); // 월요일 누락
        assert!(check_gaps(&daily_window(), &bars, &GapPolicy::calendar(nyse())).is_err());
    }

    #[test]
    fn test_edge_gaps_checked() {
        let window = daily_window();
        let bars = vec![bar(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(), Timeframe::D1)];
        let gaps = check_gaps(&window, &bars, &GapPolicy::TolerateAll).unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].from, window.start);
        assert_eq!(gaps[1].to, window.end);
    }

    #[test]
    fn test_overnight_intraday_gap_tolerated() {
        // 2024-03-04 20:55 UTC (15:55 ET) ~ 2024-03-05 14:35 UTC (09:35 ET)
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 20, 55, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 5, 14, 35, 0).unwrap();
        let window = RangeKey::new("AAPL", Timeframe::M5, start, end).unwrap();
        let bars = vec![
            bar(start, Timeframe::M5),
            bar(Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(), Timeframe::M5),
        ];

        let gaps = check_gaps(&window, &bars, &GapPolicy::calendar(nyse())).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from, start + Duration::minutes(5));
    }

    #[test]
    fn test_empty_result_is_one_gap() {
        let window = daily_window();
        let gaps = check_gaps(&window, &[], &GapPolicy::TolerateAll).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].missing_slots, 5);
    }
}
