//! 바 데이터를 위한 타임프레임 정의.
//!
//! 모든 타임프레임은 고정 길이 기간이며, UTC epoch 기준 격자에 정렬됩니다.
//! 주봉은 월요일 00:00 UTC를 기준으로 정렬합니다.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 주봉 정렬 기준점 (1970-01-05 월요일 00:00 UTC).
const WEEK_ANCHOR_SECS: i64 = 4 * 24 * 60 * 60;

/// 바 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1분봉
    #[serde(rename = "1m")]
    M1,
    /// 3분봉
    #[serde(rename = "3m")]
    M3,
    /// 5분봉
    #[serde(rename = "5m")]
    M5,
    /// 15분봉
    #[serde(rename = "15m")]
    M15,
    /// 30분봉
    #[serde(rename = "30m")]
    M30,
    /// 1시간봉
    #[serde(rename = "1h")]
    H1,
    /// 2시간봉
    #[serde(rename = "2h")]
    H2,
    /// 4시간봉
    #[serde(rename = "4h")]
    H4,
    /// 6시간봉
    #[serde(rename = "6h")]
    H6,
    /// 8시간봉
    #[serde(rename = "8h")]
    H8,
    /// 12시간봉
    #[serde(rename = "12h")]
    H12,
    /// 일봉
    #[serde(rename = "1d")]
    D1,
    /// 주봉
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// 지원하는 모든 타임프레임.
    pub const ALL: [Timeframe; 13] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// 이 타임프레임의 초 단위 값을 반환합니다.
    pub fn as_secs(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 3 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H2 => 2 * 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
            Timeframe::H6 => 6 * 60 * 60,
            Timeframe::H8 => 8 * 60 * 60,
            Timeframe::H12 => 12 * 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
            Timeframe::W1 => 7 * 24 * 60 * 60,
        }
    }

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn period(&self) -> Duration {
        Duration::seconds(self.as_secs())
    }

    /// 일봉 이상인지 확인합니다.
    pub fn is_daily_or_longer(&self) -> bool {
        matches!(self, Timeframe::D1 | Timeframe::W1)
    }

    fn anchor_secs(&self) -> i64 {
        match self {
            Timeframe::W1 => WEEK_ANCHOR_SECS,
            _ => 0,
        }
    }

    fn offset_secs(&self, ts: DateTime<Utc>) -> i64 {
        (ts.timestamp() - self.anchor_secs()).rem_euclid(self.as_secs())
    }

    /// 타임스탬프가 기간 경계에 정렬되어 있는지 확인합니다.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_subsec_nanos() == 0 && self.offset_secs(ts) == 0
    }

    /// 타임스탬프 이하의 가장 가까운 경계로 내림합니다.
    pub fn align_floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts - Duration::seconds(self.offset_secs(ts))
            - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
    }

    /// 타임스탬프 이상의 가장 가까운 경계로 올림합니다.
    pub fn align_ceil(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_aligned(ts) {
            ts
        } else {
            self.align_floor(ts) + self.period()
        }
    }

    /// 간격 문자열로 변환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// 간격 문자열에서 파싱합니다.
    pub fn from_interval(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.as_str() == s)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_interval(s).ok_or_else(|| format!("Invalid timeframe: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};
    use proptest::prelude::*;

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.as_secs(), 60);
        assert_eq!(Timeframe::H1.as_secs(), 3600);
        assert_eq!(Timeframe::D1.as_secs(), 86400);
        assert_eq!(Timeframe::W1.period(), Duration::days(7));
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("15m".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!(Timeframe::from_interval("4h"), Some(Timeframe::H4));
        assert!("1M".parse::<Timeframe>().is_err());
        for tf in Timeframe::ALL {
            assert_eq!(tf.to_string().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn test_timeframe_serde() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }

    #[test]
    fn test_align_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 42).unwrap();
        let floor = Timeframe::M5.align_floor(ts);
        assert_eq!(floor, Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap());
        assert_eq!(
            Timeframe::M5.align_ceil(ts),
            Utc.with_ymd_and_hms(2024, 3, 4, 9, 35, 0).unwrap()
        );
        assert_eq!(Timeframe::M5.align_ceil(floor), floor);
        assert!(Timeframe::M5.is_aligned(floor));
        assert!(!Timeframe::M5.is_aligned(ts));
    }

    #[test]
    fn test_align_week_starts_monday() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 7, 15, 0, 0).unwrap(); // 목요일
        let floor = Timeframe::W1.align_floor(ts);
        assert_eq!(floor.weekday(), Weekday::Mon);
        assert_eq!(floor, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_align_subsecond() {
        let ts = Utc.timestamp_opt(1_700_000_040, 500_000_000).unwrap();
        assert!(!Timeframe::M1.is_aligned(ts));
        assert_eq!(Timeframe::M1.align_floor(ts).timestamp(), 1_700_000_040);
        assert_eq!(Timeframe::M1.align_ceil(ts).timestamp(), 1_700_000_100);
    }

    proptest! {
        #[test]
        fn prop_floor_ceil_bracket(secs in 0i64..4_000_000_000, tf_idx in 0usize..13) {
            let tf = Timeframe::ALL[tf_idx];
            let ts = Utc.timestamp_opt(secs, 0).unwrap();
            let floor = tf.align_floor(ts);
            let ceil = tf.align_ceil(ts);
            prop_assert!(tf.is_aligned(floor));
            prop_assert!(tf.is_aligned(ceil));
            prop_assert!(floor <= ts && ts <= ceil);
            prop_assert!(ceil - floor <= tf.period());
        }
    }
}
