//! 거래 캘린더 정책.
//!
//! 데이터 갭이 "거래가 없었던 정상적인 구간"인지 판단하는 데 사용됩니다.
//! 특정 거래소 지식을 하드코딩하지 않고 설정으로 세션을 정의합니다.
//!
//! - `AlwaysOpen`: 24/7 시장 (암호화폐 등)
//! - `SessionCalendar`: 시간대, 세션 시간, 거래 요일, 휴장일로 정의되는 캘린더

use crate::config::CalendarConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::Timeframe;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::fmt::Debug;

/// 바 슬롯에 거래 활동이 예상되는지 판단하는 캘린더.
pub trait TradingCalendar: Send + Sync + Debug {
    /// `ts` 에서 시작하는 `timeframe` 바 구간에 거래 세션이 있는지 확인합니다.
    fn is_trading_slot(&self, ts: DateTime<Utc>, timeframe: Timeframe) -> bool;
}

/// 항상 열려 있는 시장.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl TradingCalendar for AlwaysOpen {
    fn is_trading_slot(&self, _ts: DateTime<Utc>, _timeframe: Timeframe) -> bool {
        true
    }
}

/// 세션 기반 거래 캘린더.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    tz: Tz,
    session_open: NaiveTime,
    session_close: NaiveTime,
    weekdays: Vec<Weekday>,
    holidays: BTreeSet<NaiveDate>,
}

impl SessionCalendar {
    /// 새 세션 캘린더를 생성합니다.
    pub fn new(
        tz: Tz,
        session_open: NaiveTime,
        session_close: NaiveTime,
        weekdays: Vec<Weekday>,
    ) -> CoreResult<Self> {
        if session_open >= session_close {
            return Err(CoreError::Config(format!(
                "session open {} must be before close {}",
                session_open, session_close
            )));
        }
        Ok(Self {
            tz,
            session_open,
            session_close,
            weekdays,
            holidays: BTreeSet::new(),
        })
    }

    /// 휴장일을 추가합니다.
    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    /// 설정에서 캘린더를 생성합니다.
    pub fn from_config(config: &CalendarConfig) -> CoreResult<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| CoreError::Config(format!("unknown timezone '{}'", config.timezone)))?;
        let session_open = parse_session_time(&config.session_open)?;
        let session_close = parse_session_time(&config.session_close)?;
        let weekdays = config
            .weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| CoreError::Config(format!("unknown weekday '{}'", d)))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self::new(tz, session_open, session_close, weekdays)?.with_holidays(
            config.holidays.iter().copied(),
        ))
    }

    /// 해당 날짜가 거래일인지 확인합니다.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday()) && !self.holidays.contains(&date)
    }

    fn to_local(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        ts.with_timezone(&self.tz).naive_local()
    }

    fn overlaps_session(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let local_start = self.to_local(start);
        let local_end = self.to_local(end);

        let mut date = local_start.date();
        while date <= local_end.date() {
            if self.is_trading_day(date) {
                let open = date.and_time(self.session_open);
                let close = date.and_time(self.session_close);
                if local_start < close && open < local_end {
                    return true;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        false
    }
}

impl TradingCalendar for SessionCalendar {
    fn is_trading_slot(&self, ts: DateTime<Utc>, timeframe: Timeframe) -> bool {
        match timeframe {
            // 일봉은 UTC 날짜 자체가 거래일 라벨
            Timeframe::D1 => self.is_trading_day(ts.date_naive()),
            Timeframe::W1 => (0..7).any(|d| self.is_trading_day((ts + Duration::days(d)).date_naive())),
            _ => self.overlaps_session(ts, ts + timeframe.period()),
        }
    }
}

fn parse_session_time(s: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| CoreError::Config(format!("invalid session time '{}'", s)))
}
