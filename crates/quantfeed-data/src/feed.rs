//! 백테스트 엔진용 풀(pull) 방식 바 피드.
//!
//! 피드는 첫 요청 시 데이터 소스를 한 번 호출하고, 그 결과를 시간순으로
//! 한 개씩 내보냅니다. `restart()` 후에는 다시 소스를 호출합니다.

use crate::error::Result;
use crate::facade::BarSeries;
use crate::gaps::Gap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use quantfeed_core::{Bar, Timeframe};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// 피드가 바를 가져오는 소스.
#[async_trait]
pub trait BarSource: Send + Sync {
    /// `[start, end)` 범위의 검증된 바 시퀀스를 가져옵니다.
    async fn load_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries>;
}

#[derive(Debug, Default)]
enum FeedState {
    #[default]
    Pending,
    Loaded(VecDeque<Bar>),
    Finished,
}

/// 한 (심볼, 타임프레임, 범위)에 대한 지연 바 피드.
pub struct BarFeed {
    source: Arc<dyn BarSource>,
    symbol: String,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    state: FeedState,
    gaps: Vec<Gap>,
    position: Option<DateTime<Utc>>,
}

impl BarFeed {
    pub fn new(
        source: Arc<dyn BarSource>,
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            symbol: symbol.into(),
            timeframe,
            start,
            end,
            state: FeedState::Pending,
            gaps: Vec::new(),
            position: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// 다음 바를 가져옵니다. 끝나면 `None`.
    ///
    /// 소스 오류는 한 번 반환되고, 이후 피드는 `restart()` 전까지 종료 상태입니다.
    pub async fn next_bar(&mut self) -> Result<Option<Bar>> {
        if matches!(self.state, FeedState::Pending) {
            match self
                .source
                .load_bars(&self.symbol, self.timeframe, self.start, self.end)
                .await
            {
                Ok(series) => {
                    debug!(
                        symbol = %self.symbol,
                        timeframe = %self.timeframe,
                        bars = series.bars.len(),
                        "Feed loaded"
                    );
                    self.gaps = series.gaps;
                    self.state = FeedState::Loaded(series.bars.into());
                }
                Err(e) => {
                    self.state = FeedState::Finished;
                    return Err(e);
                }
            }
        }

        let FeedState::Loaded(bars) = &mut self.state else {
            return Ok(None);
        };
        match bars.pop_front() {
            Some(bar) => {
                self.position = Some(bar.timestamp);
                Ok(Some(bar))
            }
            None => {
                self.state = FeedState::Finished;
                Ok(None)
            }
        }
    }

    /// 피드를 처음으로 되돌립니다. 다음 호출에서 소스를 다시 조회합니다.
    pub fn restart(&mut self) {
        self.state = FeedState::Pending;
        self.gaps.clear();
        self.position = None;
    }

    /// 마지막 소스 호출에서 보고된 허용 갭.
    pub fn tolerated_gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// 마지막으로 내보낸 바의 타임스탬프.
    pub fn position(&self) -> Option<DateTime<Utc>> {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, FeedState::Finished)
    }

    /// `futures::Stream`으로 변환합니다.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bar>> + Send {
        futures::stream::unfold(self, |mut feed| async move {
            match feed.next_bar().await {
                Ok(Some(bar)) => Some((Ok(bar), feed)),
                Ok(None) => None,
                Err(e) => Some((Err(e), feed)),
            }
        })
    }
}

impl std::fmt::Debug for BarFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarFeed")
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use chrono::{Duration, TimeZone};
    use futures::StreamExt;
    use quantfeed_core::RangeKey;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl BarSource for CountingSource {
        async fn load_bars(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<BarSeries> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(DataError::DataUnavailable {
                    key: symbol.to_string(),
                    attempts: 2,
                    source: Box::new(DataError::QueryError("timeout".into())),
                });
            }
            let key = RangeKey::new(symbol, timeframe, start, end)?;
            let bars = key
                .slots()
                .map(|ts| Bar::new(symbol, timeframe, ts, dec!(1), dec!(2), dec!(1), dec!(2), dec!(3)))
                .collect();
            Ok(BarSeries {
                key,
                bars,
                gaps: Vec::new(),
            })
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap()
    }

    fn feed(source: Arc<CountingSource>) -> BarFeed {
        BarFeed::new(source, "AAPL", Timeframe::M1, start(), start() + Duration::minutes(3))
    }

    #[tokio::test]
    async fn test_yields_in_order_with_single_source_call() {
        let source = Arc::new(CountingSource::default());
        let mut feed = feed(source.clone());

        let mut seen = Vec::new();
        while let Some(bar) = feed.next_bar().await.unwrap() {
            seen.push(bar.timestamp);
        }

        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(feed.position(), Some(start() + Duration::minutes(2)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(feed.next_bar().await.unwrap().is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_requeries() {
        let source = Arc::new(CountingSource::default());
        let mut feed = feed(source.clone());

        feed.next_bar().await.unwrap();
        feed.restart();
        assert_eq!(feed.position(), None);

        let first = feed.next_bar().await.unwrap().unwrap();
        assert_eq!(first.timestamp, start());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_yielded_once() {
        let source = Arc::new(CountingSource {
            fail_first: true,
            ..CountingSource::default()
        });
        let mut feed = feed(source.clone());

        assert!(feed.next_bar().await.is_err());
        assert!(feed.is_finished());
        assert!(feed.next_bar().await.unwrap().is_none());

        feed.restart();
        assert!(feed.next_bar().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let source = Arc::new(CountingSource::default());
        let bars: Vec<Result<Bar>> = feed(source).into_stream().collect().await;
        assert_eq!(bars.len(), 3);
        assert!(bars.iter().all(|b| b.is_ok()));
    }
}
