//! 제한된 지수 백오프 재시도 정책.

use crate::error::DataError;
use quantfeed_core::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 재시도 정책.
///
/// `max_attempts`는 최초 시도를 포함합니다 (기본 2 = 재시도 1회).
/// n번째 시도(n >= 2) 전 대기 시간은 `base_delay * 2^(n-2)`이며 `max_delay`로 제한됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// 재시도가 모두 실패했거나 재시도 불가 오류가 발생한 결과.
#[derive(Debug)]
pub struct Attempted {
    /// 실행한 시도 횟수
    pub attempts: u32,
    /// 마지막 오류
    pub error: DataError,
}

impl RetryPolicy {
    /// 재시도 없이 한 번만 시도하는 정책.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `attempt`번째 시도 전 대기 시간 (1번째 시도는 대기 없음).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 재시도 가능한 오류에 한해 작업을 반복 실행합니다.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Attempted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    warn!(
                        target_range = label,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(Attempted {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}
