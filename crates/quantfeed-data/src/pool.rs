//! 분석 저장소 연결 풀.
//!
//! 고정된 최대 크기의 연결 집합을 관리합니다.
//!
//! - `acquire`는 용량이 찼을 때 타임아웃까지 대기한 뒤 `PoolExhausted`로 실패
//! - 임대된 연결은 `PooledConnection` 가드가 drop될 때 반환 (모든 종료 경로)
//! - 전송 계층 오류가 난 연결은 `discard()`로 표시되어 반환 대신 폐기되고,
//!   다음 `acquire`에서 지연 재연결
//! - 유휴 목록과 카운터는 하나의 mutex 아래에서만 변경

use crate::error::{DataError, Result};
use crate::storage::AnalyticalStore;
use quantfeed_core::PoolConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// 풀 상태 스냅샷.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// 최대 연결 수
    pub max_size: usize,
    /// 살아 있는 연결 수 (유휴 + 임대)
    pub live: usize,
    /// 유휴 연결 수
    pub idle: usize,
    /// 임대 중인 연결 수
    pub leased: usize,
    /// 누적 생성 연결 수
    pub created: u64,
    /// 오류로 폐기된 누적 연결 수
    pub discarded: u64,
    /// 최대 사용 횟수 도달로 닫힌 누적 연결 수
    pub recycled: u64,
}

struct IdleConnection<C> {
    conn: C,
    uses: u32,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    leased: usize,
    /// 여는 중인 연결 수
    opening: usize,
    created: u64,
    discarded: u64,
    recycled: u64,
}

struct PoolShared<S: AnalyticalStore> {
    store: Arc<S>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<S::Connection>>,
}

impl<S: AnalyticalStore> PoolShared<S> {
    fn lock(&self) -> MutexGuard<'_, PoolState<S::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: S::Connection, uses: u32, broken: bool) {
        let mut state = self.lock();
        state.leased -= 1;

        if broken {
            state.discarded += 1;
            drop(state);
            warn!("Discarding broken store connection");
            return;
        }

        if self.config.max_usage > 0 && uses >= self.config.max_usage {
            state.recycled += 1;
            drop(state);
            debug!(uses = uses, "Store connection reached max usage, closing");
            return;
        }

        state.idle.push_back(IdleConnection { conn, uses });
    }
}

/// 분석 저장소 연결 풀.
pub struct ConnectionPool<S: AnalyticalStore> {
    shared: Arc<PoolShared<S>>,
}

impl<S: AnalyticalStore> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: AnalyticalStore> ConnectionPool<S> {
    /// 연결을 미리 열지 않는 풀을 생성합니다.
    pub fn new(store: Arc<S>, config: PoolConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(DataError::ConfigError("pool max_size must be > 0".to_string()));
        }
        if config.min_size > config.max_size {
            return Err(DataError::ConfigError(format!(
                "pool min_size {} exceeds max_size {}",
                config.min_size, config.max_size
            )));
        }

        let permits = Arc::new(Semaphore::new(config.max_size as usize));
        Ok(Self {
            shared: Arc::new(PoolShared {
                store,
                config,
                permits,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    leased: 0,
                    opening: 0,
                    created: 0,
                    discarded: 0,
                    recycled: 0,
                }),
            }),
        })
    }

    /// 풀을 생성하고 `min_size`개의 연결을 미리 엽니다.
    pub async fn connect(store: Arc<S>, config: PoolConfig) -> Result<Self> {
        info!(
            min = config.min_size,
            max = config.max_size,
            "Connecting store pool..."
        );
        let pool = Self::new(store, config)?;
        pool.warm_up().await?;
        info!("Store pool ready");
        Ok(pool)
    }

    /// 살아 있는 연결이 `min_size`가 될 때까지 연결을 엽니다.
    ///
    /// 연결마다 용량 슬롯을 하나씩 잡고 열기 때문에 동시에 진행 중인 `acquire`와
    /// 합쳐도 `max_size`를 넘지 않습니다. 모든 슬롯이 사용 중이면 멈춥니다.
    pub async fn warm_up(&self) -> Result<usize> {
        let min_size = self.shared.config.min_size as usize;
        let mut opened = 0;
        loop {
            let Ok(permit) = self.shared.permits.clone().try_acquire_owned() else {
                break;
            };
            {
                let mut state = self.shared.lock();
                if state.idle.len() + state.leased + state.opening >= min_size {
                    break;
                }
                state.opening += 1;
            }

            let slot = OpeningSlot {
                shared: &*self.shared,
            };
            let conn = self.open_connection().await?;
            {
                let mut state = self.shared.lock();
                state.created += 1;
                state.idle.push_back(IdleConnection { conn, uses: 0 });
            }
            drop(slot);
            drop(permit);
            opened += 1;
        }
        Ok(opened)
    }

    /// 풀 설정.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// 풀이 감싸는 저장소 백엔드.
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// 설정된 기본 타임아웃으로 연결을 임대합니다.
    pub async fn acquire(&self) -> Result<PooledConnection<S>> {
        self.acquire_timeout(self.shared.config.acquire_timeout()).await
    }

    /// 연결을 임대합니다.
    ///
    /// 용량이 찼으면 `timeout`까지 대기하고, 그래도 없으면 `PoolExhausted`를 반환합니다.
    /// 유휴 연결이 없으면 새 연결을 엽니다.
    #[instrument(skip(self))]
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<S>> {
        let permit = match tokio::time::timeout(
            timeout,
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Store pool exhausted");
                return Err(DataError::PoolExhausted(timeout));
            }
        };

        let reused = {
            let mut state = self.shared.lock();
            let idle = state.idle.pop_back();
            if idle.is_some() {
                state.leased += 1;
            } else {
                state.opening += 1;
            }
            idle
        };

        let (conn, uses) = match reused {
            Some(idle) => (idle.conn, idle.uses),
            None => {
                // 실패 시 permit이 drop되어 슬롯이 반환됨
                let slot = OpeningSlot {
                    shared: &*self.shared,
                };
                let conn = self.open_connection().await?;
                {
                    let mut state = self.shared.lock();
                    state.created += 1;
                    state.leased += 1;
                }
                drop(slot);
                (conn, 0)
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            uses: uses + 1,
            broken: false,
            pool: self.shared.clone(),
            _permit: permit,
        })
    }

    /// 연결을 풀에 반환합니다. 가드를 drop하는 것과 같습니다.
    pub fn release(&self, conn: PooledConnection<S>) {
        drop(conn);
    }

    /// 풀 상태 스냅샷을 반환합니다.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            max_size: self.shared.config.max_size as usize,
            live: state.idle.len() + state.leased,
            idle: state.idle.len(),
            leased: state.leased,
            created: state.created,
            discarded: state.discarded,
            recycled: state.recycled,
        }
    }

    /// 연결 하나를 임대해 서버 버전을 조회합니다.
    pub async fn health_check(&self) -> Result<String> {
        let mut conn = self.acquire().await?;
        match self.shared.store.server_version(&mut *conn).await {
            Ok(version) => Ok(version),
            Err(e) => {
                if e.is_transport() {
                    conn.discard();
                }
                Err(e)
            }
        }
    }

    async fn open_connection(&self) -> Result<S::Connection> {
        let connect_timeout = self.shared.config.connect_timeout();
        match tokio::time::timeout(connect_timeout, self.shared.store.connect()).await {
            Ok(Ok(conn)) => {
                debug!("Opened store connection");
                Ok(conn)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to open store connection");
                Err(e)
            }
            Err(_) => {
                warn!(timeout_secs = connect_timeout.as_secs(), "Store connect timed out");
                Err(DataError::ConnectionError(format!(
                    "connect timed out after {:?}",
                    connect_timeout
                )))
            }
        }
    }
}

/// 여는 중인 연결 슬롯. 성공, 실패, 취소 어느 경우든 drop 시 카운트를 되돌립니다.
struct OpeningSlot<'a, S: AnalyticalStore> {
    shared: &'a PoolShared<S>,
}

impl<S: AnalyticalStore> Drop for OpeningSlot<'_, S> {
    fn drop(&mut self) {
        self.shared.lock().opening -= 1;
    }
}

/// 임대된 저장소 연결.
///
/// drop 시 풀에 반환되며, `discard()`로 표시된 경우 폐기됩니다.
pub struct PooledConnection<S: AnalyticalStore> {
    conn: Option<S::Connection>,
    uses: u32,
    broken: bool,
    pool: Arc<PoolShared<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: AnalyticalStore> PooledConnection<S> {
    /// 연결을 손상된 것으로 표시합니다. 반환 시 재사용되지 않고 폐기됩니다.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// 이 연결이 지금까지 임대된 횟수 (이번 임대 포함).
    pub fn uses(&self) -> u32 {
        self.uses
    }
}

impl<S: AnalyticalStore> Deref for PooledConnection<S> {
    type Target = S::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<S: AnalyticalStore> DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<S: AnalyticalStore> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.uses, self.broken);
        }
    }
}
