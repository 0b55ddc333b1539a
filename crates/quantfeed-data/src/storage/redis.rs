//! Redis 캐시 저장소.
//!
//! 캐시 계층의 원격 백엔드입니다. 연결이 끊긴 경우 한 번 재연결 후
//! 명령을 재시도하며, 그래도 실패하면 `CacheError`를 반환합니다.
//! 접두사 삭제는 블로킹 `KEYS` 대신 커서 기반 `SCAN`으로 페이지 단위 처리합니다.

use crate::error::{DataError, Result};
use crate::storage::CacheStore;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Redis 연결 래퍼.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: Arc<RwLock<MultiplexedConnection>>,
}

impl RedisStore {
    /// 새로운 Redis 연결을 생성합니다.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis...");

        let client = Client::open(url).map_err(|e| DataError::CacheError(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        info!("Redis connection established");

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(connection)),
        })
    }

    /// 연결을 다시 열고 공유 연결을 교체합니다.
    async fn reconnect(&self) -> Result<MultiplexedConnection> {
        let fresh = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DataError::CacheError(format!("reconnect failed: {}", e)))?;

        *self.connection.write().await = fresh.clone();
        info!("Redis reconnected");
        Ok(fresh)
    }

    /// 명령을 실행하고, 연결 오류 시 한 번 재연결 후 재시도합니다.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection.read().await.clone();
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_disconnect(&e) => {
                warn!(error = %e, "Redis connection lost, reconnecting once");
                let conn = self.reconnect().await?;
                Ok(op(conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_disconnect(err: &RedisError) -> bool {
    err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
}

/// 한 번의 SCAN 호출이 훑는 키 수 힌트.
const SCAN_COUNT: usize = 1000;

/// 커서 위치에서 패턴에 맞는 키 한 페이지를 요청하는 SCAN 명령.
fn scan_page(cursor: u64, pattern: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_COUNT);
    cmd
}

/// SCAN 글로브 패턴에서 특수 문자를 이스케이프합니다.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run(|mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        // Redis는 0초 만료를 거부함
        let secs = ttl.as_secs().max(1);
        self.run(|mut conn| async move { conn.set_ex(key, value, secs).await })
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: i64 = self
            .run(|mut conn| async move { conn.del(keys.to_vec()).await })
            .await?;
        Ok(deleted.max(0) as usize)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = format!("{}*", escape_glob(prefix));
        let pattern = pattern.as_str();
        let mut cursor = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run(|mut conn| async move {
                    let cmd = scan_page(cursor, pattern);
                    cmd.query_async(&mut conn).await
                })
                .await?;
            deleted += self.delete(&keys).await?;

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<bool> {
        let reply: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(reply == "PONG")
    }
}
