//! 인메모리 캐시 저장소.
//!
//! Redis가 설정되지 않았거나 연결할 수 없을 때, 그리고 테스트에서 사용됩니다.
//! 만료는 `get` 시점에 지연 확인합니다.

use crate::error::{DataError, Result};
use crate::storage::CacheStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// 프로세스 내 키/값 저장소.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 만료되지 않은 키 수.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // 만료된 항목 정리
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some((_, expires_at)) if *expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| DataError::CacheError(format!("ttl {:?} out of range", ttl)))?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }
}
