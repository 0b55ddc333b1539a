//! 캐싱 레이어.
//!
//! - 바 범위 캐시(`BarCache`): `RangeKey` 단위 TTL/LRU 캐시와 상주 범위 인덱스
//! - 저장 백엔드는 `storage::redis::RedisStore` 또는 `storage::memory::MemoryStore`

pub mod tier;

pub use tier::{BarCache, CacheEntry, CacheStats};
