//! 热层缓存
//!
//! 进程内有界LRU缓存，所有操作都是同步的，只在短暂的 `parking_lot` 锁内完成。
//! 时间取自 `tokio::time::Instant`，测试中可以暂停并推进时钟。

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// 热层缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// 缓存键
    pub key: String,
    /// 缓存值
    pub value: Value,
    /// 写入时间（`expire` 会平移该时间）
    pub inserted_at: Instant,
    /// 最后访问时间
    pub last_access_at: Instant,
    /// TTL
    pub ttl: Duration,
    /// 访问次数
    pub access_count: u64,
    /// 序列化后的负载大小
    pub size_bytes: usize,
}

impl CacheEntry {
    /// 创建新的缓存条目
    pub fn new(key: String, value: Value, ttl: Duration, size_bytes: usize) -> Self {
        let now = Instant::now();
        Self {
            key,
            value,
            inserted_at: now,
            last_access_at: now,
            ttl,
            access_count: 0,
            size_bytes,
        }
    }

    fn expires_at(&self) -> Instant {
        self.inserted_at + self.ttl
    }

    /// 检查是否过期
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// 剩余TTL
    pub fn remaining_ttl_at(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    fn touch(&mut self, now: Instant) {
        self.last_access_at = now;
        self.access_count += 1;
    }
}

/// 热层查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum HotLookup {
    /// 命中，附带剩余TTL
    Hit { value: Value, remaining: Duration },
    /// 条目已过期（已移除）
    Expired,
    /// 不存在
    Miss,
}

/// 热层
pub struct HotTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
    capacity: usize,
    max_entry_bytes: usize,
}

impl HotTier {
    /// 创建热层
    ///
    /// # 参数
    ///
    /// * `capacity` - 最大条目数（至少为1）
    /// * `max_entry_bytes` - 准入的最大负载字节数
    pub fn new(capacity: usize, max_entry_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity,
            max_entry_bytes,
        }
    }

    /// 读取并刷新最近使用顺序
    pub fn get(&self, key: &str) -> HotLookup {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired_at(now) => {
                entries.pop(key);
                trace!("热层条目过期: key={}", key);
                HotLookup::Expired
            }
            Some(entry) => {
                entry.touch(now);
                HotLookup::Hit {
                    value: entry.value.clone(),
                    remaining: entry.remaining_ttl_at(now),
                }
            }
            None => HotLookup::Miss,
        }
    }

    /// 只读查询：不更新最近使用顺序与访问计数，过期条目也不移除
    pub fn peek(&self, key: &str) -> HotLookup {
        let now = Instant::now();
        let entries = self.entries.lock();
        match entries.peek(key) {
            Some(entry) if entry.is_expired_at(now) => HotLookup::Expired,
            Some(entry) => HotLookup::Hit {
                value: entry.value.clone(),
                remaining: entry.remaining_ttl_at(now),
            },
            None => HotLookup::Miss,
        }
    }

    /// 负载大小是否允许进入热层
    pub fn admits(&self, size_bytes: usize) -> bool {
        size_bytes <= self.max_entry_bytes
    }

    /// 写入条目，返回因容量不足被淘汰的键
    pub fn insert(&self, key: &str, value: Value, ttl: Duration, size_bytes: usize) -> Option<String> {
        let entry = CacheEntry::new(key.to_string(), value, ttl, size_bytes);
        let mut entries = self.entries.lock();
        match entries.push(key.to_string(), entry) {
            Some((evicted, _)) if evicted != key => {
                debug!("热层LRU淘汰: key={}", evicted);
                Some(evicted)
            }
            _ => None,
        }
    }

    /// 删除条目，返回是否存在未过期的条目
    pub fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .pop(key)
            .map_or(false, |entry| !entry.is_expired_at(now))
    }

    /// 是否存在未过期的条目（不影响最近使用顺序）
    pub fn contains(&self, key: &str) -> bool {
        self.remaining_ttl(key).is_some()
    }

    /// 剩余TTL（不影响最近使用顺序）
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .peek(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.remaining_ttl_at(now))
    }

    /// 修改剩余TTL
    ///
    /// 平移写入时间，使 `inserted_at + ttl - now == new_ttl`。
    pub fn expire(&self, key: &str, new_ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.peek_mut(key) else {
            return false;
        };
        if entry.is_expired_at(now) {
            entries.pop(key);
            return false;
        }

        if new_ttl >= entry.ttl {
            entry.inserted_at = now + (new_ttl - entry.ttl);
        } else {
            match now.checked_sub(entry.ttl - new_ttl) {
                Some(shifted) => entry.inserted_at = shifted,
                None => {
                    entry.inserted_at = now;
                    entry.ttl = new_ttl;
                }
            }
        }
        true
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            entries.pop(key);
        }

        if !expired_keys.is_empty() {
            debug!("热层清理了 {} 条过期数据", expired_keys.len());
        }
        expired_keys.len()
    }

    /// 释放内存：先清理过期条目，再淘汰最久未使用的 `fraction` 比例
    pub fn shed(&self, fraction: f64) -> usize {
        let expired = self.cleanup_expired();
        let mut entries = self.entries.lock();
        let target = (entries.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;

        let mut shed = 0;
        while shed < target && entries.pop_lru().is_some() {
            shed += 1;
        }
        expired + shed
    }

    /// 删除满足条件的条目，条件参数为键与剩余TTL
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str, Duration) -> bool,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry.remaining_ttl_at(now)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// 未过期条目快照：(键, 值, 剩余TTL)
    pub fn snapshot(&self) -> Vec<(String, Value, Duration)> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.remaining_ttl_at(now)))
            .collect()
    }

    /// 读取条目元数据（不影响最近使用顺序）
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().peek(key).cloned()
    }

    /// 清空
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 占用率 [0, 1]
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}
