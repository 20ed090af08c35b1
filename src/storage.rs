//! 存储抽象层
//!
//! 定义温层（持久化缓存）接口和内存实现。温层键由上层加上命名空间前缀，
//! 每个条目都带有显式TTL。

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StorageError;

/// 键的剩余TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// 键不存在
    Missing,
    /// 键存在但没有过期时间
    Persistent,
    /// 剩余时间
    Expires(Duration),
}

impl KeyTtl {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// 批量读取到的值与其TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    pub ttl: KeyTtl,
}

/// 温层存储接口
#[async_trait]
pub trait WarmStore: Send + Sync {
    /// 获取值
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// 写入值并设置TTL
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StorageError>;

    /// 删除值，返回键是否存在
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// 检查键是否存在
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// 获取剩余TTL
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError>;

    /// 重新设置TTL，返回键是否存在
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// 分页扫描匹配 `pattern`（glob）的键，游标为0表示扫描结束
    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError>;

    /// 一次请求批量读取值和TTL，结果顺序与 `keys` 一致
    async fn multi_get_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<StoredValue>>, StorageError>;

    /// 连通性检查
    async fn ping(&self) -> Result<(), StorageError>;

    /// 重新建立连接
    async fn reconnect(&self) -> Result<(), StorageError> {
        self.ping().await
    }

    /// 释放连接，之后的操作返回连接错误
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// 把glob模式转换为正则（支持 `*` 与 `?`）
pub fn glob_to_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| StorageError::QueryError(format!("无效的匹配模式: {}", e)))
}

/// 内存条目
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// 内存温层（单节点部署与测试使用）
#[derive(Debug, Default)]
pub struct MemoryWarmStore {
    data: DashMap<String, MemoryEntry>,
}

impl MemoryWarmStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// 未过期条目数
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 写入一个原始值（测试中用来构造损坏的负载）
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.data.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn live_entry(&self, key: &str) -> Option<MemoryEntry> {
        let now = Instant::now();
        let entry = self.data.get(key).map(|e| e.clone())?;
        if entry.is_expired(now) {
            self.data.remove(key);
            None
        } else {
            Some(entry)
        }
    }

    fn ttl_of(entry: &MemoryEntry) -> KeyTtl {
        match entry.expires_at {
            Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
            None => KeyTtl::Persistent,
        }
    }
}

#[async_trait]
impl WarmStore for MemoryWarmStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.live_entry(key).map(|e| e.value))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        self.insert_raw(key, value, Some(ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.live_entry(key).is_some();
        self.data.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.live_entry(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        Ok(self
            .live_entry(key)
            .map_or(KeyTtl::Missing, |e| Self::ttl_of(&e)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        if self.live_entry(key).is_none() {
            return Ok(false);
        }
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();

        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + count.max(1)).min(keys.len());
        let page = keys[start..end]
            .iter()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn multi_get_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<StoredValue>>, StorageError> {
        Ok(keys
            .iter()
            .map(|key| {
                self.live_entry(key).map(|entry| StoredValue {
                    ttl: Self::ttl_of(&entry),
                    value: entry.value,
                })
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
