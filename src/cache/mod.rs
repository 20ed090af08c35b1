//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 缓存模块
//!
//! 提供两级缓存实现：进程内热层（LRU）与可持久化的温层（内存或Redis）。

pub mod hot;
pub mod tiered;

use serde::{Deserialize, Serialize};

/// 数据来源层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// 进程内热层
    Hot,
    /// 持久化温层
    Warm,
    /// `get_or_set` 的工厂函数
    Factory,
    /// 上游获取
    Upstream,
    /// 不经过缓存
    Bypass,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Hot => "hot",
            CacheLevel::Warm => "warm",
            CacheLevel::Factory => "factory",
            CacheLevel::Upstream => "upstream",
            CacheLevel::Bypass => "bypass",
        }
    }
}

// 重新导出热层的公共 API
pub use hot::{CacheEntry, HotLookup, HotTier};

// 重新导出分层存储的公共 API
pub use tiered::{
    CacheLookup, CacheSnapshot, ClearOptions, ClearReport, DiagnosticIssue, ExportOptions,
    GetOrSetResult, HealingAttempt, HealthReport, ImportOptions, ImportReport, IssueKind,
    KeyState, SetOptions, SnapshotEntry, StoreStats, TieredCacheStore,
};
