//! 分层缓存存储
//!
//! 热层（进程内LRU）在前，温层（[`WarmStore`]）在后。
//!
//! # 特性
//!
//! - **读路径**: 先查热层（无I/O），未命中或过期时查温层，温层命中回填热层
//! - **写路径**: 温层TTL裁剪到 `[min_ttl, max_ttl]`，热层按负载大小准入
//! - **降级机制**: 温层连接失败时降级为仅热层，自愈成功后恢复
//! - **批量读取**: 一次流水线请求，失败时退化为逐键读取
//! - **健康检查**: 连通性、热层占用率、近期错误率加权评分
//! - **导入导出**: 可序列化快照，支持覆盖保护和键前缀映射

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::hot::{HotLookup, HotTier};
use crate::cache::CacheLevel;
use crate::config::StoreConfig;
use crate::constants::{ERROR_WINDOW_SIZE, HIGH_ERROR_RATE, HOT_NEAR_CAPACITY_RATIO};
use crate::error::{CacheError, StorageError};
use crate::optimizer::PressureRelief;
use crate::storage::{glob_to_regex, KeyTtl, StoredValue, WarmStore};
use crate::telemetry::{CacheEvent, MetricsSink, NoopMetrics};

/// 温层中存储的负载
#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    data: Value,
    stored_at: DateTime<Utc>,
}

/// 缓存查询结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheLookup {
    pub value: Value,
    /// 剩余TTL
    pub ttl_remaining: Duration,
    /// 命中层级
    pub level: CacheLevel,
}

/// 键状态（性能分析使用）
#[derive(Debug, Clone, PartialEq)]
pub enum KeyState {
    Cached(CacheLookup),
    Expired,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Inspect,
}

/// 写入选项
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL，为空时使用默认TTL
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// 清理选项
#[derive(Debug, Clone, Default)]
pub struct ClearOptions {
    /// 跳过剩余TTL大于 `min_active_ttl` 的键
    pub preserve_active: bool,
    pub min_active_ttl: Duration,
    /// 扫描分页大小，为空时使用配置值
    pub page_size: Option<usize>,
}

/// 清理结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClearReport {
    /// 温层匹配的键数
    pub scanned: usize,
    /// 温层删除数
    pub deleted: usize,
    /// 因仍然活跃而保留的键数
    pub preserved: usize,
    /// 热层删除数
    pub hot_removed: usize,
}

/// `get_or_set` 结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetOrSetResult {
    pub value: Value,
    pub hit: bool,
    pub cache_level: CacheLevel,
}

/// 诊断问题类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    StoreConnectionFailed,
    HotTierNearCapacity,
    HighErrorRate,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::StoreConnectionFailed => "store_connection_failed",
            IssueKind::HotTierNearCapacity => "hot_tier_near_capacity",
            IssueKind::HighErrorRate => "high_error_rate",
        }
    }
}

/// 诊断出的问题
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticIssue {
    pub kind: IssueKind,
    pub message: String,
}

/// 一次自愈尝试
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingAttempt {
    pub issue: IssueKind,
    pub success: bool,
    pub message: String,
}

/// 健康报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// 0-100
    pub score: u8,
    pub connected: bool,
    pub degraded: bool,
    pub hot_entries: usize,
    pub hot_capacity: usize,
    pub hot_occupancy: f64,
    pub error_rate: f64,
    pub checked_at: DateTime<Utc>,
}

/// 导出选项
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// 键的glob过滤，为空时导出全部
    pub pattern: Option<String>,
}

/// 快照条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: Value,
    /// 剩余TTL（秒）
    pub ttl_secs: Option<u64>,
}

/// 缓存快照（与传输方式无关）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub namespace: String,
    pub exported_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

/// 导入选项
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// 是否覆盖已存在的键
    pub overwrite: bool,
    /// 键前缀映射：(旧前缀, 新前缀)，按顺序取第一个匹配项
    pub key_prefix_map: Vec<(String, String)>,
    /// 条目没有TTL时使用的值
    pub default_ttl: Option<Duration>,
}

/// 导入结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 存储统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub serialization_errors: u64,
    pub rejected_admissions: u64,
    pub degradations: u64,
    pub recoveries: u64,
    pub hot_entries: usize,
    pub degraded: bool,
}

impl StoreStats {
    /// 总命中率
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hot_hits + self.warm_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    serialization_errors: AtomicU64,
    rejected_admissions: AtomicU64,
    degradations: AtomicU64,
    recoveries: AtomicU64,
}

/// 分层缓存存储
pub struct TieredCacheStore {
    hot: HotTier,
    warm: Arc<dyn WarmStore>,
    config: StoreConfig,
    degraded: AtomicBool,
    counters: Counters,
    /// 最近温层操作结果（true 表示失败）
    error_window: Mutex<VecDeque<bool>>,
    metrics: Arc<dyn MetricsSink>,
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TieredCacheStore {
    /// 创建分层存储
    pub fn new(config: StoreConfig, warm: Arc<dyn WarmStore>) -> Self {
        info!(
            "创建分层缓存: namespace={}, hot_max_entries={}",
            config.namespace, config.hot_max_entries
        );
        Self {
            hot: HotTier::new(config.hot_max_entries, config.hot_max_entry_bytes),
            warm,
            config,
            degraded: AtomicBool::new(false),
            counters: Counters::default(),
            error_window: Mutex::new(VecDeque::with_capacity(ERROR_WINDOW_SIZE)),
            metrics: Arc::new(NoopMetrics),
            maintenance_handle: Mutex::new(None),
        }
    }

    /// 设置指标接收方
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 初始化：检查温层连通性，失败时返回错误
    pub async fn init(&self) -> Result<(), CacheError> {
        match self.warm.ping().await {
            Ok(()) => {
                info!("温层连接正常: namespace={}", self.config.namespace);
                Ok(())
            }
            Err(e) => {
                error!("温层初始化失败: {}", e);
                Err(CacheError::StoreConnectivity(e.to_string()))
            }
        }
    }

    /// 获取值
    pub async fn get(&self, key: &str) -> Result<Option<CacheLookup>, CacheError> {
        validate_key(key)?;

        if let HotLookup::Hit { value, remaining } = self.hot.get(key) {
            self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
            trace!("热层命中: key={}", key);
            return Ok(Some(CacheLookup {
                value,
                ttl_remaining: remaining,
                level: CacheLevel::Hot,
            }));
        }

        if self.is_degraded() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let keys = [self.warm_key(key)];
        let stored = match self.warm.multi_get_with_ttl(&keys).await {
            Ok(mut values) => {
                self.record_outcome(true);
                values.pop().flatten()
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Err(self.handle_store_error("get", e));
            }
        };

        match stored.and_then(|stored| self.decode(key, stored)) {
            Some(lookup) => {
                self.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(lookup))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// 写入值
    pub async fn set(&self, key: &str, value: &Value, opts: SetOptions) -> Result<(), CacheError> {
        validate_key(key)?;
        validate_value(value)?;

        let ttl = self.clamp_ttl(opts.ttl.unwrap_or_else(|| self.config.default_ttl()));
        let payload = serde_json::to_string(&Payload {
            data: value.clone(),
            stored_at: Utc::now(),
        })?;

        if !self.is_degraded() {
            match self
                .warm
                .set_with_ttl(&self.warm_key(key), &payload, ttl)
                .await
            {
                Ok(()) => self.record_outcome(true),
                Err(e) => {
                    let err = self.handle_store_error("set", e);
                    if !err.is_connectivity() {
                        return Err(err);
                    }
                    warn!("温层写入失败，仅写入热层: key={}", key);
                }
            }
        }

        self.write_hot(key, value.clone(), ttl, payload.len());
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!("写入缓存: key={}, ttl={:?}", key, ttl);
        Ok(())
    }

    /// 删除键，返回任一层是否存在该键
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        let hot_removed = self.hot.remove(key);
        if self.is_degraded() {
            return Ok(hot_removed);
        }
        match self.warm.delete(&self.warm_key(key)).await {
            Ok(existed) => {
                self.record_outcome(true);
                Ok(hot_removed || existed)
            }
            Err(e) => Err(self.handle_store_error("delete", e)),
        }
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        if self.hot.contains(key) {
            return Ok(true);
        }
        if self.is_degraded() {
            return Ok(false);
        }
        match self.warm.exists(&self.warm_key(key)).await {
            Ok(exists) => {
                self.record_outcome(true);
                Ok(exists)
            }
            Err(e) => Err(self.handle_store_error("exists", e)),
        }
    }

    /// 获取剩余TTL
    pub async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        validate_key(key)?;
        if let Some(remaining) = self.hot.remaining_ttl(key) {
            return Ok(KeyTtl::Expires(remaining));
        }
        if self.is_degraded() {
            return Ok(KeyTtl::Missing);
        }
        match self.warm.ttl(&self.warm_key(key)).await {
            Ok(ttl) => {
                self.record_outcome(true);
                Ok(ttl)
            }
            Err(e) => Err(self.handle_store_error("ttl", e)),
        }
    }

    /// 修改剩余TTL，返回任一层是否存在该键
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        validate_key(key)?;
        if ttl.is_zero() {
            return Err(CacheError::Validation("TTL必须大于0".to_string()));
        }
        let hot_updated = self.hot.expire(key, ttl);
        if self.is_degraded() {
            return Ok(hot_updated);
        }
        match self.warm.expire(&self.warm_key(key), ttl).await {
            Ok(existed) => {
                self.record_outcome(true);
                Ok(hot_updated || existed)
            }
            Err(e) => Err(self.handle_store_error("expire", e)),
        }
    }

    /// 批量获取，结果顺序与 `keys` 一致
    pub async fn batch_get(&self, keys: &[String]) -> Vec<Option<CacheLookup>> {
        self.lookup_keys(keys, Access::Read)
            .await
            .into_iter()
            .map(|state| match state {
                KeyState::Cached(lookup) => Some(lookup),
                KeyState::Expired | KeyState::Missing => None,
            })
            .collect()
    }

    /// 批量检查键状态，不影响热层淘汰顺序、命中计数，也不回填热层
    pub async fn inspect_keys(&self, keys: &[String]) -> Vec<KeyState> {
        self.lookup_keys(keys, Access::Inspect).await
    }

    /// 温层只发一次流水线请求；流水线失败时逐键读取，单个负载损坏只影响该键。
    async fn lookup_keys(&self, keys: &[String], access: Access) -> Vec<KeyState> {
        let read = access == Access::Read;
        let mut states = vec![KeyState::Missing; keys.len()];
        let mut pending = Vec::new();

        for (idx, key) in keys.iter().enumerate() {
            if key.is_empty() {
                continue;
            }
            let lookup = if read { self.hot.get(key) } else { self.hot.peek(key) };
            match lookup {
                HotLookup::Hit { value, remaining } => {
                    if read {
                        self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    states[idx] = KeyState::Cached(CacheLookup {
                        value,
                        ttl_remaining: remaining,
                        level: CacheLevel::Hot,
                    });
                }
                HotLookup::Expired => {
                    states[idx] = KeyState::Expired;
                    pending.push(idx);
                }
                HotLookup::Miss => pending.push(idx),
            }
        }

        if pending.is_empty() || self.is_degraded() {
            if read {
                self.count_misses(&states, &pending);
            }
            return states;
        }

        let warm_keys: Vec<String> = pending.iter().map(|&i| self.warm_key(&keys[i])).collect();
        match self.warm.multi_get_with_ttl(&warm_keys).await {
            Ok(values) => {
                self.record_outcome(true);
                for (&idx, stored) in pending.iter().zip(values) {
                    if let Some(state) = stored.map(|s| self.classify(&keys[idx], s, read)) {
                        states[idx] = state;
                    }
                }
            }
            Err(e) => {
                warn!("批量读取流水线失败，改为逐键读取: {}", e);
                self.handle_store_error("batch_get", e);
                for (&idx, warm_key) in pending.iter().zip(&warm_keys) {
                    if self.is_degraded() {
                        break;
                    }
                    match self.warm.get(warm_key).await {
                        Ok(Some(raw)) => {
                            self.record_outcome(true);
                            let ttl = self.warm.ttl(warm_key).await.unwrap_or(KeyTtl::Persistent);
                            states[idx] =
                                self.classify(&keys[idx], StoredValue { value: raw, ttl }, read);
                        }
                        Ok(None) => self.record_outcome(true),
                        Err(e) => {
                            self.handle_store_error("get", e);
                        }
                    }
                }
            }
        }

        if read {
            for &idx in &pending {
                if let KeyState::Cached(lookup) = &states[idx] {
                    if lookup.level == CacheLevel::Warm {
                        self.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.count_misses(&states, &pending);
        }
        states
    }

    /// 按glob模式清理
    pub async fn clear(&self, pattern: &str, opts: ClearOptions) -> Result<ClearReport, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let mut report = ClearReport::default();

        report.hot_removed = self.hot.remove_where(|key, remaining| {
            matcher.is_match(key) && !(opts.preserve_active && remaining > opts.min_active_ttl)
        });

        if self.is_degraded() {
            warn!("温层降级中，仅清理热层: pattern={}", pattern);
            return Ok(report);
        }

        let page_size = opts.page_size.unwrap_or(self.config.scan_page_size).max(1);
        let candidates = self.scan_all(pattern, page_size).await?;
        report.scanned = candidates.len();

        for chunk in candidates.chunks(page_size) {
            for warm_key in chunk {
                if opts.preserve_active {
                    let ttl = self
                        .warm
                        .ttl(warm_key)
                        .await
                        .map_err(|e| self.handle_store_error("ttl", e))?;
                    let active = match ttl {
                        KeyTtl::Expires(remaining) => remaining > opts.min_active_ttl,
                        KeyTtl::Persistent => true,
                        KeyTtl::Missing => false,
                    };
                    if active {
                        report.preserved += 1;
                        continue;
                    }
                }
                if self
                    .warm
                    .delete(warm_key)
                    .await
                    .map_err(|e| self.handle_store_error("delete", e))?
                {
                    report.deleted += 1;
                }
            }
        }
        self.record_outcome(true);

        info!(
            "清理缓存完成: pattern={}, deleted={}, preserved={}, hot_removed={}",
            pattern, report.deleted, report.preserved, report.hot_removed
        );
        Ok(report)
    }

    /// 命中时返回缓存值，否则调用工厂函数并写入缓存
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        factory: F,
        opts: SetOptions,
    ) -> Result<GetOrSetResult, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        match self.get(key).await {
            Ok(Some(lookup)) => {
                return Ok(GetOrSetResult {
                    value: lookup.value,
                    hit: true,
                    cache_level: lookup.level,
                })
            }
            Ok(None) => {}
            Err(CacheError::Validation(msg)) => return Err(CacheError::Validation(msg)),
            Err(e) => warn!("读取缓存失败，直接调用工厂函数: key={}, error={}", key, e),
        }

        let value = factory().await.map_err(|e| CacheError::upstream(&e))?;
        if let Err(e) = self.set(key, &value, opts).await {
            warn!("工厂函数结果写入缓存失败: key={}, error={}", key, e);
        }

        Ok(GetOrSetResult {
            value,
            hit: false,
            cache_level: CacheLevel::Factory,
        })
    }

    /// 健康检查
    pub async fn health_check(&self) -> HealthReport {
        let connected = self.warm.ping().await.is_ok();
        let hot_occupancy = self.hot.occupancy();
        let error_rate = self.error_rate();

        let connectivity_score = if connected { 50.0 } else { 0.0 };
        let occupancy_score = if hot_occupancy < HOT_NEAR_CAPACITY_RATIO {
            25.0
        } else {
            25.0 * ((1.0 - hot_occupancy) / (1.0 - HOT_NEAR_CAPACITY_RATIO)).clamp(0.0, 1.0)
        };
        let error_score = 25.0 * (1.0 - error_rate).clamp(0.0, 1.0);

        HealthReport {
            score: (connectivity_score + occupancy_score + error_score).round() as u8,
            connected,
            degraded: self.is_degraded(),
            hot_entries: self.hot.len(),
            hot_capacity: self.hot.capacity(),
            hot_occupancy,
            error_rate,
            checked_at: Utc::now(),
        }
    }

    /// 诊断问题
    pub async fn diagnose(&self) -> Vec<DiagnosticIssue> {
        let mut issues = Vec::new();

        if let Err(e) = self.warm.ping().await {
            issues.push(DiagnosticIssue {
                kind: IssueKind::StoreConnectionFailed,
                message: format!("温层不可达: {}", e),
            });
        }

        let occupancy = self.hot.occupancy();
        if occupancy >= HOT_NEAR_CAPACITY_RATIO {
            issues.push(DiagnosticIssue {
                kind: IssueKind::HotTierNearCapacity,
                message: format!("热层占用率 {:.0}%", occupancy * 100.0),
            });
        }

        let error_rate = self.error_rate();
        if error_rate >= HIGH_ERROR_RATE {
            issues.push(DiagnosticIssue {
                kind: IssueKind::HighErrorRate,
                message: format!("近期错误率 {:.1}%", error_rate * 100.0),
            });
        }

        issues
    }

    /// 自愈：每个问题尝试一次修复，不返回错误
    pub async fn self_heal(&self) -> Vec<HealingAttempt> {
        let issues = self.diagnose().await;
        let mut attempts = Vec::with_capacity(issues.len());

        for issue in issues {
            let attempt = match issue.kind {
                IssueKind::StoreConnectionFailed => self.heal_connection().await,
                IssueKind::HotTierNearCapacity => {
                    let expired = self.hot.cleanup_expired();
                    let success = self.hot.occupancy() < HOT_NEAR_CAPACITY_RATIO;
                    HealingAttempt {
                        issue: issue.kind,
                        success,
                        message: format!("清理了 {} 条过期数据", expired),
                    }
                }
                IssueKind::HighErrorRate => {
                    self.error_window.lock().clear();
                    HealingAttempt {
                        issue: issue.kind,
                        success: true,
                        message: "错误率窗口已重置".to_string(),
                    }
                }
            };

            if attempt.success {
                info!("自愈成功: issue={}, {}", attempt.issue.as_str(), attempt.message);
            } else {
                error!("自愈失败: issue={}, {}", attempt.issue.as_str(), attempt.message);
            }
            self.metrics.record(&CacheEvent::SelfHeal {
                issue: attempt.issue.as_str().to_string(),
                success: attempt.success,
            });
            attempts.push(attempt);
        }

        attempts
    }

    async fn heal_connection(&self) -> HealingAttempt {
        let result = match self.warm.reconnect().await {
            Ok(()) => self.warm.ping().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.set_degraded(false);
                HealingAttempt {
                    issue: IssueKind::StoreConnectionFailed,
                    success: true,
                    message: "温层已重新连接".to_string(),
                }
            }
            Err(e) => {
                self.set_degraded(true);
                HealingAttempt {
                    issue: IssueKind::StoreConnectionFailed,
                    success: false,
                    message: format!("重新连接失败: {}", e),
                }
            }
        }
    }

    /// 导出快照
    pub async fn export(&self, opts: ExportOptions) -> Result<CacheSnapshot, CacheError> {
        let pattern = opts.pattern.as_deref().unwrap_or("*");
        let matcher = glob_to_regex(pattern)?;
        let mut entries = Vec::new();
        let mut seen = AHashSet::new();

        if !self.is_degraded() {
            let page_size = self.config.scan_page_size.max(1);
            let warm_keys = self.scan_all(pattern, page_size).await?;
            for chunk in warm_keys.chunks(page_size) {
                let values = self
                    .warm
                    .multi_get_with_ttl(chunk)
                    .await
                    .map_err(|e| self.handle_store_error("export", e))?;
                for (warm_key, stored) in chunk.iter().zip(values) {
                    let Some(stored) = stored else { continue };
                    let key = self.user_key(warm_key).to_string();
                    match serde_json::from_str::<Payload>(&stored.value) {
                        Ok(payload) => {
                            seen.insert(key.clone());
                            entries.push(SnapshotEntry {
                                key,
                                value: payload.data,
                                ttl_secs: stored.ttl.remaining().map(|d| d.as_secs().max(1)),
                            });
                        }
                        Err(e) => {
                            self.counters.serialization_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("导出时跳过损坏的负载: key={}, error={}", key, e);
                        }
                    }
                }
            }
            self.record_outcome(true);
        }

        // 降级期间只写入热层的数据也需要导出
        for (key, value, remaining) in self.hot.snapshot() {
            if matcher.is_match(&key) && !seen.contains(&key) {
                entries.push(SnapshotEntry {
                    key,
                    value,
                    ttl_secs: Some(remaining.as_secs().max(1)),
                });
            }
        }

        info!("导出缓存快照: {} 条", entries.len());
        Ok(CacheSnapshot {
            namespace: self.config.namespace.clone(),
            exported_at: Utc::now(),
            entries,
        })
    }

    /// 导入快照
    pub async fn import(
        &self,
        snapshot: &CacheSnapshot,
        opts: ImportOptions,
    ) -> Result<ImportReport, CacheError> {
        let mut report = ImportReport::default();

        for entry in &snapshot.entries {
            let key = remap_key(&entry.key, &opts.key_prefix_map);

            if !opts.overwrite {
                match self.exists(&key).await {
                    Ok(true) => {
                        report.skipped += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("导入时检查键失败: key={}, error={}", key, e);
                        report.failed += 1;
                        continue;
                    }
                }
            }

            let ttl = entry
                .ttl_secs
                .map(Duration::from_secs)
                .or(opts.default_ttl);
            match self.set(&key, &entry.value, SetOptions { ttl }).await {
                Ok(()) => report.imported += 1,
                Err(e) => {
                    warn!("导入条目失败: key={}, error={}", key, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "导入缓存快照: imported={}, skipped={}, failed={}",
            report.imported, report.skipped, report.failed
        );
        Ok(report)
    }

    /// 释放热层内存，返回移除的条目数
    pub fn shed_hot_entries(&self, fraction: f64) -> usize {
        let removed = self.hot.shed(fraction);
        if removed > 0 {
            warn!("内存压力释放热层条目: {}", removed);
        }
        removed
    }

    /// 清理热层过期条目
    pub fn cleanup_expired(&self) -> usize {
        self.hot.cleanup_expired()
    }

    /// 启动定期维护（过期清理，降级时探测恢复）
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut handle = self.maintenance_handle.lock();
        if handle.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                store.cleanup_expired();
                if store.is_degraded() && store.warm.ping().await.is_ok() {
                    store.set_degraded(false);
                }
            }
        }));
    }

    /// 统计信息
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            warm_hits: c.warm_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            serialization_errors: c.serialization_errors.load(Ordering::Relaxed),
            rejected_admissions: c.rejected_admissions.load(Ordering::Relaxed),
            degradations: c.degradations.load(Ordering::Relaxed),
            recoveries: c.recoveries.load(Ordering::Relaxed),
            hot_entries: self.hot.len(),
            degraded: self.is_degraded(),
        }
    }

    /// 是否处于降级状态
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// 热层
    pub fn hot_tier(&self) -> &HotTier {
        &self.hot
    }

    /// 存储配置
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 把TTL限制在配置范围内
    pub fn clamp_ttl(&self, ttl: Duration) -> Duration {
        let (min, max) = (self.config.min_ttl(), self.config.max_ttl());
        let clamped = ttl.clamp(min, max);
        if clamped != ttl {
            debug!("TTL {:?} 超出范围 [{:?}, {:?}]，已裁剪", ttl, min, max);
        }
        clamped
    }

    /// 停止维护任务并释放热层
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance_handle.lock().take() {
            handle.abort();
        }
        self.hot.clear();
        if let Err(e) = self.warm.close().await {
            warn!("释放温层连接失败: {}", e);
        }
        info!("分层缓存已关闭: namespace={}", self.config.namespace);
    }

    fn warm_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn user_key<'a>(&self, warm_key: &'a str) -> &'a str {
        warm_key
            .strip_prefix(&self.config.namespace)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(warm_key)
    }

    async fn scan_all(&self, pattern: &str, page_size: usize) -> Result<Vec<String>, CacheError> {
        let warm_pattern = self.warm_key(pattern);
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, page) = self
                .warm
                .scan(&warm_pattern, cursor, page_size)
                .await
                .map_err(|e| self.handle_store_error("scan", e))?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn write_hot(&self, key: &str, value: Value, ttl: Duration, size_bytes: usize) {
        if !self.hot.admits(size_bytes) {
            self.counters.rejected_admissions.fetch_add(1, Ordering::Relaxed);
            self.hot.remove(key);
            debug!("负载过大，不进入热层: key={}, size={}", key, size_bytes);
            return;
        }
        if self.hot.insert(key, value, ttl, size_bytes).is_some() {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(&CacheEvent::Eviction);
        }
    }

    /// 解析温层值；损坏的负载视为未命中
    fn decode(&self, key: &str, stored: StoredValue) -> Option<CacheLookup> {
        match self.classify(key, stored, true) {
            KeyState::Cached(lookup) => Some(lookup),
            KeyState::Expired | KeyState::Missing => None,
        }
    }

    fn classify(&self, key: &str, stored: StoredValue, promote: bool) -> KeyState {
        let remaining = match stored.ttl {
            KeyTtl::Expires(d) if d.is_zero() => return KeyState::Expired,
            KeyTtl::Expires(d) => d,
            KeyTtl::Persistent => self.config.max_ttl(),
            KeyTtl::Missing => return KeyState::Missing,
        };

        let payload = match serde_json::from_str::<Payload>(&stored.value) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.serialization_errors.fetch_add(1, Ordering::Relaxed);
                warn!("温层负载损坏，按未命中处理: key={}, error={}", key, e);
                return KeyState::Missing;
            }
        };

        if promote {
            self.write_hot(key, payload.data.clone(), remaining, stored.value.len());
        }
        KeyState::Cached(CacheLookup {
            value: payload.data,
            ttl_remaining: remaining,
            level: CacheLevel::Warm,
        })
    }

    fn count_misses(&self, states: &[KeyState], pending: &[usize]) {
        let misses = pending
            .iter()
            .filter(|&&i| !matches!(states[i], KeyState::Cached(_)))
            .count() as u64;
        self.counters.misses.fetch_add(misses, Ordering::Relaxed);
    }

    fn handle_store_error(&self, operation: &'static str, err: StorageError) -> CacheError {
        self.record_outcome(false);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(&CacheEvent::StoreError { operation });

        let err = CacheError::from(err);
        if err.is_connectivity() {
            error!("温层连接失败，降级为仅热层: operation={}, error={}", operation, err);
            self.set_degraded(true);
        } else {
            warn!("温层操作失败: operation={}, error={}", operation, err);
        }
        err
    }

    fn set_degraded(&self, degraded: bool) {
        let previous = self.degraded.swap(degraded, Ordering::Relaxed);
        if previous != degraded {
            if degraded {
                self.counters.degradations.fetch_add(1, Ordering::Relaxed);
                warn!("分层缓存进入降级模式");
            } else {
                self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
                info!("分层缓存从降级模式恢复");
            }
        }
    }

    fn record_outcome(&self, ok: bool) {
        let mut window = self.error_window.lock();
        if window.len() >= ERROR_WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(!ok);
    }

    fn error_rate(&self) -> f64 {
        let window = self.error_window.lock();
        if window.is_empty() {
            0.0
        } else {
            window.iter().filter(|failed| **failed).count() as f64 / window.len() as f64
        }
    }
}

impl PressureRelief for TieredCacheStore {
    fn relieve(&self, fraction: f64) -> usize {
        self.shed_hot_entries(fraction)
    }
}

impl Drop for TieredCacheStore {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance_handle.lock().take() {
            handle.abort();
        }
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::Validation("缓存键不能为空".to_string()));
    }
    Ok(())
}

fn validate_value(value: &Value) -> Result<(), CacheError> {
    match value {
        Value::Null => Err(CacheError::Validation("缓存值不能为空(null)".to_string())),
        Value::String(s) if s.is_empty() => {
            Err(CacheError::Validation("缓存值不能为空字符串".to_string()))
        }
        _ => Ok(()),
    }
}

fn remap_key(key: &str, prefix_map: &[(String, String)]) -> String {
    prefix_map
        .iter()
        .find_map(|(from, to)| key.strip_prefix(from.as_str()).map(|rest| format!("{}{}", to, rest)))
        .unwrap_or_else(|| key.to_string())
}
