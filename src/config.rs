//! 配置模块
//!
//! 定义编排器、分层存储和性能优化器的配置结构，支持YAML/TOML反序列化。
//! 数值边界的裁剪由 [`crate::factory::ConfigFactory`] 负责，这里只做结构校验。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::*;
use crate::strategy::StrategySettings;

/// 智能缓存总配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartCacheConfig {
    /// 同一键两次后台刷新的最小间隔（毫秒）
    pub min_update_interval_ms: u64,
    /// 后台刷新最大并发数，范围 [2, 32]
    pub max_concurrent_updates: usize,
    /// 关闭时等待后台任务的时长（毫秒）
    pub graceful_shutdown_timeout_ms: u64,
    /// 单次获取超时（毫秒）
    pub fetch_timeout_ms: u64,
    /// 市场状态缓存时长（秒）
    pub market_status_cache_ttl_secs: u64,
    /// 健康检查/自愈间隔（秒）
    pub health_check_interval_secs: u64,
    /// 预热时的新鲜度阈值
    pub warmup_freshness_ratio: f64,
    /// 热点判定阈值（秒）
    pub hotspot_ttl_threshold_secs: u64,
    /// 低命中率阈值
    pub low_hit_rate_threshold: f64,
    /// 是否启用后台更新
    pub enable_background_update: bool,
    /// 是否启用数据变化检测（自适应策略使用）
    pub enable_data_change_detection: bool,
    /// 是否启用指标上报
    pub enable_metrics: bool,
    /// 策略参数
    pub strategies: StrategySettings,
    /// 分层存储配置
    pub store: StoreConfig,
    /// 性能优化器配置
    pub optimizer: OptimizerConfig,
}

impl Default for SmartCacheConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: DEFAULT_MIN_UPDATE_INTERVAL_MS,
            max_concurrent_updates: DEFAULT_MAX_CONCURRENT_UPDATES,
            graceful_shutdown_timeout_ms: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            market_status_cache_ttl_secs: DEFAULT_MARKET_STATUS_CACHE_TTL_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            warmup_freshness_ratio: DEFAULT_WARMUP_FRESHNESS_RATIO,
            hotspot_ttl_threshold_secs: DEFAULT_HOTSPOT_TTL_THRESHOLD_SECS,
            low_hit_rate_threshold: DEFAULT_LOW_HIT_RATE_THRESHOLD,
            enable_background_update: true,
            enable_data_change_detection: true,
            enable_metrics: true,
            strategies: StrategySettings::default(),
            store: StoreConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl SmartCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent_updates(mut self, n: usize) -> Self {
        self.max_concurrent_updates = n;
        self
    }

    pub fn min_update_interval(mut self, interval: Duration) -> Self {
        self.min_update_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn enable_background_update(mut self, enable: bool) -> Self {
        self.enable_background_update = enable;
        self
    }

    pub fn enable_data_change_detection(mut self, enable: bool) -> Self {
        self.enable_data_change_detection = enable;
        self
    }

    pub fn strategies(mut self, strategies: StrategySettings) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn min_update_interval_duration(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }

    pub fn fetch_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn graceful_shutdown_duration(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn market_status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.market_status_cache_ttl_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// 结构校验，返回所有违规项
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(MIN_CONCURRENT_UPDATES..=MAX_CONCURRENT_UPDATES).contains(&self.max_concurrent_updates)
        {
            errors.push(format!(
                "max_concurrent_updates ({}) 必须位于 [{}, {}]",
                self.max_concurrent_updates, MIN_CONCURRENT_UPDATES, MAX_CONCURRENT_UPDATES
            ));
        }
        if self.graceful_shutdown_timeout_ms == 0 {
            errors.push("graceful_shutdown_timeout_ms 必须大于0".to_string());
        }
        if self.fetch_timeout_ms == 0 {
            errors.push("fetch_timeout_ms 必须大于0".to_string());
        }
        if self.market_status_cache_ttl_secs == 0 {
            errors.push("market_status_cache_ttl_secs 必须大于0".to_string());
        }
        if self.health_check_interval_secs == 0 {
            errors.push("health_check_interval_secs 必须大于0".to_string());
        }
        if !(0.0..=1.0).contains(&self.warmup_freshness_ratio) {
            errors.push(format!(
                "warmup_freshness_ratio ({}) 必须位于 [0, 1]",
                self.warmup_freshness_ratio
            ));
        }
        if !(0.0..=1.0).contains(&self.low_hit_rate_threshold) {
            errors.push(format!(
                "low_hit_rate_threshold ({}) 必须位于 [0, 1]",
                self.low_hit_rate_threshold
            ));
        }

        self.strategies.validate(&mut errors);
        self.store.validate(&mut errors);
        self.optimizer.validate(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// 分层存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 温层键命名空间
    pub namespace: String,
    /// 热层最大条目数
    pub hot_max_entries: usize,
    /// 热层准入的最大负载字节数
    pub hot_max_entry_bytes: usize,
    /// TTL下限（秒）
    pub min_ttl_secs: u64,
    /// TTL上限（秒）
    pub max_ttl_secs: u64,
    /// 未指定TTL时使用的值（秒）
    pub default_ttl_secs: u64,
    /// 扫描分页大小
    pub scan_page_size: usize,
    /// 过期清理间隔（秒）
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            hot_max_entries: DEFAULT_HOT_MAX_ENTRIES,
            hot_max_entry_bytes: DEFAULT_HOT_MAX_ENTRY_BYTES,
            min_ttl_secs: DEFAULT_STORE_MIN_TTL_SECS,
            max_ttl_secs: DEFAULT_STORE_MAX_TTL_SECS,
            default_ttl_secs: DEFAULT_STORE_DEFAULT_TTL_SECS,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn hot_max_entries(mut self, n: usize) -> Self {
        self.hot_max_entries = n;
        self
    }

    pub fn hot_max_entry_bytes(mut self, n: usize) -> Self {
        self.hot_max_entry_bytes = n;
        self
    }

    pub fn ttl_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl_secs = min.as_secs();
        self.max_ttl_secs = max.as_secs();
        self
    }

    pub fn scan_page_size(mut self, n: usize) -> Self {
        self.scan_page_size = n;
        self
    }

    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            errors.push(format!("store.namespace 无效: {:?}", self.namespace));
        }
        if self.hot_max_entries == 0 {
            errors.push("store.hot_max_entries 必须大于0".to_string());
        }
        if self.min_ttl_secs == 0 {
            errors.push("store.min_ttl_secs 必须大于0".to_string());
        }
        if self.min_ttl_secs > self.max_ttl_secs {
            errors.push(format!(
                "store.min_ttl_secs ({}) 不能大于 max_ttl_secs ({})",
                self.min_ttl_secs, self.max_ttl_secs
            ));
        }
        if self.default_ttl_secs == 0 {
            errors.push("store.default_ttl_secs 必须大于0".to_string());
        }
        if self.scan_page_size == 0 {
            errors.push("store.scan_page_size 必须大于0".to_string());
        }
        if self.cleanup_interval_secs == 0 {
            errors.push("store.cleanup_interval_secs 必须大于0".to_string());
        }
    }
}

/// 性能优化器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// 最小批大小
    pub min_batch_size: usize,
    /// 最大批大小
    pub max_batch_size: usize,
    /// 内存压力阈值（占内存上限的比例）
    pub memory_pressure_threshold: f64,
    /// 重新计算间隔（秒）
    pub optimization_interval_secs: u64,
    /// 任务耗时历史窗口
    pub duration_history_size: usize,
    /// 内存上限（字节），为空时使用系统总内存
    pub memory_limit_bytes: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            memory_pressure_threshold: DEFAULT_MEMORY_PRESSURE_THRESHOLD,
            optimization_interval_secs: DEFAULT_OPTIMIZATION_INTERVAL_SECS,
            duration_history_size: DEFAULT_DURATION_HISTORY_SIZE,
            memory_limit_bytes: None,
        }
    }
}

impl OptimizerConfig {
    pub fn batch_size_range(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    pub fn memory_pressure_threshold(mut self, threshold: f64) -> Self {
        self.memory_pressure_threshold = threshold;
        self
    }

    pub fn memory_limit_bytes(mut self, limit: u64) -> Self {
        self.memory_limit_bytes = Some(limit);
        self
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.min_batch_size == 0 {
            errors.push("optimizer.min_batch_size 必须大于0".to_string());
        }
        if self.min_batch_size > self.max_batch_size {
            errors.push(format!(
                "optimizer.min_batch_size ({}) 不能大于 max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            ));
        }
        if !(self.memory_pressure_threshold > 0.0 && self.memory_pressure_threshold < 1.0) {
            errors.push(format!(
                "optimizer.memory_pressure_threshold ({}) 必须位于 (0, 1)",
                self.memory_pressure_threshold
            ));
        }
        if self.optimization_interval_secs == 0 {
            errors.push("optimizer.optimization_interval_secs 必须大于0".to_string());
        }
        if self.duration_history_size < 2 {
            errors.push("optimizer.duration_history_size 必须 >= 2".to_string());
        }
    }
}
