//! 配置工厂模块
//!
//! 把默认值与外部覆盖项合并为经过校验的 [`SmartCacheConfig`]。
//!
//! # 规则
//!
//! - 覆盖项以 `键 -> 原始字符串` 形式提供，键使用点号分隔（如 `strategies.strong.ttl_secs`）
//! - 数值超出文档范围时裁剪到边界并记录警告
//! - 无法解析的值记录警告并保留默认值
//! - 负数时长与非正TTL视为违规，不做裁剪
//! - 合并后做结构校验，所有违规项汇总为一个 [`CacheError::Configuration`]

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::SmartCacheConfig;
use crate::constants::*;
use crate::error::CacheError;

/// 数值符号约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    /// 必须大于0（TTL、间隔、容量）
    Positive,
    /// 不能为负（可为0的时长）
    NonNegative,
    /// 任意值，超出范围时裁剪（比例）
    Clamp,
}

/// 数值配置项描述
struct NumericField {
    key: &'static str,
    sign: Sign,
    bounds: (f64, f64),
    get: fn(&SmartCacheConfig) -> Option<f64>,
    set: fn(&mut SmartCacheConfig, f64),
}

/// 布尔配置项描述
struct BoolField {
    key: &'static str,
    set: fn(&mut SmartCacheConfig, bool),
}

macro_rules! int_field {
    ($key:literal, $sign:expr, $bounds:expr, $ty:ty, $($path:ident).+) => {
        NumericField {
            key: $key,
            sign: $sign,
            bounds: $bounds,
            get: |c| Some(c.$($path).+ as f64),
            set: |c, v| c.$($path).+ = v.round() as $ty,
        }
    };
}

macro_rules! float_field {
    ($key:literal, $sign:expr, $bounds:expr, $($path:ident).+) => {
        NumericField {
            key: $key,
            sign: $sign,
            bounds: $bounds,
            get: |c| Some(c.$($path).+),
            set: |c, v| c.$($path).+ = v,
        }
    };
}

macro_rules! bool_field {
    ($key:literal, $($path:ident).+) => {
        BoolField {
            key: $key,
            set: |c, v| c.$($path).+ = v,
        }
    };
}

const MEMORY_LIMIT_BOUNDS: (f64, f64) = (16.0 * 1024.0 * 1024.0, 1.0e15);
const HOTSPOT_THRESHOLD_BOUNDS: (f64, f64) = (0.0, 86_400.0);
const CONCURRENCY_BOUNDS: (f64, f64) = (MIN_CONCURRENT_UPDATES as f64, MAX_CONCURRENT_UPDATES as f64);

fn numeric_fields() -> Vec<NumericField> {
    use Sign::*;
    vec![
        int_field!("min_update_interval_ms", NonNegative, MIN_UPDATE_INTERVAL_MS_BOUNDS, u64, min_update_interval_ms),
        int_field!("max_concurrent_updates", Positive, CONCURRENCY_BOUNDS, usize, max_concurrent_updates),
        int_field!("graceful_shutdown_timeout_ms", Positive, GRACEFUL_SHUTDOWN_TIMEOUT_MS_BOUNDS, u64, graceful_shutdown_timeout_ms),
        int_field!("fetch_timeout_ms", Positive, FETCH_TIMEOUT_MS_BOUNDS, u64, fetch_timeout_ms),
        int_field!("market_status_cache_ttl_secs", Positive, MARKET_STATUS_CACHE_TTL_SECS_BOUNDS, u64, market_status_cache_ttl_secs),
        int_field!("health_check_interval_secs", Positive, HEALTH_CHECK_INTERVAL_SECS_BOUNDS, u64, health_check_interval_secs),
        float_field!("warmup_freshness_ratio", Clamp, RATIO_BOUNDS, warmup_freshness_ratio),
        int_field!("hotspot_ttl_threshold_secs", NonNegative, HOTSPOT_THRESHOLD_BOUNDS, u64, hotspot_ttl_threshold_secs),
        float_field!("low_hit_rate_threshold", Clamp, RATIO_BOUNDS, low_hit_rate_threshold),
        // 强时效
        int_field!("strategies.strong.ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.strong.ttl_secs),
        float_field!("strategies.strong.update_threshold_ratio", Clamp, RATIO_BOUNDS, strategies.strong.update_threshold_ratio),
        int_field!("strategies.strong.refresh_interval_secs", Positive, STRATEGY_INTERVAL_SECS_BOUNDS, u64, strategies.strong.refresh_interval_secs),
        // 弱时效
        int_field!("strategies.weak.ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.weak.ttl_secs),
        float_field!("strategies.weak.update_threshold_ratio", Clamp, RATIO_BOUNDS, strategies.weak.update_threshold_ratio),
        int_field!("strategies.weak.refresh_interval_secs", Positive, STRATEGY_INTERVAL_SECS_BOUNDS, u64, strategies.weak.refresh_interval_secs),
        // 市场感知
        int_field!("strategies.market_aware.open_market_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.market_aware.open_market_ttl_secs),
        int_field!("strategies.market_aware.closed_market_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.market_aware.closed_market_ttl_secs),
        float_field!("strategies.market_aware.open_market_update_ratio", Clamp, RATIO_BOUNDS, strategies.market_aware.open_market_update_ratio),
        float_field!("strategies.market_aware.closed_market_update_ratio", Clamp, RATIO_BOUNDS, strategies.market_aware.closed_market_update_ratio),
        int_field!("strategies.market_aware.market_status_check_interval_secs", Positive, STRATEGY_INTERVAL_SECS_BOUNDS, u64, strategies.market_aware.market_status_check_interval_secs),
        // 自适应
        int_field!("strategies.adaptive.base_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.adaptive.base_ttl_secs),
        int_field!("strategies.adaptive.min_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.adaptive.min_ttl_secs),
        int_field!("strategies.adaptive.max_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, strategies.adaptive.max_ttl_secs),
        float_field!("strategies.adaptive.adaptation_factor", Positive, ADAPTATION_FACTOR_BOUNDS, strategies.adaptive.adaptation_factor),
        int_field!("strategies.adaptive.change_detection_window_secs", Positive, STRATEGY_INTERVAL_SECS_BOUNDS, u64, strategies.adaptive.change_detection_window_secs),
        // 存储
        int_field!("store.hot_max_entries", Positive, HOT_MAX_ENTRIES_BOUNDS, usize, store.hot_max_entries),
        int_field!("store.hot_max_entry_bytes", Positive, HOT_MAX_ENTRY_BYTES_BOUNDS, usize, store.hot_max_entry_bytes),
        int_field!("store.min_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, store.min_ttl_secs),
        int_field!("store.max_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, store.max_ttl_secs),
        int_field!("store.default_ttl_secs", Positive, STRATEGY_TTL_SECS_BOUNDS, u64, store.default_ttl_secs),
        int_field!("store.scan_page_size", Positive, SCAN_PAGE_SIZE_BOUNDS, usize, store.scan_page_size),
        int_field!("store.cleanup_interval_secs", Positive, STRATEGY_INTERVAL_SECS_BOUNDS, u64, store.cleanup_interval_secs),
        // 优化器
        int_field!("optimizer.min_batch_size", Positive, BATCH_SIZE_BOUNDS, usize, optimizer.min_batch_size),
        int_field!("optimizer.max_batch_size", Positive, BATCH_SIZE_BOUNDS, usize, optimizer.max_batch_size),
        float_field!("optimizer.memory_pressure_threshold", Positive, MEMORY_PRESSURE_THRESHOLD_BOUNDS, optimizer.memory_pressure_threshold),
        int_field!("optimizer.optimization_interval_secs", Positive, OPTIMIZATION_INTERVAL_SECS_BOUNDS, u64, optimizer.optimization_interval_secs),
        int_field!("optimizer.duration_history_size", Positive, DURATION_HISTORY_SIZE_BOUNDS, usize, optimizer.duration_history_size),
        NumericField {
            key: "optimizer.memory_limit_bytes",
            sign: Positive,
            bounds: MEMORY_LIMIT_BOUNDS,
            get: |c| c.optimizer.memory_limit_bytes.map(|v| v as f64),
            set: |c, v| c.optimizer.memory_limit_bytes = Some(v.round() as u64),
        },
    ]
}

fn bool_fields() -> Vec<BoolField> {
    vec![
        bool_field!("enable_background_update", enable_background_update),
        bool_field!("enable_data_change_detection", enable_data_change_detection),
        bool_field!("enable_metrics", enable_metrics),
        bool_field!("strategies.strong.enable_background_update", strategies.strong.enable_background_update),
        bool_field!("strategies.weak.enable_background_update", strategies.weak.enable_background_update),
        bool_field!("strategies.market_aware.enable_background_update", strategies.market_aware.enable_background_update),
        bool_field!("strategies.adaptive.enable_background_update", strategies.adaptive.enable_background_update),
    ]
}

/// 配置工厂
///
/// # 示例
///
/// ```rust
/// use quotecache::factory::ConfigFactory;
/// use std::collections::HashMap;
///
/// let mut overrides = HashMap::new();
/// overrides.insert("max_concurrent_updates".to_string(), "100".to_string());
/// let config = ConfigFactory::create_config(&overrides).unwrap();
/// assert_eq!(config.max_concurrent_updates, 32);
/// ```
pub struct ConfigFactory;

impl ConfigFactory {
    /// 合并默认值与覆盖项
    ///
    /// # 返回
    /// - `Ok(SmartCacheConfig)`: 校验通过的配置
    /// - `Err(CacheError::Configuration)`: 所有违规项
    pub fn create_config(
        overrides: &HashMap<String, String>,
    ) -> Result<SmartCacheConfig, CacheError> {
        let mut config = SmartCacheConfig::default();
        let mut violations = Vec::new();

        // 按键排序，保证警告与违规项顺序稳定
        let mut entries: Vec<(&String, &String)> = overrides.iter().collect();
        entries.sort();

        for (key, raw) in entries {
            Self::apply_override(&mut config, &normalize_key(key), raw.trim(), &mut violations);
        }

        Self::finish(config, violations)
    }

    /// 从环境变量读取覆盖项
    ///
    /// `PREFIX_MAX_CONCURRENT_UPDATES` 对应 `max_concurrent_updates`，
    /// 双下划线表示层级：`PREFIX_STRATEGIES__STRONG__TTL_SECS`。
    pub fn from_env(prefix: &str) -> Result<SmartCacheConfig, CacheError> {
        let marker = format!("{}_", prefix.to_uppercase());
        let overrides: HashMap<String, String> = std::env::vars()
            .filter_map(|(name, value)| {
                name.strip_prefix(&marker)
                    .map(|rest| (rest.replace("__", ".").to_lowercase(), value))
            })
            .collect();

        debug!("从环境变量读取到 {} 个配置覆盖项", overrides.len());
        Self::create_config(&overrides)
    }

    /// 从YAML字符串加载
    pub fn from_yaml_str(yaml: &str) -> Result<SmartCacheConfig, CacheError> {
        let config: SmartCacheConfig = serde_yaml::from_str(yaml)
            .map_err(|e| CacheError::Configuration(vec![format!("YAML解析失败: {}", e)]))?;
        Self::finalize(config)
    }

    /// 从TOML字符串加载
    pub fn from_toml_str(toml_str: &str) -> Result<SmartCacheConfig, CacheError> {
        let config: SmartCacheConfig = toml::from_str(toml_str)
            .map_err(|e| CacheError::Configuration(vec![format!("TOML解析失败: {}", e)]))?;
        Self::finalize(config)
    }

    /// 对手工构造的配置执行同样的裁剪与校验
    pub fn finalize(mut config: SmartCacheConfig) -> Result<SmartCacheConfig, CacheError> {
        let mut violations = Vec::new();

        for field in numeric_fields() {
            if let Some(value) = (field.get)(&config) {
                Self::apply_numeric(&mut config, &field, value, &mut violations);
            }
        }

        Self::finish(config, violations)
    }

    fn finish(
        config: SmartCacheConfig,
        mut violations: Vec<String>,
    ) -> Result<SmartCacheConfig, CacheError> {
        if let Err(errors) = config.validate() {
            violations.extend(errors);
        }

        if violations.is_empty() {
            info!(
                "缓存配置校验通过: max_concurrent_updates={}, hot_max_entries={}",
                config.max_concurrent_updates, config.store.hot_max_entries
            );
            Ok(config)
        } else {
            warn!("缓存配置存在 {} 个违规项", violations.len());
            Err(CacheError::Configuration(violations))
        }
    }

    fn apply_override(
        config: &mut SmartCacheConfig,
        key: &str,
        raw: &str,
        violations: &mut Vec<String>,
    ) {
        if key == "store.namespace" {
            if raw.is_empty() {
                warn!("配置项 store.namespace 为空，保留默认值");
            } else {
                config.store.namespace = raw.to_string();
            }
            return;
        }

        if let Some(field) = bool_fields().into_iter().find(|f| f.key == key) {
            match parse_bool(raw) {
                Some(value) => (field.set)(config, value),
                None => warn!("配置项 {} 的值 {:?} 不是布尔值，保留默认值", key, raw),
            }
            return;
        }

        if let Some(field) = numeric_fields().into_iter().find(|f| f.key == key) {
            match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => {
                    Self::apply_numeric(config, &field, value, violations)
                }
                _ => warn!("配置项 {} 的值 {:?} 无法解析，保留默认值", key, raw),
            }
            return;
        }

        warn!("忽略未知配置项: {}", key);
    }

    fn apply_numeric(
        config: &mut SmartCacheConfig,
        field: &NumericField,
        value: f64,
        violations: &mut Vec<String>,
    ) {
        match field.sign {
            Sign::Positive if value <= 0.0 => {
                violations.push(format!("{} 必须大于0，实际为 {}", field.key, value));
                return;
            }
            Sign::NonNegative if value < 0.0 => {
                violations.push(format!("{} 不能为负数，实际为 {}", field.key, value));
                return;
            }
            _ => {}
        }

        let (min, max) = field.bounds;
        let clamped = value.clamp(min, max);
        if clamped != value {
            warn!(
                "配置项 {} 的值 {} 超出范围 [{}, {}]，已裁剪为 {}",
                field.key, value, min, max, clamped
            );
        }
        (field.set)(config, clamped);
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
