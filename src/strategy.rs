//! 缓存策略定义
//!
//! 策略集合是封闭的：五种策略对应 `StrategyConfig` 的五个变体，
//! 编排器通过穷尽匹配分发，新增策略时编译器会指出所有需要处理的位置。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::constants::*;

/// 缓存策略名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStrategy {
    /// 不缓存，每次直接获取
    NoCache,
    /// 强时效：行情快照、盘口
    StrongTimeliness,
    /// 弱时效：基础资料、财务数据
    WeakTimeliness,
    /// 按交易时段区分TTL
    MarketAware,
    /// 按市场状态与数据变化频率自适应
    Adaptive,
}

impl CacheStrategy {
    /// 所有策略
    pub const ALL: [CacheStrategy; 5] = [
        CacheStrategy::NoCache,
        CacheStrategy::StrongTimeliness,
        CacheStrategy::WeakTimeliness,
        CacheStrategy::MarketAware,
        CacheStrategy::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::NoCache => "NO_CACHE",
            CacheStrategy::StrongTimeliness => "STRONG_TIMELINESS",
            CacheStrategy::WeakTimeliness => "WEAK_TIMELINESS",
            CacheStrategy::MarketAware => "MARKET_AWARE",
            CacheStrategy::Adaptive => "ADAPTIVE",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 强/弱时效策略参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinessConfig {
    /// 缓存TTL（秒）
    pub ttl_secs: u64,
    /// 是否启用后台更新
    pub enable_background_update: bool,
    /// 剩余TTL占比低于该值时触发提前刷新
    pub update_threshold_ratio: f64,
    /// 刷新间隔（秒），不得小于TTL
    pub refresh_interval_secs: u64,
}

impl TimelinessConfig {
    /// 强时效默认值
    pub fn strong() -> Self {
        Self {
            ttl_secs: DEFAULT_STRONG_TTL_SECS,
            enable_background_update: true,
            update_threshold_ratio: DEFAULT_STRONG_UPDATE_RATIO,
            refresh_interval_secs: DEFAULT_STRONG_REFRESH_INTERVAL_SECS,
        }
    }

    /// 弱时效默认值
    pub fn weak() -> Self {
        Self {
            ttl_secs: DEFAULT_WEAK_TTL_SECS,
            enable_background_update: true,
            update_threshold_ratio: DEFAULT_WEAK_UPDATE_RATIO,
            refresh_interval_secs: DEFAULT_WEAK_REFRESH_INTERVAL_SECS,
        }
    }

    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn enable_background_update(mut self, enable: bool) -> Self {
        self.enable_background_update = enable;
        self
    }

    pub fn update_threshold_ratio(mut self, ratio: f64) -> Self {
        self.update_threshold_ratio = ratio;
        self
    }

    pub fn refresh_interval_secs(mut self, secs: u64) -> Self {
        self.refresh_interval_secs = secs;
        self
    }

    fn validate(&self, path: &str, errors: &mut Vec<String>) {
        if self.ttl_secs == 0 {
            errors.push(format!("{}.ttl_secs 必须大于0", path));
        }
        check_ratio(path, "update_threshold_ratio", self.update_threshold_ratio, errors);
        if self.refresh_interval_secs < self.ttl_secs {
            errors.push(format!(
                "{}.refresh_interval_secs ({}) 不能小于 ttl_secs ({})",
                path, self.refresh_interval_secs, self.ttl_secs
            ));
        }
    }
}

/// 市场感知策略参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketAwareConfig {
    /// 开市TTL（秒）
    pub open_market_ttl_secs: u64,
    /// 闭市TTL（秒）
    pub closed_market_ttl_secs: u64,
    /// 开市提前刷新比例
    pub open_market_update_ratio: f64,
    /// 闭市提前刷新比例
    pub closed_market_update_ratio: f64,
    /// 市场状态检查间隔（秒）
    pub market_status_check_interval_secs: u64,
    /// 是否启用后台更新
    pub enable_background_update: bool,
}

impl Default for MarketAwareConfig {
    fn default() -> Self {
        Self {
            open_market_ttl_secs: DEFAULT_OPEN_MARKET_TTL_SECS,
            closed_market_ttl_secs: DEFAULT_CLOSED_MARKET_TTL_SECS,
            open_market_update_ratio: DEFAULT_OPEN_MARKET_UPDATE_RATIO,
            closed_market_update_ratio: DEFAULT_CLOSED_MARKET_UPDATE_RATIO,
            market_status_check_interval_secs: DEFAULT_MARKET_STATUS_CHECK_INTERVAL_SECS,
            enable_background_update: true,
        }
    }
}

impl MarketAwareConfig {
    pub fn open_market_ttl_secs(mut self, secs: u64) -> Self {
        self.open_market_ttl_secs = secs;
        self
    }

    pub fn closed_market_ttl_secs(mut self, secs: u64) -> Self {
        self.closed_market_ttl_secs = secs;
        self
    }

    pub fn enable_background_update(mut self, enable: bool) -> Self {
        self.enable_background_update = enable;
        self
    }

    fn validate(&self, path: &str, errors: &mut Vec<String>) {
        if self.open_market_ttl_secs == 0 {
            errors.push(format!("{}.open_market_ttl_secs 必须大于0", path));
        }
        if self.closed_market_ttl_secs == 0 {
            errors.push(format!("{}.closed_market_ttl_secs 必须大于0", path));
        }
        if self.market_status_check_interval_secs == 0 {
            errors.push(format!("{}.market_status_check_interval_secs 必须大于0", path));
        }
        check_ratio(path, "open_market_update_ratio", self.open_market_update_ratio, errors);
        check_ratio(path, "closed_market_update_ratio", self.closed_market_update_ratio, errors);
    }
}

/// 自适应策略参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// 基准TTL（秒）
    pub base_ttl_secs: u64,
    /// TTL下限（秒）
    pub min_ttl_secs: u64,
    /// TTL上限（秒）
    pub max_ttl_secs: u64,
    /// 调整系数（>= 1）
    pub adaptation_factor: f64,
    /// 变化检测窗口（秒）
    pub change_detection_window_secs: u64,
    /// 是否启用后台更新
    pub enable_background_update: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: DEFAULT_ADAPTIVE_BASE_TTL_SECS,
            min_ttl_secs: DEFAULT_ADAPTIVE_MIN_TTL_SECS,
            max_ttl_secs: DEFAULT_ADAPTIVE_MAX_TTL_SECS,
            adaptation_factor: DEFAULT_ADAPTATION_FACTOR,
            change_detection_window_secs: DEFAULT_CHANGE_DETECTION_WINDOW_SECS,
            enable_background_update: true,
        }
    }
}

impl AdaptiveConfig {
    pub fn base_ttl_secs(mut self, secs: u64) -> Self {
        self.base_ttl_secs = secs;
        self
    }

    pub fn ttl_range_secs(mut self, min: u64, max: u64) -> Self {
        self.min_ttl_secs = min;
        self.max_ttl_secs = max;
        self
    }

    pub fn adaptation_factor(mut self, factor: f64) -> Self {
        self.adaptation_factor = factor;
        self
    }

    /// 把秒数限制在 `[min_ttl, max_ttl]`
    pub fn clamp_ttl_secs(&self, secs: f64) -> u64 {
        let clamped = secs.clamp(self.min_ttl_secs as f64, self.max_ttl_secs as f64);
        (clamped.round() as u64).max(1)
    }

    fn validate(&self, path: &str, errors: &mut Vec<String>) {
        if self.min_ttl_secs == 0 {
            errors.push(format!("{}.min_ttl_secs 必须大于0", path));
        }
        if self.min_ttl_secs >= self.max_ttl_secs {
            errors.push(format!(
                "{}.min_ttl_secs ({}) 必须小于 max_ttl_secs ({})",
                path, self.min_ttl_secs, self.max_ttl_secs
            ));
        }
        if self.base_ttl_secs < self.min_ttl_secs || self.base_ttl_secs > self.max_ttl_secs {
            errors.push(format!(
                "{}.base_ttl_secs ({}) 必须位于 [{}, {}]",
                path, self.base_ttl_secs, self.min_ttl_secs, self.max_ttl_secs
            ));
        }
        if !self.adaptation_factor.is_finite() || self.adaptation_factor < 1.0 {
            errors.push(format!("{}.adaptation_factor 必须 >= 1", path));
        }
        if self.change_detection_window_secs == 0 {
            errors.push(format!("{}.change_detection_window_secs 必须大于0", path));
        }
    }
}

/// 已解析的策略配置（封闭联合体）
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyConfig {
    NoCache,
    StrongTimeliness(TimelinessConfig),
    WeakTimeliness(TimelinessConfig),
    MarketAware(MarketAwareConfig),
    Adaptive(AdaptiveConfig),
}

impl StrategyConfig {
    /// 对应的策略名称
    pub fn strategy(&self) -> CacheStrategy {
        match self {
            StrategyConfig::NoCache => CacheStrategy::NoCache,
            StrategyConfig::StrongTimeliness(_) => CacheStrategy::StrongTimeliness,
            StrategyConfig::WeakTimeliness(_) => CacheStrategy::WeakTimeliness,
            StrategyConfig::MarketAware(_) => CacheStrategy::MarketAware,
            StrategyConfig::Adaptive(_) => CacheStrategy::Adaptive,
        }
    }

    /// 该策略是否允许后台刷新
    pub fn background_update_enabled(&self) -> bool {
        match self {
            StrategyConfig::NoCache => false,
            StrategyConfig::StrongTimeliness(c) | StrategyConfig::WeakTimeliness(c) => {
                c.enable_background_update
            }
            StrategyConfig::MarketAware(c) => c.enable_background_update,
            StrategyConfig::Adaptive(c) => c.enable_background_update,
        }
    }

    /// 按市场状态给出的名义TTL（自适应策略返回基准TTL）
    pub fn nominal_ttl(&self, market_open: bool) -> Option<Duration> {
        let secs = match self {
            StrategyConfig::NoCache => return None,
            StrategyConfig::StrongTimeliness(c) | StrategyConfig::WeakTimeliness(c) => c.ttl_secs,
            StrategyConfig::MarketAware(c) => {
                if market_open {
                    c.open_market_ttl_secs
                } else {
                    c.closed_market_ttl_secs
                }
            }
            StrategyConfig::Adaptive(c) => c.base_ttl_secs,
        };
        Some(Duration::from_secs(secs))
    }

    /// 提前刷新比例
    pub fn update_ratio(&self, market_open: bool) -> f64 {
        match self {
            StrategyConfig::NoCache => 0.0,
            StrategyConfig::StrongTimeliness(c) | StrategyConfig::WeakTimeliness(c) => {
                c.update_threshold_ratio
            }
            StrategyConfig::MarketAware(c) => {
                if market_open {
                    c.open_market_update_ratio
                } else {
                    c.closed_market_update_ratio
                }
            }
            // 自适应策略沿用弱时效的保守比例
            StrategyConfig::Adaptive(_) => DEFAULT_WEAK_UPDATE_RATIO,
        }
    }
}

/// 全部策略的参数集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub strong: TimelinessConfig,
    pub weak: TimelinessConfig,
    pub market_aware: MarketAwareConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            strong: TimelinessConfig::strong(),
            weak: TimelinessConfig::weak(),
            market_aware: MarketAwareConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl StrategySettings {
    /// 取出某个策略的配置
    pub fn resolve(&self, strategy: CacheStrategy) -> StrategyConfig {
        match strategy {
            CacheStrategy::NoCache => StrategyConfig::NoCache,
            CacheStrategy::StrongTimeliness => StrategyConfig::StrongTimeliness(self.strong.clone()),
            CacheStrategy::WeakTimeliness => StrategyConfig::WeakTimeliness(self.weak.clone()),
            CacheStrategy::MarketAware => StrategyConfig::MarketAware(self.market_aware.clone()),
            CacheStrategy::Adaptive => StrategyConfig::Adaptive(self.adaptive.clone()),
        }
    }

    /// 收集所有违规项
    pub fn validate(&self, errors: &mut Vec<String>) {
        self.strong.validate("strategies.strong", errors);
        self.weak.validate("strategies.weak", errors);
        self.market_aware.validate("strategies.market_aware", errors);
        self.adaptive.validate("strategies.adaptive", errors);
    }
}

fn check_ratio(path: &str, field: &str, value: f64, errors: &mut Vec<String>) {
    if !(RATIO_BOUNDS.0..=RATIO_BOUNDS.1).contains(&value) {
        errors.push(format!("{}.{} ({}) 必须位于 [0, 1]", path, field, value));
    }
}
