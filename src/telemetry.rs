//! 指标与日志模块
//!
//! 缓存核心只通过 [`MetricsSink`] 发出事件，发送是同步且不会失败的，
//! 调用方路径上不会因为指标而阻塞或出错。
//!
//! - `NoopMetrics`：默认实现，丢弃所有事件
//! - `PrometheusMetrics`：`monitoring` 特性下基于prometheus的实现
//! - `init_logging`：`telemetry` 特性下初始化tracing订阅者

use serde::Serialize;
use std::time::Duration;

use crate::cache::CacheLevel;
use crate::strategy::CacheStrategy;

/// 后台刷新结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundOutcome {
    Scheduled,
    Completed,
    Failed,
    Skipped,
}

impl BackgroundOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundOutcome::Scheduled => "scheduled",
            BackgroundOutcome::Completed => "completed",
            BackgroundOutcome::Failed => "failed",
            BackgroundOutcome::Skipped => "skipped",
        }
    }
}

/// 缓存事件
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// 收到一个请求
    Request { strategy: CacheStrategy },
    /// 命中
    Hit {
        strategy: CacheStrategy,
        level: CacheLevel,
    },
    /// 未命中
    Miss { strategy: CacheStrategy },
    /// 调用了上游获取
    Fetch {
        strategy: CacheStrategy,
        duration: Duration,
        success: bool,
    },
    /// 并发请求合并到已有的获取
    DedupJoin,
    /// 后台刷新状态变化
    Background(BackgroundOutcome),
    /// 存储层错误
    StoreError { operation: &'static str },
    /// 热层淘汰
    Eviction,
    /// 检测到内存压力
    MemoryPressure,
    /// 自愈尝试
    SelfHeal { issue: String, success: bool },
}

/// 指标接收方
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &CacheEvent);
}

/// 丢弃所有事件
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: &CacheEvent) {}
}

#[cfg(feature = "monitoring")]
pub use prometheus_sink::PrometheusMetrics;

#[cfg(feature = "monitoring")]
mod prometheus_sink {
    use super::*;
    use prometheus::{
        Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
    };
    use tracing::error;

    /// Prometheus指标
    #[derive(Clone)]
    pub struct PrometheusMetrics {
        /// 请求数（按策略）
        pub requests_total: IntCounterVec,
        /// 命中数（按策略、层级）
        pub hits_total: IntCounterVec,
        /// 未命中数（按策略）
        pub misses_total: IntCounterVec,
        /// 上游获取数（按策略、结果）
        pub fetches_total: IntCounterVec,
        /// 上游获取耗时
        pub fetch_duration: Histogram,
        /// 单飞合并次数
        pub dedup_joins_total: IntCounter,
        /// 后台刷新（按结果）
        pub background_updates_total: IntCounterVec,
        /// 存储错误（按操作）
        pub store_errors_total: IntCounterVec,
        /// 热层淘汰次数
        pub evictions_total: IntCounter,
        /// 内存压力事件
        pub memory_pressure_events_total: IntCounter,
        /// 自愈尝试（按问题、结果）
        pub self_heal_attempts_total: IntCounterVec,
        registry: Registry,
    }

    impl PrometheusMetrics {
        /// 创建并注册所有指标
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let requests_total = IntCounterVec::new(
                Opts::new("quotecache_requests_total", "Total number of cache requests"),
                &["strategy"],
            )?;
            let hits_total = IntCounterVec::new(
                Opts::new("quotecache_hits_total", "Total number of cache hits"),
                &["strategy", "level"],
            )?;
            let misses_total = IntCounterVec::new(
                Opts::new("quotecache_misses_total", "Total number of cache misses"),
                &["strategy"],
            )?;
            let fetches_total = IntCounterVec::new(
                Opts::new("quotecache_fetches_total", "Total number of upstream fetches"),
                &["strategy", "result"],
            )?;
            let fetch_duration = Histogram::with_opts(
                HistogramOpts::new(
                    "quotecache_fetch_duration_seconds",
                    "Upstream fetch latency in seconds",
                )
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            )?;
            let dedup_joins_total = IntCounter::new(
                "quotecache_dedup_joins_total",
                "Requests that joined an in-flight fetch",
            )?;
            let background_updates_total = IntCounterVec::new(
                Opts::new(
                    "quotecache_background_updates_total",
                    "Background refresh lifecycle events",
                ),
                &["outcome"],
            )?;
            let store_errors_total = IntCounterVec::new(
                Opts::new("quotecache_store_errors_total", "Tiered store errors"),
                &["operation"],
            )?;
            let evictions_total =
                IntCounter::new("quotecache_evictions_total", "Hot tier LRU evictions")?;
            let memory_pressure_events_total = IntCounter::new(
                "quotecache_memory_pressure_events_total",
                "Detected memory pressure events",
            )?;
            let self_heal_attempts_total = IntCounterVec::new(
                Opts::new("quotecache_self_heal_attempts_total", "Self-healing attempts"),
                &["issue", "result"],
            )?;

            registry.register(Box::new(requests_total.clone()))?;
            registry.register(Box::new(hits_total.clone()))?;
            registry.register(Box::new(misses_total.clone()))?;
            registry.register(Box::new(fetches_total.clone()))?;
            registry.register(Box::new(fetch_duration.clone()))?;
            registry.register(Box::new(dedup_joins_total.clone()))?;
            registry.register(Box::new(background_updates_total.clone()))?;
            registry.register(Box::new(store_errors_total.clone()))?;
            registry.register(Box::new(evictions_total.clone()))?;
            registry.register(Box::new(memory_pressure_events_total.clone()))?;
            registry.register(Box::new(self_heal_attempts_total.clone()))?;

            Ok(Self {
                requests_total,
                hits_total,
                misses_total,
                fetches_total,
                fetch_duration,
                dedup_joins_total,
                background_updates_total,
                store_errors_total,
                evictions_total,
                memory_pressure_events_total,
                self_heal_attempts_total,
                registry,
            })
        }

        /// 导出Prometheus文本格式
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("指标编码失败: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }

        /// 获取注册表
        pub fn registry(&self) -> &Registry {
            &self.registry
        }
    }

    impl MetricsSink for PrometheusMetrics {
        fn record(&self, event: &CacheEvent) {
            match event {
                CacheEvent::Request { strategy } => {
                    self.requests_total.with_label_values(&[strategy.as_str()]).inc()
                }
                CacheEvent::Hit { strategy, level } => self
                    .hits_total
                    .with_label_values(&[strategy.as_str(), level.as_str()])
                    .inc(),
                CacheEvent::Miss { strategy } => {
                    self.misses_total.with_label_values(&[strategy.as_str()]).inc()
                }
                CacheEvent::Fetch {
                    strategy,
                    duration,
                    success,
                } => {
                    let result = if *success { "success" } else { "failure" };
                    self.fetches_total
                        .with_label_values(&[strategy.as_str(), result])
                        .inc();
                    self.fetch_duration.observe(duration.as_secs_f64());
                }
                CacheEvent::DedupJoin => self.dedup_joins_total.inc(),
                CacheEvent::Background(outcome) => self
                    .background_updates_total
                    .with_label_values(&[outcome.as_str()])
                    .inc(),
                CacheEvent::StoreError { operation } => {
                    self.store_errors_total.with_label_values(&[*operation]).inc()
                }
                CacheEvent::Eviction => self.evictions_total.inc(),
                CacheEvent::MemoryPressure => self.memory_pressure_events_total.inc(),
                CacheEvent::SelfHeal { issue, success } => {
                    let result = if *success { "success" } else { "failure" };
                    self.self_heal_attempts_total
                        .with_label_values(&[issue.as_str(), result])
                        .inc()
                }
            }
        }
    }
}

/// 初始化日志订阅者
///
/// 优先读取 `RUST_LOG`，否则使用 `default_filter`。重复调用不会报错。
#[cfg(feature = "telemetry")]
pub fn init_logging(default_filter: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("日志订阅者已初始化，跳过");
    }
    Ok(())
}
