//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Quotecache - Market-aware smart cache core
//!
//! Decides per request whether to serve market data from cache, how long it
//! stays fresh and when to refresh it in the background, so client latency
//! stays low while load on slow upstream providers stays bounded.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use quotecache::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`CacheOrchestrator`] - Strategy-driven facade (dedup fetch, refresh-ahead, batch)
//! - [`TieredCacheStore`] - In-process LRU hot tier over a persistent warm tier
//! - [`PerformanceOptimizer`] - Concurrency and batch-size recommendations
//! - [`ConfigFactory`] - Validated configuration from overrides, env, YAML or TOML
//! - [`CacheError`] - Error types
//!
//! ## Extensions (feature-gated)
//!
//! - Redis warm tier (requires `redis` feature)
//! - Prometheus metrics (requires `monitoring` feature)
//! - Logging subscriber setup (requires `telemetry` feature)
//!
//! # Examples
//!
//! ```rust
//! use quotecache::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = TieredCacheStore::new(StoreConfig::default(), Arc::new(MemoryWarmStore::new()));
//!
//!     store
//!         .set("quote:AAPL", &json!({"price": 190.5}), SetOptions::ttl(std::time::Duration::from_secs(5)))
//!         .await
//!         .unwrap();
//!     let hit = store.get("quote:AAPL").await.unwrap().unwrap();
//!     assert_eq!(hit.value["price"], 190.5);
//! }
//! ```
//!
//! # Features
//!
//! - **Five strategies**: no cache, strong / weak timeliness, market aware, adaptive
//! - **Single flight**: concurrent misses for a key share one upstream fetch
//! - **Refresh ahead**: background refresh ordered by market priority
//! - **Degradation**: hot-tier only operation while the warm tier is unreachable, with self-healing
//! - **Monitoring**: pluggable metrics sink with a Prometheus implementation

pub mod prelude;

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod factory;
pub mod market;
pub mod optimizer;
pub mod orchestrator;
#[cfg(feature = "redis")]
pub mod redis_storage;
pub mod storage;
pub mod strategy;
pub mod telemetry;

// 重新导出常用类型
pub use cache::{
    CacheEntry, CacheLevel, CacheLookup, CacheSnapshot, ClearOptions, ClearReport,
    DiagnosticIssue, ExportOptions, GetOrSetResult, HealingAttempt, HealthReport, HotTier,
    ImportOptions, ImportReport, IssueKind, KeyState, SetOptions, SnapshotEntry, StoreStats,
    TieredCacheStore,
};
pub use config::{OptimizerConfig, SmartCacheConfig, StoreConfig};
pub use error::{CacheError, StorageError};
pub use factory::ConfigFactory;
pub use market::{
    Market, MarketInferrer, MarketStatusProvider, MarketStatusReport, MarketStatusSnapshot,
    StaticMarketStatusProvider, SuffixMarketInferrer, TradingStatus,
};
pub use optimizer::{
    PerformanceOptimizer, PerformanceSnapshot, PressureRelief, ResourceProbe, ResourceSample,
    SystemResourceProbe,
};
pub use orchestrator::{
    fetch_fn, BackgroundTask, BatchOptions, CacheOrchestrator, CacheOrchestratorBuilder,
    CachePerformanceAnalysis, CacheRequest, CacheResult, FetchFn, KeyReport,
    OrchestratorStats, ResultMetadata, WarmupResult,
};
#[cfg(feature = "redis")]
pub use redis_storage::{RedisConfig, RedisStorage, RetryStats};
pub use storage::{KeyTtl, MemoryWarmStore, StoredValue, WarmStore};
pub use strategy::{
    AdaptiveConfig, CacheStrategy, MarketAwareConfig, StrategyConfig, StrategySettings,
    TimelinessConfig,
};
#[cfg(feature = "telemetry")]
pub use telemetry::init_logging;
#[cfg(feature = "monitoring")]
pub use telemetry::PrometheusMetrics;
pub use telemetry::{BackgroundOutcome, CacheEvent, MetricsSink, NoopMetrics};
