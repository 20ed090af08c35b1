//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 缓存编排器
//!
//! 按请求的策略决定是否使用缓存、数据的新鲜期以及何时在后台刷新。
//! 同一个键的并发未命中只触发一次上游获取。
//!
//! # 示例
//!
//! ```rust,no_run
//! use quotecache::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let orchestrator = std::sync::Arc::new(
//!         CacheOrchestrator::builder(SmartCacheConfig::default()).build()?,
//!     );
//!     orchestrator.init().await?;
//!
//!     let request = CacheRequest::new(
//!         "quote:AAPL",
//!         CacheStrategy::StrongTimeliness,
//!         fetch_fn(|| async { Ok(json!({"symbol": "AAPL", "price": 190.5})) }),
//!     )
//!     .symbols(["AAPL"]);
//!
//!     let result = orchestrator.get_data_with_smart_cache(request).await;
//!     assert!(result.is_ok());
//!
//!     orchestrator.destroy().await;
//!     Ok(())
//! }
//! ```

mod adaptive;
mod analysis;
mod background;
pub mod request;
mod single_flight;

pub use analysis::{BatchOptions, CachePerformanceAnalysis, KeyReport, WarmupResult};
pub use background::BackgroundTask;
pub use request::{fetch_fn, CacheRequest, CacheResult, FetchFn, ResultMetadata};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheLevel, CacheLookup, SetOptions, StoreStats, TieredCacheStore};
use crate::config::SmartCacheConfig;
use crate::constants::FALLBACK_MARKET_STATUS_CONFIDENCE;
use crate::error::CacheError;
use crate::market::{
    update_priority, Market, MarketInferrer, MarketStatusProvider, MarketStatusSnapshot,
    StaticMarketStatusProvider, SuffixMarketInferrer, TradingStatus,
};
use crate::optimizer::{PerformanceOptimizer, PerformanceSnapshot, ResourceProbe};
use crate::storage::{MemoryWarmStore, WarmStore};
use crate::strategy::{AdaptiveConfig, StrategyConfig};
use crate::telemetry::{CacheEvent, MetricsSink, NoopMetrics};

use adaptive::{adaptive_ttl, ChangeActivity, ChangeTracker};
use background::{BackgroundUpdater, ScheduleDecision};
use single_flight::SingleFlight;

/// 编排器统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub dedup_joins: u64,
    /// 存储读取失败后直接获取的次数
    pub fallback_fetches: u64,
    pub background_scheduled: u64,
    pub background_completed: u64,
    pub background_failed: u64,
    pub background_skipped: u64,
    pub background_pending: usize,
    pub in_flight_fetches: usize,
    pub store: StoreStats,
    pub performance: PerformanceSnapshot,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    dedup_joins: AtomicU64,
    fallback_fetches: AtomicU64,
}

/// 一次请求的TTL与刷新参数
#[derive(Debug, Clone)]
struct TtlPlan {
    ttl: Duration,
    ratio: f64,
    market_status: Option<Vec<MarketStatusSnapshot>>,
    /// 自适应策略在写入前根据本次获取结果重新计算TTL
    adaptive: Option<(AdaptiveConfig, bool)>,
}

#[derive(Debug, Clone)]
struct CachedStatus {
    snapshot: MarketStatusSnapshot,
    cached_at: Instant,
}

/// 编排器构建器
pub struct CacheOrchestratorBuilder {
    config: SmartCacheConfig,
    store: Option<Arc<TieredCacheStore>>,
    warm: Option<Arc<dyn WarmStore>>,
    provider: Option<Arc<dyn MarketStatusProvider>>,
    inferrer: Option<Arc<dyn MarketInferrer>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl CacheOrchestratorBuilder {
    pub fn new(config: SmartCacheConfig) -> Self {
        Self {
            config,
            store: None,
            warm: None,
            provider: None,
            inferrer: None,
            metrics: None,
            probe: None,
        }
    }

    /// 使用已创建的分层存储
    pub fn store(mut self, store: Arc<TieredCacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 温层实现，未设置存储时使用（默认为内存温层）
    pub fn warm_store(mut self, warm: Arc<dyn WarmStore>) -> Self {
        self.warm = Some(warm);
        self
    }

    pub fn market_status_provider(mut self, provider: Arc<dyn MarketStatusProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn market_inferrer(mut self, inferrer: Arc<dyn MarketInferrer>) -> Self {
        self.inferrer = Some(inferrer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 校验配置并创建编排器
    pub fn build(self) -> Result<CacheOrchestrator, CacheError> {
        self.config.validate().map_err(CacheError::Configuration)?;
        let config = self.config;

        let metrics: Arc<dyn MetricsSink> = match self.metrics {
            Some(metrics) if config.enable_metrics => metrics,
            _ => Arc::new(NoopMetrics),
        };

        let store = match self.store {
            Some(store) => store,
            None => {
                let warm = self
                    .warm
                    .unwrap_or_else(|| Arc::new(MemoryWarmStore::new()));
                Arc::new(
                    TieredCacheStore::new(config.store.clone(), warm).with_metrics(metrics.clone()),
                )
            }
        };

        let mut optimizer =
            PerformanceOptimizer::new(config.optimizer.clone(), config.max_concurrent_updates)
                .with_relief(store.clone())
                .with_metrics(metrics.clone());
        if let Some(probe) = self.probe {
            optimizer = optimizer.with_probe(probe);
        }
        let optimizer = Arc::new(optimizer);

        let flights = Arc::new(SingleFlight::new());
        let updater = Arc::new(BackgroundUpdater::new(
            store.clone(),
            flights.clone(),
            optimizer.clone(),
            metrics.clone(),
            config.fetch_timeout_duration(),
            config.min_update_interval_duration(),
        ));

        info!(
            "创建缓存编排器: max_concurrent_updates={}, background_update={}",
            config.max_concurrent_updates, config.enable_background_update
        );

        Ok(CacheOrchestrator {
            store,
            provider: self
                .provider
                .unwrap_or_else(|| Arc::new(StaticMarketStatusProvider::new())),
            inferrer: self.inferrer.unwrap_or_else(|| Arc::new(SuffixMarketInferrer)),
            metrics,
            optimizer,
            flights,
            updater,
            market_cache: DashMap::new(),
            changes: ChangeTracker::new(),
            counters: Counters::default(),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
            config,
        })
    }
}

/// 缓存编排器
pub struct CacheOrchestrator {
    config: SmartCacheConfig,
    store: Arc<TieredCacheStore>,
    provider: Arc<dyn MarketStatusProvider>,
    inferrer: Arc<dyn MarketInferrer>,
    metrics: Arc<dyn MetricsSink>,
    optimizer: Arc<PerformanceOptimizer>,
    flights: Arc<SingleFlight>,
    updater: Arc<BackgroundUpdater>,
    market_cache: DashMap<Market, CachedStatus>,
    changes: ChangeTracker,
    counters: Counters,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheOrchestrator {
    pub fn builder(config: SmartCacheConfig) -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder::new(config)
    }

    /// 初始化存储并启动后台循环
    pub async fn init(self: &Arc<Self>) -> Result<(), CacheError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CacheError::Shutdown);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.store.init().await {
            self.initialized.store(false, Ordering::Release);
            return Err(e);
        }

        self.store.start_maintenance();
        self.optimizer
            .start_optimization(self.config.max_concurrent_updates);
        self.updater.start();

        let mut handles = self.task_handles.lock();
        handles.push(self.spawn_health_loop());
        handles.push(self.spawn_sweeper());

        info!("缓存编排器已初始化");
        Ok(())
    }

    /// 停止接收新请求，等待后台任务，释放资源
    pub async fn destroy(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("缓存编排器开始关闭");

        self.updater
            .shutdown(self.config.graceful_shutdown_duration())
            .await;
        for handle in self.task_handles.lock().drain(..) {
            handle.abort();
        }
        self.optimizer.stop_optimization();
        self.store.shutdown().await;
        self.market_cache.clear();

        info!("缓存编排器已关闭");
    }

    /// 按策略获取数据
    #[instrument(skip(self, request), fields(key = %request.cache_key, strategy = %request.strategy))]
    pub async fn get_data_with_smart_cache(&self, request: CacheRequest) -> CacheResult {
        self.count_request(&request);
        if let Some(rejected) = self.reject(&request) {
            return rejected;
        }

        let config = self.config.strategies.resolve(request.strategy);
        let statuses = if needs_market_status(&config) {
            self.get_market_status_for_symbols(&request.symbols).await
        } else {
            HashMap::new()
        };

        match self.plan(&request, &config, &statuses) {
            None => self.fetch_direct(&request).await,
            Some(plan) => match self.store.get(&request.cache_key).await {
                Ok(Some(hit)) => self.serve_hit(&request, &config, &plan, hit),
                Ok(None) => {
                    self.count_miss(&request);
                    self.fetch_and_store(&request, plan, None).await
                }
                Err(e) => {
                    self.counters.fallback_fetches.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "读取缓存失败，直接获取: key={}, error={}",
                        request.cache_key, e
                    );
                    self.fetch_and_store(&request, plan, Some(e)).await
                }
            },
        }
    }

    /// 批量获取，结果顺序与输入一致
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn batch_get_data_with_smart_cache(
        &self,
        requests: Vec<CacheRequest>,
    ) -> Vec<CacheResult> {
        let mut slots: Vec<Option<CacheResult>> = vec![None; requests.len()];

        let market_symbols: Vec<String> = requests
            .iter()
            .filter(|r| needs_market_status(&self.config.strategies.resolve(r.strategy)))
            .flat_map(|r| r.symbols.iter().cloned())
            .collect();
        let statuses = if market_symbols.is_empty() {
            HashMap::new()
        } else {
            self.get_market_status_for_symbols(&market_symbols).await
        };

        let mut direct = Vec::new();
        let mut cacheable = Vec::new();
        for (idx, request) in requests.iter().enumerate() {
            self.count_request(request);
            if let Some(rejected) = self.reject(request) {
                slots[idx] = Some(rejected);
                continue;
            }
            let config = self.config.strategies.resolve(request.strategy);
            match self.plan(request, &config, &statuses) {
                None => direct.push(idx),
                Some(plan) => cacheable.push((idx, config, plan)),
            }
        }

        let keys: Vec<String> = cacheable
            .iter()
            .map(|(idx, _, _)| requests[*idx].cache_key.clone())
            .collect();
        let lookups = if keys.is_empty() {
            Vec::new()
        } else {
            self.store.batch_get(&keys).await
        };

        let mut misses = Vec::new();
        for ((idx, config, plan), lookup) in cacheable.into_iter().zip(lookups) {
            match lookup {
                Some(hit) => slots[idx] = Some(self.serve_hit(&requests[idx], &config, &plan, hit)),
                None => {
                    self.count_miss(&requests[idx]);
                    misses.push((idx, plan));
                }
            }
        }
        debug!(
            "批量请求: total={}, direct={}, misses={}",
            requests.len(),
            direct.len(),
            misses.len()
        );

        let requests = &requests;
        let direct_fetches = join_all(
            direct
                .into_iter()
                .map(|idx| async move { (idx, self.fetch_direct(&requests[idx]).await) }),
        );
        let miss_fetches = join_all(misses.into_iter().map(|(idx, plan)| async move {
            (idx, self.fetch_and_store(&requests[idx], plan, None).await)
        }));
        let (direct_results, miss_results) = futures::join!(direct_fetches, miss_fetches);
        for (idx, result) in direct_results.into_iter().chain(miss_results) {
            slots[idx] = Some(result);
        }

        slots
            .into_iter()
            .zip(requests.iter())
            .map(|(slot, request)| {
                slot.unwrap_or_else(|| {
                    CacheResult::failure(
                        request,
                        CacheError::Validation("请求未被处理".to_string()),
                        CacheLevel::Bypass,
                    )
                })
            })
            .collect()
    }

    /// 安排后台刷新，返回是否新注册了任务
    ///
    /// 后台更新关闭、正在关闭、该键已有任务或距上次刷新不足
    /// `min_update_interval` 时不做任何事。
    pub fn schedule_background_update(
        &self,
        cache_key: &str,
        symbols: &[String],
        fetch: FetchFn,
        ttl: Option<Duration>,
    ) -> bool {
        if !self.config.enable_background_update || self.shutting_down.load(Ordering::Acquire) {
            return false;
        }

        let task = BackgroundTask {
            id: Uuid::new_v4(),
            cache_key: cache_key.to_string(),
            symbols: symbols.to_vec(),
            priority: self.calculate_update_priority(symbols),
            fetch,
            ttl,
            scheduled_at: Utc::now(),
        };
        self.updater.schedule(task) == ScheduleDecision::Scheduled
    }

    /// 后台刷新优先级：主要市场与开市中的市场权重更高
    pub fn calculate_update_priority(&self, symbols: &[String]) -> u32 {
        update_priority(
            symbols.iter().map(String::as_str),
            self.inferrer.as_ref(),
            &|market| self.cached_market_open(market),
        )
    }

    /// 查询代码所属市场的状态，每个市场查询一次并短暂缓存
    pub async fn get_market_status_for_symbols(
        &self,
        symbols: &[String],
    ) -> HashMap<Market, MarketStatusSnapshot> {
        let mut markets: Vec<Market> = symbols
            .iter()
            .map(|s| self.inferrer.infer_market(s))
            .collect();
        markets.sort();
        markets.dedup();

        join_all(
            markets
                .into_iter()
                .map(|market| async move { (market, self.market_status(market).await) }),
        )
        .await
        .into_iter()
        .collect()
    }

    /// 删除键并清除相关跟踪状态
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let existed = self.store.delete(key).await?;
        self.changes.forget(key);
        self.updater.forget_refresh(key);
        debug!("缓存失效: key={}, existed={}", key, existed);
        Ok(existed)
    }

    pub fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        let bg = &self.updater.counters;
        OrchestratorStats {
            requests: c.requests.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            dedup_joins: c.dedup_joins.load(Ordering::Relaxed),
            fallback_fetches: c.fallback_fetches.load(Ordering::Relaxed),
            background_scheduled: bg.scheduled.load(Ordering::Relaxed),
            background_completed: bg.completed.load(Ordering::Relaxed),
            background_failed: bg.failed.load(Ordering::Relaxed),
            background_skipped: bg.skipped.load(Ordering::Relaxed),
            background_pending: self.updater.pending_count(),
            in_flight_fetches: self.flights.in_flight(),
            store: self.store.stats(),
            performance: self.optimizer.snapshot(),
        }
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        &self.store
    }

    pub fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }

    pub fn config(&self) -> &SmartCacheConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// 是否有该键的后台任务在排队或执行
    pub fn is_background_update_pending(&self, key: &str) -> bool {
        self.updater.is_pending(key)
    }

    fn count_request(&self, request: &CacheRequest) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(&CacheEvent::Request {
            strategy: request.strategy,
        });
    }

    fn count_miss(&self, request: &CacheRequest) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(&CacheEvent::Miss {
            strategy: request.strategy,
        });
    }

    fn reject(&self, request: &CacheRequest) -> Option<CacheResult> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Some(CacheResult::failure(
                request,
                CacheError::Shutdown,
                CacheLevel::Bypass,
            ));
        }
        if request.cache_key.trim().is_empty() {
            return Some(CacheResult::failure(
                request,
                CacheError::Validation("cache_key 不能为空".to_string()),
                CacheLevel::Bypass,
            ));
        }
        None
    }

    /// 策略分发：NoCache 返回 None
    fn plan(
        &self,
        request: &CacheRequest,
        config: &StrategyConfig,
        statuses: &HashMap<Market, MarketStatusSnapshot>,
    ) -> Option<TtlPlan> {
        let (open, market_status) = if needs_market_status(config) {
            let (open, snapshots) = self.market_session(&request.symbols, statuses);
            (open, Some(snapshots))
        } else {
            (true, None)
        };

        let mut plan = TtlPlan {
            ttl: config.nominal_ttl(open)?,
            ratio: config.update_ratio(open),
            market_status,
            adaptive: None,
        };
        if let StrategyConfig::Adaptive(c) = config {
            let activity = self.change_activity(&request.cache_key, c);
            plan.ttl = adaptive_ttl(c, open, activity);
            plan.adaptive = Some((c.clone(), open));
        }

        if let Some(ttl) = request.ttl_override {
            plan.ttl = ttl;
            plan.adaptive = None;
        }
        Some(plan)
    }

    /// 没有代码时按开市处理
    fn market_session(
        &self,
        symbols: &[String],
        statuses: &HashMap<Market, MarketStatusSnapshot>,
    ) -> (bool, Vec<MarketStatusSnapshot>) {
        if symbols.is_empty() {
            return (true, Vec::new());
        }
        let mut markets: Vec<Market> = symbols
            .iter()
            .map(|s| self.inferrer.infer_market(s))
            .collect();
        markets.sort();
        markets.dedup();

        let snapshots: Vec<MarketStatusSnapshot> = markets
            .iter()
            .filter_map(|m| statuses.get(m).cloned())
            .collect();
        let open = snapshots.iter().any(MarketStatusSnapshot::is_open);
        (open, snapshots)
    }

    fn change_activity(&self, key: &str, config: &AdaptiveConfig) -> ChangeActivity {
        if self.config.enable_data_change_detection {
            self.changes
                .activity(key, Duration::from_secs(config.change_detection_window_secs))
        } else {
            ChangeActivity::Unknown
        }
    }

    fn serve_hit(
        &self,
        request: &CacheRequest,
        config: &StrategyConfig,
        plan: &TtlPlan,
        hit: CacheLookup,
    ) -> CacheResult {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(&CacheEvent::Hit {
            strategy: request.strategy,
            level: hit.level,
        });

        let refresh_due =
            hit.ttl_remaining.as_secs_f64() <= plan.ttl.as_secs_f64() * plan.ratio;
        let scheduled = refresh_due
            && config.background_update_enabled()
            && self.schedule_background_update(
                &request.cache_key,
                &request.symbols,
                request.fetch.clone(),
                Some(plan.ttl),
            );

        let mut metadata = ResultMetadata::new(hit.level);
        metadata.ttl_remaining = Some(hit.ttl_remaining);
        metadata.market_status = plan.market_status.clone();
        metadata.background_update_scheduled = scheduled;

        CacheResult {
            data: Some(hit.value),
            hit: true,
            strategy: request.strategy,
            storage_key: request.cache_key.clone(),
            error: None,
            metadata,
        }
    }

    /// 合并获取并写入存储；`prior_error` 为此前读取存储时的错误
    async fn fetch_and_store(
        &self,
        request: &CacheRequest,
        plan: TtlPlan,
        prior_error: Option<CacheError>,
    ) -> CacheResult {
        let started = Instant::now();
        let fetch = request.fetch.clone();
        let planned = &plan;
        let outcome = self
            .flights
            .run(
                &request.cache_key,
                self.config.fetch_timeout_duration(),
                move || fetch(),
                |value| async move {
                    let ttl = self.write_ttl(&request.cache_key, planned, &value);
                    let written = self
                        .store
                        .set(&request.cache_key, &value, SetOptions::ttl(ttl))
                        .await;
                    (ttl, written)
                },
            )
            .await;
        let elapsed = started.elapsed();

        let mut metadata = ResultMetadata::new(CacheLevel::Upstream);
        metadata.market_status = plan.market_status.clone();
        metadata.fetch_duration = Some(elapsed);
        metadata.deduplicated = outcome.joined;

        if outcome.joined {
            self.counters.dedup_joins.fetch_add(1, Ordering::Relaxed);
            self.metrics.record(&CacheEvent::DedupJoin);
        } else {
            self.record_fetch(request, elapsed, outcome.result.is_ok());
        }

        let value = match outcome.result {
            Ok(value) => value,
            Err(e) => {
                warn!("获取失败: key={}, error={}", request.cache_key, e);
                return CacheResult {
                    data: None,
                    hit: false,
                    strategy: request.strategy,
                    storage_key: request.cache_key.clone(),
                    error: Some(e),
                    metadata,
                };
            }
        };

        let mut error = prior_error;
        let ttl = match outcome.committed {
            Some((ttl, written)) => {
                if let Err(e) = written {
                    warn!("写入缓存失败: key={}, error={}", request.cache_key, e);
                    error.get_or_insert(e);
                }
                ttl
            }
            None => plan.ttl,
        };
        metadata.ttl_remaining = Some(self.store.clamp_ttl(ttl));

        CacheResult {
            data: Some(value),
            hit: false,
            strategy: request.strategy,
            storage_key: request.cache_key.clone(),
            error,
            metadata,
        }
    }

    /// 不经过缓存直接获取
    async fn fetch_direct(&self, request: &CacheRequest) -> CacheResult {
        let started = Instant::now();
        let timeout = self.config.fetch_timeout_duration();
        let result = match tokio::time::timeout(timeout, (request.fetch)()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::upstream(&e)),
            Err(_) => Err(CacheError::Timeout(format!(
                "获取超时: key={}, timeout={:?}",
                request.cache_key, timeout
            ))),
        };
        let elapsed = started.elapsed();
        self.record_fetch(request, elapsed, result.is_ok());

        let mut metadata = ResultMetadata::new(CacheLevel::Bypass);
        metadata.fetch_duration = Some(elapsed);
        let (data, error) = match result {
            Ok(value) => (Some(value), None),
            Err(e) => {
                warn!("直接获取失败: key={}, error={}", request.cache_key, e);
                (None, Some(e))
            }
        };

        CacheResult {
            data,
            hit: false,
            strategy: request.strategy,
            storage_key: request.cache_key.clone(),
            error,
            metadata,
        }
    }

    fn record_fetch(&self, request: &CacheRequest, duration: Duration, success: bool) {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record(&CacheEvent::Fetch {
            strategy: request.strategy,
            duration,
            success,
        });
    }

    /// 自适应策略先记录本次结果，再按最新变化情况计算TTL
    fn write_ttl(&self, key: &str, plan: &TtlPlan, value: &serde_json::Value) -> Duration {
        let Some((config, open)) = &plan.adaptive else {
            return plan.ttl;
        };
        if !self.config.enable_data_change_detection {
            return plan.ttl;
        }
        let window = Duration::from_secs(config.change_detection_window_secs);
        self.changes.observe(key, value, window);
        adaptive_ttl(config, *open, self.changes.activity(key, window))
    }

    async fn market_status(&self, market: Market) -> MarketStatusSnapshot {
        let ttl = self.config.market_status_cache_ttl();
        if let Some(cached) = self.market_cache.get(&market) {
            if cached.cached_at.elapsed() < ttl {
                return cached.snapshot.clone();
            }
        }

        match self.provider.get_market_status(market).await {
            Ok(report) => {
                let snapshot = MarketStatusSnapshot {
                    market,
                    status: report.status,
                    confidence: report.confidence.clamp(0.0, 1.0),
                    queried_at: Utc::now(),
                };
                self.market_cache.insert(
                    market,
                    CachedStatus {
                        snapshot: snapshot.clone(),
                        cached_at: Instant::now(),
                    },
                );
                snapshot
            }
            Err(e) => {
                warn!("查询市场状态失败，按休市处理: market={}, error={:#}", market, e);
                MarketStatusSnapshot {
                    market,
                    status: TradingStatus::Closed,
                    confidence: FALLBACK_MARKET_STATUS_CONFIDENCE,
                    queried_at: Utc::now(),
                }
            }
        }
    }

    fn cached_market_open(&self, market: Market) -> bool {
        self.market_cache
            .get(&market)
            .map_or(false, |cached| cached.snapshot.is_open())
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else { break };
                if orchestrator.is_shutting_down() {
                    break;
                }
                let attempts = orchestrator.store.self_heal().await;
                if !attempts.is_empty() {
                    debug!("健康检查触发自愈: attempts={}", attempts.len());
                }
            }
        })
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.market_status_cache_ttl();
        let window = Duration::from_secs(
            self.config
                .strategies
                .adaptive
                .change_detection_window_secs,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else { break };
                let ttl = orchestrator.config.market_status_cache_ttl();
                orchestrator
                    .market_cache
                    .retain(|_, cached| cached.cached_at.elapsed() < ttl);
                let swept = orchestrator.changes.sweep(window);
                if swept > 0 {
                    debug!("清除过期的变化跟踪记录: {}", swept);
                }
                let pruned = orchestrator.updater.prune_refresh_history();
                if pruned > 0 {
                    debug!("清除过期的刷新记录: {}", pruned);
                }
            }
        })
    }
}

impl Drop for CacheOrchestrator {
    fn drop(&mut self) {
        for handle in self.task_handles.lock().drain(..) {
            handle.abort();
        }
        self.updater.abort_all();
        self.optimizer.stop_optimization();
    }
}

fn needs_market_status(config: &StrategyConfig) -> bool {
    matches!(
        config,
        StrategyConfig::MarketAware(_) | StrategyConfig::Adaptive(_)
    )
}
