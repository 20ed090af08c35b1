//! 预热、缓存分析与受控并发的批量获取

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::cache::{CacheLevel, KeyState, StoreStats};
use crate::constants::DEFAULT_RETRY_BACKOFF_MS;
use crate::error::CacheError;
use crate::orchestrator::request::{CacheRequest, CacheResult};
use crate::orchestrator::{needs_market_status, CacheOrchestrator};
use crate::storage::KeyTtl;

/// 单个预热结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmupResult {
    pub cache_key: String,
    pub success: bool,
    /// 数据仍然新鲜，未获取
    pub skipped: bool,
    pub ttl_remaining: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CacheError>,
}

/// 单个键的分析结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyReport {
    pub key: String,
    /// cached / expired / missing
    pub state: &'static str,
    pub ttl_remaining: Option<Duration>,
    pub level: Option<CacheLevel>,
}

/// 缓存性能分析
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachePerformanceAnalysis {
    pub total_keys: usize,
    pub cached: usize,
    pub expired: usize,
    pub missing: usize,
    pub hit_rate: f64,
    /// 即将过期的键
    pub hotspots: Vec<String>,
    pub keys: Vec<KeyReport>,
    pub recommendations: Vec<String>,
    pub store: StoreStats,
    pub analyzed_at: DateTime<Utc>,
}

/// 受控并发批量获取的选项
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// 调用方并发上限，为空时使用 `max_concurrent_updates`
    pub concurrency: Option<usize>,
    /// 单个失败不影响其他请求
    pub error_isolation: bool,
    /// 可重试的失败在退避后重试一次
    pub retry_failures: bool,
    pub retry_backoff: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            error_isolation: true,
            retry_failures: false,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl BatchOptions {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    pub fn error_isolation(mut self, enable: bool) -> Self {
        self.error_isolation = enable;
        self
    }

    pub fn retry_failures(mut self, enable: bool) -> Self {
        self.retry_failures = enable;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

impl CacheOrchestrator {
    /// 预热热点查询
    ///
    /// 剩余TTL超过 `warmup_freshness_ratio × 策略TTL` 的键跳过，其余获取并写入。
    #[instrument(skip(self, queries), fields(count = queries.len()))]
    pub async fn warmup_hot_queries(&self, queries: Vec<CacheRequest>) -> Vec<WarmupResult> {
        let concurrency = self.optimizer.recommended_concurrency().max(1);
        let results: Vec<WarmupResult> = stream::iter(queries)
            .map(|query| self.warmup_one(query))
            .buffered(concurrency)
            .collect()
            .await;

        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            "预热完成: total={}, skipped={}, failed={}",
            results.len(),
            skipped,
            failed
        );
        results
    }

    async fn warmup_one(&self, query: CacheRequest) -> WarmupResult {
        if let Some(rejected) = self.reject(&query) {
            return WarmupResult {
                cache_key: query.cache_key,
                success: false,
                skipped: false,
                ttl_remaining: None,
                error: rejected.error,
            };
        }

        let config = self.config.strategies.resolve(query.strategy);
        let statuses = if needs_market_status(&config) {
            self.get_market_status_for_symbols(&query.symbols).await
        } else {
            HashMap::new()
        };
        let Some(plan) = self.plan(&query, &config, &statuses) else {
            // NoCache 不写入缓存，预热没有意义
            return WarmupResult {
                cache_key: query.cache_key,
                success: true,
                skipped: true,
                ttl_remaining: None,
                error: None,
            };
        };

        let threshold = plan.ttl.as_secs_f64() * self.config.warmup_freshness_ratio;
        match self.store.ttl(&query.cache_key).await {
            Ok(KeyTtl::Expires(remaining)) if remaining.as_secs_f64() > threshold => {
                debug!("预热跳过仍然新鲜的键: key={}, remaining={:?}", query.cache_key, remaining);
                return WarmupResult {
                    cache_key: query.cache_key,
                    success: true,
                    skipped: true,
                    ttl_remaining: Some(remaining),
                    error: None,
                };
            }
            Ok(KeyTtl::Persistent) => {
                return WarmupResult {
                    cache_key: query.cache_key,
                    success: true,
                    skipped: true,
                    ttl_remaining: None,
                    error: None,
                };
            }
            _ => {}
        }

        let result = self.fetch_and_store(&query, plan, None).await;
        WarmupResult {
            cache_key: query.cache_key,
            success: result.is_ok(),
            skipped: false,
            ttl_remaining: result.metadata.ttl_remaining,
            error: result.error,
        }
    }

    /// 分析一组键的缓存状态
    pub async fn analyze_cache_performance(&self, keys: &[String]) -> CachePerformanceAnalysis {
        let states = self.store.inspect_keys(keys).await;
        let hotspot_threshold = Duration::from_secs(self.config.hotspot_ttl_threshold_secs);

        let mut reports = Vec::with_capacity(keys.len());
        let mut hotspots = Vec::new();
        let (mut cached, mut expired, mut missing) = (0, 0, 0);

        for (key, state) in keys.iter().zip(states) {
            let report = match state {
                KeyState::Cached(lookup) => {
                    cached += 1;
                    if lookup.ttl_remaining < hotspot_threshold {
                        hotspots.push(key.clone());
                    }
                    KeyReport {
                        key: key.clone(),
                        state: "cached",
                        ttl_remaining: Some(lookup.ttl_remaining),
                        level: Some(lookup.level),
                    }
                }
                KeyState::Expired => {
                    expired += 1;
                    KeyReport {
                        key: key.clone(),
                        state: "expired",
                        ttl_remaining: None,
                        level: None,
                    }
                }
                KeyState::Missing => {
                    missing += 1;
                    KeyReport {
                        key: key.clone(),
                        state: "missing",
                        ttl_remaining: None,
                        level: None,
                    }
                }
            };
            reports.push(report);
        }

        let total_keys = keys.len();
        let hit_rate = if total_keys == 0 {
            0.0
        } else {
            cached as f64 / total_keys as f64
        };
        let store = self.store.stats();

        let mut recommendations = Vec::new();
        if total_keys > 0 && hit_rate < self.config.low_hit_rate_threshold {
            recommendations.push(format!(
                "命中率 {:.1}% 低于 {:.1}%，建议预热热点查询或延长TTL",
                hit_rate * 100.0,
                self.config.low_hit_rate_threshold * 100.0
            ));
        }
        if expired > 0 {
            recommendations.push(format!("{} 个键已过期，建议启用后台更新", expired));
        }
        if !hotspots.is_empty() {
            recommendations.push(format!(
                "{} 个热点键将在 {:?} 内过期，建议提高提前刷新比例",
                hotspots.len(),
                hotspot_threshold
            ));
        }
        if store.degraded {
            recommendations.push("温层处于降级状态，仅使用热层".to_string());
        }

        CachePerformanceAnalysis {
            total_keys,
            cached,
            expired,
            missing,
            hit_rate,
            hotspots,
            keys: reports,
            recommendations,
            store,
            analyzed_at: Utc::now(),
        }
    }

    /// 以优化器推荐的并发度批量获取，结果顺序与输入一致
    ///
    /// 未开启 `error_isolation` 时第一个失败会中止整个批次并返回该错误。
    #[instrument(skip(self, requests, opts), fields(count = requests.len()))]
    pub async fn get_batch_data_with_optimized_concurrency(
        &self,
        requests: Vec<CacheRequest>,
        opts: BatchOptions,
    ) -> Result<Vec<CacheResult>, CacheError> {
        let cap = opts
            .concurrency
            .unwrap_or(self.config.max_concurrent_updates);
        let concurrency = cap.min(self.optimizer.recommended_concurrency()).max(1);
        debug!(
            "受控并发批量获取: count={}, concurrency={}",
            requests.len(),
            concurrency
        );

        let results = stream::iter(requests)
            .map(|request| self.run_batch_item(request, &opts))
            .buffered(concurrency);

        if opts.error_isolation {
            Ok(results.collect().await)
        } else {
            results
                .map(|result| match result.error.clone() {
                    Some(e) if result.data.is_none() => Err(e),
                    _ => Ok(result),
                })
                .try_collect()
                .await
        }
    }

    async fn run_batch_item(&self, request: CacheRequest, opts: &BatchOptions) -> CacheResult {
        let started = Instant::now();
        let mut result = self.get_data_with_smart_cache(request.clone()).await;

        let retryable = result.data.is_none()
            && result.error.as_ref().map_or(false, CacheError::is_retryable);
        if opts.retry_failures && retryable {
            debug!(
                "退避 {:?} 后重试: key={}",
                opts.retry_backoff, request.cache_key
            );
            tokio::time::sleep(opts.retry_backoff).await;
            result = self.get_data_with_smart_cache(request).await;
        }

        self.optimizer.record_task(started.elapsed(), result.is_ok());
        result
    }
}
