//! 缓存编排器集成测试
//!
//! 覆盖请求合并、市场感知TTL、批量获取、提前刷新和生命周期

use futures::future::join_all;
use quotecache::{
    fetch_fn, BatchOptions, CacheError, CacheLevel, CacheOrchestrator, CacheRequest,
    CacheStrategy, Market, SmartCacheConfig, StaticMarketStatusProvider, TradingStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{
    counting_fetch, create_orchestrator, failing_fetch, init_test_logging, slow_fetch, FixedProbe,
    FlakyWarmStore, SlowWarmStore,
};

/// 并发未命中只触发一次上游获取
#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    init_test_logging();
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Trading);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = slow_fetch(calls.clone(), json!({"price": 10.5}), Duration::from_millis(50));

    let requests = (0..10).map(|_| {
        let orch = orch.clone();
        let request = CacheRequest::new("quote:AAPL", CacheStrategy::WeakTimeliness, fetch.clone());
        async move { orch.get_data_with_smart_cache(request).await }
    });
    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.data == Some(json!({"price": 10.5}))));
    assert_eq!(results.iter().filter(|r| r.metadata.deduplicated).count(), 9);

    let stats = orch.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.dedup_joins, 9);
    assert_eq!(stats.in_flight_fetches, 0);
}

/// 温层有时延时，写入完成前到达的请求仍复用同一次获取
#[tokio::test(start_paused = true)]
async fn test_staggered_misses_with_slow_warm_tier_share_one_fetch() {
    init_test_logging();
    let orch = Arc::new(
        CacheOrchestrator::builder(SmartCacheConfig::default())
            .warm_store(Arc::new(SlowWarmStore::new(Duration::from_millis(30))))
            .market_status_provider(Arc::new(StaticMarketStatusProvider::all(
                TradingStatus::Trading,
            )))
            .resource_probe(Arc::new(FixedProbe::idle()))
            .build()
            .unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = slow_fetch(calls.clone(), json!({"price": 10.5}), Duration::from_millis(45));

    let requests = (0..10u64).map(|i| {
        let orch = orch.clone();
        let request = CacheRequest::new("quote:AAPL", CacheStrategy::WeakTimeliness, fetch.clone());
        async move {
            tokio::time::sleep(Duration::from_millis(10 * i)).await;
            orch.get_data_with_smart_cache(request).await
        }
    });
    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.data == Some(json!({"price": 10.5}))));
    // 写入完成前到达的请求加入获取，之后的请求直接命中
    assert!(results.iter().filter(|r| r.metadata.deduplicated).count() >= 1);
    assert!(results.last().unwrap().hit);
    assert_eq!(orch.stats().in_flight_fetches, 0);
}

/// 开市与休市使用不同TTL
#[tokio::test]
async fn test_market_aware_ttl_follows_trading_session() {
    let provider = StaticMarketStatusProvider::new()
        .with_status(Market::US, TradingStatus::Trading)
        .with_status(Market::HK, TradingStatus::Closed);
    let orch = CacheOrchestrator::builder(SmartCacheConfig::default())
        .market_status_provider(Arc::new(provider))
        .resource_probe(Arc::new(FixedProbe::idle()))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let hk = orch
        .get_data_with_smart_cache(
            CacheRequest::new(
                "quote:0700.HK",
                CacheStrategy::MarketAware,
                counting_fetch(calls.clone(), json!(1)),
            )
            .symbols(["0700.HK"]),
        )
        .await;
    assert_eq!(hk.metadata.ttl_remaining, Some(Duration::from_secs(1800)));
    let statuses = hk.metadata.market_status.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].market, Market::HK);
    assert!(!statuses[0].is_open());

    let us = orch
        .get_data_with_smart_cache(
            CacheRequest::new(
                "quote:AAPL",
                CacheStrategy::MarketAware,
                counting_fetch(calls.clone(), json!(2)),
            )
            .symbols(["AAPL"]),
        )
        .await;
    assert_eq!(us.metadata.ttl_remaining, Some(Duration::from_secs(30)));

    // 任一市场开市即按开市处理
    let mixed = orch
        .get_data_with_smart_cache(
            CacheRequest::new(
                "basket:AAPL+0700",
                CacheStrategy::MarketAware,
                counting_fetch(calls.clone(), json!(3)),
            )
            .symbols(["AAPL", "0700.HK"]),
        )
        .await;
    assert_eq!(mixed.metadata.ttl_remaining, Some(Duration::from_secs(30)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// 状态查询失败时按休市处理
#[tokio::test]
async fn test_unknown_market_status_falls_back_to_closed() {
    let orch = CacheOrchestrator::builder(SmartCacheConfig::default())
        .market_status_provider(Arc::new(StaticMarketStatusProvider::new()))
        .resource_probe(Arc::new(FixedProbe::idle()))
        .build()
        .unwrap();

    let statuses = orch
        .get_market_status_for_symbols(&["600519.SH".to_string()])
        .await;
    let sh = &statuses[&Market::SH];
    assert_eq!(sh.status, TradingStatus::Closed);
    assert!(sh.confidence < 0.5);
}

/// 批量结果与输入顺序一致，命中与未命中分别处理
#[tokio::test]
async fn test_batch_preserves_order() {
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Closed);
    let calls = Arc::new(AtomicUsize::new(0));

    let warm_up = orch
        .get_data_with_smart_cache(CacheRequest::new(
            "profile:MSFT",
            CacheStrategy::WeakTimeliness,
            counting_fetch(calls.clone(), json!("msft")),
        ))
        .await;
    assert!(!warm_up.hit);

    let results = orch
        .batch_get_data_with_smart_cache(vec![
            CacheRequest::new(
                "live:AAPL",
                CacheStrategy::NoCache,
                counting_fetch(calls.clone(), json!("live")),
            ),
            CacheRequest::new(
                "profile:MSFT",
                CacheStrategy::WeakTimeliness,
                counting_fetch(calls.clone(), json!("stale")),
            ),
            CacheRequest::new("", CacheStrategy::WeakTimeliness, failing_fetch("unused")),
            CacheRequest::new(
                "quote:0700.HK",
                CacheStrategy::MarketAware,
                counting_fetch(calls.clone(), json!("hk")),
            )
            .symbols(["0700.HK"]),
        ])
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].data, Some(json!("live")));
    assert_eq!(results[0].metadata.cache_level, CacheLevel::Bypass);
    assert!(results[1].hit);
    assert_eq!(results[1].data, Some(json!("msft")));
    assert!(matches!(results[2].error, Some(CacheError::Validation(_))));
    assert_eq!(results[3].data, Some(json!("hk")));
    assert_eq!(results[3].metadata.ttl_remaining, Some(Duration::from_secs(1800)));
    // 预热 1 次 + NoCache 1 次 + 未命中 1 次
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// 先请求的键获取较慢时结果仍按输入顺序返回
#[tokio::test(start_paused = true)]
async fn test_batch_order_survives_out_of_order_completion() {
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Closed);
    let calls = Arc::new(AtomicUsize::new(0));

    let results = orch
        .batch_get_data_with_smart_cache(vec![
            CacheRequest::new(
                "quote:AAPL",
                CacheStrategy::WeakTimeliness,
                slow_fetch(calls.clone(), json!("aapl"), Duration::from_millis(200)),
            ),
            CacheRequest::new(
                "quote:MSFT",
                CacheStrategy::WeakTimeliness,
                slow_fetch(calls.clone(), json!("msft"), Duration::from_millis(50)),
            ),
            CacheRequest::new(
                "quote:TSLA",
                CacheStrategy::WeakTimeliness,
                counting_fetch(calls.clone(), json!("tsla")),
            ),
        ])
        .await;

    let keys: Vec<&str> = results.iter().map(|r| r.storage_key.as_str()).collect();
    assert_eq!(keys, vec!["quote:AAPL", "quote:MSFT", "quote:TSLA"]);
    let data: Vec<_> = results.iter().map(|r| r.data.clone()).collect();
    assert_eq!(
        data,
        vec![Some(json!("aapl")), Some(json!("msft")), Some(json!("tsla"))]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// 剩余TTL低于阈值时命中并安排后台刷新
#[tokio::test(start_paused = true)]
async fn test_refresh_ahead_updates_in_background() {
    init_test_logging();
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Trading);
    orch.init().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetch = fetch_fn(move || {
        let counter = counter.clone();
        async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
    });
    let request = || CacheRequest::new("quote:TSLA", CacheStrategy::StrongTimeliness, fetch.clone());

    let first = orch.get_data_with_smart_cache(request()).await;
    assert_eq!(first.data, Some(json!(1)));

    // 强时效 TTL 5 秒，剩余不足一半时触发刷新
    tokio::time::advance(Duration::from_secs(3)).await;
    let second = orch.get_data_with_smart_cache(request()).await;
    assert!(second.hit);
    assert_eq!(second.data, Some(json!(1)));
    assert!(second.metadata.background_update_scheduled);

    for _ in 0..50 {
        if calls.load(Ordering::SeqCst) >= 2 && !orch.is_background_update_pending("quote:TSLA") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let third = orch.get_data_with_smart_cache(request()).await;
    assert!(third.hit);
    assert_eq!(third.data, Some(json!(2)));
    assert_eq!(orch.stats().background_completed, 1);

    orch.destroy().await;
}

/// 关闭后拒绝新请求
#[tokio::test]
async fn test_destroy_rejects_new_requests() {
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Trading);
    orch.init().await.unwrap();
    orch.destroy().await;

    assert!(orch.is_shutting_down());
    let result = orch
        .get_data_with_smart_cache(CacheRequest::new(
            "quote:AAPL",
            CacheStrategy::WeakTimeliness,
            failing_fetch("unused"),
        ))
        .await;
    assert!(matches!(result.error, Some(CacheError::Shutdown)));
    assert!(matches!(orch.init().await, Err(CacheError::Shutdown)));
}

/// 关闭时释放温层连接，重复关闭不再释放
#[tokio::test]
async fn test_destroy_releases_warm_store() {
    let warm = Arc::new(FlakyWarmStore::new());
    let orch = Arc::new(
        CacheOrchestrator::builder(SmartCacheConfig::default())
            .warm_store(warm.clone())
            .market_status_provider(Arc::new(StaticMarketStatusProvider::all(
                TradingStatus::Trading,
            )))
            .resource_probe(Arc::new(FixedProbe::idle()))
            .build()
            .unwrap(),
    );
    orch.init().await.unwrap();
    let stored = orch
        .get_data_with_smart_cache(CacheRequest::new(
            "quote:AAPL",
            CacheStrategy::WeakTimeliness,
            counting_fetch(Arc::new(AtomicUsize::new(0)), json!(1)),
        ))
        .await;
    assert!(stored.is_ok());

    orch.destroy().await;
    orch.destroy().await;
    assert_eq!(warm.closes.load(Ordering::SeqCst), 1);
    assert_eq!(orch.store().hot_tier().len(), 0);
}

/// 预热后分析：新鲜的键跳过，缺失的键出现在报告中
#[tokio::test]
async fn test_warmup_then_analyze() {
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Trading);
    let calls = Arc::new(AtomicUsize::new(0));
    let queries = || {
        ["profile:AAPL", "profile:MSFT", "profile:NVDA"]
            .iter()
            .map(|key| {
                CacheRequest::new(
                    *key,
                    CacheStrategy::WeakTimeliness,
                    counting_fetch(calls.clone(), json!({"key": key})),
                )
            })
            .collect::<Vec<_>>()
    };

    let first = orch.warmup_hot_queries(queries()).await;
    assert!(first.iter().all(|r| r.success && !r.skipped));
    let second = orch.warmup_hot_queries(queries()).await;
    assert!(second.iter().all(|r| r.success && r.skipped));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let keys: Vec<String> = ["profile:AAPL", "profile:MSFT", "profile:NVDA", "profile:AMZN"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    let analysis = orch.analyze_cache_performance(&keys).await;
    assert_eq!(analysis.total_keys, 4);
    assert_eq!(analysis.cached, 3);
    assert_eq!(analysis.missing, 1);
    assert!((analysis.hit_rate - 0.75).abs() < f64::EPSILON);
    assert_eq!(analysis.keys[3].state, "missing");
}

/// 受控并发批量获取：隔离错误或在首个错误处中止
#[tokio::test]
async fn test_optimized_batch_error_isolation() {
    let orch = create_orchestrator(SmartCacheConfig::default(), TradingStatus::Trading);
    let calls = Arc::new(AtomicUsize::new(0));
    let build = || {
        (0..8)
            .map(|i| {
                let fetch = if i == 5 {
                    failing_fetch("upstream 503")
                } else {
                    counting_fetch(calls.clone(), json!(i))
                };
                CacheRequest::new(format!("batch:{}", i), CacheStrategy::NoCache, fetch)
            })
            .collect::<Vec<_>>()
    };

    let isolated = orch
        .get_batch_data_with_optimized_concurrency(build(), BatchOptions::default().concurrency(3))
        .await
        .unwrap();
    assert_eq!(isolated.len(), 8);
    assert!(isolated[5].error.is_some());
    assert_eq!(isolated[7].data, Some(json!(7)));

    let aborted = orch
        .get_batch_data_with_optimized_concurrency(
            build(),
            BatchOptions::default().error_isolation(false),
        )
        .await;
    assert!(matches!(aborted, Err(CacheError::UpstreamFetch(_))));
}
