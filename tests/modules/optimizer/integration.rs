//! 性能优化器集成测试
//!
//! 内存压力释放热层，周期性优化按负载调整并发度

use quotecache::{
    CacheOrchestrator, OptimizerConfig, PerformanceOptimizer, SetOptions, SmartCacheConfig,
    StaticMarketStatusProvider, StoreConfig, TradingStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{create_memory_store, FixedProbe};

/// 内存压力下释放热层条目并把并发度减半
#[tokio::test]
async fn test_memory_pressure_sheds_hot_tier() {
    let (store, _warm) = create_memory_store(StoreConfig::default());
    for i in 0..8 {
        store
            .set(&format!("quote:{}", i), &json!(i), SetOptions::default())
            .await
            .unwrap();
    }

    let optimizer = PerformanceOptimizer::new(OptimizerConfig::default(), 10)
        .with_probe(Arc::new(FixedProbe::memory_bound()))
        .with_relief(store.clone());

    assert!(optimizer.check_memory_pressure());
    assert!(optimizer.handle_memory_pressure());
    assert_eq!(store.hot_tier().len(), 6);
    assert_eq!(optimizer.recommended_concurrency(), 5);

    let snapshot = optimizer.snapshot();
    assert_eq!(snapshot.memory_pressure_events, 1);
    assert!(snapshot.under_memory_pressure);
    assert_eq!(
        optimizer.calculate_optimal_batch_size(0.0),
        OptimizerConfig::default().min_batch_size
    );
}

/// 高CPU时周期性优化逐步降低并发度
#[tokio::test(start_paused = true)]
async fn test_periodic_optimization_backs_off_under_load() {
    let optimizer = Arc::new(
        PerformanceOptimizer::new(OptimizerConfig::default(), 16)
            .with_probe(Arc::new(FixedProbe::busy())),
    );
    optimizer.start_optimization(16);
    assert_eq!(optimizer.recommended_concurrency(), 16);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(optimizer.recommended_concurrency(), 12);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(optimizer.recommended_concurrency(), 9);

    optimizer.stop_optimization();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(optimizer.recommended_concurrency(), 9);
}

/// 编排器把推荐并发度限制在 `max_concurrent_updates` 内
#[tokio::test]
async fn test_orchestrator_caps_recommended_concurrency() {
    let config = SmartCacheConfig::default().max_concurrent_updates(4);
    let orch = Arc::new(
        CacheOrchestrator::builder(config)
            .market_status_provider(Arc::new(StaticMarketStatusProvider::all(TradingStatus::Trading)))
            .resource_probe(Arc::new(FixedProbe::idle()))
            .build()
            .unwrap(),
    );

    let optimizer = orch.optimizer();
    for _ in 0..5 {
        optimizer.calculate_optimal_concurrency();
    }
    assert_eq!(optimizer.recommended_concurrency(), 4);
    assert!(!optimizer.check_memory_pressure());
    assert_eq!(orch.stats().performance.concurrency, 4);
}
