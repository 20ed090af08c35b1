//! 分层缓存集成测试
//!
//! 覆盖TTL过期、LRU淘汰、降级与自愈、快照导入导出和按模式清理

use quotecache::{
    CacheError, CacheLevel, ClearOptions, ExportOptions, ImportOptions, IssueKind, SetOptions,
    StoreConfig, TieredCacheStore, WarmStore,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{create_memory_store, init_test_logging, FlakyWarmStore};

fn flaky_store(config: StoreConfig) -> (Arc<TieredCacheStore>, Arc<FlakyWarmStore>) {
    let warm = Arc::new(FlakyWarmStore::new());
    (Arc::new(TieredCacheStore::new(config, warm.clone())), warm)
}

/// 写入后命中，过期后未命中，`get_or_set` 重新填充
#[tokio::test(start_paused = true)]
async fn test_quote_expires_and_repopulates() {
    init_test_logging();
    let (store, _warm) = create_memory_store(StoreConfig::default());
    let quote = json!({"symbol": "AAPL", "price": 190.5});

    store
        .set("quote:AAPL", &quote, SetOptions::ttl(Duration::from_secs(5)))
        .await
        .unwrap();

    let hit = store.get("quote:AAPL").await.unwrap().unwrap();
    assert_eq!(hit.value, quote);
    assert_eq!(hit.level, CacheLevel::Hot);
    assert!(hit.ttl_remaining <= Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(store.get("quote:AAPL").await.unwrap().is_none());

    let refreshed = json!({"symbol": "AAPL", "price": 191.0});
    let result = store
        .get_or_set(
            "quote:AAPL",
            || {
                let value = refreshed.clone();
                async move { Ok(value) }
            },
            SetOptions::ttl(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(!result.hit);
    assert_eq!(result.cache_level, CacheLevel::Factory);

    let hit = store.get("quote:AAPL").await.unwrap().unwrap();
    assert_eq!(hit.value["price"], 191.0);
}

/// 超出热层容量时淘汰最久未使用的键，温层仍可读到
#[tokio::test]
async fn test_lru_eviction_falls_back_to_warm() {
    let (store, _warm) = create_memory_store(StoreConfig::default().hot_max_entries(3));

    for i in 0..3 {
        store
            .set(&format!("k{}", i), &json!(i), SetOptions::default())
            .await
            .unwrap();
    }
    // k0 变为最近使用
    store.get("k0").await.unwrap().unwrap();
    store.set("k3", &json!(3), SetOptions::default()).await.unwrap();

    let hot = store.hot_tier();
    assert!(hot.contains("k0"));
    assert!(!hot.contains("k1"));
    assert_eq!(store.stats().evictions, 1);

    let from_warm = store.get("k1").await.unwrap().unwrap();
    assert_eq!(from_warm.level, CacheLevel::Warm);
    assert_eq!(from_warm.value, json!(1));
}

/// 温层不可达时降级为仅热层，自愈后恢复
#[tokio::test]
async fn test_degraded_mode_and_recovery() {
    init_test_logging();
    let (store, warm) = flaky_store(StoreConfig::default().hot_max_entries(1));

    store.set("a", &json!("alpha"), SetOptions::default()).await.unwrap();
    store.set("b", &json!("beta"), SetOptions::default()).await.unwrap();
    assert!(!store.hot_tier().contains("a"));

    warm.set_failing(true);
    match store.get("a").await {
        Err(CacheError::StoreConnectivity(_)) => {}
        other => panic!("expected connectivity error, got {:?}", other),
    }
    assert!(store.is_degraded());

    // 降级期间热层照常服务
    let hit = store.get("b").await.unwrap().unwrap();
    assert_eq!(hit.level, CacheLevel::Hot);
    assert!(store.get("a").await.unwrap().is_none());
    store.set("c", &json!("gamma"), SetOptions::default()).await.unwrap();

    let attempts = store.self_heal().await;
    assert!(attempts
        .iter()
        .any(|a| a.issue == IssueKind::StoreConnectionFailed && a.success));
    assert!(!store.is_degraded());
    assert_eq!(warm.reconnects.load(Ordering::SeqCst), 1);

    let stats = store.stats();
    assert_eq!(stats.degradations, 1);
    assert_eq!(stats.recoveries, 1);
    assert_eq!(store.get("a").await.unwrap().unwrap().value, json!("alpha"));
}

/// 单次探测失败只触发一次重连
#[tokio::test]
async fn test_self_heal_after_transient_ping_failure() {
    let (store, warm) = flaky_store(StoreConfig::default());
    warm.fail_next_pings(1);

    let attempts = store.self_heal().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].issue, IssueKind::StoreConnectionFailed);
    assert_eq!(attempts[0].issue.as_str(), "store_connection_failed");
    assert!(attempts[0].success);
    assert_eq!(warm.reconnects.load(Ordering::SeqCst), 1);

    assert!(store.self_heal().await.is_empty());
    let report = store.health_check().await;
    assert!(report.connected);
    assert_eq!(report.score, 100);
}

/// 导出快照后按前缀映射导入另一个命名空间
#[tokio::test]
async fn test_export_then_import_with_prefix_map() {
    let (source, _) = create_memory_store(StoreConfig::default().namespace("gateway-a"));
    let (target, target_warm) = create_memory_store(StoreConfig::default().namespace("gateway-b"));

    for symbol in ["AAPL", "MSFT"] {
        source
            .set(
                &format!("quote:{}", symbol),
                &json!({"symbol": symbol}),
                SetOptions::ttl(Duration::from_secs(120)),
            )
            .await
            .unwrap();
    }
    source
        .set("profile:AAPL", &json!({"name": "Apple"}), SetOptions::default())
        .await
        .unwrap();

    let snapshot = source
        .export(ExportOptions {
            pattern: Some("quote:*".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.namespace, "gateway-a");

    let opts = ImportOptions {
        key_prefix_map: vec![("quote:".to_string(), "snapshot:".to_string())],
        ..Default::default()
    };
    let report = target.import(&snapshot, opts.clone()).await.unwrap();
    assert_eq!(report.imported, 2);
    assert!(target_warm.exists("gateway-b:snapshot:AAPL").await.unwrap());

    let again = target.import(&snapshot, opts).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 2);

    let hit = target.get("snapshot:MSFT").await.unwrap().unwrap();
    assert_eq!(hit.value["symbol"], "MSFT");
    assert!(hit.ttl_remaining <= Duration::from_secs(120));
}

/// 清理时保留仍然活跃的键
#[tokio::test]
async fn test_clear_preserves_active_entries() {
    let (store, warm) = create_memory_store(StoreConfig::default());
    store
        .set("quote:AAPL", &json!(1), SetOptions::ttl(Duration::from_secs(600)))
        .await
        .unwrap();
    store
        .set("quote:MSFT", &json!(2), SetOptions::ttl(Duration::from_secs(3)))
        .await
        .unwrap();
    store
        .set("profile:AAPL", &json!(3), SetOptions::ttl(Duration::from_secs(3)))
        .await
        .unwrap();

    let report = store
        .clear(
            "quote:*",
            ClearOptions {
                preserve_active: true,
                min_active_ttl: Duration::from_secs(60),
                page_size: Some(1),
            },
        )
        .await
        .unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.preserved, 1);
    assert_eq!(report.hot_removed, 1);
    assert!(store.exists("quote:AAPL").await.unwrap());
    assert!(!store.exists("quote:MSFT").await.unwrap());
    assert!(warm.exists("quotecache:profile:AAPL").await.unwrap());
}

/// 批量流水线不可用时逐键读取
#[tokio::test]
async fn test_batch_get_survives_broken_pipeline() {
    let warm = Arc::new(FlakyWarmStore::new());
    let writer = TieredCacheStore::new(StoreConfig::default(), warm.clone());
    writer.set("a", &json!("alpha"), SetOptions::default()).await.unwrap();
    writer.set("c", &json!("gamma"), SetOptions::default()).await.unwrap();

    let reader = TieredCacheStore::new(StoreConfig::default(), warm.clone());
    warm.break_pipeline(true);
    let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
    let results = reader.batch_get(&keys).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().value, json!("alpha"));
    assert!(results[1].is_none());
    assert_eq!(results[2].as_ref().unwrap().level, CacheLevel::Warm);
    assert!(!reader.is_degraded());
}
