//! 配置工厂集成测试
//!
//! 从YAML/TOML加载配置并驱动编排器

use quotecache::{
    CacheError, CacheOrchestrator, CacheRequest, CacheStrategy, ConfigFactory, StaticMarketStatusProvider,
    TradingStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{counting_fetch, FixedProbe};

const GATEWAY_YAML: &str = r#"
max_concurrent_updates: 100
fetch_timeout_ms: 2000
enable_metrics: false
strategies:
  market_aware:
    open_market_ttl_secs: 15
    closed_market_ttl_secs: 900
store:
  namespace: gateway-test
  hot_max_entries: 500
"#;

/// YAML配置中的超限值被裁剪，部分覆盖的策略保留其余默认值
#[tokio::test]
async fn test_yaml_config_drives_orchestrator() {
    let config = ConfigFactory::from_yaml_str(GATEWAY_YAML).unwrap();
    assert_eq!(config.max_concurrent_updates, 32);
    assert_eq!(config.fetch_timeout_ms, 2000);
    assert_eq!(config.store.namespace, "gateway-test");
    assert_eq!(config.strategies.market_aware.open_market_update_ratio, 0.3);

    let orch = CacheOrchestrator::builder(config)
        .market_status_provider(Arc::new(StaticMarketStatusProvider::all(TradingStatus::Holiday)))
        .resource_probe(Arc::new(FixedProbe::idle()))
        .build()
        .unwrap();

    let result = orch
        .get_data_with_smart_cache(
            CacheRequest::new(
                "quote:600519.SH",
                CacheStrategy::MarketAware,
                counting_fetch(Arc::new(AtomicUsize::new(0)), json!({"price": 1700.0})),
            )
            .symbols(["600519.SH"]),
        )
        .await;
    assert!(result.is_ok());
    assert_eq!(result.metadata.ttl_remaining, Some(Duration::from_secs(900)));
}

/// TOML与覆盖项得到同样的结果
#[test]
fn test_toml_matches_overrides() {
    let from_toml = ConfigFactory::from_toml_str(
        r#"
min_update_interval_ms = 250
warmup_freshness_ratio = 1.5

[strategies.adaptive]
base_ttl_secs = 240
"#,
    )
    .unwrap();

    let overrides: HashMap<String, String> = [
        ("min_update_interval_ms", "250"),
        ("warmup_freshness_ratio", "1.5"),
        ("strategies.adaptive.base_ttl_secs", "240"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let from_overrides = ConfigFactory::create_config(&overrides).unwrap();

    assert_eq!(from_toml, from_overrides);
    assert_eq!(from_toml.warmup_freshness_ratio, 1.0);
    assert_eq!(from_toml.min_update_interval_duration(), Duration::from_millis(250));
}

/// 所有违规项一次性返回
#[test]
fn test_invalid_yaml_reports_every_violation() {
    let yaml = r#"
store:
  min_ttl_secs: 600
  max_ttl_secs: 60
optimizer:
  min_batch_size: 200
  max_batch_size: 20
"#;
    match ConfigFactory::from_yaml_str(yaml) {
        Err(CacheError::Configuration(violations)) => {
            assert!(violations.iter().any(|v| v.contains("store.min_ttl_secs")));
            assert!(violations.iter().any(|v| v.contains("optimizer.min_batch_size")));
        }
        other => panic!("expected configuration error, got {:?}", other),
    }

    assert!(matches!(
        ConfigFactory::from_yaml_str("max_concurrent_updates: [1, 2]"),
        Err(CacheError::Configuration(_))
    ));
}
