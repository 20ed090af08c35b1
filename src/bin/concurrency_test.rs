//! 并发请求合并演示
//!
//! 大量并发请求同一行情时只触发一次上游获取，随后的请求命中缓存。

use quotecache::{
    fetch_fn, init_logging, CacheOrchestrator, CacheRequest, CacheStrategy, SmartCacheConfig,
    StaticMarketStatusProvider, TradingStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONCURRENT_REQUESTS: usize = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info")?;
    println!("=== 并发请求合并测试 ===");

    let orchestrator = Arc::new(
        CacheOrchestrator::builder(SmartCacheConfig::default())
            .market_status_provider(Arc::new(StaticMarketStatusProvider::all(
                TradingStatus::Trading,
            )))
            .build()?,
    );
    orchestrator.init().await?;

    let upstream_calls = Arc::new(AtomicU64::new(0));
    let counter = upstream_calls.clone();
    let fetch = fetch_fn(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!({"symbol": "AAPL", "price": 190.5}))
        }
    });

    let start = Instant::now();
    let handles: Vec<_> = (0..CONCURRENT_REQUESTS)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let request = CacheRequest::new("quote:AAPL", CacheStrategy::MarketAware, fetch.clone())
                .symbols(["AAPL"]);
            tokio::spawn(async move { orchestrator.get_data_with_smart_cache(request).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            succeeded += 1;
        }
    }
    let elapsed = start.elapsed();

    let stats = orchestrator.stats();
    println!("请求数: {}", CONCURRENT_REQUESTS);
    println!("成功: {}", succeeded);
    println!("上游调用: {}", upstream_calls.load(Ordering::SeqCst));
    println!("合并等待: {}", stats.dedup_joins);
    println!("命中: {}", stats.hits);
    println!("耗时: {:?}", elapsed);
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let upstream = upstream_calls.load(Ordering::SeqCst);
    orchestrator.destroy().await;

    if succeeded == CONCURRENT_REQUESTS && upstream == 1 {
        println!("✓ 并发请求只触发一次上游获取");
        Ok(())
    } else {
        anyhow::bail!("请求合并失败: 成功 {}，上游调用 {}", succeeded, upstream)
    }
}
