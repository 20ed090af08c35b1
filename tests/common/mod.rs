//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use async_trait::async_trait;
use quotecache::{
    fetch_fn, CacheOrchestrator, FetchFn, KeyTtl, MemoryWarmStore, ResourceProbe,
    ResourceSample, SmartCacheConfig, StaticMarketStatusProvider, StorageError, StoreConfig,
    StoredValue, TieredCacheStore, TradingStatus, WarmStore,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 初始化测试日志（重复调用无副作用）
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// 负载固定的资源探针
pub struct FixedProbe {
    pub sample: ResourceSample,
}

impl FixedProbe {
    /// 空闲：CPU 10%，内存占用 0.1%
    pub fn idle() -> Self {
        Self {
            sample: ResourceSample {
                cpu_utilization: 0.1,
                process_memory_bytes: 1_000,
                memory_limit_bytes: 1_000_000,
            },
        }
    }

    /// 高负载：CPU 95%
    pub fn busy() -> Self {
        Self {
            sample: ResourceSample {
                cpu_utilization: 0.95,
                process_memory_bytes: 1_000,
                memory_limit_bytes: 1_000_000,
            },
        }
    }

    /// 内存接近上限
    pub fn memory_bound() -> Self {
        Self {
            sample: ResourceSample {
                cpu_utilization: 0.3,
                process_memory_bytes: 950_000,
                memory_limit_bytes: 1_000_000,
            },
        }
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        self.sample
    }
}

/// 可注入故障的温层
///
/// - `failing_pings`: 接下来若干次 `ping` 返回连接错误
/// - `fail_ops`: 读写操作返回连接错误
/// - `pipeline_broken`: 批量读取返回查询错误
/// - `close` 之后所有读写返回连接错误
pub struct FlakyWarmStore {
    pub inner: MemoryWarmStore,
    pub failing_pings: AtomicUsize,
    pub fail_ops: AtomicBool,
    pub pipeline_broken: AtomicBool,
    pub reconnects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FlakyWarmStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryWarmStore::new(),
            failing_pings: AtomicUsize::new(0),
            fail_ops: AtomicBool::new(false),
            pipeline_broken: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_pings(&self, n: usize) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_ops.store(failing, Ordering::SeqCst);
    }

    pub fn break_pipeline(&self, broken: bool) {
        self.pipeline_broken.store(broken, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail_ops.load(Ordering::SeqCst) {
            Err(StorageError::ConnectionError("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WarmStore for FlakyWarmStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        self.check()?;
        self.inner.scan(pattern, cursor, count).await
    }

    async fn multi_get_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<StoredValue>>, StorageError> {
        self.check()?;
        if self.pipeline_broken.load(Ordering::SeqCst) {
            return Err(StorageError::QueryError("pipeline unavailable".to_string()));
        }
        self.inner.multi_get_with_ttl(keys).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::ConnectionError("ping failed".to_string()));
        }
        self.check()
    }

    async fn reconnect(&self) -> Result<(), StorageError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.fail_ops.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.fail_ops.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 每次读写前先等待固定时延的温层
pub struct SlowWarmStore {
    pub inner: MemoryWarmStore,
    pub latency: Duration,
}

impl SlowWarmStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: MemoryWarmStore::new(),
            latency,
        }
    }
}

#[async_trait]
impl WarmStore for SlowWarmStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        tokio::time::sleep(self.latency).await;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        tokio::time::sleep(self.latency).await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.inner.expire(key, ttl).await
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        self.inner.scan(pattern, cursor, count).await
    }

    async fn multi_get_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<StoredValue>>, StorageError> {
        tokio::time::sleep(self.latency).await;
        self.inner.multi_get_with_ttl(keys).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
}

/// 创建基于内存温层的分层存储
pub fn create_memory_store(config: StoreConfig) -> (Arc<TieredCacheStore>, Arc<MemoryWarmStore>) {
    let warm = Arc::new(MemoryWarmStore::new());
    (Arc::new(TieredCacheStore::new(config, warm.clone())), warm)
}

/// 创建所有市场处于同一状态的编排器
pub fn create_orchestrator(
    config: SmartCacheConfig,
    status: TradingStatus,
) -> Arc<CacheOrchestrator> {
    Arc::new(
        CacheOrchestrator::builder(config)
            .market_status_provider(Arc::new(StaticMarketStatusProvider::all(status)))
            .resource_probe(Arc::new(FixedProbe::idle()))
            .build()
            .expect("编排器构建失败"),
    )
}

/// 返回固定值并计数的获取函数
pub fn counting_fetch(calls: Arc<AtomicUsize>, value: Value) -> FetchFn {
    fetch_fn(move || {
        let calls = calls.clone();
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    })
}

/// 先等待一段时间再返回的获取函数
pub fn slow_fetch(calls: Arc<AtomicUsize>, value: Value, delay: Duration) -> FetchFn {
    fetch_fn(move || {
        let calls = calls.clone();
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    })
}

/// 总是失败的获取函数
pub fn failing_fetch(message: &'static str) -> FetchFn {
    fetch_fn(move || async move { Err(anyhow::anyhow!(message)) })
}
