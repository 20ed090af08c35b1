//! 缓存请求与结果

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheLevel;
use crate::error::CacheError;
use crate::market::MarketStatusSnapshot;
use crate::strategy::CacheStrategy;

/// 调用方提供的上游获取函数
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// 把异步闭包包装成 [`FetchFn`]
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// 一次缓存请求
#[derive(Clone)]
pub struct CacheRequest {
    pub cache_key: String,
    pub strategy: CacheStrategy,
    /// 涉及的证券代码，用于市场状态判断和刷新优先级
    pub symbols: Vec<String>,
    pub fetch: FetchFn,
    /// 覆盖策略计算出的TTL
    pub ttl_override: Option<Duration>,
}

impl CacheRequest {
    pub fn new(cache_key: impl Into<String>, strategy: CacheStrategy, fetch: FetchFn) -> Self {
        Self {
            cache_key: cache_key.into(),
            strategy,
            symbols: Vec::new(),
            fetch,
            ttl_override: None,
        }
    }

    pub fn symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl_override(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }
}

impl fmt::Debug for CacheRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRequest")
            .field("cache_key", &self.cache_key)
            .field("strategy", &self.strategy)
            .field("symbols", &self.symbols)
            .field("ttl_override", &self.ttl_override)
            .finish_non_exhaustive()
    }
}

/// 结果元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    /// 命中时为剩余TTL，获取后为写入TTL
    pub ttl_remaining: Option<Duration>,
    pub cache_level: CacheLevel,
    /// 市场感知和自适应策略使用的市场状态
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_status: Option<Vec<MarketStatusSnapshot>>,
    pub background_update_scheduled: bool,
    /// 是否复用了其他请求正在进行的获取
    pub deduplicated: bool,
    pub fetch_duration: Option<Duration>,
    pub generated_at: DateTime<Utc>,
}

impl ResultMetadata {
    pub(crate) fn new(cache_level: CacheLevel) -> Self {
        Self {
            ttl_remaining: None,
            cache_level,
            market_status: None,
            background_update_scheduled: false,
            deduplicated: false,
            fetch_duration: None,
            generated_at: Utc::now(),
        }
    }
}

/// 缓存请求结果
///
/// 预期内的失败不会以 `Err` 返回，而是记录在 `error` 中。`data` 存在时
/// `error` 表示降级路径上出现的问题（例如存储不可用后直接获取）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheResult {
    pub data: Option<Value>,
    pub hit: bool,
    pub strategy: CacheStrategy,
    pub storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CacheError>,
    pub metadata: ResultMetadata,
}

impl CacheResult {
    pub(crate) fn failure(
        request: &CacheRequest,
        error: CacheError,
        cache_level: CacheLevel,
    ) -> Self {
        Self {
            data: None,
            hit: false,
            strategy: request.strategy,
            storage_key: request.cache_key.clone(),
            error: Some(error),
            metadata: ResultMetadata::new(cache_level),
        }
    }

    /// 是否拿到了数据
    pub fn is_ok(&self) -> bool {
        self.data.is_some()
    }
}
