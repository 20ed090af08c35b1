//! Redis温层实现
//!
//! 基于 `ConnectionManager` 的 [`WarmStore`] 实现。
//!
//! # 特性
//!
//! - **重试机制**: 指数退避重试，连接错误时先重连再重试
//! - **毫秒TTL**: 使用 `SET PX` / `PTTL` / `PEXPIRE`
//! - **流水线**: `multi_get_with_ttl` 一次往返读取所有键的值与TTL
//! - **分页扫描**: `SCAN MATCH COUNT`

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::storage::{KeyTtl, StoredValue, WarmStore};

/// 最大键总长度
const MAX_KEY_LENGTH: usize = 1024;

/// 验证完整键
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::QueryError("键不能为空".to_string()));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::QueryError(format!(
            "键长度超过限制（最大 {} 字符）",
            MAX_KEY_LENGTH
        )));
    }

    if key.contains('\0') {
        return Err(StorageError::QueryError("键包含非法字符".to_string()));
    }

    Ok(())
}

/// 把 `PTTL` 的返回值转换为 [`KeyTtl`]
fn parse_pttl(ms: i64) -> KeyTtl {
    match ms {
        -2 => KeyTtl::Missing,
        -1 => KeyTtl::Persistent,
        ms if ms < 0 => KeyTtl::Missing,
        ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RedisConfig {
    /// 创建新的Redis配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置连接超时
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 设置重试初始退避时间
    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = backoff;
        self
    }
}

/// 重试统计
#[derive(Debug, Default)]
pub struct RetryStats {
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

impl RetryStats {
    /// 获取总重试次数
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// 获取成功重试次数
    pub fn successful_retries(&self) -> u64 {
        self.successful_retries.load(Ordering::Relaxed)
    }

    /// 获取失败重试次数
    pub fn failed_retries(&self) -> u64 {
        self.failed_retries.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        self.successful_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        self.failed_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Redis温层
pub struct RedisStorage {
    /// 连接管理器
    conn_manager: Mutex<Option<ConnectionManager>>,
    /// 配置
    config: RedisConfig,
    /// 重试统计
    retry_stats: Arc<RetryStats>,
    /// 已关闭后不再重连
    closed: AtomicBool,
}

impl RedisStorage {
    /// 创建新的Redis存储并建立连接
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        info!("创建Redis温层, URL: {}", config.url);

        let storage = Self {
            conn_manager: Mutex::new(None),
            config,
            retry_stats: Arc::new(RetryStats::default()),
            closed: AtomicBool::new(false),
        };
        storage.connect().await?;

        info!("Redis温层创建成功");
        Ok(storage)
    }

    /// 建立连接
    async fn connect(&self) -> Result<(), StorageError> {
        debug!("建立Redis连接");

        let mut info = self
            .config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| StorageError::ConnectionError(format!("无效的Redis URL: {}", e)))?;
        info.redis.db = self.config.db;
        if let Some(password) = &self.config.password {
            info.redis.password = Some(password.expose_secret().clone());
        }

        let client = Client::open(info).map_err(|e| {
            error!("创建Redis客户端失败: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn_manager =
            tokio::time::timeout(self.config.connection_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| StorageError::TimeoutError("建立Redis连接超时".to_string()))?
                .map_err(|e| {
                    error!("创建Redis连接管理器失败: {}", e);
                    StorageError::ConnectionError(format!("创建Redis连接管理器失败: {}", e))
                })?;

        *self.conn_manager.lock().await = Some(conn_manager);
        info!("Redis连接建立成功");
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        self.conn_manager
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::ConnectionError("连接未初始化".to_string()))
    }

    /// 带重试的执行
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut last_error = None;
        let mut backoff = self.config.retry_initial_backoff;

        for attempt in 0..=self.config.max_retries {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        self.retry_stats.record_success();
                        debug!("重试成功，尝试次数: {}", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    // 查询错误重试无意义
                    if matches!(e, StorageError::QueryError(_)) {
                        return Err(e);
                    }
                    last_error = Some(e.clone());

                    if attempt < self.config.max_retries {
                        warn!(
                            "操作失败，将在 {:?} 后重试 (尝试 {}/{}): {}",
                            backoff,
                            attempt + 1,
                            self.config.max_retries,
                            e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.mul_f32(2.0);

                        if matches!(e, StorageError::ConnectionError(_)) {
                            if let Err(reconnect_err) = self.reset_connection().await {
                                error!("重新连接失败: {}", reconnect_err);
                            }
                        }
                    }
                }
            }
        }

        self.retry_stats.record_failure();
        error!("操作失败，已达最大重试次数: {:?}", last_error);
        Err(last_error.unwrap_or_else(|| StorageError::TimeoutError("操作超时".to_string())))
    }

    async fn reset_connection(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ConnectionError("连接已关闭".to_string()));
        }
        debug!("尝试重新连接Redis");
        *self.conn_manager.lock().await = None;
        self.connect().await
    }

    /// 获取重试统计
    pub fn retry_stats(&self) -> &RetryStats {
        &self.retry_stats
    }

    /// 获取配置
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

#[async_trait]
impl WarmStore for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let ms = ttl_millis(ttl);
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ms)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let exists: bool = conn.exists(key).await?;
            Ok(exists)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        validate_key(key)?;
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
            Ok(parse_pttl(ms))
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        validate_key(key)?;
        let ms = ttl_millis(ttl);
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let updated: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ms)
                .query_async(&mut conn)
                .await?;
            Ok(updated == 1)
        })
        .await
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok((next, keys))
        })
        .await
    }

    async fn multi_get_with_ttl(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<StoredValue>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        for key in keys {
            validate_key(key)?;
        }

        self.execute_with_retry(move || async move {
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);
            }
            let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
            if raw.len() != keys.len() * 2 {
                return Err(StorageError::QueryError(format!(
                    "流水线返回 {} 个结果，期望 {}",
                    raw.len(),
                    keys.len() * 2
                )));
            }

            raw.chunks(2)
                .map(|pair| {
                    let value: Option<String> = redis::from_redis_value(&pair[0])?;
                    let ms: i64 = redis::from_redis_value(&pair[1])?;
                    Ok(value.map(|value| StoredValue {
                        value,
                        ttl: parse_pttl(ms),
                    }))
                })
                .collect::<Result<Vec<_>, redis::RedisError>>()
                .map_err(StorageError::from)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis PING失败: {}", e);
            StorageError::ConnectionError(format!("PING失败: {}", e))
        })?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StorageError> {
        self.reset_connection().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        if self.conn_manager.lock().await.take().is_some() {
            info!("Redis连接已释放");
        }
        Ok(())
    }
}
