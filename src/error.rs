//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。`CacheError` 实现了 `Clone`，
//! 单飞加载的结果需要分发给所有等待者。

use serde::Serialize;
use thiserror::Error;

/// 缓存核心错误类型
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CacheError {
    /// 参数校验错误（不重试，立即返回）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 上游数据获取失败
    #[error("上游数据获取失败: {0}")]
    UpstreamFetch(String),

    /// 单次获取超时
    #[error("数据获取超时: {0}")]
    Timeout(String),

    /// 持久化存储不可达
    #[error("持久化存储不可用: {0}")]
    StoreConnectivity(String),

    /// 配置错误（聚合所有违规项）
    #[error("配置错误: {}", .0.join("; "))]
    Configuration(Vec<String>),

    /// 存储负载无法解析
    #[error("序列化错误: {0}")]
    Serialization(String),

    /// 编排器已关闭
    #[error("缓存编排器已关闭，拒绝新的请求")]
    Shutdown,

    /// 其他存储错误
    #[error("存储错误: {0}")]
    Storage(StorageError),
}

impl CacheError {
    /// 错误类别（用于指标与日志）
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Validation(_) => "validation",
            CacheError::UpstreamFetch(_) => "upstream_fetch",
            CacheError::Timeout(_) => "timeout",
            CacheError::StoreConnectivity(_) => "store_connectivity",
            CacheError::Configuration(_) => "configuration",
            CacheError::Serialization(_) => "serialization",
            CacheError::Shutdown => "shutdown",
            CacheError::Storage(_) => "storage",
        }
    }

    /// 是否允许重试（仅上游失败和超时）
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::UpstreamFetch(_) | CacheError::Timeout(_))
    }

    /// 是否为持久层连接类错误
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            CacheError::StoreConnectivity(_)
                | CacheError::Storage(StorageError::ConnectionError(_))
                | CacheError::Storage(StorageError::TimeoutError(_))
        )
    }

    /// 把上游回调返回的错误包装为 `UpstreamFetch`
    pub fn upstream(err: &anyhow::Error) -> Self {
        CacheError::UpstreamFetch(format!("{:#}", err))
    }
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConnectionError(msg) | StorageError::TimeoutError(msg) => {
                CacheError::StoreConnectivity(msg)
            }
            other => CacheError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StorageError::ConnectionError(err.to_string())
        } else if err.is_timeout() {
            StorageError::TimeoutError(err.to_string())
        } else {
            StorageError::QueryError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        let error = CacheError::Validation("缓存键不能为空".to_string());
        assert_eq!(error.to_string(), "参数校验失败: 缓存键不能为空");
    }

    #[test]
    fn test_configuration_error_lists_every_violation() {
        let error = CacheError::Configuration(vec![
            "strategies.strong.ttl_secs 必须大于0".to_string(),
            "strategies.adaptive.min_ttl_secs 必须小于 max_ttl_secs".to_string(),
        ]);
        let message = error.to_string();
        assert!(message.contains("strong.ttl_secs"));
        assert!(message.contains("adaptive.min_ttl_secs"));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: CacheError = StorageError::ConnectionError("refused".to_string()).into();
        assert!(matches!(err, CacheError::StoreConnectivity(_)));
        assert!(err.is_connectivity());

        let err: CacheError = StorageError::QueryError("bad".to_string()).into();
        assert!(matches!(err, CacheError::Storage(StorageError::QueryError(_))));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_serde_error_conversion() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CacheError = serde_err.into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(CacheError::UpstreamFetch("x".into()).is_retryable());
        assert!(CacheError::Timeout("x".into()).is_retryable());
        assert!(!CacheError::Validation("x".into()).is_retryable());
        assert!(!CacheError::Shutdown.is_retryable());
    }

    #[test]
    fn test_error_serializes_with_kind() {
        let json = serde_json::to_value(CacheError::Timeout("AAPL".into())).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["message"], "AAPL");
    }
}
