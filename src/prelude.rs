//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Quotecache,
//! allowing users to import them with a single `use quotecache::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::{OptimizerConfig, SmartCacheConfig, StoreConfig};
pub use crate::error::CacheError;
pub use crate::factory::ConfigFactory;
pub use crate::orchestrator::{
    fetch_fn, BatchOptions, CacheOrchestrator, CacheRequest, CacheResult, FetchFn,
};
pub use crate::strategy::CacheStrategy;

// Storage
pub use crate::cache::{CacheLevel, SetOptions, TieredCacheStore};
pub use crate::storage::{MemoryWarmStore, WarmStore};

// Market data collaborators
pub use crate::market::{
    Market, MarketInferrer, MarketStatusProvider, StaticMarketStatusProvider,
    SuffixMarketInferrer, TradingStatus,
};

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::redis_storage::{RedisConfig, RedisStorage};

#[cfg(feature = "monitoring")]
pub use crate::telemetry::PrometheusMetrics;
