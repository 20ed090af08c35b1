//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for QuoteCache.
//!
//! Every default and every documented `[min, max]` bound used by the
//! configuration factory lives here, so the clamping table and the
//! `Default` impls can never drift apart.

// ============================================================================
// Orchestrator Constants
// ============================================================================

/// Default number of concurrently running background refreshes.
pub const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 10;

/// Lower bound for `max_concurrent_updates`.
pub const MIN_CONCURRENT_UPDATES: usize = 2;

/// Upper bound for `max_concurrent_updates`.
///
/// Overrides above this value are clamped, never rejected.
pub const MAX_CONCURRENT_UPDATES: usize = 32;

/// Default minimum gap between two background refreshes of the same key (1 second).
pub const DEFAULT_MIN_UPDATE_INTERVAL_MS: u64 = 1_000;

/// Bounds for `min_update_interval_ms`.
pub const MIN_UPDATE_INTERVAL_MS_BOUNDS: (f64, f64) = (0.0, 600_000.0);

/// Default time `destroy()` waits for in-flight background refreshes (30 seconds).
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Bounds for `graceful_shutdown_timeout_ms`.
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS_BOUNDS: (f64, f64) = (100.0, 300_000.0);

/// Default per-call timeout applied to caller-supplied fetch functions (5 seconds).
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;

/// Bounds for `fetch_timeout_ms`.
pub const FETCH_TIMEOUT_MS_BOUNDS: (f64, f64) = (10.0, 120_000.0);

/// Default lifetime of a cached market-status snapshot (30 seconds).
pub const DEFAULT_MARKET_STATUS_CACHE_TTL_SECS: u64 = 30;

/// Bounds for `market_status_cache_ttl_secs`.
pub const MARKET_STATUS_CACHE_TTL_SECS_BOUNDS: (f64, f64) = (1.0, 3_600.0);

/// Confidence reported when the market-status provider fails.
pub const FALLBACK_MARKET_STATUS_CONFIDENCE: f64 = 0.1;

/// Keys whose remaining TTL exceeds this share of the strategy TTL are skipped by warm-up.
pub const DEFAULT_WARMUP_FRESHNESS_RATIO: f64 = 0.5;

/// Remaining TTL below which an analysed key counts as a hotspot (10 seconds).
pub const DEFAULT_HOTSPOT_TTL_THRESHOLD_SECS: u64 = 10;

/// Hit rate below which performance analysis emits recommendations.
pub const DEFAULT_LOW_HIT_RATE_THRESHOLD: f64 = 0.5;

/// Interval of the periodic health-check / self-heal loop (15 seconds).
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 15;

/// Bounds for `health_check_interval_secs`.
pub const HEALTH_CHECK_INTERVAL_SECS_BOUNDS: (f64, f64) = (1.0, 3_600.0);

/// Backoff before a failed fetch is retried once (100 milliseconds).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

// ============================================================================
// Strategy Constants
// ============================================================================

/// Strong timeliness: quotes, order books (5 seconds).
pub const DEFAULT_STRONG_TTL_SECS: u64 = 5;
pub const DEFAULT_STRONG_UPDATE_RATIO: f64 = 0.5;
pub const DEFAULT_STRONG_REFRESH_INTERVAL_SECS: u64 = 10;

/// Weak timeliness: reference data, fundamentals (5 minutes).
pub const DEFAULT_WEAK_TTL_SECS: u64 = 300;
pub const DEFAULT_WEAK_UPDATE_RATIO: f64 = 0.2;
pub const DEFAULT_WEAK_REFRESH_INTERVAL_SECS: u64 = 600;

/// Market aware: short TTL while trading, long TTL while closed.
pub const DEFAULT_OPEN_MARKET_TTL_SECS: u64 = 30;
pub const DEFAULT_CLOSED_MARKET_TTL_SECS: u64 = 1_800;
pub const DEFAULT_OPEN_MARKET_UPDATE_RATIO: f64 = 0.3;
pub const DEFAULT_CLOSED_MARKET_UPDATE_RATIO: f64 = 0.1;
pub const DEFAULT_MARKET_STATUS_CHECK_INTERVAL_SECS: u64 = 60;

/// Adaptive: TTL derived from market session and observed change frequency.
pub const DEFAULT_ADAPTIVE_BASE_TTL_SECS: u64 = 180;
pub const DEFAULT_ADAPTIVE_MIN_TTL_SECS: u64 = 30;
pub const DEFAULT_ADAPTIVE_MAX_TTL_SECS: u64 = 3_600;
pub const DEFAULT_ADAPTATION_FACTOR: f64 = 1.5;
pub const DEFAULT_CHANGE_DETECTION_WINDOW_SECS: u64 = 3_600;

/// Bounds shared by every strategy TTL key.
pub const STRATEGY_TTL_SECS_BOUNDS: (f64, f64) = (1.0, 86_400.0);

/// Bounds shared by every refresh / check interval key.
pub const STRATEGY_INTERVAL_SECS_BOUNDS: (f64, f64) = (1.0, 86_400.0);

/// Bounds for `adaptation_factor`.
pub const ADAPTATION_FACTOR_BOUNDS: (f64, f64) = (1.0, 10.0);

/// Bounds for update threshold ratios.
pub const RATIO_BOUNDS: (f64, f64) = (0.0, 1.0);

// ============================================================================
// Tiered Store Constants
// ============================================================================

/// Default hot-tier capacity (entries).
pub const DEFAULT_HOT_MAX_ENTRIES: usize = 1_000;

/// Bounds for `hot_max_entries`.
pub const HOT_MAX_ENTRIES_BOUNDS: (f64, f64) = (1.0, 1_000_000.0);

/// Largest serialized payload admitted into the hot tier (64 KiB).
pub const DEFAULT_HOT_MAX_ENTRY_BYTES: usize = 64 * 1024;

/// Bounds for `hot_max_entry_bytes`.
pub const HOT_MAX_ENTRY_BYTES_BOUNDS: (f64, f64) = (64.0, 16.0 * 1024.0 * 1024.0);

/// Smallest TTL accepted by `set` (1 second).
pub const DEFAULT_STORE_MIN_TTL_SECS: u64 = 1;

/// Largest TTL accepted by `set` (1 day).
pub const DEFAULT_STORE_MAX_TTL_SECS: u64 = 86_400;

/// TTL used by `set` when the caller passes none (5 minutes).
pub const DEFAULT_STORE_DEFAULT_TTL_SECS: u64 = 300;

/// Default key namespace in the warm tier.
pub const DEFAULT_NAMESPACE: &str = "quotecache";

/// Default page size of warm-tier scans.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Bounds for `scan_page_size`.
pub const SCAN_PAGE_SIZE_BOUNDS: (f64, f64) = (10.0, 10_000.0);

/// Sliding window used for the store's recent error rate.
pub const ERROR_WINDOW_SIZE: usize = 100;

/// Hot occupancy ratio that raises `hot_tier_near_capacity`.
pub const HOT_NEAR_CAPACITY_RATIO: f64 = 0.9;

/// Recent error rate that raises `high_error_rate`.
pub const HIGH_ERROR_RATE: f64 = 0.1;

/// Interval of the store's expiry sweep (60 seconds).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// Optimizer Constants
// ============================================================================

/// Default smallest recommended batch size.
pub const DEFAULT_MIN_BATCH_SIZE: usize = 10;

/// Default largest recommended batch size.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Bounds shared by both batch size keys.
pub const BATCH_SIZE_BOUNDS: (f64, f64) = (1.0, 10_000.0);

/// Process memory ratio above which memory pressure is declared.
pub const DEFAULT_MEMORY_PRESSURE_THRESHOLD: f64 = 0.85;

/// Bounds for `memory_pressure_threshold`.
pub const MEMORY_PRESSURE_THRESHOLD_BOUNDS: (f64, f64) = (0.1, 0.99);

/// Interval of the optimizer recomputation loop (30 seconds).
pub const DEFAULT_OPTIMIZATION_INTERVAL_SECS: u64 = 30;

/// Bounds for `optimization_interval_secs`.
pub const OPTIMIZATION_INTERVAL_SECS_BOUNDS: (f64, f64) = (1.0, 3_600.0);

/// Number of task samples kept for latency trend detection.
pub const DEFAULT_DURATION_HISTORY_SIZE: usize = 100;

/// Bounds for `duration_history_size`.
pub const DURATION_HISTORY_SIZE_BOUNDS: (f64, f64) = (4.0, 10_000.0);

/// Absolute floor of the concurrency recommendation.
pub const MIN_RECOMMENDED_CONCURRENCY: usize = 2;

/// CPU utilisation above which concurrency shrinks.
pub const HIGH_CPU_UTILIZATION: f64 = 0.8;

/// CPU utilisation below which concurrency may grow.
pub const LOW_CPU_UTILIZATION: f64 = 0.5;

/// Task error rate above which concurrency shrinks.
pub const HIGH_TASK_ERROR_RATE: f64 = 0.2;

/// Task error rate below which concurrency may grow.
pub const LOW_TASK_ERROR_RATE: f64 = 0.05;

/// Recent/older average duration ratio that counts as rising latency.
pub const LATENCY_TREND_FACTOR: f64 = 1.5;

/// Share of hot entries shed on memory pressure.
pub const MEMORY_PRESSURE_SHED_FRACTION: f64 = 0.25;
