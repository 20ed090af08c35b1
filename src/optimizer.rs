//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 性能优化器
//!
//! 根据进程资源使用情况和最近任务的耗时、错误率给出推荐并发度和批大小，
//! 并在内存压力下请求缓存释放热层条目。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OptimizerConfig;
use crate::constants::{
    HIGH_CPU_UTILIZATION, HIGH_TASK_ERROR_RATE, LATENCY_TREND_FACTOR, LOW_CPU_UTILIZATION,
    LOW_TASK_ERROR_RATE, MEMORY_PRESSURE_SHED_FRACTION, MIN_RECOMMENDED_CONCURRENCY,
};
use crate::telemetry::{CacheEvent, MetricsSink, NoopMetrics};

/// 内存压力下可以释放内存的组件
pub trait PressureRelief: Send + Sync {
    /// 释放 `fraction` 比例的条目，返回释放的条目数
    fn relieve(&self, fraction: f64) -> usize;
}

/// 一次资源采样
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceSample {
    /// CPU使用率 [0, 1]
    pub cpu_utilization: f64,
    /// 进程常驻内存（字节）
    pub process_memory_bytes: u64,
    /// 内存上限（字节），0 表示未知
    pub memory_limit_bytes: u64,
}

/// 资源探针
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// 基于 sysinfo 的系统资源探针
pub struct SystemResourceProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemResourceProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemResourceProbe {
    fn sample(&self) -> ResourceSample {
        let mut sys = self.system.lock();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_process(self.pid);

        let cpu_utilization = (sys.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        let process_memory_bytes = sys.process(self.pid).map(|p| p.memory()).unwrap_or(0);

        ResourceSample {
            cpu_utilization,
            process_memory_bytes,
            memory_limit_bytes: sys.total_memory(),
        }
    }
}

/// 优化器状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    /// 当前推荐并发度
    pub concurrency: usize,
    /// 按最近一次CPU使用率计算的批大小
    pub batch_size: usize,
    /// 累计内存压力事件数
    pub memory_pressure_events: u64,
    /// 平均任务耗时（毫秒）
    pub average_task_duration_ms: f64,
    /// 任务错误率
    pub error_rate: f64,
    /// 内存使用比例
    pub memory_ratio: f64,
    pub under_memory_pressure: bool,
}

#[derive(Debug, Clone, Copy)]
struct TaskRecord {
    duration: Duration,
    success: bool,
}

/// 性能优化器
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    /// 并发度上限（即 `max_concurrent_updates`）
    hard_cap: usize,
    probe: Arc<dyn ResourceProbe>,
    relief: Option<Arc<dyn PressureRelief>>,
    metrics: Arc<dyn MetricsSink>,
    concurrency: AtomicUsize,
    under_pressure: AtomicBool,
    memory_pressure_events: AtomicU64,
    history: Mutex<VecDeque<TaskRecord>>,
    last_sample: Mutex<ResourceSample>,
    optimization_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceOptimizer {
    /// 创建优化器，推荐并发度位于 `[2, hard_cap]`
    pub fn new(config: OptimizerConfig, hard_cap: usize) -> Self {
        let hard_cap = hard_cap.max(MIN_RECOMMENDED_CONCURRENCY);
        let history_size = config.duration_history_size;
        Self {
            config,
            hard_cap,
            probe: Arc::new(SystemResourceProbe::new()),
            relief: None,
            metrics: Arc::new(NoopMetrics),
            concurrency: AtomicUsize::new(hard_cap),
            under_pressure: AtomicBool::new(false),
            memory_pressure_events: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            last_sample: Mutex::new(ResourceSample::default()),
            optimization_handle: Mutex::new(None),
        }
    }

    /// 替换资源探针
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 设置内存压力释放方
    pub fn with_relief(mut self, relief: Arc<dyn PressureRelief>) -> Self {
        self.relief = Some(relief);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 重新计算推荐并发度
    pub fn calculate_optimal_concurrency(&self) -> usize {
        let sample = self.take_sample();
        let current = self.concurrency.load(Ordering::Relaxed);
        let error_rate = self.error_rate();
        let pressure = self.is_pressure(&sample);
        self.under_pressure.store(pressure, Ordering::Relaxed);

        let next = if pressure {
            current / 2
        } else if sample.cpu_utilization > HIGH_CPU_UTILIZATION
            || error_rate > HIGH_TASK_ERROR_RATE
            || self.latency_rising()
        {
            current.saturating_sub((current / 4).max(1))
        } else if sample.cpu_utilization < LOW_CPU_UTILIZATION && error_rate < LOW_TASK_ERROR_RATE {
            current + 1
        } else {
            current
        };

        let next = next.clamp(MIN_RECOMMENDED_CONCURRENCY, self.hard_cap);
        if next != current {
            debug!(
                "并发度调整: {} -> {} (cpu={:.2}, error_rate={:.2}, pressure={})",
                current, next, sample.cpu_utilization, error_rate, pressure
            );
        }
        self.concurrency.store(next, Ordering::Relaxed);
        next
    }

    /// 负载越高批越小，内存压力下使用最小批
    pub fn calculate_optimal_batch_size(&self, current_load: f64) -> usize {
        let (min, max) = (self.config.min_batch_size, self.config.max_batch_size.max(self.config.min_batch_size));
        if self.under_pressure.load(Ordering::Relaxed) {
            return min;
        }
        let load = if current_load.is_nan() { 1.0 } else { current_load.clamp(0.0, 1.0) };
        let shrink = ((max - min) as f64 * load).round() as usize;
        (max - shrink).clamp(min, max)
    }

    /// 检查进程内存是否超过阈值
    pub fn check_memory_pressure(&self) -> bool {
        let sample = self.take_sample();
        let pressure = self.is_pressure(&sample);
        self.under_pressure.store(pressure, Ordering::Relaxed);
        pressure
    }

    /// 处理内存压力：计数、释放热层、并发度减半。返回是否检测到压力
    pub fn handle_memory_pressure(&self) -> bool {
        if !self.check_memory_pressure() {
            return false;
        }

        let events = self.memory_pressure_events.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record(&CacheEvent::MemoryPressure);

        let released = self
            .relief
            .as_ref()
            .map_or(0, |relief| relief.relieve(MEMORY_PRESSURE_SHED_FRACTION));

        let current = self.concurrency.load(Ordering::Relaxed);
        let halved = (current / 2).clamp(MIN_RECOMMENDED_CONCURRENCY, self.hard_cap);
        self.concurrency.store(halved, Ordering::Relaxed);

        warn!(
            "检测到内存压力(第{}次): 释放条目={}, 并发度 {} -> {}",
            events, released, current, halved
        );
        true
    }

    /// 启动周期性优化
    pub fn start_optimization(self: &Arc<Self>, initial_concurrency: usize) {
        let initial = initial_concurrency.clamp(MIN_RECOMMENDED_CONCURRENCY, self.hard_cap);
        self.concurrency.store(initial, Ordering::Relaxed);

        let mut handle = self.optimization_handle.lock();
        if let Some(old) = handle.take() {
            old.abort();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.optimization_interval().max(Duration::from_secs(1));
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(optimizer) = weak.upgrade() else { break };
                if !optimizer.handle_memory_pressure() {
                    optimizer.calculate_optimal_concurrency();
                }
            }
        }));

        info!(
            "性能优化器已启动: initial_concurrency={}, interval={:?}",
            initial, interval
        );
    }

    /// 停止周期性优化
    pub fn stop_optimization(&self) {
        if let Some(handle) = self.optimization_handle.lock().take() {
            handle.abort();
            info!("性能优化器已停止");
        }
    }

    /// 记录一次任务
    pub fn record_task(&self, duration: Duration, success: bool) {
        let mut history = self.history.lock();
        if history.len() >= self.config.duration_history_size.max(1) {
            history.pop_front();
        }
        history.push_back(TaskRecord { duration, success });
    }

    /// 当前推荐并发度
    pub fn recommended_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let sample = *self.last_sample.lock();
        let average_task_duration_ms = {
            let history = self.history.lock();
            if history.is_empty() {
                0.0
            } else {
                history.iter().map(|r| r.duration.as_secs_f64() * 1000.0).sum::<f64>()
                    / history.len() as f64
            }
        };

        PerformanceSnapshot {
            concurrency: self.recommended_concurrency(),
            batch_size: self.calculate_optimal_batch_size(sample.cpu_utilization),
            memory_pressure_events: self.memory_pressure_events.load(Ordering::Relaxed),
            average_task_duration_ms,
            error_rate: self.error_rate(),
            memory_ratio: self.memory_ratio(&sample),
            under_memory_pressure: self.under_pressure.load(Ordering::Relaxed),
        }
    }

    fn take_sample(&self) -> ResourceSample {
        let sample = self.probe.sample();
        *self.last_sample.lock() = sample;
        sample
    }

    fn memory_ratio(&self, sample: &ResourceSample) -> f64 {
        let limit = self
            .config
            .memory_limit_bytes
            .unwrap_or(sample.memory_limit_bytes);
        if limit == 0 {
            0.0
        } else {
            sample.process_memory_bytes as f64 / limit as f64
        }
    }

    fn is_pressure(&self, sample: &ResourceSample) -> bool {
        self.memory_ratio(sample) >= self.config.memory_pressure_threshold
    }

    fn error_rate(&self) -> f64 {
        let history = self.history.lock();
        if history.is_empty() {
            0.0
        } else {
            history.iter().filter(|r| !r.success).count() as f64 / history.len() as f64
        }
    }

    /// 较新一半的平均耗时明显高于较旧一半
    fn latency_rising(&self) -> bool {
        let history = self.history.lock();
        if history.len() < 4 {
            return false;
        }
        let secs: Vec<f64> = history.iter().map(|r| r.duration.as_secs_f64()).collect();
        let (older, recent) = secs.split_at(secs.len() / 2);
        let older = older.iter().sum::<f64>() / older.len() as f64;
        let recent = recent.iter().sum::<f64>() / recent.len() as f64;
        older > 0.0 && recent > older * LATENCY_TREND_FACTOR
    }
}

impl Drop for PerformanceOptimizer {
    fn drop(&mut self) {
        if let Some(handle) = self.optimization_handle.lock().take() {
            handle.abort();
        }
    }
}
