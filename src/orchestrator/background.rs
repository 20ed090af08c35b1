//! 后台刷新调度
//!
//! 任务按优先级排队，由分发循环在并发度允许时取出执行。每个键最多一个
//! 排队或执行中的任务，注册项在任何退出路径上都会被移除。

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{SetOptions, TieredCacheStore};
use crate::optimizer::PerformanceOptimizer;
use crate::orchestrator::request::FetchFn;
use crate::orchestrator::single_flight::SingleFlight;
use crate::telemetry::{BackgroundOutcome, CacheEvent, MetricsSink};

/// 后台刷新任务
#[derive(Clone)]
pub struct BackgroundTask {
    pub id: Uuid,
    pub cache_key: String,
    pub symbols: Vec<String>,
    pub priority: u32,
    pub fetch: FetchFn,
    /// 写回时使用的TTL，为空时使用存储默认TTL
    pub ttl: Option<Duration>,
    pub scheduled_at: DateTime<Utc>,
}

struct QueuedTask {
    task: BackgroundTask,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // 优先级高的先出；同优先级先入先出
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 后台刷新计数
#[derive(Debug, Default)]
pub(crate) struct BackgroundCounters {
    pub scheduled: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

/// 调度前检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision {
    Scheduled,
    ShuttingDown,
    AlreadyPending,
    TooSoon,
}

pub(crate) struct BackgroundUpdater {
    store: Arc<TieredCacheStore>,
    flights: Arc<SingleFlight>,
    optimizer: Arc<PerformanceOptimizer>,
    metrics: Arc<dyn MetricsSink>,
    fetch_timeout: Duration,
    min_update_interval: Duration,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    /// cache_key -> 任务id（排队或执行中）
    registered: DashMap<String, Uuid>,
    last_refresh: DashMap<String, Instant>,
    running: DashMap<Uuid, JoinHandle<()>>,
    active: AtomicUsize,
    seq: AtomicU64,
    accepting: AtomicBool,
    wake: Notify,
    idle: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    pub counters: BackgroundCounters,
}

impl BackgroundUpdater {
    pub fn new(
        store: Arc<TieredCacheStore>,
        flights: Arc<SingleFlight>,
        optimizer: Arc<PerformanceOptimizer>,
        metrics: Arc<dyn MetricsSink>,
        fetch_timeout: Duration,
        min_update_interval: Duration,
    ) -> Self {
        Self {
            store,
            flights,
            optimizer,
            metrics,
            fetch_timeout,
            min_update_interval,
            queue: Mutex::new(BinaryHeap::new()),
            registered: DashMap::new(),
            last_refresh: DashMap::new(),
            running: DashMap::new(),
            active: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            idle: Notify::new(),
            dispatcher: Mutex::new(None),
            counters: BackgroundCounters::default(),
        }
    }

    /// 注册任务
    pub fn schedule(&self, task: BackgroundTask) -> ScheduleDecision {
        if !self.accepting.load(Ordering::Acquire) {
            return self.skip(&task.cache_key, ScheduleDecision::ShuttingDown);
        }

        if let Some(last) = self.last_refresh.get(&task.cache_key) {
            if last.elapsed() < self.min_update_interval {
                drop(last);
                return self.skip(&task.cache_key, ScheduleDecision::TooSoon);
            }
        }

        match self.registered.entry(task.cache_key.clone()) {
            Entry::Occupied(_) => {
                return self.skip(&task.cache_key, ScheduleDecision::AlreadyPending);
            }
            Entry::Vacant(entry) => {
                entry.insert(task.id);
            }
        }

        debug!(
            "后台刷新已排队: key={}, priority={}, id={}",
            task.cache_key, task.priority, task.id
        );
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedTask { task, seq });
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record(&CacheEvent::Background(BackgroundOutcome::Scheduled));
        self.wake.notify_one();
        ScheduleDecision::Scheduled
    }

    /// 启动分发循环
    pub fn start(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let updater = self.clone();
        *dispatcher = Some(tokio::spawn(async move {
            loop {
                updater.dispatch_ready();
                updater.wake.notified().await;
            }
        }));
        debug!("后台刷新分发循环已启动");
    }

    /// 拒绝新任务，丢弃排队任务，等待执行中的任务直到超时，然后中止剩余任务
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        let dropped: Vec<QueuedTask> = self.queue.lock().drain().collect();
        for queued in &dropped {
            self.registered.remove(&queued.task.cache_key);
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        }
        if !dropped.is_empty() {
            info!("丢弃未开始的后台刷新: {}", dropped.len());
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let idle = self.idle.notified();
                if self.active.load(Ordering::Acquire) == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "后台刷新未在 {:?} 内完成，中止剩余 {} 个任务",
                grace,
                self.active.load(Ordering::Acquire)
            );
        }
        self.abort_all();
    }

    /// 中止所有任务与分发循环
    pub fn abort_all(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        for entry in self.running.iter() {
            entry.value().abort();
        }
        self.running.clear();
        self.registered.clear();
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.registered.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.registered.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn forget_refresh(&self, key: &str) {
        self.last_refresh.remove(key);
    }

    /// 移除已超过最小刷新间隔的记录，返回移除数
    pub fn prune_refresh_history(&self) -> usize {
        let before = self.last_refresh.len();
        self.last_refresh
            .retain(|_, at| at.elapsed() < self.min_update_interval);
        before.saturating_sub(self.last_refresh.len())
    }

    pub fn refresh_history_len(&self) -> usize {
        self.last_refresh.len()
    }

    fn skip(&self, key: &str, decision: ScheduleDecision) -> ScheduleDecision {
        debug!("跳过后台刷新: key={}, reason={:?}", key, decision);
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record(&CacheEvent::Background(BackgroundOutcome::Skipped));
        decision
    }

    fn dispatch_ready(self: &Arc<Self>) {
        self.running.retain(|_, handle| !handle.is_finished());
        self.prune_refresh_history();
        loop {
            let limit = self.optimizer.recommended_concurrency().max(1);
            if self.active.load(Ordering::Acquire) >= limit {
                return;
            }
            let Some(queued) = self.queue.lock().pop() else {
                return;
            };
            self.spawn_task(queued.task);
        }
    }

    fn spawn_task(self: &Arc<Self>, task: BackgroundTask) {
        self.active.fetch_add(1, Ordering::AcqRel);
        let id = task.id;
        let updater = self.clone();
        let handle = tokio::spawn(async move {
            let key = task.cache_key.clone();
            let _cleanup = scopeguard::guard(updater.clone(), move |updater| {
                updater.registered.remove(&key);
                if !updater.min_update_interval.is_zero() {
                    updater.last_refresh.insert(key, Instant::now());
                }
                updater.active.fetch_sub(1, Ordering::AcqRel);
                updater.wake.notify_one();
                updater.idle.notify_waiters();
            });
            updater.run_task(task).await;
        });
        self.running.insert(id, handle);
    }

    async fn run_task(&self, task: BackgroundTask) {
        let started = Instant::now();
        let fetch = task.fetch.clone();
        let (key, ttl) = (&task.cache_key, task.ttl);
        let outcome = self
            .flights
            .run(
                key,
                self.fetch_timeout,
                move || fetch(),
                |value| async move {
                    self.store.set(key, &value, SetOptions { ttl }).await
                },
            )
            .await;
        let elapsed = started.elapsed();

        let result = match (outcome.result, outcome.committed) {
            (Ok(_), Some(Err(e))) => Err(e),
            (result, _) => result.map(|_| ()),
        };

        self.optimizer.record_task(elapsed, result.is_ok());
        match result {
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record(&CacheEvent::Background(BackgroundOutcome::Completed));
                debug!(
                    "后台刷新完成: key={}, id={}, elapsed={:?}",
                    task.cache_key, task.id, elapsed
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record(&CacheEvent::Background(BackgroundOutcome::Failed));
                warn!(
                    "后台刷新失败: key={}, id={}, error={}",
                    task.cache_key, task.id, e
                );
            }
        }
    }
}

impl Drop for BackgroundUpdater {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}
