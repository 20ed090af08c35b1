//! 自适应TTL的数据变化跟踪

use ahash::AHasher;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

use crate::strategy::AdaptiveConfig;

/// 窗口内变化次数达到该值视为频繁变化
const FREQUENT_CHANGE_COUNT: usize = 2;
/// 窗口内观察次数达到该值且没有变化视为稳定
const STABLE_OBSERVATION_COUNT: usize = 3;

/// 键在观察窗口内的活跃程度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeActivity {
    Unknown,
    Frequent,
    Normal,
    Stable,
}

#[derive(Debug)]
struct ChangeHistory {
    last_hash: u64,
    observations: VecDeque<Instant>,
    changes: VecDeque<Instant>,
}

impl ChangeHistory {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .observations
            .front()
            .map_or(false, |at| now.duration_since(*at) > window)
        {
            self.observations.pop_front();
        }
        while self
            .changes
            .front()
            .map_or(false, |at| now.duration_since(*at) > window)
        {
            self.changes.pop_front();
        }
    }
}

/// 记录每个键获取结果的内容哈希
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    entries: DashMap<String, ChangeHistory>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次获取结果，返回内容是否与上次不同
    pub fn observe(&self, key: &str, value: &Value, window: Duration) -> bool {
        let hash = content_hash(value);
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| ChangeHistory {
                last_hash: hash,
                observations: VecDeque::new(),
                changes: VecDeque::new(),
            });

        entry.prune(now, window);
        let changed = !entry.observations.is_empty() && entry.last_hash != hash;
        if changed {
            entry.changes.push_back(now);
        }
        entry.last_hash = hash;
        entry.observations.push_back(now);
        changed
    }

    pub fn activity(&self, key: &str, window: Duration) -> ChangeActivity {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return ChangeActivity::Unknown;
        };
        entry.prune(Instant::now(), window);

        if entry.changes.len() >= FREQUENT_CHANGE_COUNT {
            ChangeActivity::Frequent
        } else if entry.changes.is_empty() && entry.observations.len() >= STABLE_OBSERVATION_COUNT {
            ChangeActivity::Stable
        } else if entry.observations.is_empty() {
            ChangeActivity::Unknown
        } else {
            ChangeActivity::Normal
        }
    }

    pub fn forget(&self, key: &str) {
        self.entries.remove(key);
    }

    /// 清除窗口外已无观察记录的键
    pub fn sweep(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, history| {
            history.prune(now, window);
            !history.observations.is_empty()
        });
        before - self.entries.len()
    }
}

/// 计算自适应TTL
///
/// 开市除以调整因子，休市乘以调整因子；启用变化检测时频繁变化再缩短，
/// 稳定数据再延长。结果限制在 `[min_ttl, max_ttl]`。
pub(crate) fn adaptive_ttl(config: &AdaptiveConfig, market_open: bool, activity: ChangeActivity) -> Duration {
    let factor = config.adaptation_factor.max(1.0);
    let mut secs = config.base_ttl_secs as f64;
    if market_open {
        secs /= factor;
    } else {
        secs *= factor;
    }
    match activity {
        ChangeActivity::Frequent => secs /= factor,
        ChangeActivity::Stable => secs *= factor,
        ChangeActivity::Normal | ChangeActivity::Unknown => {}
    }
    Duration::from_secs(config.clamp_ttl_secs(secs))
}

fn content_hash(value: &Value) -> u64 {
    let mut hasher = AHasher::default();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}
