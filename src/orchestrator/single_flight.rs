//! 按键合并并发获取
//!
//! 同一个键同时只有一个上游获取，其他调用方订阅结果。注册项在获取结束、
//! 失败、超时或被取消时都会被移除。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

use crate::error::CacheError;

pub(crate) type FlightResult = Result<Value, CacheError>;

/// 一次获取的结果
#[derive(Debug)]
pub(crate) struct FlightOutcome<T> {
    pub result: FlightResult,
    /// 是否复用了其他调用方的获取
    pub joined: bool,
    /// 发起方提交步骤的输出，仅在获取成功时存在
    pub committed: Option<T>,
}

#[derive(Default)]
pub(crate) struct SingleFlight {
    pending: DashMap<String, watch::Sender<Option<FlightResult>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// 执行或加入 `key` 的获取
    ///
    /// `timeout` 约束上游获取。获取成功后发起方在仍持有注册项时执行 `commit`
    /// （通常是写入存储），期间到达的调用方加入本次获取而不会再次访问上游。
    pub async fn run<F, Fut, C, CFut, T>(
        &self,
        key: &str,
        timeout: Duration,
        fetch: F,
        commit: C,
    ) -> FlightOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
        C: FnOnce(Value) -> CFut,
        CFut: Future<Output = T>,
    {
        let tx = match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                trace!("加入正在进行的获取: key={}", key);
                let mut rx = entry.get().subscribe();
                drop(entry);
                return FlightOutcome {
                    result: Self::wait(key, &mut rx).await,
                    joined: true,
                    committed: None,
                };
            }
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(None);
                entry.insert(tx.clone());
                tx
            }
        };

        let _registration = scopeguard::guard((), |_| {
            self.pending.remove(key);
        });

        let result = match tokio::time::timeout(timeout, fetch()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::upstream(&e)),
            Err(_) => Err(CacheError::Timeout(format!(
                "获取超时: key={}, timeout={:?}",
                key, timeout
            ))),
        };

        let _ = tx.send(Some(result.clone()));
        let committed = match &result {
            Ok(value) => Some(commit(value.clone()).await),
            Err(_) => None,
        };
        FlightOutcome {
            result,
            joined: false,
            committed,
        }
    }

    async fn wait(key: &str, rx: &mut watch::Receiver<Option<FlightResult>>) -> FlightResult {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // 发起方在给出结果前被取消
                return Err(CacheError::UpstreamFetch(format!(
                    "获取在完成前被取消: key={}",
                    key
                )));
            }
        }
    }

    /// 正在进行的获取数
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let flights = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let flights = flights.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    flights
                        .run("quote:AAPL", Duration::from_secs(1), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(json!({"price": 190.5}))
                        }, |_| async {})
                        .await
                })
            })
            .collect();

        let outcomes = futures::future::join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.as_ref().unwrap().joined).count(), 1);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().result.unwrap(), json!({"price": 190.5}));
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinguishable() {
        let flights = SingleFlight::new();
        let outcome = flights
            .run("slow", Duration::from_millis(100), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(1))
            }, |_| async {})
            .await;
        assert!(matches!(outcome.result, Err(CacheError::Timeout(_))));
        assert!(!flights.is_in_flight("slow"));
    }

    #[tokio::test]
    async fn test_failure_releases_registration() {
        let flights = SingleFlight::new();
        let outcome = flights
            .run(
                "bad",
                Duration::from_secs(1),
                || async { Err(anyhow::anyhow!("上游500")) },
                |_| async {},
            )
            .await;
        assert!(outcome.committed.is_none());
        match outcome.result {
            Err(CacheError::UpstreamFetch(msg)) => assert!(msg.contains("上游500")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!flights.is_in_flight("bad"));
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_registration() {
        let flights = Arc::new(SingleFlight::new());
        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!(1))
                    }, |_| async {})
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(flights.is_in_flight("k"));

        leader.abort();
        let _ = leader.await;
        assert!(!flights.is_in_flight("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_during_commit_joins_instead_of_fetching() {
        let flights = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flights = flights.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flights
                    .run(
                        "quote:AAPL",
                        Duration::from_secs(1),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!(1))
                        },
                        |value| async move {
                            // 模拟较慢的存储写入
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            value
                        },
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flights.is_in_flight("quote:AAPL"));

        let late = flights
            .run(
                "quote:AAPL",
                Duration::from_secs(1),
                || async { Ok(json!(2)) },
                |_| async {},
            )
            .await;
        assert!(late.joined);
        assert_eq!(late.result.unwrap(), json!(1));

        let leader = leader.await.unwrap();
        assert_eq!(leader.committed, Some(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight("quote:AAPL"));
    }
}
