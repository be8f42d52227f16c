//! Periodic snapshots of the execution store for live displays.
//!
//! A subscription owns its polling task: dropping it (or calling `stop`)
//! cancels the task, so no timer outlives its consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::{ExecutionFilter, ExecutionRecord, ExecutionStats, ExecutionStore};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub executions: Vec<ExecutionRecord>,
    pub stats: ExecutionStats,
    pub taken_at: DateTime<Utc>,
}

/// Receiving end of a polling task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub type DashboardSubscription = Subscription<DashboardSnapshot>;

impl<T> Subscription<T> {
    /// Next value, or `None` once the task has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Subscription<DashboardSnapshot> {
    /// Sends a fresh list and stats for `filter` every `period`.
    pub fn spawn(store: Arc<ExecutionStore>, filter: ExecutionFilter, period: Duration) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = match take_snapshot(&store, &filter) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("[DASH] Snapshot failed: {}", e);
                        continue;
                    }
                };

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    sent = tx.send(snapshot) => if sent.is_err() { break },
                }
            }
            debug!("[DASH] Dashboard polling stopped");
        });

        Self {
            rx,
            cancel,
            handle: Some(handle),
        }
    }
}

fn take_snapshot(
    store: &ExecutionStore,
    filter: &ExecutionFilter,
) -> Result<DashboardSnapshot, crate::error::AppError> {
    Ok(DashboardSnapshot {
        executions: store.list(filter)?,
        stats: store.stats(filter)?,
        taken_at: Utc::now(),
    })
}

/// Polls one record every `period` and stops after sending a terminal state
/// (or when the record disappears).
pub fn watch_execution(
    store: Arc<ExecutionStore>,
    id: impl Into<String>,
    period: Duration,
) -> Subscription<ExecutionRecord> {
    let id = id.into();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let record = match store.get(&id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("[DASH] {} no longer exists", id);
                    break;
                }
                Err(e) => {
                    warn!("[DASH] Failed to read {}: {}", id, e);
                    continue;
                }
            };
            let terminal = record.status.is_terminal();

            tokio::select! {
                _ = task_cancel.cancelled() => break,
                sent = tx.send(record) => if sent.is_err() { break },
            }
            if terminal {
                break;
            }
        }
        debug!("[DASH] Watch of {} stopped", id);
    });

    Subscription {
        rx,
        cancel,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ExecutionStatus, NewExecution};
    use serde_json::json;

    fn store_with_one() -> (Arc<ExecutionStore>, String) {
        let store = Arc::new(ExecutionStore::in_memory());
        let record = store
            .create(NewExecution {
                workflow_id: "loop-over-rows".into(),
                input_data: json!({}),
                ..Default::default()
            })
            .unwrap();
        (store, record.id)
    }

    #[tokio::test]
    async fn dashboard_sends_snapshots() {
        let (store, id) = store_with_one();
        let mut sub = DashboardSubscription::spawn(
            store.clone(),
            ExecutionFilter::default(),
            Duration::from_millis(10),
        );

        let first = sub.recv().await.expect("snapshot");
        assert_eq!(first.stats.total, 1);
        assert_eq!(first.stats.queued, 1);
        assert_eq!(first.executions[0].id, id);

        store.begin(&id).unwrap();
        let mut running = 0;
        for _ in 0..20 {
            let snapshot = sub.recv().await.expect("snapshot");
            running = snapshot.stats.running;
            if running == 1 {
                break;
            }
        }
        assert_eq!(running, 1);
        sub.stop().await;
    }

    #[tokio::test]
    async fn dropping_subscription_stops_task() {
        let (store, _) = store_with_one();
        let sub = DashboardSubscription::spawn(
            store.clone(),
            ExecutionFilter::default(),
            Duration::from_millis(10),
        );
        assert_eq!(Arc::strong_count(&store), 2);

        drop(sub);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn watch_stops_at_terminal_status() {
        let (store, id) = store_with_one();
        let mut watch = watch_execution(store.clone(), id.clone(), Duration::from_millis(10));

        let first = watch.recv().await.expect("first");
        assert_eq!(first.status, ExecutionStatus::Queued);

        store.cancel(&id).unwrap();

        let mut last = first;
        while let Some(record) = watch.recv().await {
            last = record;
        }
        assert_eq!(last.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn watch_ends_when_record_is_removed() {
        let (store, id) = store_with_one();
        store.remove(&id).unwrap();

        let mut watch = watch_execution(store, id, Duration::from_millis(10));
        assert!(watch.recv().await.is_none());
    }
}
