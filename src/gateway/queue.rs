//! Per-WS-client message queue (§3, §4.5): a FIFO with a single in-flight
//! drain, bounded retries, and linear backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const MAX_RETRIES: u32 = 3;

struct QueueItem {
    payload: serde_json::Value,
    attempts: u32,
}

/// The queue and the "somebody is draining" flag share one lock so the
/// decision to (not) spawn a drain task is atomic with the queue's
/// contents — otherwise an `enqueue` landing between the drain loop's last
/// empty `pop_front` and its flag clear would strand its item until the
/// next unrelated `enqueue`.
#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    draining: bool,
}

/// `enqueue` returns immediately; draining happens on at most one task at a
/// time, matching §5's "callers return immediately after appending;
/// draining runs on one task".
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState::default()) }
    }

    /// Append `payload` and, if nobody is already draining, spawn a drain
    /// loop that calls `process` for each item until `process` succeeds or
    /// `MAX_RETRIES` is exhausted.
    pub async fn enqueue<F, Fut>(self: &Arc<Self>, payload: serde_json::Value, process: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send,
    {
        let should_spawn = {
            let mut state = self.state.lock().await;
            state.items.push_back(QueueItem { payload, attempts: 0 });
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if !should_spawn {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.drain(process).await });
    }

    async fn drain<F, Fut>(&self, process: F)
    where
        F: Fn(serde_json::Value) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.items.pop_front() {
                    Some(item) => Some(item),
                    None => {
                        state.draining = false;
                        None
                    }
                }
            };
            let Some(mut item) = next else { break };

            loop {
                match process(item.payload.clone()).await {
                    Ok(()) => break,
                    Err(_err) if item.attempts + 1 >= MAX_RETRIES => break,
                    Err(_err) => {
                        item.attempts += 1;
                        tokio::time::sleep(Duration::from_secs(item.attempts as u64)).await;
                    }
                }
            }
        }
    }

    /// Cancel pending work (closing client WS, §5 "Cancellation").
    pub async fn clear(&self) {
        self.state.lock().await.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn succeeding_item_runs_once() {
        let queue = Arc::new(MessageQueue::new());
        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());
        let calls2 = calls.clone();
        let done2 = done.clone();
        queue
            .enqueue(serde_json::json!({"a": 1}), move |_| {
                let calls = calls2.clone();
                let done = done2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    done.notify_one();
                    Ok(())
                }
            })
            .await;
        done.notified().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_item_stops_after_max_retries() {
        let queue = Arc::new(MessageQueue::new());
        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());
        let calls2 = calls.clone();
        let done2 = done.clone();
        queue
            .enqueue(serde_json::json!({"a": 1}), move |_| {
                let calls = calls2.clone();
                let done = done2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= MAX_RETRIES {
                        done.notify_one();
                    }
                    Err("boom".to_string())
                }
            })
            .await;
        done.notified().await;
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
    }

    /// An item enqueued while the drain loop is mid-flight (racing its
    /// empty-check-and-clear-flag step) must still be picked up rather than
    /// stranded until some unrelated future enqueue.
    #[tokio::test]
    async fn item_enqueued_during_a_drain_in_progress_is_not_stranded() {
        let queue = Arc::new(MessageQueue::new());
        let calls = Arc::new(AtomicU32::new(0));
        let started = Arc::new(Notify::new());
        let done = Arc::new(Notify::new());

        let calls2 = calls.clone();
        let started2 = started.clone();
        queue
            .enqueue(serde_json::json!({"a": 1}), move |_| {
                let calls = calls2.clone();
                let started = started2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    started.notify_one();
                    Ok(())
                }
            })
            .await;

        started.notified().await;

        let calls3 = calls.clone();
        let done3 = done.clone();
        queue
            .enqueue(serde_json::json!({"a": 2}), move |_| {
                let calls = calls3.clone();
                let done = done3.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    done.notify_one();
                    Ok(())
                }
            })
            .await;

        done.notified().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
