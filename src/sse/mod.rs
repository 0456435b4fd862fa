use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// Queue depth per subscriber. A slow or disconnected consumer stalls here
/// rather than ever blocking a dispatch/completion path.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Fan-out registry for `GET /jobs/events` SSE subscribers, keyed by
/// `user_id`. Mirrors the teacher's `cache::WorkflowCache` Arc<RwLock<HashMap>>
/// shape, generalized from a TTL cache to a multi-sender broadcast map.
#[derive(Clone)]
pub struct SseRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
}

impl SseRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a new subscriber for `user_id` and returns the receiving
    /// half. The caller is responsible for deregistering on stream close.
    pub async fn subscribe(&self, user_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut guard = self.inner.write().await;
        guard.entry(user_id.to_string()).or_default().push(tx);
        rx
    }

    /// Publishes an event to every live subscriber for `user_id`. Never
    /// blocks: a full queue just drops the event for that subscriber,
    /// matching the Python original's `put_nowait` fire-and-forget publish.
    pub async fn publish(&self, user_id: &str, event: Value) {
        let mut guard = self.inner.write().await;
        if let Some(senders) = guard.get_mut(user_id) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                guard.remove(user_id);
            }
        }
    }
}

impl Default for SseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let registry = SseRegistry::new();
        let mut rx = registry.subscribe("user-1").await;
        registry.publish("user-1", serde_json::json!({"status": "completed"})).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event["status"], "completed");
    }

    #[tokio::test]
    async fn publish_to_unknown_user_is_a_noop() {
        let registry = SseRegistry::new();
        registry.publish("nobody-subscribed", serde_json::json!({"x": 1})).await;
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let registry = SseRegistry::new();
        let rx = registry.subscribe("user-1").await;
        drop(rx);
        registry.publish("user-1", serde_json::json!({"x": 1})).await;
        assert!(registry.inner.read().await.get("user-1").is_none());
    }
}
