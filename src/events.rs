use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Chat turn an event belongs to. Only built when the request metadata
/// carries all three ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTarget {
    pub session_id: String,
    pub chat_id: String,
    pub message_id: String,
}

impl EventTarget {
    pub fn from_metadata(metadata: &Value) -> Option<Self> {
        let field = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Some(Self {
            session_id: field("session_id")?,
            chat_id: field("chat_id")?,
            message_id: field("message_id")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub target: EventTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EventCallError {
    #[error("no subscriber is listening for events")]
    NoSubscriber,
    #[error("event call timed out")]
    Timeout,
    #[error("event call was dropped before a reply arrived")]
    Dropped,
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EventEnvelope>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    call_timeout: Duration,
}

impl EventHub {
    pub fn new(capacity: usize, call_timeout: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            pending: Arc::new(DashMap::new()),
            call_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn emitter(&self, target: EventTarget) -> EventEmitter {
        EventEmitter {
            hub: self.clone(),
            target,
        }
    }

    pub fn caller(&self, target: EventTarget) -> EventCaller {
        EventCaller {
            hub: self.clone(),
            target,
        }
    }

    /// Delivers the reply to a pending event call. Returns false when no call
    /// with that id is waiting.
    pub fn respond(&self, call_id: &str, reply: Value) -> bool {
        match self.pending.remove(call_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(300))
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    hub: EventHub,
    target: EventTarget,
}

impl EventEmitter {
    pub fn target(&self) -> &EventTarget {
        &self.target
    }

    pub async fn emit(&self, data: Value) {
        let envelope = EventEnvelope {
            target: self.target.clone(),
            call_id: None,
            data,
        };
        if self.hub.tx.send(envelope).is_err() {
            tracing::debug!(
                chat_id = %self.target.chat_id,
                message_id = %self.target.message_id,
                "event dropped, no subscribers"
            );
        }
    }
}

#[derive(Clone)]
pub struct EventCaller {
    hub: EventHub,
    target: EventTarget,
}

impl EventCaller {
    pub async fn call(&self, data: Value) -> Result<Value, EventCallError> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub.pending.insert(call_id.clone(), reply_tx);
        // Dropped on every exit, including cancellation of this future.
        let _pending = PendingCall {
            pending: &self.hub.pending,
            call_id: &call_id,
        };
        let envelope = EventEnvelope {
            target: self.target.clone(),
            call_id: Some(call_id.clone()),
            data,
        };
        if self.hub.tx.send(envelope).is_err() {
            return Err(EventCallError::NoSubscriber);
        }
        let outcome = tokio::time::timeout(self.hub.call_timeout, reply_rx).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EventCallError::Dropped),
            Err(_) => Err(EventCallError::Timeout),
        }
    }
}

/// Removes a call's reply slot from the pending table when dropped.
struct PendingCall<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Value>>,
    call_id: &'a str,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> EventTarget {
        EventTarget::from_metadata(&json!({
            "session_id": "s", "chat_id": "c", "message_id": "m"
        }))
        .expect("target")
    }

    #[test]
    fn target_requires_all_three_ids() {
        assert!(EventTarget::from_metadata(&json!({"chat_id": "c", "message_id": "m"})).is_none());
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        hub.emitter(target()).emit(json!({"type": "status"})).await;
        let envelope = rx.recv().await.expect("event");
        assert_eq!(envelope.target.chat_id, "c");
        assert_eq!(envelope.data["type"], "status");
        assert!(envelope.call_id.is_none());
    }

    #[tokio::test]
    async fn event_call_returns_reply() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let responder = hub.clone();
        tokio::spawn(async move {
            let envelope = rx.recv().await.expect("event");
            let call_id = envelope.call_id.expect("call id");
            responder.respond(&call_id, json!({"confirmed": true}));
        });
        let reply = hub.caller(target()).call(json!({"type": "confirm"})).await;
        assert_eq!(reply.unwrap(), json!({"confirmed": true}));
    }

    #[tokio::test]
    async fn event_call_without_subscribers_fails_fast() {
        let hub = EventHub::default();
        let err = hub.caller(target()).call(json!({})).await.unwrap_err();
        assert!(matches!(err, EventCallError::NoSubscriber));
    }

    #[tokio::test]
    async fn event_call_times_out() {
        let hub = EventHub::new(8, Duration::from_millis(20));
        let _rx = hub.subscribe();
        let err = hub.caller(target()).call(json!({})).await.unwrap_err();
        assert!(matches!(err, EventCallError::Timeout));
    }

    #[tokio::test]
    async fn aborted_call_releases_its_pending_slot() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let caller = hub.caller(target());
        let task = tokio::spawn(async move { caller.call(json!({"type": "input"})).await });

        rx.recv().await.expect("event");
        assert_eq!(hub.pending.len(), 1);

        task.abort();
        let _ = task.await;
        assert!(hub.pending.is_empty());
    }

    #[tokio::test]
    async fn answered_and_timed_out_calls_leave_nothing_pending() {
        let hub = EventHub::new(8, Duration::from_millis(20));
        let _rx = hub.subscribe();
        let _ = hub.caller(target()).call(json!({})).await;
        assert!(hub.pending.is_empty());
    }
}
