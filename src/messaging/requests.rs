use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, SlicerError};
use crate::messaging::protocol::Message;

/// Handler for an incoming request. Receives the peer id and the message;
/// the returned value becomes the response payload when one is expected.
pub type MessageHandler = Arc<dyn Fn(&str, &Message) -> Option<Value> + Send + Sync>;

/// Named request handlers registered on a messenger.
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: Arc<Mutex<HashMap<String, MessageHandler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&self, message: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Message) -> Option<Value> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.into(), Arc::new(handler));
    }

    pub fn get(&self, message: &str) -> Option<MessageHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message)
            .cloned()
    }

    /// Run the handler for `msg` and build the reply if the sender waits on one.
    pub fn dispatch(&self, peer: &str, msg: &Message) -> Option<Message> {
        match self.get(&msg.message) {
            Some(handler) => {
                let payload = handler(peer, msg);
                msg.response
                    .then(|| msg.respond(payload.unwrap_or_else(|| Value::Object(Default::default()))))
            }
            None => {
                tracing::debug!(message = %msg.message, peer = %peer, "No handler registered");
                msg.response
                    .then(|| msg.respond_error(format!("no handler for {}", msg.message)))
            }
        }
    }
}

struct Waiter {
    owner: String,
    tx: oneshot::Sender<Message>,
}

/// Requests waiting on a response, keyed by message id.
///
/// Each waiter is tagged with the peer it was sent to so every request bound
/// to a dead connection can be failed at once.
#[derive(Clone, Default)]
pub struct PendingResponses {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, msg_id: &str, owner: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                msg_id.to_string(),
                Waiter {
                    owner: owner.to_string(),
                    tx,
                },
            );
        rx
    }

    /// Hand a response to its waiter. Returns false for unknown or late responses.
    pub fn resolve(&self, response: Message) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.msg_id);
        match waiter {
            Some(waiter) => waiter.tx.send(response).is_ok(),
            None => {
                tracing::debug!(msg_id = %response.msg_id, "Dropping response with no waiter");
                false
            }
        }
    }

    pub fn cancel(&self, msg_id: &str) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(msg_id);
    }

    /// Fail every request sent to `owner`.
    pub fn drop_owner(&self, owner: &str) -> usize {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = waiters.len();
        waiters.retain(|_, waiter| waiter.owner != owner);
        before - waiters.len()
    }

    pub fn clear(&self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the response to `msg_id`, surfacing remote errors.
    pub async fn wait(
        &self,
        msg_id: &str,
        rx: oneshot::Receiver<Message>,
        message: &str,
        timeout: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(SlicerError::Remote {
                    message: message.to_string(),
                    error,
                }),
                None => Ok(response),
            },
            Ok(Err(_)) => Err(SlicerError::Closed),
            Err(_) => {
                self.cancel(msg_id);
                Err(SlicerError::Timeout {
                    message: message.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::protocol::names;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_matching_response() {
        let pending = PendingResponses::new();
        let request = Message::request(names::PING, Value::Null);
        let rx = pending.register(&request.msg_id, "w1");

        assert!(pending.resolve(request.respond(json!({"pong": true}))));
        let response = pending
            .wait(&request.msg_id, rx, names::PING, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response.payload["pong"], true);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn times_out_and_forgets_waiter() {
        let pending = PendingResponses::new();
        let request = Message::request(names::SLICE_NEW, Value::Null);
        let rx = pending.register(&request.msg_id, "w1");

        let err = pending
            .wait(&request.msg_id, rx, names::SLICE_NEW, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SlicerError::Timeout { timeout_ms: 20, .. }));
        assert!(pending.is_empty());
        assert!(!pending.resolve(request.respond(Value::Null)));
    }

    #[tokio::test]
    async fn remote_errors_are_surfaced() {
        let pending = PendingResponses::new();
        let request = Message::request(names::SLICE_COMPLETE, Value::Null);
        let rx = pending.register(&request.msg_id, "w1");
        pending.resolve(request.respond_error("nope"));

        let err = pending
            .wait(&request.msg_id, rx, names::SLICE_COMPLETE, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SlicerError::Remote { ref error, .. } if error == "nope"));
    }

    #[tokio::test]
    async fn dropping_owner_fails_its_requests() {
        let pending = PendingResponses::new();
        let first = Message::request(names::SLICE_NEW, Value::Null);
        let second = Message::request(names::SLICE_NEW, Value::Null);
        let rx1 = pending.register(&first.msg_id, "w1");
        let _rx2 = pending.register(&second.msg_id, "w2");

        assert_eq!(pending.drop_owner("w1"), 1);
        let err = pending
            .wait(&first.msg_id, rx1, names::SLICE_NEW, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SlicerError::Closed));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn handlers_reply_only_when_asked() {
        let handlers = Handlers::new();
        handlers.insert("echo", |peer, msg| Some(json!({"peer": peer, "got": msg.payload})));

        let request = Message::request("echo", json!(1));
        let reply = handlers.dispatch("w1", &request).unwrap();
        assert_eq!(reply.payload, json!({"peer": "w1", "got": 1}));

        let volatile = Message::volatile("echo", json!(1));
        assert!(handlers.dispatch("w1", &volatile).is_none());

        let unknown = Message::request("missing", Value::Null);
        let reply = handlers.dispatch("w1", &unknown).unwrap();
        assert!(reply.error.is_some());
    }
}
