//! Inter-agent messenger: synchronous request/response between agents.
//!
//! Two operations:
//! - `request()`: resolve the target, deliver, and await the reply with a timeout
//! - `notify()`: resolve the target, hand off delivery, return immediately
//!
//! Neither creates a Job and neither retries.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agents::transport::{AgentMessage, MessageTransport};
use crate::config::MessengerConfig;
use crate::error::MessengerError;
use crate::store::AgentRegistry;

/// Outcome of `send()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageOutcome {
    /// The target replied.
    Replied { response: serde_json::Value },
    /// Handed off for best-effort delivery.
    Accepted,
}

pub struct Messenger {
    registry: Arc<dyn AgentRegistry>,
    transport: Arc<dyn MessageTransport>,
    config: MessengerConfig,
}

impl Messenger {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        transport: Arc<dyn MessageTransport>,
        config: MessengerConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Fail with `AgentNotFound` unless the target is registered. Read-only.
    async fn resolve(&self, agent: &str) -> Result<(), MessengerError> {
        match self.registry.get_agent(agent).await? {
            Some(_) => Ok(()),
            None => Err(MessengerError::AgentNotFound {
                name: agent.to_string(),
            }),
        }
    }

    /// Deliver and wait for the reply, bounded by the configured timeout.
    pub async fn request(&self, message: AgentMessage) -> Result<serde_json::Value, MessengerError> {
        self.request_with_timeout(message, self.config.request_timeout)
            .await
    }

    /// Deliver and wait for the reply, bounded by `timeout`.
    pub async fn request_with_timeout(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> Result<serde_json::Value, MessengerError> {
        self.resolve(&message.to_agent).await?;

        debug!(
            from = %message.from_agent,
            to = %message.to_agent,
            message_type = %message.message_type,
            transport = self.transport.name(),
            "Sending agent request"
        );

        match tokio::time::timeout(timeout, self.transport.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    from = %message.from_agent,
                    to = %message.to_agent,
                    timeout_ms = timeout.as_millis() as u64,
                    "Agent request timed out"
                );
                Err(MessengerError::MessageTimeout {
                    to: message.to_agent,
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget. Returns once delivery has been handed off.
    pub async fn notify(&self, message: AgentMessage) -> Result<(), MessengerError> {
        self.resolve(&message.to_agent).await?;

        info!(
            from = %message.from_agent,
            to = %message.to_agent,
            message_type = %message.message_type,
            "Notification handed off for delivery"
        );

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.deliver(&message)).await {
                Ok(Ok(_)) => debug!(to = %message.to_agent, "Notification delivered"),
                Ok(Err(e)) => warn!(to = %message.to_agent, error = %e, "Notification delivery failed"),
                Err(_) => warn!(to = %message.to_agent, "Notification delivery timed out"),
            }
        });

        Ok(())
    }

    /// Dispatch to `request` or `notify` depending on whether a reply is wanted.
    pub async fn send(
        &self,
        message: AgentMessage,
        requires_response: bool,
    ) -> Result<MessageOutcome, MessengerError> {
        if requires_response {
            let response = self.request(message).await?;
            Ok(MessageOutcome::Replied { response })
        } else {
            self.notify(message).await?;
            Ok(MessageOutcome::Accepted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::transport::{AgentHandler, LocalTransport};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Greeter;

    #[async_trait]
    impl AgentHandler for Greeter {
        async fn handle(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError> {
            Ok(json!({"reply": format!("hi {}", message.from_agent)}))
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl AgentHandler for Sleepy {
        async fn handle(&self, _message: &AgentMessage) -> Result<serde_json::Value, MessengerError> {
            tokio::time::sleep(self.0).await;
            Ok(json!("late"))
        }
    }

    struct Recorder(mpsc::UnboundedSender<AgentMessage>);

    #[async_trait]
    impl AgentHandler for Recorder {
        async fn handle(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError> {
            let _ = self.0.send(message.clone());
            Ok(serde_json::Value::Null)
        }
    }

    async fn messenger_with(
        agent: &str,
        handler: Arc<dyn AgentHandler>,
        timeout: Duration,
    ) -> (Messenger, Arc<InMemoryStore>) {
        let store = InMemoryStore::arc();
        store.upsert_agent_state(agent, json!({})).await.unwrap();
        let transport = Arc::new(LocalTransport::new());
        transport.register(agent, handler).await;
        let config = MessengerConfig {
            request_timeout: timeout,
            ..Default::default()
        };
        (Messenger::new(store.clone(), transport, config), store)
    }

    #[tokio::test]
    async fn request_returns_reply() {
        let (messenger, _) = messenger_with("b", Arc::new(Greeter), Duration::from_secs(1)).await;
        let reply = messenger
            .request(AgentMessage::new("a", "b", "hello"))
            .await
            .unwrap();
        assert_eq!(reply, json!({"reply": "hi a"}));
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found_and_mutates_nothing() {
        let (messenger, store) =
            messenger_with("b", Arc::new(Greeter), Duration::from_secs(1)).await;
        let before = store.list_agents().await.unwrap();

        let err = messenger
            .request(AgentMessage::new("a", "ghost", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::AgentNotFound { ref name } if name == "ghost"));

        let err = messenger
            .notify(AgentMessage::new("a", "ghost", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::AgentNotFound { .. }));

        assert_eq!(store.list_agents().await.unwrap(), before);
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn slow_reply_times_out() {
        let (messenger, _) = messenger_with(
            "b",
            Arc::new(Sleepy(Duration::from_millis(500))),
            Duration::from_millis(50),
        )
        .await;
        let err = messenger
            .request(AgentMessage::new("a", "b", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::MessageTimeout { .. }));
    }

    #[tokio::test]
    async fn notify_returns_before_delivery_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (messenger, _) =
            messenger_with("b", Arc::new(Recorder(tx)), Duration::from_secs(1)).await;

        let outcome = messenger
            .send(AgentMessage::new("a", "b", "ping").with_type("event"), false)
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Accepted);

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.message_type, "event");
    }
}
