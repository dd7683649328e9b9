//! Message transports: how an envelope actually reaches the target agent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::MessengerError;

/// Default `message_type` when the caller gives none.
pub const DEFAULT_MESSAGE_TYPE: &str = "direct";

/// An inter-agent message. Exists only for one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from_agent: String,
    pub to_agent: String,
    pub message: serde_json::Value,
    pub message_type: String,
}

impl AgentMessage {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message: message.into(),
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
        }
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }
}

/// Delivers a message and returns the target's reply.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError>;
}

/// Handles messages for one in-process agent.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError>;
}

/// POSTs envelopes to `{endpoint}/agents/{to_agent}/messages`.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn message_url(&self, agent: &str) -> String {
        format!("{}/agents/{agent}/messages", self.endpoint)
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError> {
        let failed = |reason: String| MessengerError::DeliveryFailed {
            to: message.to_agent.clone(),
            reason,
        };

        let resp = self
            .client
            .post(self.message_url(&message.to_agent))
            .json(message)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| failed(e.to_string()))?;
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}: {body}")));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| failed(format!("invalid JSON reply: {e}")))
    }
}

/// Routes messages to handlers registered in this process.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for an agent name.
    pub async fn register(&self, agent: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        let agent = agent.into();
        tracing::debug!(agent = %agent, "Registered local agent handler");
        self.handlers.write().await.insert(agent, handler);
    }

    pub async fn unregister(&self, agent: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.write().await.remove(agent)
    }
}

#[async_trait]
impl MessageTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn deliver(&self, message: &AgentMessage) -> Result<serde_json::Value, MessengerError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&message.to_agent)
            .cloned()
            .ok_or_else(|| MessengerError::DeliveryFailed {
                to: message.to_agent.clone(),
                reason: "no local handler registered".to_string(),
            })?;
        handler.handle(message).await
    }
}
