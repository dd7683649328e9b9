//! Agents: naming rules and the inter-agent messaging path.

pub mod messenger;
pub mod transport;

use std::sync::LazyLock;

use regex::Regex;

pub use messenger::{MessageOutcome, Messenger};
pub use transport::{AgentHandler, AgentMessage, HttpTransport, LocalTransport, MessageTransport};

static AGENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").unwrap());

/// Check an agent name against the allowed character set and length.
pub fn validate_agent_name(name: &str) -> Result<(), String> {
    if AGENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "invalid agent name {name:?}: expected 1-64 characters of [A-Za-z0-9_.-]"
        ))
    }
}
