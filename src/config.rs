//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default poll interval: 5 seconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default AI worker endpoint.
const DEFAULT_WORKER_ENDPOINT: &str = "http://127.0.0.1:8000/process";

/// Job processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Delay between poll ticks. Also the effective retry delay.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Attempts a job gets before it is marked failed.
    pub max_retries: u32,
    /// AI worker URL that `ai` tasks are POSTed to.
    pub worker_endpoint: String,
    /// Per-request bound on the AI worker call.
    #[serde(with = "duration_ms")]
    pub ai_timeout: Duration,
    /// Maximum jobs executing at once within a tick.
    pub max_concurrent: usize,
    /// Restrict the processor to jobs addressed to one agent.
    pub agent: Option<String>,
    /// Requeue or fail jobs left `processing` by a previous run on start.
    pub recover_orphans: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_retries: 3,
            worker_endpoint: DEFAULT_WORKER_ENDPOINT.to_string(),
            ai_timeout: Duration::from_secs(30),
            max_concurrent: 4,
            agent: None,
            recover_orphans: true,
        }
    }
}

impl ProcessorConfig {
    /// Build from `AGENT_QUEUE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_interval = env_parse::<u64>("AGENT_QUEUE_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let max_retries = env_parse::<u32>("AGENT_QUEUE_MAX_RETRIES")
            .unwrap_or(defaults.max_retries)
            .max(1);

        let worker_endpoint = std::env::var("AGENT_QUEUE_WORKER_ENDPOINT")
            .unwrap_or(defaults.worker_endpoint);

        let ai_timeout = env_parse::<u64>("AGENT_QUEUE_AI_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.ai_timeout);

        let max_concurrent = env_parse::<usize>("AGENT_QUEUE_MAX_CONCURRENT")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_concurrent);

        let agent = std::env::var("AGENT_QUEUE_AGENT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            poll_interval,
            max_retries,
            worker_endpoint,
            ai_timeout,
            max_concurrent,
            agent,
            recover_orphans: defaults.recover_orphans,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// At least one attempt always runs, so values below 1 become 1.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Clamp fields set directly on the struct into their usable ranges.
    pub fn normalized(mut self) -> Self {
        self.max_retries = self.max_retries.max(1);
        self.max_concurrent = self.max_concurrent.max(1);
        self
    }

    pub fn with_worker_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.worker_endpoint = endpoint.into();
        self
    }

    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = timeout;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// Inter-agent messenger configuration.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Default bound on `request` round trips.
    pub request_timeout: Duration,
    /// Base URL for HTTP message delivery (`{endpoint}/agents/{name}/messages`).
    pub endpoint: String,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            endpoint: "http://127.0.0.1:8000".to_string(),
        }
    }
}

impl MessengerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_parse::<u64>("AGENT_QUEUE_MESSAGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            endpoint: std::env::var("AGENT_QUEUE_MESSAGE_ENDPOINT").unwrap_or(defaults.endpoint),
        }
    }
}

/// HTTP server + storage settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/agent-queue.db".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("AGENT_QUEUE_DB_PATH").unwrap_or(defaults.db_path),
            port: env_parse("AGENT_QUEUE_PORT").unwrap_or(defaults.port),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
