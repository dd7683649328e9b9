use std::path::Path;
use std::sync::Arc;

use agent_queue::agents::{HttpTransport, Messenger};
use agent_queue::api::{AppState, api_routes};
use agent_queue::config::{MessengerConfig, ProcessorConfig, ServerConfig};
use agent_queue::jobs::{HandlerRegistry, JobProcessor, JobQueue};
use agent_queue::store::{AgentRegistry, JobStore, LibSqlBackend};
use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server_config = ServerConfig::from_env();
    let processor_config = ProcessorConfig::from_env();
    let messenger_config = MessengerConfig::from_env();

    eprintln!("Agent Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", server_config.port);
    eprintln!("   Worker: {}", processor_config.worker_endpoint);
    eprintln!(
        "   Poll: every {}ms, max {} retries, {} concurrent",
        processor_config.poll_interval.as_millis(),
        processor_config.max_retries,
        processor_config.max_concurrent
    );
    if let Some(agent) = &processor_config.agent {
        eprintln!("   Scope: agent {agent}");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(Path::new(&server_config.db_path))
            .await
            .with_context(|| format!("failed to open database at {}", server_config.db_path))?,
    );
    eprintln!("   Database: {}", server_config.db_path);

    let store: Arc<dyn JobStore> = backend.clone();
    let registry: Arc<dyn AgentRegistry> = backend;

    // ── Messenger + handlers ─────────────────────────────────────────────
    let transport = Arc::new(HttpTransport::new(messenger_config.endpoint.clone()));
    let messenger = Arc::new(Messenger::new(
        Arc::clone(&registry),
        transport,
        messenger_config,
    ));
    let handlers = Arc::new(HandlerRegistry::with_defaults(
        Arc::clone(&registry),
        Arc::clone(&messenger),
    ));

    // ── Processor ────────────────────────────────────────────────────────
    let processor = Arc::new(
        JobProcessor::new(Arc::clone(&store), handlers).with_config(processor_config.clone()),
    );
    processor.start(processor_config).await;

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        queue: Arc::new(JobQueue::new(store)),
        processor: Arc::clone(&processor),
        registry,
        messenger,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", server_config.port))?;
    tracing::info!(port = server_config.port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down, waiting for in-flight tick");
    processor.stop().await;
    Ok(())
}
