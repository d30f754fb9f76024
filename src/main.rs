//! promptgate - Rate-limited, guardrailed gateway for LLM chat traffic.
//!
//! The gateway sits between clients and an OpenAI-compatible generation
//! backend. It admits requests through a per-client sliding window,
//! validates message content, forwards allowed requests, and records every
//! exchange to a JSON-lines sink without blocking the response path.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use promptgate::backend::OpenAiBackend;
use promptgate::config::GatewayConfig;
use promptgate::guardrail::GuardrailPolicy;
use promptgate::metrics::GatewayMetrics;
use promptgate::pipeline::ChatPipeline;
use promptgate::rate_limit::{self, RateLimiter};
use promptgate::server::{GatewayServer, ServerConfig};
use promptgate::sink::JsonlSink;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line configuration for the gateway server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on (default: 8000, or PROMPTGATE_PORT env var)
    #[arg(short, long, env = "PROMPTGATE_PORT", default_value = "8000")]
    port: u16,

    /// Bind address (default: 0.0.0.0)
    #[arg(short, long, env = "PROMPTGATE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[arg(long, env = "PROMPTGATE_SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,
}

/// Main entry point for the promptgate gateway.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env()?;

    info!(
        bind = %cli.bind,
        port = cli.port,
        max_requests = config.rate_limit.max_requests,
        window_seconds = config.rate_limit.window_seconds,
        distributed_store = config.rate_limit.redis_url.is_some(),
        model = %config.upstream.model,
        "promptgate starting"
    );

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(GatewayMetrics::new());

    let store = rate_limit::build_store(&config.rate_limit, shutdown.clone()).await?;
    let limiter = Arc::new(RateLimiter::new(store, &config.rate_limit));

    let (sink, sink_worker) = JsonlSink::spawn(&config.sink, Arc::clone(&metrics));
    let backend = OpenAiBackend::new(config.upstream.clone())?;
    let policy = GuardrailPolicy::new(&config.guardrail);

    let pipeline = ChatPipeline::new(
        Arc::new(policy),
        Arc::new(backend),
        Arc::new(sink),
        Arc::clone(&metrics),
    );

    spawn_signal_handlers(&shutdown);

    let server = GatewayServer::new(
        ServerConfig {
            port: cli.port,
            bind_addr: cli.bind,
        },
        pipeline,
        limiter,
        metrics,
    );

    let result = server.run(shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Server error");
    }

    // The worker exits once the last sink handle drops and the queue is
    // empty; in-flight stream tasks may hold a handle briefly.
    info!("Draining record sink");
    if tokio::time::timeout(
        Duration::from_secs(cli.shutdown_timeout),
        sink_worker.drain(),
    )
    .await
    .is_err()
    {
        warn!(
            timeout_seconds = cli.shutdown_timeout,
            "Record sink drain timed out, records may be lost"
        );
    }

    result.map_err(Into::into)
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handlers(shutdown: &CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                token.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    token.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }
}
