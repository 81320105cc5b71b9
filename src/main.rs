use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};

use claudish::dispatch::Dispatcher;
use claudish::logging::JsonLinesLogger;
use claudish::monitor::MonitorProxy;
use claudish::server::{build_router, AppState};
use claudish::streaming::ReasoningPolicy;
use claudish::usage::{ConversationCache, TokenLedger};

#[derive(Parser, Debug)]
#[command(name = "claudish")]
#[command(about = "Loopback proxy translating Anthropic-style streaming chat to OpenAI-compatible backends")]
struct Args {
    /// Port to listen on (loopback only)
    #[arg(long)]
    port: u16,

    /// Model to route every request to, e.g. "ollama/qwen3:8b" or an
    /// OpenRouter model id. Without it, the client's model field is used.
    #[arg(long)]
    model: Option<String>,

    /// Pass requests through to the real vendor endpoint and capture
    /// both directions for fixture extraction
    #[arg(long)]
    monitor: bool,

    /// JSON Lines log file for request/response capture
    #[arg(long)]
    log_file: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let debug_env = std::env::var("CLAUDISH_DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    let level = if args.verbose || debug_env {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .init();

    info!("Starting claudish proxy");
    info!("Port: {}", args.port);
    if let Some(model) = &args.model {
        info!("Model: {}", model);
    }
    if args.monitor {
        info!("Monitor mode: pass-through with capture");
    }

    let logger = args
        .log_file
        .as_ref()
        .map(|path| Arc::new(JsonLinesLogger::new(path.clone())));

    let cache = Arc::new(ConversationCache::new());
    cache.spawn_sweeper();

    let ledger = Arc::new(TokenLedger::new(args.port));
    let reasoning_policy = ReasoningPolicy::from_env();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&cache),
        Arc::clone(&ledger),
        reasoning_policy,
    )?);

    let monitor = if args.monitor {
        Some(Arc::new(MonitorProxy::new(logger.clone())?))
    } else {
        None
    };

    let metrics_handle = match claudish::metrics::init() {
        Ok(handle) => Some(Arc::new(handle)),
        Err(e) => {
            info!("Prometheus metrics unavailable: {}", e);
            None
        }
    };

    let state = AppState {
        dispatcher,
        model: args.model,
        monitor,
        metrics_handle,
    };

    let app = build_router(state);
    let addr: SocketAddr = ([127, 0, 0, 1], args.port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    let shutdown_ledger = Arc::clone(&ledger);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_ledger.remove_status();
        })
        .await?;

    ledger.remove_status();
    Ok(())
}
