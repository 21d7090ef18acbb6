//! Run the redactor as a loopback JSON-RPC service.
//!
//! Thresholds come from the same `TOKENGATE_*` environment variables the
//! library reads (see `GateConfig::from_env`). The optional reranker is
//! configured with `TOKENGATE_RERANK_URL` and `TOKENGATE_RERANK_API_KEY`.
//!
//! # Examples
//!
//! ```sh
//! # Default loopback port
//! tokengate-pruner
//!
//! # Custom bind address, reranker enabled, verbose logging
//! RUST_LOG=tokengate=debug tokengate-pruner --bind 127.0.0.1:9000 --reranker
//!
//! # Prune a file through the service
//! curl -s localhost:7410/rpc -d '{"jsonrpc":"2.0","id":1,"method":"prune_text",
//!   "params":{"text":"...","goal_hint":"fix the failing test"}}'
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokengate::config::GateConfig;
use tokengate::prune::{HttpReranker, Pruner, rpc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Serve `prune_text` / `recover_text` over JSON-RPC.
#[derive(Parser)]
#[command(name = "tokengate-pruner")]
struct Cli {
    /// Address to listen on. Keep this on loopback.
    #[arg(long, default_value = "127.0.0.1:7410")]
    bind: SocketAddr,

    /// Score lines with the HTTP reranker configured in the environment
    #[arg(long)]
    reranker: bool,

    /// Reranker request timeout in seconds
    #[arg(long, default_value_t = 3)]
    rerank_timeout: u64,

    /// Seconds between sweeps of expired redaction records
    #[arg(long, default_value_t = 60)]
    purge_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GateConfig::from_env();
    let mut pruner = Pruner::new(config.pruner.clone());
    if cli.reranker {
        match HttpReranker::from_env(Duration::from_secs(cli.rerank_timeout))? {
            Some(reranker) => {
                info!("Reranker enabled: {reranker:?}");
                pruner = pruner.with_reranker(Arc::new(reranker));
            }
            None => warn!("--reranker needs TOKENGATE_RERANK_URL and TOKENGATE_RERANK_API_KEY"),
        }
    }
    let pruner = Arc::new(pruner);

    let store = Arc::clone(pruner.store());
    let interval = Duration::from_secs(cli.purge_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                info!("Purged {purged} expired redaction records");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", cli.bind))?;
    let addr = listener.local_addr().map_err(|e| e.to_string())?;
    if !addr.ip().is_loopback() {
        warn!(
            "Pruner listening on non-loopback address {addr}; recovered text is not authenticated"
        );
    }
    info!("tokengate-pruner listening on http://{addr}/rpc");

    let state = rpc::RpcState::new(pruner).with_default_options(config.redaction.config.options);
    axum::serve(listener, rpc::router_with_state(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| format!("server error: {e}"))
}
