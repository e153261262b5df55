use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dnsveil::cli::Cli;
use dnsveil::dispatcher::QueryDispatcher;
use dnsveil::server::DnsServer;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level when both are present
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Upstream work is I/O bound; a few threads beyond the core count is plenty
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let worker_threads = std::cmp::min(num_cpus + 2, 16);

    debug!("Configuring Tokio runtime with {} worker threads", worker_threads);

    let runtime = Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;

    info!(
        "Resolving over {} DoH endpoint(s){}",
        config.doh_endpoints.len(),
        config
            .socks_proxy
            .as_deref()
            .map(|p| format!(" via {}", p))
            .unwrap_or_default()
    );
    if let Some(pattern) = &config.override_pattern {
        info!("Names matching {:?} go to {}", pattern, config.secondary_resolver);
    }

    let dispatcher = Arc::new(QueryDispatcher::from_config(&config)?);
    let server = DnsServer::bind(config.listen, dispatcher).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
