use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use routeplane::cli::Args;
use routeplane::{DiscoveryServer, MemoryCache, RouteManager, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let settings = Settings::load(args.config.as_deref())
        .context("failed to load settings")?
        .with_args(&args);

    let cache = Arc::new(MemoryCache::default());
    let manager = RouteManager::new(cache.clone(), settings.manager_options());

    // Proxies get listeners right away even without a routes file
    match &settings.routes_file {
        Some(path) => manager
            .load_from_file(path)
            .await
            .with_context(|| format!("failed to load routes from {}", path.display()))?,
        None => manager
            .refresh()
            .await
            .context("failed to publish initial snapshot")?,
    }

    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();

        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    token.cancel();
                }
                Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
            }
        }
    });

    let server = DiscoveryServer::new(cache, settings.server_options());
    let served = server.start(token).await;

    if args.save_on_exit {
        if let Some(path) = &settings.routes_file {
            manager
                .save_to_file(path)
                .await
                .with_context(|| format!("failed to save routes to {}", path.display()))?;
        }
    }

    served.context("discovery server failed")
}
