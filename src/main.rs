//! Shardcast Gateway - multi-shard Discord gateway using Twilight
//!
//! Process wiring only: configuration, tracing, metrics, NATS, the shard
//! manager and the health server. Ctrl+C or SIGTERM closes every shard.

use anyhow::Result;
use shardcast_gateway::config::GatewayConfig;
use shardcast_gateway::events::EventRouter;
use shardcast_gateway::health::{self, AppState};
use shardcast_gateway::metrics::GatewayMetrics;
use shardcast_gateway::nats::{NatsPublisher, Publisher};
use shardcast_gateway::session::discord::{install_crypto_provider, DiscordRest, DiscordSessionFactory};
use shardcast_gateway::ShardManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardcast_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("twilight_gateway=info".parse()?)
                .add_directive("twilight_http=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    // Before NATS or any Discord client builds a TLS config
    install_crypto_provider();

    let settings = gateway_config.manager_settings()?;
    let (offset, count, total) = settings.resolve();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %settings.name,
        shard_offset = offset,
        shard_count = count,
        total_shards = total,
        "Starting Shardcast Gateway"
    );

    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = match gateway_config.nats_url {
        Some(ref url) => match NatsPublisher::connect(url, "shardcast-gateway").await {
            Ok(publisher) => {
                info!(url, "Connected to NATS");
                metrics.set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics.set_nats_connected(false);
                None
            }
        },
        None => {
            info!("No GATEWAY_NATS_URL configured - running in local mode");
            None
        }
    };
    let bus: Option<Arc<dyn Publisher>> = nats.clone().map(|n| n as Arc<dyn Publisher>);

    let router = Arc::new(EventRouter::new(
        bus.clone(),
        gateway_config.event_subject.clone(),
        gateway_config.event_filter()?,
        metrics.clone(),
    ));

    let intents = GatewayConfig::intents();
    info!(?intents, "Using Discord intents");

    let token = gateway_config.bot_token().to_string();
    let factory = Arc::new(DiscordSessionFactory::new(token.clone(), intents));
    let rest = Arc::new(DiscordRest::new(Arc::new(twilight_http::Client::new(token))));

    let mut manager = ShardManager::new(settings, factory, router)
        .with_channel_client(rest)
        .with_metrics(metrics.clone());
    if let Some(bus) = bus {
        manager = manager.with_bus(bus, gateway_config.lifecycle_subject.clone());
    }
    let manager = Arc::new(manager);
    manager.init()?;

    // Start health server
    let app_state = AppState {
        manager: Arc::clone(&manager),
        nats: nats.clone(),
        metrics: metrics.clone(),
    };
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::router(app_state)).await {
            error!(error = %e, "HTTP server error");
        }
    });

    let result = manager.start(shutdown_signal()).await;

    if let Err(ref e) = result {
        if e.is_fatal() {
            error!(error = %e, "Gateway stopped on fatal error, closing sessions");
            if let Err(close_err) = manager.stop_all().await {
                warn!(error = %close_err, "Sessions did not close cleanly");
            }
        } else {
            warn!(error = %e, "Sessions did not close cleanly");
        }
    }

    info!("Shutting down gateway...");
    http_server.abort();

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    result.map_err(Into::into)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
