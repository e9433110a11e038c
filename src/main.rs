//! castbridge - play videos on UPnP, Chromecast, VLC, Kodi and browser displays

use castbridge::{
    adapters, api, bus,
    bus::BusEvent,
    config::{self, DeviceDescriptor},
    content::ByteWindowCache,
    media::MediaServer,
    orchestrator::{Orchestrator, SourceFactory},
    registry::DeviceRegistry,
    session::SessionRegistry,
};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired and idle sessions are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Round-trip bound given to renderers found by SSDP
const DISCOVERED_REQUEST_TIMEOUT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castbridge=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting castbridge v{} ({})",
        env!("CASTBRIDGE_VERSION"),
        env!("CASTBRIDGE_GIT_SHA")
    );

    // Load configuration
    let mut config = config::load_config()?;
    tracing::info!(
        "Configuration loaded: {} device(s), media port {}",
        config.devices.len(),
        config.media.port
    );

    if config.discovery.upnp {
        discover_renderers(&mut config).await;
    }

    // Create event bus
    let bus = bus::create_bus();

    let cache = Arc::new(ByteWindowCache::new(config.media.cache_budget_bytes));
    let sessions = Arc::new(SessionRegistry::new(
        config.media.idle_gone_timeout(),
        config.media.block_size,
        bus.clone(),
    ));
    let sweeper = sessions.spawn_sweeper(SWEEP_INTERVAL);

    // Failing to bind is fatal
    let media = MediaServer::bind(&config.media, sessions.clone(), bus.clone()).await?;

    let devices = Arc::new(DeviceRegistry::from_descriptors(
        &config.devices,
        bus.clone(),
    )?);
    tracing::info!("{} device(s) registered", devices.len());

    let orchestrator = Arc::new(Orchestrator::new(
        sessions.clone(),
        devices.clone(),
        media.urls(),
        SourceFactory::new(&config.media, cache),
        &config.media,
    ));

    let app = api::router(api::AppState::new(orchestrator, bus.clone()));

    tracing::info!("Listening on http://{}", media.local_addr());
    media
        .serve(app, shutdown_signal(bus.clone(), sessions.shutdown_token()))
        .await?;

    // Cleanup: devices first so no new stream URLs are handed out, then sessions
    tracing::info!("Shutting down devices...");
    devices.shutdown().await;
    sessions.shutdown().await;
    if let Err(e) = sweeper.await {
        tracing::warn!("Session sweeper ended abnormally: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Add SSDP-discovered renderers that are not already configured.
async fn discover_renderers(config: &mut config::Config) {
    let timeout = Duration::from_secs(config.discovery.timeout_secs.max(1));
    let found = match adapters::upnp::discover(timeout, DISCOVERED_REQUEST_TIMEOUT_SECS).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!("UPnP discovery failed: {}", e);
            return;
        }
    };

    for descriptor in found {
        let descriptor = DeviceDescriptor::Upnp(descriptor);
        let id = descriptor.id();
        let known = config.devices.iter().any(|d| {
            let same_location = match (d, &descriptor) {
                (DeviceDescriptor::Upnp(a), DeviceDescriptor::Upnp(b)) => {
                    a.location.is_some() && a.location == b.location
                }
                _ => false,
            };
            same_location || d.id() == id
        });
        if known {
            tracing::debug!("Discovered renderer {} already configured", id);
            continue;
        }
        tracing::info!("Discovered UPnP renderer {}", id);
        config.devices.push(descriptor);
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal(bus: bus::SharedBus, streams: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    };
    tracing::info!("Received {}, shutting down...", reason);
    bus.publish(BusEvent::ShuttingDown {
        reason: Some(reason.to_string()),
    });
    // Open streams and SSE responses would otherwise hold graceful shutdown forever
    streams.cancel();
}
