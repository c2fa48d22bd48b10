//! DirectOutput Proxy
//!
//! Serves the device registry over HTTP until Ctrl+C, SIGTERM or POST /shutdown.

use direct_output_proxy::bus::ButtonEvent;
use direct_output_proxy::config::{self, HardwareBackend};
use direct_output_proxy::device::{DeviceSession, Line};
use direct_output_proxy::error::{Error, HardwareError};
use direct_output_proxy::hardware::{SharedHardware, SimulatedDirectOutput};
use direct_output_proxy::registry::DeviceRegistry;
use direct_output_proxy::{api, bus};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "direct_output_proxy=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting DirectOutput Proxy v{} ({})",
        env!("DOP_VERSION"),
        env!("DOP_GIT_SHA")
    );

    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    let hardware: SharedHardware = match config.hardware {
        HardwareBackend::Simulated => {
            let sim = Arc::new(SimulatedDirectOutput::new());
            for class in &config.simulated_devices {
                match class.guid() {
                    Some(guid) => {
                        sim.attach(guid);
                    }
                    None => tracing::warn!("Cannot simulate a device of class {}", class),
                }
            }
            tracing::info!("Simulated hardware with {} device(s)", sim.device_count());
            sim as SharedHardware
        }
    };

    let fanout = bus::create_fanout();
    let mut registry = DeviceRegistry::new(hardware.clone(), fanout.clone())
        .with_default_pages(config.default_pages())
        .with_removal_hook(|session| {
            tracing::info!(
                "Device {} ({}) gone with {} page(s)",
                session.handle(),
                session.class(),
                session.page_indices().len()
            );
        });
    if config.echo_buttons {
        registry = registry.with_arrival_hook(|session| session.on_button(echo_button));
    }
    let registry = Arc::new(registry);

    let starting = registry.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || starting.start()).await? {
        if let Error::Hardware {
            source: HardwareError::NotImplemented,
            ..
        } = e
        {
            tracing::error!(
                "Failed to initialize: DirectOutput library failed to load, check \
                 HKLM\\SOFTWARE\\Saitek\\DirectOutput\\DirectOutput_Saitek"
            );
        } else {
            tracing::error!("Failed to initialize: {}", e);
        }
        return Err(e.into());
    }
    tracing::info!("Device registry started with {} device(s)", registry.len());

    let shutdown = CancellationToken::new();
    let state = api::AppState::new(registry.clone(), fanout, shutdown.clone());
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("Releasing hardware...");
    tokio::task::spawn_blocking(move || {
        if let Err(e) = registry.stop() {
            tracing::warn!("Failed to stop device registry: {}", e);
        }
        if let Err(e) = hardware.deinitialize() {
            tracing::warn!("Failed to deinitialize: {}", e);
        }
    })
    .await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Show the pressed button on the top line of the page being shown.
fn echo_button(session: &DeviceSession, event: &ButtonEvent) {
    if !event.pressed {
        return;
    }
    let Some(page) = event.page else {
        return;
    };
    if let Err(e) = session.set_line(page, Line::Top, format!("Button: {}", event.button)) {
        tracing::warn!(device = %session.handle(), page, "Failed to echo button: {}", e);
    }
}

/// Wait for Ctrl+C, SIGTERM or a shutdown request, then cancel `token` so
/// open event streams close.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        _ = token.cancelled() => tracing::info!("Shutdown requested, shutting down..."),
    }
    token.cancel();
}
