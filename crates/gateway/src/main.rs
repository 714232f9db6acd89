//! Gateway service entry point.
//!
//! WebSocket to message-bus RPC gateway.

use anyhow::{Context, Result};
use bus::{Bus, DialerRegistry, MultiBus, NatsDialer};
use gateway::{
    create_router, tls, AppState, Engine, EngineConfig, GatewayConfig, HealthCheck,
    SessionRegistry, SessionServices,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    let router_uri = config.router_uri();

    info!("Configuration:");
    info!("  BUS_ENDPOINTS: {}", config.bus_endpoints.join(","));
    info!("  ROUTER_URI: {}", router_uri);
    info!("  PORT_HTTP: {}", config.http_port);
    info!("  PORT_HTTPS: {}", config.https_port);
    info!("  TLS: {}", config.tls_pems().is_some());
    info!("  REQUEST_TIMEOUT: {:?}", config.request_timeout);
    info!("  HEARTBEAT_TIMEOUT: {:?}", config.heartbeat_timeout);
    info!("  WIRE_FORMAT: {:?}", config.wire_format);
    info!("  TIMEOUT_POLICY: {:?}", config.timeout_policy);
    info!("  METRICS_PORT: {}", config.metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to every bus endpoint; at least one must succeed
    let dialer = NatsDialer::new(router_uri.clone())
        .with_heartbeat(config.heartbeat_timeout)
        .with_queue_group(router_uri.clone());
    let dialers = DialerRegistry::new(dialer);
    let endpoints = dialers
        .connect_all(&config.bus_endpoints)
        .await
        .context("no bus endpoint reachable")?;
    let bus = Arc::new(MultiBus::new(endpoints)?);
    info!("Connected to {} bus endpoints", bus.endpoint_count());

    let engine_config =
        EngineConfig::new(router_uri).with_request_timeout(config.request_timeout);
    let engine = Arc::new(Engine::new(bus.clone() as Arc<dyn Bus>, engine_config));
    engine.start().await?;

    let running_bus = bus.clone();
    let bus_handle = tokio::spawn(async move {
        if let Err(e) = running_bus.run().await {
            error!("Bus error: {:?}", e);
        }
    });

    // Listeners share sessions and services but advertise their own descriptor
    let registry = Arc::new(SessionRegistry::new());
    let services = SessionServices {
        engine: engine.clone(),
        codec: config.wire_format.codec(&config.legacy_destination),
        timeout_policy: config.timeout_policy.policy(),
    };
    let health = Arc::new(HealthCheck::new(engine));
    let app_for = |secure: bool| {
        create_router(Arc::new(AppState {
            registry: registry.clone(),
            services: services.clone(),
            health: health.clone(),
            descriptor: config.server_descriptor(secure),
        }))
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    // Optional HTTPS listener
    let https_handle = match config.tls_pems() {
        Some((cert, key)) => {
            let tls_config = tls::server_config(cert, key)?;
            let addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
            let listener = TcpListener::bind(addr).await?;
            let app = app_for(true);
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = tls::serve_tls(listener, tls_config, app, shutdown).await {
                    error!("HTTPS server error: {:?}", e);
                }
            }))
        }
        None => None,
    };

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app_for(false).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;

    info!("Closing {} sessions...", registry.session_count());
    registry.close_all();

    if let Some(handle) = https_handle {
        let _ = handle.await;
    }
    bus_handle.abort();

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
