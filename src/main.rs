// src/main.rs - Heater cascade host: config, composition and the web API
use clap::Parser;
use htr_cascade::config::{self, Config};
use htr_cascade::controller::{self, InstanceDeps, InstanceSettings};
use htr_cascade::gateway::{HttpGateway, TemperatureSource};
use htr_cascade::setpoint::SetpointSynchronizer;
use htr_cascade::store::FileStateStore;
use htr_cascade::telemetry::{self, ReconnectPolicy, TcpLineFeed, TelemetryHub};
use htr_cascade::web;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "htr-host", about = "Heater cascade control host")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "heaters.toml")]
    config: String,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Override the web API bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    tracing::info!("Starting heater cascade host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config);

    let config = config::load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config, e);
        tracing::error!("Please ensure the configuration file exists and is properly formatted");
        Box::new(e) as BoxError
    })?;
    if config.heaters.is_empty() {
        tracing::warn!("No heaters configured; only the telemetry API will be useful");
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let hub = Arc::new(TelemetryHub::new(
        config.telemetry_devices(),
        Duration::from_secs(config.telemetry.stale_after_secs),
    ));
    let handles = start_controllers(&config, hub.clone()).await?;
    start_telemetry(&config, hub.clone(), &shutdown_tx);

    let state = Arc::new(web::api::AppStateInner {
        heaters: handles.clone(),
        hub,
    });
    let app = web::api::create_router(state);

    let bind = args.bind.unwrap_or_else(|| config.web.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(());
    for handle in &handles {
        handle.shutdown().await;
    }
    tracing::info!("Heater cascade host stopped");
    Ok(())
}

async fn start_controllers(config: &Config, hub: Arc<TelemetryHub>) -> Result<Vec<controller::ControllerHandle>, BoxError> {
    let gateway = Arc::new(HttpGateway::new(
        &config.gateway.base_url,
        Duration::from_millis(config.gateway.request_timeout_ms),
    )?);
    let poller: Option<Arc<dyn TemperatureSource>> = if config.telemetry.poll_enabled {
        match &config.telemetry.poll_base_url {
            Some(url) => Some(Arc::new(HttpGateway::new(
                url,
                Duration::from_millis(config.gateway.request_timeout_ms),
            )?)),
            None => Some(gateway.clone()),
        }
    } else {
        None
    };
    let store = Arc::new(FileStateStore::open(&config.store.dir).await?);
    let sync = Arc::new(SetpointSynchronizer::new(store.clone(), config.control.max_temp));
    let deps = InstanceDeps {
        gateway,
        poller,
        hub,
        store,
        sync,
    };

    let mut handles = Vec::with_capacity(config.heaters.len());
    for heater in &config.heaters {
        tracing::info!("Heater {} at {}", heater.name, heater.device_address);
        let settings = InstanceSettings::from_config(heater, &config.control);
        handles.push(controller::spawn(settings, deps.clone()).await);
    }
    Ok(handles)
}

fn start_telemetry(config: &Config, hub: Arc<TelemetryHub>, shutdown: &broadcast::Sender<()>) {
    let Some(addr) = &config.telemetry.feed_addr else {
        tracing::info!("No telemetry feed configured, relying on polling and the ingest API");
        return;
    };
    let policy = ReconnectPolicy::new(
        telemetry::feed::DEFAULT_BASE_DELAY,
        telemetry::feed::DEFAULT_MAX_DELAY,
        config.telemetry.max_reconnect_attempts,
    );
    tokio::spawn(telemetry::run_feed(
        hub.clone(),
        Arc::new(TcpLineFeed::new(addr)),
        policy,
        shutdown.subscribe(),
    ));
    tokio::spawn(telemetry::run_health_check(hub, Duration::from_secs(10), shutdown.subscribe()));
}
