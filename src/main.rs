use meter_realtime::{
    config::Config,
    persist::{JsonFileStore, NoopStore, SnapshotStore},
    AlertSink, ConnectionManager, LogNotifier, MonitorEvent, TrendClient, TrendKind,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meter_realtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting meter-realtime client");

    // Load configuration
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());

    let config = Config::load(&config_path)?;
    info!("Configuration loaded from: {}", config_path);

    let store: Arc<dyn SnapshotStore> = match &config.persistence {
        Some(persistence) => {
            info!("Persisting realtime state to {}", persistence.path.display());
            Arc::new(JsonFileStore::new(persistence.path.clone()))
        }
        None => Arc::new(NoopStore),
    };

    let alerts = AlertSink::new(config.alerts.reset, Arc::new(LogNotifier));
    let manager = ConnectionManager::new(config.stream.clone(), alerts, store);
    let target_id = manager.target_id();

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MonitorEvent::State { state }) => info!(state = %state, "stream state"),
                Ok(MonitorEvent::Reading { reading }) => info!(
                    meter_id = reading.meter_id.as_deref().unwrap_or("-"),
                    power_w = reading.power_w,
                    voltage_v = reading.voltage_v,
                    current_a = reading.current_a,
                    energy_kwh = reading.energy_kwh,
                    "reading"
                ),
                Ok(MonitorEvent::Alert { description, count }) => {
                    warn!(count, "alert: {}", description)
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event consumer lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(api) = &config.api {
        let client = TrendClient::new(api.base_url.clone())?;
        for kind in TrendKind::ALL {
            match client.fetch_trend(kind, &target_id).await {
                Ok(data) => {
                    info!(kind = %kind, "trend loaded");
                    manager.save_trend(kind, data);
                }
                Err(e) => error!(kind = %kind, "Failed to fetch trend: {}", e),
            }
        }
    }

    manager.connect(&target_id)?;
    info!(
        client_id = %manager.client_id(),
        "Streaming realtime data for {}", target_id
    );

    shutdown_signal().await;

    manager.teardown();
    manager.flush().await;
    info!(
        alerts = manager.alert_count(),
        points = manager.series().len(),
        "Client shutdown complete"
    );
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
