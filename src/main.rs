use console_switch::broadcast::BroadcastHub;
use console_switch::clock::SystemClock;
use console_switch::config::Config;
use console_switch::db::LeaseStore;
use console_switch::dispatcher::CommandDispatcher;
use console_switch::lifecycle::RentalLifecycle;
use console_switch::rest_server::run_rest_server;
use console_switch::scheduler::ExpiryScheduler;
use console_switch::service_utils::{connect_endpoint, handle_shutdown, start_expiry_scheduler};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let store = match LeaseStore::open(&config.db_path, config.sqlite_mode) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open database: {:?}", e);
            return;
        }
    };

    if let Err(e) = store.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    if let Err(e) = store.seed_devices(config.console_count, config.default_price) {
        error!("Failed to provision devices: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    let endpoint = connect_endpoint(&config).await;
    let dispatcher = Arc::new(CommandDispatcher::new(endpoint, config.command_timeout()));
    let hub = Arc::new(BroadcastHub::new());
    let lifecycle = Arc::new(RentalLifecycle::new(
        store,
        dispatcher.clone(),
        hub,
        Arc::new(SystemClock),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(ExpiryScheduler::new(lifecycle.clone(), config.scheduler()));
    let scheduler_task = start_expiry_scheduler(scheduler, shutdown_rx.clone());

    let rest_api_task = tokio::spawn(run_rest_server(
        lifecycle,
        config.http_port,
        shutdown_rx,
    ));

    handle_shutdown(shutdown_tx).await;

    // Wait for tasks to complete
    if let Err(e) = scheduler_task.await {
        error!("Expiry scheduler task failed: {:?}", e);
    }
    match rest_api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("REST API failed: {:?}", e),
        Err(e) => error!("REST API task failed: {:?}", e),
    }
    dispatcher.endpoint().shutdown().await;
    info!("All services shut down successfully.");
}
