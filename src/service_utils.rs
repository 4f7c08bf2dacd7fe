use crate::config::Config;
use crate::dispatcher::{DeviceEndpoint, MockEndpoint};
use crate::mqtt_service::MqttEndpoint;
use crate::scheduler::ExpiryScheduler;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Connects the configured MQTT broker, falling back to the in-memory
/// endpoint when none is configured or every attempt failed.
pub async fn connect_endpoint(config: &Config) -> Arc<dyn DeviceEndpoint> {
    let Some(mqtt_config) = config.mqtt() else {
        info!("No MQTT_HOST configured; device commands go to the mock endpoint.");
        return Arc::new(MockEndpoint::new());
    };

    match MqttEndpoint::connect(mqtt_config).await {
        Ok(endpoint) => endpoint as Arc<dyn DeviceEndpoint>,
        Err(e) => {
            warn!(
                "MQTT unavailable after {} attempt(s) ({}); using the mock endpoint.",
                config.mqtt_connect_attempts, e
            );
            Arc::new(MockEndpoint::new())
        }
    }
}

/// Start the expiry scheduler
pub fn start_expiry_scheduler(
    scheduler: Arc<ExpiryScheduler>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        scheduler.run(shutdown).await;
    })
}

/// Waits for ctrl-c, then tells every background task to wind down.
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Service is shutting down...");
    }
    // Receivers may already be gone; nothing left to notify then.
    let _ = shutdown.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_mock_without_broker() {
        let config = Config::default();
        let endpoint = connect_endpoint(&config).await;
        assert_eq!(endpoint.describe(), "mock");
        assert!(endpoint.is_connected());
    }
}
