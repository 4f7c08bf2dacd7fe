use crate::dispatcher::DeviceEndpoint;
use crate::error::DispatchError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: Option<String>,
    /// Commands go to `<prefix>/<id>/cmd`, reports arrive on `<prefix>/<id>/status`.
    pub mqtt_prefix: String,
    pub mqtt_connect_attempts: usize,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

/// Device endpoint publishing ON/OFF over MQTT.
pub struct MqttEndpoint {
    client: AsyncClient,
    client_state: Mutex<ClientState>,
    closed: AtomicBool,
    config: MqttConfig,
}

impl MqttEndpoint {
    /// Connects with a fixed back-off between attempts. The last error is
    /// returned once every attempt has failed.
    pub async fn connect(config: MqttConfig) -> Result<Arc<Self>, DispatchError> {
        let retries = config.mqtt_connect_attempts.max(1) - 1;
        let strategy =
            FixedInterval::from_millis(config.mqtt_retry_interval_ms).take(retries);
        let total = retries + 1;
        let mut attempt = 0;

        Retry::spawn(strategy, || {
            attempt += 1;
            let config = config.clone();
            let attempt = attempt;
            async move {
                let result = Self::try_connect(config).await;
                if let Err(e) = &result {
                    warn!("MQTT connect failed ({}/{}): {}", attempt, total, e);
                }
                result
            }
        })
        .await
    }

    async fn try_connect(config: MqttConfig) -> Result<Arc<Self>, DispatchError> {
        debug!(
            "Configuring MQTT broker at {}:{}...",
            config.mqtt_host, config.mqtt_port
        );

        let client_id = config
            .mqtt_client_id
            .clone()
            .unwrap_or_else(|| format!("console_switch_{}", Uuid::new_v4()));
        let mut mqtt_options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);
        if !config.mqtt_username.is_empty() {
            mqtt_options.set_credentials(&config.mqtt_username, &config.mqtt_password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

        let timeout = Duration::from_millis(config.mqtt_connect_timeout_ms);
        let connack = tokio::time::timeout(timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(DispatchError::Rejected(e.to_string())),
                }
            }
        })
        .await;
        match connack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DispatchError::Timeout(timeout)),
        }

        let status_topic = format!("{}/+/status", config.mqtt_prefix);
        client
            .subscribe(&status_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        info!(
            "Connected to MQTT broker {}:{}, listening on '{}'.",
            config.mqtt_host, config.mqtt_port, status_topic
        );

        let endpoint = Arc::new(Self {
            client,
            client_state: Mutex::new(ClientState::Connected),
            closed: AtomicBool::new(false),
            config,
        });
        tokio::spawn(endpoint.clone().drive(eventloop));
        Ok(endpoint)
    }

    /// Keeps polling the event loop; rumqttc reconnects on the next poll after
    /// an error.
    async fn drive(self: Arc<Self>, mut eventloop: EventLoop) {
        let retry_interval = Duration::from_millis(self.config.mqtt_retry_interval_ms);
        while !self.closed.load(Ordering::SeqCst) {
            match eventloop.poll().await {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("Error in MQTT event loop: {:?}", e);
                    self.set_state(ClientState::Error(e.to_string()));
                    warn!("Lost connection to MQTT broker. Retrying in {:?}...", retry_interval);
                    sleep(retry_interval).await;
                    self.set_state(ClientState::Connecting);
                }
            }
        }
        self.set_state(ClientState::Disconnected);
        debug!("MQTT event loop finished.");
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                match device_id_from_status_topic(&self.config.mqtt_prefix, &publish.topic) {
                    Some(id) => info!("Status update from device {}: {}", id, payload),
                    None => warn!("Unknown topic received: {}", publish.topic),
                }
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Reconnected to MQTT broker.");
                self.set_state(ClientState::Connected);
            }
            Event::Outgoing(_) => {}
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.client_state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[async_trait]
impl DeviceEndpoint for MqttEndpoint {
    async fn send(&self, device_id: i64, command: &str) -> Result<(), DispatchError> {
        if !self.is_connected() {
            return Err(DispatchError::NotConnected);
        }
        let topic = command_topic(&self.config.mqtt_prefix, device_id);
        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, false, command.as_bytes().to_vec())
            .await
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        info!("Message published to '{}': {}", topic, command);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.client_state.lock().unwrap_or_else(|e| e.into_inner()) == ClientState::Connected
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
    }

    fn describe(&self) -> String {
        format!(
            "mqtt://{}:{} (prefix '{}')",
            self.config.mqtt_host, self.config.mqtt_port, self.config.mqtt_prefix
        )
    }
}

pub fn command_topic(prefix: &str, device_id: i64) -> String {
    format!("{}/{}/cmd", prefix, device_id)
}

/// Extracts `<id>` from `<prefix>/<id>/status`.
pub fn device_id_from_status_topic(prefix: &str, topic: &str) -> Option<i64> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let id = rest.strip_suffix("/status")?;
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics() {
        assert_eq!(command_topic("ps", 3), "ps/3/cmd");
        assert_eq!(device_id_from_status_topic("ps", "ps/3/status"), Some(3));
        assert_eq!(device_id_from_status_topic("ps", "ps/x/status"), None);
        assert_eq!(device_id_from_status_topic("ps", "ps/3/cmd"), None);
        assert_eq!(device_id_from_status_topic("ps", "other/3/status"), None);
        assert_eq!(device_id_from_status_topic("shop/ps", "shop/ps/12/status"), Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_configured_attempts() {
        let config = MqttConfig {
            mqtt_host: "127.0.0.1".to_string(),
            // Nothing listens on port 1; every attempt is refused.
            mqtt_port: 1,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_id: None,
            mqtt_prefix: "ps".to_string(),
            mqtt_connect_attempts: 3,
            mqtt_retry_interval_ms: 1000,
            mqtt_connect_timeout_ms: 500,
        };
        assert!(MqttEndpoint::connect(config).await.is_err());
    }
}
