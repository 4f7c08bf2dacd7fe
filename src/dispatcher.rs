use crate::error::DispatchError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

pub const CMD_ON: &str = "ON";
pub const CMD_OFF: &str = "OFF";

/// Something that can switch a physical device.
#[async_trait]
pub trait DeviceEndpoint: Send + Sync {
    async fn send(&self, device_id: i64, command: &str) -> Result<(), DispatchError>;

    fn is_connected(&self) -> bool {
        true
    }

    /// Releases the underlying connection, if any.
    async fn shutdown(&self) {}

    fn describe(&self) -> String;
}

/// In-memory endpoint used when no broker is reachable, and by tests.
/// Keeps every delivered command in order.
#[derive(Debug, Default)]
pub struct MockEndpoint {
    delivered: Mutex<Vec<(i64, String)>>,
    fail: Mutex<bool>,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following send fail with `NotConnected` until reset.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn delivered(&self) -> Vec<(i64, String)> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, device_id: i64, command: &str) -> usize {
        self.delivered()
            .iter()
            .filter(|(id, cmd)| *id == device_id && cmd == command)
            .count()
    }
}

#[async_trait]
impl DeviceEndpoint for MockEndpoint {
    async fn send(&self, device_id: i64, command: &str) -> Result<(), DispatchError> {
        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(DispatchError::NotConnected);
        }
        debug!("Mock endpoint: device {} <- {}", device_id, command);
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device_id, command.to_string()));
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Sends commands through an endpoint, dropping any command identical to the
/// last one delivered to the same device. Sends to one device are serialized,
/// so concurrent duplicates see each other's delivery.
pub struct CommandDispatcher {
    endpoint: Arc<dyn DeviceEndpoint>,
    last: Mutex<HashMap<i64, String>>,
    gates: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(endpoint: Arc<dyn DeviceEndpoint>, timeout: Duration) -> Self {
        info!("Command dispatcher using {} endpoint.", endpoint.describe());
        Self {
            endpoint,
            last: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn send(&self, device_id: i64, command: &str) -> Result<(), DispatchError> {
        let gate = self.gate(device_id);
        let _held = gate.lock().await;

        if self.last_command(device_id).as_deref() == Some(command) {
            debug!("Suppressed duplicate {} for device {}.", command, device_id);
            return Ok(());
        }

        match tokio::time::timeout(self.timeout, self.endpoint.send(device_id, command)).await {
            Ok(Ok(())) => {
                self.last
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(device_id, command.to_string());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        }
    }

    pub fn last_command(&self, device_id: i64) -> Option<String> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device_id)
            .cloned()
    }

    pub fn endpoint(&self) -> &Arc<dyn DeviceEndpoint> {
        &self.endpoint
    }

    fn gate(&self, device_id: i64) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id)
            .or_default()
            .clone()
    }
}
