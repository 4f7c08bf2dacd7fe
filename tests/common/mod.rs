#![allow(dead_code)]

use async_trait::async_trait;
use console_switch::broadcast::BroadcastHub;
use console_switch::clock::Clock;
use console_switch::db::{LeaseStore, SqliteMode};
use console_switch::dispatcher::{CommandDispatcher, DeviceEndpoint};
use console_switch::error::DispatchError;
use console_switch::lifecycle::RentalLifecycle;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Recording endpoint that can run one piece of code in the middle of a
/// delivery, to interleave other operations with whoever is sending.
#[derive(Default)]
pub struct HookEndpoint {
    delivered: Mutex<Vec<(i64, String)>>,
    hooks: Mutex<Vec<(i64, String, Hook)>>,
}

impl HookEndpoint {
    /// Runs `hook` once, the first time `command` is delivered to `device_id`.
    pub fn on<F>(&self, device_id: i64, command: &str, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.hooks
            .lock()
            .unwrap()
            .push((device_id, command.to_string(), Box::new(hook)));
    }

    pub fn delivered(&self) -> Vec<(i64, String)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn sent_to(&self, device_id: i64) -> Vec<String> {
        self.delivered()
            .into_iter()
            .filter(|(id, _)| *id == device_id)
            .map(|(_, cmd)| cmd)
            .collect()
    }

    pub fn count(&self, device_id: i64, command: &str) -> usize {
        self.sent_to(device_id).iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl DeviceEndpoint for HookEndpoint {
    async fn send(&self, device_id: i64, command: &str) -> Result<(), DispatchError> {
        self.delivered
            .lock()
            .unwrap()
            .push((device_id, command.to_string()));

        let hook = {
            let mut hooks = self.hooks.lock().unwrap();
            hooks
                .iter()
                .position(|(id, cmd, _)| *id == device_id && cmd == command)
                .map(|i| hooks.remove(i).2)
        };
        if let Some(hook) = hook {
            hook().await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "hook".to_string()
    }
}

/// Clock that only moves through `advance`.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        {
            let mut now = self.now.lock().unwrap();
            if deadline > *now {
                *now = deadline;
            }
        }
        tokio::task::yield_now().await;
    }
}

pub struct Harness {
    pub lifecycle: Arc<RentalLifecycle>,
    pub store: Arc<LeaseStore>,
    pub endpoint: Arc<HookEndpoint>,
    pub clock: Arc<ManualClock>,
}

pub fn epoch() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

/// Fresh store with `PS1..PS{devices}` at `rate` per hour, a recording
/// endpoint and a clock pinned to [`epoch`].
pub fn harness(devices: u32, rate: i64) -> Harness {
    let path = std::env::temp_dir().join(format!("console_switch_it_{}.db", Uuid::new_v4()));
    let store = Arc::new(LeaseStore::open(&path.to_string_lossy(), SqliteMode::Balanced).unwrap());
    store.initialize_db().unwrap();
    store.seed_devices(devices, rate).unwrap();

    let endpoint = Arc::new(HookEndpoint::default());
    let dispatcher = Arc::new(CommandDispatcher::new(endpoint.clone(), Duration::from_secs(1)));
    let clock = Arc::new(ManualClock::new(epoch()));
    let lifecycle = Arc::new(RentalLifecycle::new(
        store.clone(),
        dispatcher,
        Arc::new(BroadcastHub::new()),
        clock.clone(),
    ));

    Harness {
        lifecycle,
        store,
        endpoint,
        clock,
    }
}
