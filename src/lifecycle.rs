use crate::broadcast::BroadcastHub;
use crate::clock::Clock;
use crate::db::LeaseStore;
use crate::dispatcher::{CommandDispatcher, CMD_OFF, CMD_ON};
use crate::error::{RentalError, StoreError};
use crate::models::{lease_price, status_payload, Device, DeviceSnapshot, LeaseRecord, PriceChange};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

pub const HISTORY_LIMIT: usize = 50;

/// The rental state machine. Every mutation is one store transaction; the
/// device command and the viewer broadcast happen after commit and never
/// undo it.
pub struct RentalLifecycle {
    store: Arc<LeaseStore>,
    dispatcher: Arc<CommandDispatcher>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn Clock>,
}

impl RentalLifecycle {
    pub fn new(
        store: Arc<LeaseStore>,
        dispatcher: Arc<CommandDispatcher>,
        hub: Arc<BroadcastHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            hub,
            clock,
        }
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Opens a lease of `duration_minutes` on an idle device and switches it on.
    pub async fn start_rental(
        &self,
        device_id: i64,
        duration_minutes: i64,
    ) -> Result<LeaseRecord, RentalError> {
        if duration_minutes <= 0 {
            return Err(RentalError::InvalidDuration);
        }
        let now = self.clock.now();

        let (device, lease) = self
            .in_store(move |store| {
                store.transaction(|tx| -> Result<_, RentalError> {
                    let device = tx
                        .device(device_id)?
                        .ok_or(RentalError::DeviceNotFound(device_id))?;
                    if device.is_running() {
                        return Err(RentalError::AlreadyRunning(device.name));
                    }

                    let lease_end = now + Duration::minutes(duration_minutes);
                    tx.mark_running(device_id, lease_end)?;
                    let lease = tx.insert_lease(&LeaseRecord {
                        id: 0,
                        device_id,
                        start_time: now,
                        end_time: lease_end,
                        duration_minutes,
                        total_price: lease_price(device.rate_per_hour, duration_minutes),
                        rate_snapshot: device.rate_per_hour,
                    })?;
                    Ok((device, lease))
                })
            })
            .await?;

        info!(
            "Started {} for {} min (price {}).",
            device.name, duration_minutes, lease.total_price
        );
        self.send_command(device_id, CMD_ON).await;
        self.publish_snapshot().await;
        Ok(lease)
    }

    /// Pushes the lease end back and re-prices the open lease at the rate it
    /// started with. Returns the updated lease, if the device has one.
    pub async fn extend_rental(
        &self,
        device_id: i64,
        add_minutes: i64,
    ) -> Result<Option<LeaseRecord>, RentalError> {
        if add_minutes <= 0 {
            return Err(RentalError::InvalidDuration);
        }

        let (device, lease) = self
            .in_store(move |store| {
                store.transaction(|tx| -> Result<_, RentalError> {
                    let device = tx
                        .device(device_id)?
                        .ok_or(RentalError::DeviceNotFound(device_id))?;
                    let lease_end = match (device.is_running(), device.lease_end) {
                        (true, Some(end)) => end,
                        _ => return Err(RentalError::NotRunning(device.name)),
                    };
                    tx.set_lease_end(device_id, lease_end + Duration::minutes(add_minutes))?;

                    let lease = match tx.last_lease(device_id)? {
                        Some(mut lease) => {
                            lease.extend(add_minutes);
                            tx.update_lease(&lease)?;
                            Some(lease)
                        }
                        None => None,
                    };
                    Ok((device, lease))
                })
            })
            .await?;

        match &lease {
            Some(lease) => info!(
                "Extended {} by {} min (now {} min, price {}).",
                device.name, add_minutes, lease.duration_minutes, lease.total_price
            ),
            None => warn!("Extended {} by {} min but it has no lease record.", device.name, add_minutes),
        }
        self.publish_snapshot().await;
        Ok(lease)
    }

    /// Ends the lease of a running device and switches it off.
    pub async fn stop_rental(&self, device_id: i64) -> Result<(), RentalError> {
        let device = self
            .in_store(move |store| {
                store.transaction(|tx| -> Result<_, RentalError> {
                    let device = tx
                        .device(device_id)?
                        .ok_or(RentalError::DeviceNotFound(device_id))?;
                    if !device.is_running() {
                        return Err(RentalError::NotRunning(device.name));
                    }
                    tx.mark_idle(device_id)?;
                    Ok(device)
                })
            })
            .await?;

        info!("Stopped {}.", device.name);
        self.send_command(device_id, CMD_OFF).await;
        self.publish_snapshot().await;
        Ok(())
    }

    /// Stops the device only if its lease has run out as of `now`, judged on
    /// the row read inside the transaction. Returns `None` when there was
    /// nothing to expire, e.g. the lease was extended or stopped meanwhile.
    /// No broadcast; the expiry loop publishes once per tick.
    pub(crate) async fn expire_lease(
        &self,
        device_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<Device>, RentalError> {
        let expired = self
            .in_store(move |store| {
                store.transaction(|tx| -> Result<_, RentalError> {
                    let device = tx
                        .device(device_id)?
                        .ok_or(RentalError::DeviceNotFound(device_id))?;
                    if !device.is_expired(now) {
                        return Ok(None);
                    }
                    tx.mark_idle(device_id)?;
                    Ok(Some(device))
                })
            })
            .await?;

        if let Some(device) = &expired {
            info!("Auto-stopped {} (lease expired).", device.name);
            self.send_command(device_id, CMD_OFF).await;
        }
        Ok(expired)
    }

    /// Changes the hourly rate for future leases and records the change.
    pub async fn update_price(&self, device_id: i64, new_rate: i64) -> Result<(), RentalError> {
        if new_rate <= 0 {
            return Err(RentalError::InvalidPrice);
        }
        let now = self.clock.now();

        let (name, old_rate) = self
            .in_store(move |store| {
                store.transaction(|tx| -> Result<_, RentalError> {
                    let device = tx
                        .device(device_id)?
                        .ok_or(RentalError::DeviceNotFound(device_id))?;
                    tx.set_rate(device_id, new_rate)?;
                    tx.insert_price_change(device_id, device.rate_per_hour, new_rate, now)?;
                    Ok((device.name, device.rate_per_hour))
                })
            })
            .await?;

        info!("Price of {} changed {} -> {} per hour.", name, old_rate, new_rate);
        self.publish_snapshot().await;
        Ok(())
    }

    /// Re-issues the command matching the device's current state. Goes through
    /// the idempotency filter, so it only reaches hardware if the last attempt
    /// was never delivered.
    pub async fn resend_command(&self, device_id: i64) -> Result<&'static str, RentalError> {
        let device = self
            .in_store(move |store| Ok(store.device(device_id)?))
            .await?
            .ok_or(RentalError::DeviceNotFound(device_id))?;
        let command = if device.is_running() { CMD_ON } else { CMD_OFF };
        self.dispatcher.send(device_id, command).await?;
        Ok(command)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, RentalError> {
        self.in_store(|store| Ok(store.list_devices()?)).await
    }

    /// Every device with its remaining time and latest lease.
    pub async fn snapshot(&self) -> Result<Vec<DeviceSnapshot>, RentalError> {
        let now = self.clock.now();
        self.in_store(move |store| {
            let devices = store.list_devices()?;
            let mut snapshots = Vec::with_capacity(devices.len());
            for device in devices {
                let last_transaction = store.last_lease(device.id)?;
                snapshots.push(DeviceSnapshot {
                    remaining_sec: device.remaining(now).whole_seconds(),
                    device,
                    last_transaction,
                });
            }
            Ok(snapshots)
        })
        .await
    }

    pub async fn snapshot_payload(&self) -> Result<Vec<u8>, RentalError> {
        let snapshots = self.snapshot().await?;
        Ok(status_payload(&snapshots).map_err(StoreError::from)?)
    }

    /// Broadcasts a fresh snapshot when anyone is listening. Returns the
    /// number of subscribers reached.
    pub async fn publish_snapshot(&self) -> usize {
        if self.hub.size() == 0 {
            return 0;
        }
        match self.snapshot_payload().await {
            Ok(payload) => self.hub.publish(&payload),
            Err(e) => {
                warn!("Failed to build status snapshot: {}", e);
                0
            }
        }
    }

    pub async fn transactions(&self, device_id: i64) -> Result<Vec<LeaseRecord>, RentalError> {
        self.in_store(move |store| {
            if store.device(device_id)?.is_none() {
                return Err(RentalError::DeviceNotFound(device_id));
            }
            Ok(store.leases_for_device(device_id, HISTORY_LIMIT)?)
        })
        .await
    }

    /// Running devices whose lease ends within `threshold` from now,
    /// soonest first. Already-expired leases are included.
    pub async fn due_soon(&self, threshold: Duration) -> Result<Vec<Device>, RentalError> {
        let cutoff = self.clock.now() + threshold;
        self.in_store(move |store| Ok(store.running_due_by(cutoff)?))
            .await
    }

    pub async fn last_price_change(&self, device_id: i64) -> Result<Option<PriceChange>, RentalError> {
        self.in_store(move |store| Ok(store.last_price_change(device_id)?))
            .await
    }

    async fn send_command(&self, device_id: i64, command: &str) {
        if let Err(e) = self.dispatcher.send(device_id, command).await {
            warn!(
                "Command {} to device {} failed, lease state kept: {}",
                command, device_id, e
            );
        }
    }

    async fn in_store<T, F>(&self, f: F) -> Result<T, RentalError>
    where
        F: FnOnce(&LeaseStore) -> Result<T, RentalError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| RentalError::StoreFailure(StoreError::Join(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteMode;
    use crate::dispatcher::MockEndpoint;
    use crate::models::DeviceStatus;
    use crate::testing::{temp_db_path, ManualClock};

    struct Fixture {
        lifecycle: RentalLifecycle,
        store: Arc<LeaseStore>,
        endpoint: Arc<MockEndpoint>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LeaseStore::open(&temp_db_path(), SqliteMode::Balanced).unwrap());
        store.initialize_db().unwrap();
        store.seed_devices(2, 40_000).unwrap();
        let endpoint = Arc::new(MockEndpoint::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            endpoint.clone(),
            std::time::Duration::from_secs(1),
        ));
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let lifecycle = RentalLifecycle::new(
            store.clone(),
            dispatcher,
            Arc::new(BroadcastHub::new()),
            clock.clone(),
        );
        Fixture {
            lifecycle,
            store,
            endpoint,
            clock,
        }
    }

    #[tokio::test]
    async fn start_opens_lease_and_switches_on() {
        let f = fixture();
        let start = f.clock.now();
        let lease = f.lifecycle.start_rental(1, 30).await.unwrap();

        assert_eq!(lease.duration_minutes, 30);
        assert_eq!(lease.total_price, 20_000);
        assert_eq!(lease.rate_snapshot, 40_000);
        let device = f.store.device(1).unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Running);
        assert_eq!(device.lease_end, Some(start + Duration::minutes(30)));
        assert_eq!(f.endpoint.delivered(), vec![(1, "ON".to_string())]);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_touching_the_store() {
        let f = fixture();
        assert!(matches!(f.lifecycle.start_rental(1, 0).await, Err(RentalError::InvalidDuration)));
        assert!(matches!(f.lifecycle.start_rental(1, -5).await, Err(RentalError::InvalidDuration)));
        assert!(matches!(f.lifecycle.extend_rental(1, 0).await, Err(RentalError::InvalidDuration)));
        assert!(matches!(f.lifecycle.update_price(1, 0).await, Err(RentalError::InvalidPrice)));
        assert!(matches!(f.lifecycle.start_rental(99, 10).await, Err(RentalError::DeviceNotFound(99))));
        assert!(matches!(f.lifecycle.stop_rental(99).await, Err(RentalError::DeviceNotFound(99))));
        assert!(matches!(f.lifecycle.update_price(99, 10).await, Err(RentalError::DeviceNotFound(99))));
        assert!(f.endpoint.delivered().is_empty());
    }

    #[tokio::test]
    async fn start_on_running_device_changes_nothing() {
        let f = fixture();
        f.lifecycle.start_rental(1, 30).await.unwrap();
        let before = f.store.device(1).unwrap();
        let lease_before = f.store.last_lease(1).unwrap();

        f.clock.advance(Duration::minutes(5));
        let err = f.lifecycle.start_rental(1, 60).await.unwrap_err();
        assert!(matches!(err, RentalError::AlreadyRunning(ref name) if name == "PS1"));
        assert_eq!(f.store.device(1).unwrap(), before);
        assert_eq!(f.store.last_lease(1).unwrap(), lease_before);
        assert_eq!(f.store.leases_for_device(1, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extend_and_stop_require_a_running_device() {
        let f = fixture();
        assert!(matches!(f.lifecycle.extend_rental(2, 10).await, Err(RentalError::NotRunning(_))));
        assert!(matches!(f.lifecycle.stop_rental(2).await, Err(RentalError::NotRunning(_))));
    }

    #[tokio::test]
    async fn extend_keeps_the_original_rate() {
        let f = fixture();
        f.lifecycle.start_rental(1, 30).await.unwrap();
        f.lifecycle.update_price(1, 90_000).await.unwrap();

        let lease = f.lifecycle.extend_rental(1, 30).await.unwrap().unwrap();
        assert_eq!(lease.duration_minutes, 60);
        assert_eq!(lease.rate_snapshot, 40_000);
        assert_eq!(lease.total_price, 40_000);
        assert_eq!(f.store.last_lease(1).unwrap(), Some(lease));
        assert_eq!(f.store.device(1).unwrap().unwrap().rate_per_hour, 90_000);
    }

    #[tokio::test]
    async fn price_change_is_audited() {
        let f = fixture();
        f.clock.advance(Duration::hours(1));
        f.lifecycle.update_price(2, 55_000).await.unwrap();

        let change = f.lifecycle.last_price_change(2).await.unwrap().unwrap();
        assert_eq!(change.old_rate, 40_000);
        assert_eq!(change.new_rate, 55_000);
        assert_eq!(change.changed_at, f.clock.now());

        let lease = f.lifecycle.start_rental(2, 60).await.unwrap();
        assert_eq!(lease.total_price, 55_000);
    }

    #[tokio::test]
    async fn due_soon_lists_leases_ending_within_threshold() {
        let f = fixture();
        f.lifecycle.start_rental(1, 5).await.unwrap();
        f.lifecycle.start_rental(2, 120).await.unwrap();

        let due = f.lifecycle.due_soon(Duration::minutes(10)).await.unwrap();
        assert_eq!(due.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1]);
        let due = f.lifecycle.due_soon(Duration::hours(3)).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn endpoint_failure_does_not_roll_back_the_lease() {
        let f = fixture();
        f.endpoint.set_failing(true);
        f.lifecycle.start_rental(1, 15).await.unwrap();
        assert!(f.store.device(1).unwrap().unwrap().is_running());
        assert!(f.endpoint.delivered().is_empty());

        f.endpoint.set_failing(false);
        assert_eq!(f.lifecycle.resend_command(1).await.unwrap(), "ON");
        assert_eq!(f.endpoint.count(1, "ON"), 1);
        // Already delivered: a second resend is absorbed by the filter.
        f.lifecycle.resend_command(1).await.unwrap();
        assert_eq!(f.endpoint.count(1, "ON"), 1);
    }

    #[tokio::test]
    async fn snapshot_reports_remaining_time_and_last_lease() {
        let f = fixture();
        f.lifecycle.start_rental(1, 10).await.unwrap();
        f.clock.advance(Duration::minutes(4));

        let snapshot = f.lifecycle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].remaining_sec, 6 * 60);
        assert_eq!(snapshot[0].last_transaction.as_ref().unwrap().duration_minutes, 10);
        assert_eq!(snapshot[1].remaining_sec, 0);
        assert!(snapshot[1].last_transaction.is_none());
    }

    #[tokio::test]
    async fn mutations_publish_only_when_someone_listens() {
        let f = fixture();
        f.lifecycle.start_rental(1, 10).await.unwrap();

        let (_id, mut rx) = f.lifecycle.hub().subscribe(8);
        f.lifecycle.stop_rental(1).await.unwrap();
        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"][0]["status"], "IDLE");
        assert!(value["data"][0]["lease_end"].is_null());
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let f = fixture();
        for minutes in [10, 20, 30] {
            f.lifecycle.start_rental(1, minutes).await.unwrap();
            f.lifecycle.stop_rental(1).await.unwrap();
        }
        let history = f.lifecycle.transactions(1).await.unwrap();
        let durations: Vec<_> = history.iter().map(|l| l.duration_minutes).collect();
        assert_eq!(durations, [30, 20, 10]);
        assert!(matches!(f.lifecycle.transactions(42).await, Err(RentalError::DeviceNotFound(42))));
    }
}
