use crate::error::RentalError;
use crate::lifecycle::RentalLifecycle;
use std::sync::Arc;
use time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Period while at least one viewer is connected.
    pub fast_interval: Duration,
    /// Period with no viewers.
    pub slow_interval: Duration,
    pub warn_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::seconds(2),
            slow_interval: Duration::seconds(10),
            warn_threshold: Duration::seconds(60),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub expired: Vec<i64>,
    pub warned: Vec<i64>,
    pub failed: usize,
    pub published: usize,
}

impl TickReport {
    pub fn changed(&self) -> bool {
        !self.expired.is_empty()
    }
}

/// Background poll that stops expired leases and keeps viewers' countdowns fresh.
pub struct ExpiryScheduler {
    lifecycle: Arc<RentalLifecycle>,
    config: SchedulerConfig,
}

impl ExpiryScheduler {
    pub fn new(lifecycle: Arc<RentalLifecycle>, config: SchedulerConfig) -> Self {
        Self { lifecycle, config }
    }

    pub fn interval(&self) -> Duration {
        if self.lifecycle.hub().size() > 0 {
            self.config.fast_interval
        } else {
            self.config.slow_interval
        }
    }

    pub async fn tick(&self) -> Result<TickReport, RentalError> {
        let now = self.lifecycle.clock().now();
        let devices = self.lifecycle.list_devices().await?;
        let listening = self.lifecycle.hub().size() > 0;
        let mut report = TickReport::default();

        for device in &devices {
            if device.is_expired(now) {
                match self.lifecycle.expire_lease(device.id, now).await {
                    Ok(Some(_)) => report.expired.push(device.id),
                    Ok(None) => {
                        debug!("{} was stopped or extended before expiry.", device.name);
                    }
                    Err(e) => {
                        error!("Failed to auto-stop {}: {}", device.name, e);
                        report.failed += 1;
                    }
                }
                continue;
            }

            if !device.is_running() {
                continue;
            }

            let remaining = device.remaining(now);
            if listening && remaining < self.config.warn_threshold {
                warn!(
                    "{} ends in {} seconds.",
                    device.name,
                    remaining.whole_seconds()
                );
                report.warned.push(device.id);
            }
        }

        if listening {
            report.published = self.lifecycle.publish_snapshot().await;
        }
        Ok(report)
    }

    /// Runs until `shutdown` flips to true or its sender goes away. A tick in
    /// progress always completes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let clock = self.lifecycle.clock().clone();
        let mut last_tick = clock.now();
        info!("Expiry scheduler started.");

        loop {
            let interval = self.interval();
            let next = last_tick + interval;

            tokio::select! {
                _ = clock.sleep_until(next) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            // Anchor on the planned wake time; resync only when a whole
            // interval was missed.
            let now = clock.now();
            last_tick = if now - next >= interval { now } else { next };

            match self.tick().await {
                Ok(report) if report.changed() => {
                    debug!("Tick expired {} lease(s).", report.expired.len())
                }
                Ok(_) => {}
                Err(e) => error!("Expiry tick failed: {}", e),
            }
        }

        info!("Expiry scheduler stopped.");
    }
}
