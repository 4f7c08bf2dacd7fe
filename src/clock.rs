use async_trait::async_trait;
use time::OffsetDateTime;

/// Source of wall-clock time for leases and the expiry loop.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Resolves once `now()` has reached `deadline`.
    async fn sleep_until(&self, deadline: OffsetDateTime);
}

#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let wait = deadline - self.now();
        if wait.is_positive() {
            let wait = std::time::Duration::try_from(wait).unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    async fn system_clock_returns_for_past_deadline() {
        let clock = SystemClock;
        let past = clock.now() - Duration::seconds(5);
        tokio::time::timeout(std::time::Duration::from_secs(1), clock.sleep_until(past))
            .await
            .expect("sleep_until on a past deadline must not block");
    }
}
