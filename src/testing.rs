use crate::clock::Clock;
use async_trait::async_trait;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

/// Path of a fresh SQLite file under the system temp dir.
pub fn temp_db_path() -> String {
    std::env::temp_dir()
        .join(format!("console_switch_test_{}.db", Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

/// Clock that only moves when told to. `sleep_until` jumps straight to the
/// deadline, so loops driven by it run without wall-clock delays.
#[derive(Debug)]
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

#[tokio::test]
async fn manual_clock_jumps_to_deadline() {
    use time::Duration;

    let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
    let clock = ManualClock::new(start);

    clock.sleep_until(start + Duration::seconds(10)).await;
    assert_eq!(clock.now(), start + Duration::seconds(10));

    // Deadlines in the past never move time backwards.
    clock.sleep_until(start).await;
    assert_eq!(clock.now(), start + Duration::seconds(10));

    clock.advance(Duration::minutes(1));
    assert_eq!(clock.now(), start + Duration::seconds(70));
}
