use serde::Serialize;
use std::fmt;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Idle,
    Running,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Idle => "IDLE",
            DeviceStatus::Running => "RUNNING",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IDLE" => Some(DeviceStatus::Idle),
            "RUNNING" => Some(DeviceStatus::Running),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rentable console.
///
/// `lease_end` is only set while the device is `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_end: Option<OffsetDateTime>,
    pub rate_per_hour: i64,
}

impl Device {
    pub fn is_running(&self) -> bool {
        self.status == DeviceStatus::Running
    }

    /// Running with a lease end at or before `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match (self.status, self.lease_end) {
            (DeviceStatus::Running, Some(end)) => now >= end,
            _ => false,
        }
    }

    /// Time left on the lease, clamped to zero.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        match (self.status, self.lease_end) {
            (DeviceStatus::Running, Some(end)) if end > now => end - now,
            _ => Duration::ZERO,
        }
    }
}

/// One rental window. The most recent record of a running device is
/// rewritten on every extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRecord {
    pub id: i64,
    pub device_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub duration_minutes: i64,
    pub total_price: i64,
    pub rate_snapshot: i64,
}

impl LeaseRecord {
    pub fn extend(&mut self, add_minutes: i64) {
        self.duration_minutes += add_minutes;
        self.end_time = self.start_time + Duration::minutes(self.duration_minutes);
        self.total_price = lease_price(self.rate_snapshot, self.duration_minutes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceChange {
    pub id: i64,
    pub device_id: i64,
    pub old_rate: i64,
    pub new_rate: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

/// Entry of the status payload pushed to viewers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    #[serde(flatten)]
    pub device: Device,
    pub remaining_sec: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transaction: Option<LeaseRecord>,
}

#[derive(Debug, Serialize)]
struct StatusMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a [DeviceSnapshot],
}

/// Serializes a snapshot list into the `{"type":"status","data":[...]}` frame.
pub fn status_payload(snapshots: &[DeviceSnapshot]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StatusMessage {
        kind: "status",
        data: snapshots,
    })
}

/// Integer price of `minutes` at `rate_per_hour`, truncated toward zero.
pub fn lease_price(rate_per_hour: i64, minutes: i64) -> i64 {
    rate_per_hour * minutes / 60
}
