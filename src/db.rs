use crate::error::StoreError;
use crate::models::{Device, DeviceStatus, LeaseRecord, PriceChange};
use log::{error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::time::Duration;
use time::OffsetDateTime;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const DEVICE_COLUMNS: &str = "id, name, status, lease_end, rate_per_hour";
const LEASE_COLUMNS: &str =
    "id, device_id, start_time, end_time, duration_minutes, total_price, rate_snapshot";

/// PRAGMA profile applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqliteMode {
    /// synchronous=OFF and an exclusive lock; fastest, may lose data on crash.
    Aggressive,
    Balanced,
    /// synchronous=FULL.
    Safe,
}

impl SqliteMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Some(SqliteMode::Aggressive),
            "balanced" => Some(SqliteMode::Balanced),
            "safe" => Some(SqliteMode::Safe),
            _ => None,
        }
    }

    fn pool_size(&self) -> u32 {
        match self {
            SqliteMode::Aggressive => 1,
            _ => 4,
        }
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        let (synchronous, cache_mb) = match self {
            SqliteMode::Aggressive => ("OFF", 256),
            SqliteMode::Balanced => ("NORMAL", 64),
            SqliteMode::Safe => ("FULL", 16),
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "cache_size", -(cache_mb * 1024))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if *self == SqliteMode::Aggressive {
            conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        }
        Ok(())
    }
}

/// SQLite-backed persistence for devices, leases and price history.
pub struct LeaseStore {
    pool: Pool<SqliteConnectionManager>,
}

impl LeaseStore {
    /// Opens a pool on `db_path` with the PRAGMAs of `mode`.
    pub fn open(db_path: &str, mode: SqliteMode) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(move |c| mode.apply(c));
        let pool = Pool::builder().max_size(mode.pool_size()).build(manager)?;
        info!("Opened SQLite store at {} ({:?} mode).", db_path, mode);
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'IDLE',
            lease_end INTEGER,
            rate_per_hour INTEGER NOT NULL CHECK (rate_per_hour > 0)
        );

        CREATE INDEX IF NOT EXISTS idx_devices_status_end ON devices(status, lease_end);

        CREATE TABLE IF NOT EXISTS leases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
            total_price INTEGER NOT NULL CHECK (total_price >= 0),
            rate_snapshot INTEGER NOT NULL CHECK (rate_snapshot > 0),
            FOREIGN KEY (device_id) REFERENCES devices(id)
        );

        CREATE INDEX IF NOT EXISTS idx_leases_device ON leases(device_id, id);

        CREATE TABLE IF NOT EXISTS price_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            old_rate INTEGER NOT NULL,
            new_rate INTEGER NOT NULL,
            changed_at INTEGER NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id)
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Provisions `PS1..PS{count}` when no device exists yet. Returns how many were created.
    pub fn seed_devices(&self, count: u32, rate_per_hour: i64) -> Result<usize, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row("SELECT COUNT(1) FROM devices", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }
        for i in 1..=count {
            tx.execute(
                "INSERT INTO devices (name, status, rate_per_hour) VALUES (?1, 'IDLE', ?2)",
                params![format!("PS{}", i), rate_per_hour],
            )?;
        }
        tx.commit()?;
        info!("Seeded {} devices at {} per hour.", count, rate_per_hour);
        Ok(count as usize)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
    /// up front, so two read-then-write sequences on the same device never
    /// interleave. Any error from `f` rolls everything back.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&DeviceTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.pool.get().map_err(StoreError::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let scope = DeviceTx { tx };
        let out = f(&scope)?;
        scope.tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    pub fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"))?;
        let rows = stmt.query_map([], device_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn device(&self, device_id: i64) -> Result<Option<Device>, StoreError> {
        let conn = self.pool.get()?;
        Ok(select_device(&conn, device_id)?)
    }

    /// Running devices whose lease ends at or before `cutoff`, soonest first.
    pub fn running_due_by(&self, cutoff: OffsetDateTime) -> Result<Vec<Device>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE status = 'RUNNING' AND lease_end <= ?1
             ORDER BY lease_end"
        ))?;
        let rows = stmt.query_map(params![to_millis(cutoff)], device_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn last_lease(&self, device_id: i64) -> Result<Option<LeaseRecord>, StoreError> {
        let conn = self.pool.get()?;
        Ok(select_last_lease(&conn, device_id)?)
    }

    /// Newest-first lease history of a device.
    pub fn leases_for_device(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<LeaseRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![device_id, limit as i64], lease_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn last_price_change(&self, device_id: i64) -> Result<Option<PriceChange>, StoreError> {
        let conn = self.pool.get()?;
        let change = conn
            .query_row(
                "SELECT id, device_id, old_rate, new_rate, changed_at
                 FROM price_changes WHERE device_id = ?1 ORDER BY id DESC LIMIT 1",
                params![device_id],
                |row| {
                    Ok(PriceChange {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        old_rate: row.get(2)?,
                        new_rate: row.get(3)?,
                        changed_at: from_millis(4, row.get(4)?)?,
                    })
                },
            )
            .optional()?;
        Ok(change)
    }
}

/// Write scope handed to [`LeaseStore::transaction`] callers.
pub struct DeviceTx<'c> {
    tx: Transaction<'c>,
}

impl DeviceTx<'_> {
    pub fn device(&self, device_id: i64) -> Result<Option<Device>, StoreError> {
        Ok(select_device(&self.tx, device_id)?)
    }

    pub fn mark_running(&self, device_id: i64, lease_end: OffsetDateTime) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE devices SET status = 'RUNNING', lease_end = ?1 WHERE id = ?2",
            params![to_millis(lease_end), device_id],
        )?;
        Ok(())
    }

    pub fn set_lease_end(&self, device_id: i64, lease_end: OffsetDateTime) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE devices SET lease_end = ?1 WHERE id = ?2",
            params![to_millis(lease_end), device_id],
        )?;
        Ok(())
    }

    pub fn mark_idle(&self, device_id: i64) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE devices SET status = 'IDLE', lease_end = NULL WHERE id = ?1",
            params![device_id],
        )?;
        Ok(())
    }

    pub fn set_rate(&self, device_id: i64, rate_per_hour: i64) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE devices SET rate_per_hour = ?1 WHERE id = ?2",
            params![rate_per_hour, device_id],
        )?;
        Ok(())
    }

    /// Appends a lease and returns it with its assigned id.
    pub fn insert_lease(&self, lease: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.tx.execute(
            "INSERT INTO leases
                 (device_id, start_time, end_time, duration_minutes, total_price, rate_snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lease.device_id,
                to_millis(lease.start_time),
                to_millis(lease.end_time),
                lease.duration_minutes,
                lease.total_price,
                lease.rate_snapshot,
            ],
        )?;
        Ok(LeaseRecord {
            id: self.tx.last_insert_rowid(),
            ..lease.clone()
        })
    }

    pub fn last_lease(&self, device_id: i64) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(select_last_lease(&self.tx, device_id)?)
    }

    pub fn update_lease(&self, lease: &LeaseRecord) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE leases SET end_time = ?1, duration_minutes = ?2, total_price = ?3 WHERE id = ?4",
            params![
                to_millis(lease.end_time),
                lease.duration_minutes,
                lease.total_price,
                lease.id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_price_change(
        &self,
        device_id: i64,
        old_rate: i64,
        new_rate: i64,
        changed_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO price_changes (device_id, old_rate, new_rate, changed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![device_id, old_rate, new_rate, to_millis(changed_at)],
        )?;
        Ok(())
    }
}

fn select_device(conn: &Connection, device_id: i64) -> rusqlite::Result<Option<Device>> {
    conn.query_row(
        &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
        params![device_id],
        device_from_row,
    )
    .optional()
}

fn select_last_lease(conn: &Connection, device_id: i64) -> rusqlite::Result<Option<LeaseRecord>> {
    conn.query_row(
        &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE device_id = ?1 ORDER BY id DESC LIMIT 1"),
        params![device_id],
        lease_from_row,
    )
    .optional()
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let raw_status: String = row.get(2)?;
    let status = DeviceStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown device status '{}'", raw_status).into(),
        )
    })?;
    let lease_end = match row.get::<_, Option<i64>>(3)? {
        Some(ms) => Some(from_millis(3, ms)?),
        None => None,
    };
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        lease_end,
        rate_per_hour: row.get(4)?,
    })
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<LeaseRecord> {
    Ok(LeaseRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        start_time: from_millis(2, row.get(2)?)?,
        end_time: from_millis(3, row.get(3)?)?,
        duration_minutes: row.get(4)?,
        total_price: row.get(5)?,
        rate_snapshot: row.get(6)?,
    })
}

fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(column: usize, ms: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}
