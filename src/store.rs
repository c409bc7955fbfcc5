//! SQLite persistence layer (via sqlx): device catalog, sensor time-series,
//! device error log, capability snapshots, and bridge-derived metrics.
//!
//! Queries are built with `sqlx::query`/`query_as` against runtime-bound
//! parameters rather than the `query!` macro family, so the crate does not
//! need a live database or an offline query cache to build.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::BridgeError;
use crate::registry::SensorValue;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceRow {
    pub device_id: String,
    pub device_type: Option<String>,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub firmware_version: Option<String>,
    pub location: Option<String>,
    pub status: String,
    pub last_seen: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorDataRow {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub quality: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceErrorRow {
    pub device_id: String,
    pub error_type: String,
    pub message: String,
    pub severity: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySnapshotRow {
    pub device_id: String,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub metadata: serde_json::Value,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DeviceMetricsRow {
    pub device_id: String,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub connection_failures: i64,
    pub sensor_read_errors: i64,
    pub last_activity: i64,
    pub uptime_start: i64,
}

#[derive(Debug, Default)]
pub struct CleanupCounts {
    pub sensor_data_deleted: u64,
    pub device_errors_deleted: u64,
}

impl Store {
    /// db_url examples:
    /// - "sqlite:/var/lib/bridge/bridge.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    fn map_err(e: sqlx::Error) -> BridgeError {
        BridgeError::StorageUnavailable(e.to_string())
    }

    // ----------------------------
    // Device catalog
    // ----------------------------

    pub async fn register_device(
        &self,
        device_id: &str,
        device_type: Option<&str>,
        sensors: &[String],
        actuators: &[String],
        firmware_version: Option<&str>,
        location: Option<&str>,
    ) -> Result<(), BridgeError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let sensors_json = serde_json::to_string(sensors).unwrap_or_else(|_| "[]".into());
        let actuators_json = serde_json::to_string(actuators).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, device_type, sensors_json, actuators_json,
              firmware_version, location, status, last_seen, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'offline', ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              device_type = COALESCE(excluded.device_type, device_type),
              sensors_json = excluded.sensors_json,
              actuators_json = excluded.actuators_json,
              firmware_version = COALESCE(excluded.firmware_version, firmware_version),
              location = COALESCE(excluded.location, location),
              last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(device_type)
        .bind(&sensors_json)
        .bind(&actuators_json)
        .bind(firmware_version)
        .bind(location)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    /// Persists `status` verbatim (spec §4.4: device status strings other
    /// than "online"/"offline" are accepted and stored as reported, not
    /// canonicalized). Callers that need a canonical flip — the timeout
    /// scan, say — just pass the literal `"offline"`.
    pub async fn update_device_status(
        &self,
        device_id: &str,
        status: &str,
        last_seen: i64,
    ) -> Result<(), BridgeError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, status, last_seen, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              status = excluded.status,
              last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(status)
        .bind(last_seen)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRow>, BridgeError> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_err)?;

        Ok(row.map(Self::row_to_device))
    }

    fn row_to_device(row: sqlx::sqlite::SqliteRow) -> DeviceRow {
        let sensors_json: String = row.try_get("sensors_json").unwrap_or_default();
        let actuators_json: String = row.try_get("actuators_json").unwrap_or_default();
        DeviceRow {
            device_id: row.try_get("device_id").unwrap_or_default(),
            device_type: row.try_get("device_type").ok(),
            sensors: serde_json::from_str(&sensors_json).unwrap_or_default(),
            actuators: serde_json::from_str(&actuators_json).unwrap_or_default(),
            firmware_version: row.try_get("firmware_version").ok(),
            location: row.try_get("location").ok(),
            status: row.try_get("status").unwrap_or_else(|_| "offline".into()),
            last_seen: row.try_get("last_seen").unwrap_or_default(),
            created_at: row.try_get("created_at").unwrap_or_default(),
        }
    }

    // ----------------------------
    // Sensor time-series
    // ----------------------------

    pub async fn store_sensor_data(
        &self,
        device_id: &str,
        sensor_type: &str,
        value: &SensorValue,
        timestamp: i64,
    ) -> Result<(), BridgeError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO sensor_data (device_id, sensor_type, value, unit, quality, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(sensor_type)
        .bind(value.reading)
        .bind(value.unit.as_deref())
        .bind(value.quality)
        .bind(timestamp)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    pub async fn get_sensor_data(
        &self,
        device_id: &str,
        sensor_type: &str,
        since_minutes: Option<i64>,
        limit: i64,
    ) -> Result<Vec<SensorDataRow>, BridgeError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT device_id, sensor_type, value, unit, quality, timestamp FROM sensor_data WHERE device_id = ",
        );
        qb.push_bind(device_id);
        qb.push(" AND sensor_type = ");
        qb.push_bind(sensor_type);

        if let Some(mins) = since_minutes {
            let cutoff = OffsetDateTime::now_utc().unix_timestamp() - mins * 60;
            qb.push(" AND timestamp >= ");
            qb.push_bind(cutoff);
        }

        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_err)?;

        Ok(rows
            .into_iter()
            .map(|r| SensorDataRow {
                device_id: r.try_get("device_id").unwrap_or_default(),
                sensor_type: r.try_get("sensor_type").unwrap_or_default(),
                value: r.try_get("value").unwrap_or_default(),
                unit: r.try_get("unit").ok(),
                quality: r.try_get("quality").ok(),
                timestamp: r.try_get("timestamp").unwrap_or_default(),
            })
            .collect())
    }

    // ----------------------------
    // Device errors
    // ----------------------------

    pub async fn log_device_error(
        &self,
        device_id: &str,
        error_type: &str,
        message: &str,
        severity: i64,
        timestamp: i64,
    ) -> Result<(), BridgeError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO device_errors (device_id, error_type, message, severity, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(error_type)
        .bind(message)
        .bind(severity)
        .bind(timestamp)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    pub async fn get_device_errors(
        &self,
        device_id: Option<&str>,
        min_severity: Option<i64>,
        since_minutes: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DeviceErrorRow>, BridgeError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT device_id, error_type, message, severity, timestamp FROM device_errors",
        );

        let mut has_where = false;
        if let Some(id) = device_id {
            qb.push(" WHERE device_id = ");
            qb.push_bind(id);
            has_where = true;
        }
        if let Some(sev) = min_severity {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("severity >= ");
            qb.push_bind(sev);
            has_where = true;
        }
        if let Some(mins) = since_minutes {
            let cutoff = OffsetDateTime::now_utc().unix_timestamp() - mins * 60;
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("timestamp >= ");
            qb.push_bind(cutoff);
        }

        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_err)?;

        Ok(rows
            .into_iter()
            .map(|r| DeviceErrorRow {
                device_id: r.try_get("device_id").unwrap_or_default(),
                error_type: r.try_get("error_type").unwrap_or_default(),
                message: r.try_get("message").unwrap_or_default(),
                severity: r.try_get("severity").unwrap_or_default(),
                timestamp: r.try_get("timestamp").unwrap_or_default(),
            })
            .collect())
    }

    // ----------------------------
    // Capability snapshots (latest-wins)
    // ----------------------------

    pub async fn upsert_capabilities(
        &self,
        snapshot: &CapabilitySnapshotRow,
    ) -> Result<(), BridgeError> {
        let sensors_json =
            serde_json::to_string(&snapshot.sensors).unwrap_or_else(|_| "[]".into());
        let actuators_json =
            serde_json::to_string(&snapshot.actuators).unwrap_or_else(|_| "[]".into());
        let metadata_json = snapshot.metadata.to_string();

        sqlx::query(
            r#"
            INSERT INTO device_capabilities (
              device_id, sensors_json, actuators_json, metadata_json,
              firmware_version, hardware_version, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              sensors_json = excluded.sensors_json,
              actuators_json = excluded.actuators_json,
              metadata_json = excluded.metadata_json,
              firmware_version = excluded.firmware_version,
              hardware_version = excluded.hardware_version,
              last_updated = excluded.last_updated
            "#,
        )
        .bind(&snapshot.device_id)
        .bind(&sensors_json)
        .bind(&actuators_json)
        .bind(&metadata_json)
        .bind(&snapshot.firmware_version)
        .bind(&snapshot.hardware_version)
        .bind(snapshot.last_updated)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    pub async fn get_capabilities(
        &self,
        device_id: &str,
    ) -> Result<Option<CapabilitySnapshotRow>, BridgeError> {
        let row = sqlx::query("SELECT * FROM device_capabilities WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_err)?;

        Ok(row.map(|r| {
            let sensors_json: String = r.try_get("sensors_json").unwrap_or_default();
            let actuators_json: String = r.try_get("actuators_json").unwrap_or_default();
            let metadata_json: String = r.try_get("metadata_json").unwrap_or_else(|_| "{}".into());
            CapabilitySnapshotRow {
                device_id: r.try_get("device_id").unwrap_or_default(),
                sensors: serde_json::from_str(&sensors_json).unwrap_or_default(),
                actuators: serde_json::from_str(&actuators_json).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata_json)
                    .unwrap_or_else(|_| serde_json::json!({})),
                firmware_version: r.try_get("firmware_version").ok(),
                hardware_version: r.try_get("hardware_version").ok(),
                last_updated: r.try_get("last_updated").unwrap_or_default(),
            }
        }))
    }

    // ----------------------------
    // Metrics (overwrite-by-key)
    // ----------------------------

    pub async fn upsert_metrics(&self, metrics: &DeviceMetricsRow) -> Result<(), BridgeError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO device_metrics (
              device_id, messages_sent, messages_received, connection_failures,
              sensor_read_errors, last_activity, uptime_start, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              messages_sent = excluded.messages_sent,
              messages_received = excluded.messages_received,
              connection_failures = excluded.connection_failures,
              sensor_read_errors = excluded.sensor_read_errors,
              last_activity = excluded.last_activity,
              last_updated = excluded.last_updated
            "#,
        )
        .bind(&metrics.device_id)
        .bind(metrics.messages_sent)
        .bind(metrics.messages_received)
        .bind(metrics.connection_failures)
        .bind(metrics.sensor_read_errors)
        .bind(metrics.last_activity)
        .bind(metrics.uptime_start)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::map_err)?;
        Ok(())
    }

    pub async fn get_device_metrics(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<DeviceMetricsRow>, BridgeError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT device_id, messages_sent, messages_received, connection_failures, \
             sensor_read_errors, last_activity, uptime_start FROM device_metrics",
        );
        if let Some(id) = device_id {
            qb.push(" WHERE device_id = ");
            qb.push_bind(id);
        }
        qb.push(" ORDER BY device_id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_err)?;

        Ok(rows
            .into_iter()
            .map(|r| DeviceMetricsRow {
                device_id: r.try_get("device_id").unwrap_or_default(),
                messages_sent: r.try_get("messages_sent").unwrap_or_default(),
                messages_received: r.try_get("messages_received").unwrap_or_default(),
                connection_failures: r.try_get("connection_failures").unwrap_or_default(),
                sensor_read_errors: r.try_get("sensor_read_errors").unwrap_or_default(),
                last_activity: r.try_get("last_activity").unwrap_or_default(),
                uptime_start: r.try_get("uptime_start").unwrap_or_default(),
            })
            .collect())
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Deletes `sensor_data` and `device_errors` rows older than
    /// `retention_days`. Never touches `devices` or `device_capabilities`.
    /// Runs as bounded-batch deletes so a large backlog doesn't hold a
    /// single long write transaction.
    pub async fn cleanup(&self, retention_days: i64) -> Result<CleanupCounts, BridgeError> {
        let cutoff = OffsetDateTime::now_utc().unix_timestamp() - retention_days * 86400;
        const BATCH: i64 = 5000;

        let mut counts = CleanupCounts::default();

        loop {
            let result = sqlx::query(
                "DELETE FROM sensor_data WHERE id IN (SELECT id FROM sensor_data WHERE timestamp < ? LIMIT ?)",
            )
            .bind(cutoff)
            .bind(BATCH)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;

            let affected = result.rows_affected();
            counts.sensor_data_deleted += affected;
            if affected < BATCH as u64 {
                break;
            }
        }

        loop {
            let result = sqlx::query(
                "DELETE FROM device_errors WHERE id IN (SELECT id FROM device_errors WHERE timestamp < ? LIMIT ?)",
            )
            .bind(cutoff)
            .bind(BATCH)
            .execute(&self.pool)
            .await
            .map_err(Self::map_err)?;

            let affected = result.rows_affected();
            counts.device_errors_deleted += affected;
            if affected < BATCH as u64 {
                break;
            }
        }

        Ok(counts)
    }

    /// Quick connectivity check — runs a trivial query.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
