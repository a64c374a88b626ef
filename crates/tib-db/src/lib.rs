use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tib_core::error::PersistError;
use tib_core::port::{CatalogMap, PersistencePort, RetentionTable};
use tib_schemas::{
    CatalogEntry, CatalogKey, Event, GpsFix, GpsRawRecord, HistoryRow, LatestStateRow, RegisterKey,
    ValueKind, WriteReason,
};

pub const ENV_DB_URL: &str = "TIB_DATABASE_URL";

/// Connect to Postgres using `TIB_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Postgres-backed implementation of [`PersistencePort`].
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Retryable faults (connection loss, pool exhaustion, timeouts) map to
/// `PersistError::Transient`; everything else (constraint violations,
/// malformed rows, protocol errors) is fatal.
fn classify(err: sqlx::Error, context: &str) -> PersistError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            PersistError::Transient(format!("{context}: {err}"))
        }
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("57P03") => {
            // cannot_connect_now
            PersistError::Transient(format!("{context}: {err}"))
        }
        _ => PersistError::Fatal(format!("{context}: {err}")),
    }
}

fn value_kind_str(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Analog => "analog",
        ValueKind::Discrete => "discrete",
        ValueKind::Counter => "counter",
        ValueKind::Enum => "enum",
        ValueKind::Text => "text",
    }
}

fn value_kind_from_str(s: &str) -> ValueKind {
    match s {
        "discrete" => ValueKind::Discrete,
        "counter" => ValueKind::Counter,
        "enum" => ValueKind::Enum,
        "text" => ValueKind::Text,
        _ => ValueKind::Analog,
    }
}

fn write_reason_str(reason: WriteReason) -> &'static str {
    match reason {
        WriteReason::First => "first",
        WriteReason::Change => "change",
        WriteReason::Heartbeat => "heartbeat",
        WriteReason::ReasonChange => "reason_change",
    }
}

#[derive(sqlx::FromRow)]
struct CatalogRow {
    equip_type: String,
    addr: i32,
    name_default: String,
    unit_default: Option<String>,
    value_kind: String,
    tolerance: f64,
    min_interval_sec: i64,
    heartbeat_sec: i64,
    store_history: bool,
}

#[derive(sqlx::FromRow)]
struct GpsLatestRow {
    router_sn: String,
    gps_time: Option<DateTime<Utc>>,
    received_at: DateTime<Utc>,
    lat: f64,
    lon: f64,
    satellites: i32,
    fix_status: i32,
}

#[derive(sqlx::FromRow)]
struct LatestStateDbRow {
    router_sn: String,
    equip_type: String,
    panel_id: String,
    addr: i32,
    ts: DateTime<Utc>,
    value: Option<f64>,
    raw: Option<i64>,
    text: Option<String>,
    reason: Option<String>,
}

#[async_trait]
impl PersistencePort for PgPersistence {
    async fn upsert_object(&self, router_sn: &str) -> Result<(), PersistError> {
        sqlx::query("insert into objects (router_sn) values ($1) on conflict (router_sn) do nothing")
            .bind(router_sn)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "upsert_object"))?;
        Ok(())
    }

    async fn upsert_equipment(
        &self,
        router_sn: &str,
        equip_type: &str,
        panel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into equipment (router_sn, equip_type, panel_id, first_seen_at, last_seen_at)
            values ($1, $2, $3, $4, $4)
            on conflict (router_sn, equip_type, panel_id)
            do update set last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(router_sn)
        .bind(equip_type)
        .bind(panel_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "upsert_equipment"))?;
        Ok(())
    }

    async fn load_catalog(&self) -> Result<CatalogMap, PersistError> {
        let rows = sqlx::query_as::<_, CatalogRow>(
            r#"
            select equip_type, addr, name_default, unit_default, value_kind,
                   tolerance, min_interval_sec, heartbeat_sec, store_history
            from register_catalog
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "load_catalog"))?;

        let mut map = CatalogMap::new();
        for row in rows {
            map.insert(
                CatalogKey::new(row.equip_type, row.addr),
                CatalogEntry {
                    name_default: row.name_default,
                    unit_default: row.unit_default,
                    value_kind: value_kind_from_str(&row.value_kind),
                    tolerance: row.tolerance,
                    min_interval_sec: row.min_interval_sec,
                    heartbeat_sec: row.heartbeat_sec,
                    store_history: row.store_history,
                },
            );
        }
        Ok(map)
    }

    async fn insert_gps_raw(&self, record: &GpsRawRecord) -> Result<i64, PersistError> {
        let reject_reason = record.reject_reason.map(|r| r.to_string());
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into gps_raw_history
                (router_sn, gps_time, received_at, lat, lon, satellites, fix_status, accepted, reject_reason)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            returning id
            "#,
        )
        .bind(&record.router_sn)
        .bind(record.gps_time)
        .bind(record.received_at)
        .bind(record.lat)
        .bind(record.lon)
        .bind(record.satellites)
        .bind(record.fix_status)
        .bind(record.accepted)
        .bind(reject_reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, "insert_gps_raw"))?;
        Ok(id)
    }

    async fn upsert_gps_latest(&self, fix: &GpsFix) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into gps_latest_filtered (router_sn, gps_time, received_at, lat, lon, satellites, fix_status)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (router_sn) do update set
                gps_time = excluded.gps_time,
                received_at = excluded.received_at,
                lat = excluded.lat,
                lon = excluded.lon,
                satellites = excluded.satellites,
                fix_status = excluded.fix_status
            "#,
        )
        .bind(&fix.router_sn)
        .bind(fix.gps_time)
        .bind(fix.received_at)
        .bind(fix.lat)
        .bind(fix.lon)
        .bind(fix.satellites)
        .bind(fix.fix_status)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "upsert_gps_latest"))?;
        Ok(())
    }

    async fn load_gps_latest_all(&self) -> Result<HashMap<String, GpsFix>, PersistError> {
        let rows = sqlx::query_as::<_, GpsLatestRow>(
            "select router_sn, gps_time, received_at, lat, lon, satellites, fix_status from gps_latest_filtered",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "load_gps_latest_all"))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let fix = GpsFix {
                    router_sn: r.router_sn.clone(),
                    lat: r.lat,
                    lon: r.lon,
                    satellites: r.satellites,
                    fix_status: r.fix_status,
                    gps_time: r.gps_time,
                    received_at: r.received_at,
                };
                (r.router_sn, fix)
            })
            .collect())
    }

    async fn upsert_latest_state(&self, row: &LatestStateRow) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into latest_state (router_sn, equip_type, panel_id, addr, ts, value, raw, text, reason)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (router_sn, equip_type, panel_id, addr) do update set
                ts = excluded.ts,
                value = excluded.value,
                raw = excluded.raw,
                text = excluded.text,
                reason = excluded.reason
            "#,
        )
        .bind(&row.key.router_sn)
        .bind(&row.key.equip_type)
        .bind(&row.key.panel_id)
        .bind(row.key.addr)
        .bind(row.ts)
        .bind(row.value)
        .bind(row.raw)
        .bind(&row.text)
        .bind(&row.reason)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "upsert_latest_state"))?;
        Ok(())
    }

    async fn insert_history(&self, row: &HistoryRow) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into history (router_sn, equip_type, panel_id, addr, ts, value, raw, text, reason, write_reason)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            on conflict (router_sn, equip_type, panel_id, addr, ts) do nothing
            "#,
        )
        .bind(&row.key.router_sn)
        .bind(&row.key.equip_type)
        .bind(&row.key.panel_id)
        .bind(row.key.addr)
        .bind(row.ts)
        .bind(row.value)
        .bind(row.raw)
        .bind(&row.text)
        .bind(&row.reason)
        .bind(write_reason_str(row.write_reason))
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "insert_history"))?;
        Ok(())
    }

    async fn load_latest_state_all(&self) -> Result<HashMap<RegisterKey, LatestStateRow>, PersistError> {
        let rows = sqlx::query_as::<_, LatestStateDbRow>(
            "select router_sn, equip_type, panel_id, addr, ts, value, raw, text, reason from latest_state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "load_latest_state_all"))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let key = RegisterKey::new(r.router_sn, r.equip_type, r.panel_id, r.addr);
                let row = LatestStateRow {
                    key: key.clone(),
                    ts: r.ts,
                    value: r.value,
                    raw: r.raw,
                    text: r.text,
                    reason: r.reason,
                };
                (key, row)
            })
            .collect())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into events (router_sn, equip_type, panel_id, event_type, description, payload_json, created_at)
            values ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&event.router_sn)
        .bind(&event.equip_type)
        .bind(&event.panel_id)
        .bind(event.event_type.to_string())
        .bind(&event.description)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "insert_event"))?;
        Ok(())
    }

    async fn delete_older_than(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, PersistError> {
        let sql = format!(
            r#"
            with victims as (
                select ctid from {table} where {column} < $1 limit $2
            )
            delete from {table} where ctid in (select ctid from victims)
            "#,
            table = table.table_name(),
            column = table.timestamp_column(),
        );
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .bind(batch_size as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "delete_older_than"))?;
        Ok(result.rows_affected())
    }
}

impl PgPersistence {
    /// Seeds or updates one catalog entry. Not part of [`PersistencePort`] —
    /// `register_catalog` is populated out of band (migration, ad hoc SQL, or
    /// an ops script), not by the ingest pipeline itself. This method exists
    /// for that path and for tests that need a catalog row without raw SQL.
    pub async fn upsert_register_catalog_entry(
        &self,
        key: &CatalogKey,
        entry: &CatalogEntry,
    ) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            insert into register_catalog
                (equip_type, addr, name_default, unit_default, value_kind, tolerance, min_interval_sec, heartbeat_sec, store_history)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (equip_type, addr) do update set
                name_default = excluded.name_default,
                unit_default = excluded.unit_default,
                value_kind = excluded.value_kind,
                tolerance = excluded.tolerance,
                min_interval_sec = excluded.min_interval_sec,
                heartbeat_sec = excluded.heartbeat_sec,
                store_history = excluded.store_history
            "#,
        )
        .bind(&key.equip_type)
        .bind(key.addr)
        .bind(&entry.name_default)
        .bind(&entry.unit_default)
        .bind(value_kind_str(entry.value_kind))
        .bind(entry.tolerance)
        .bind(entry.min_interval_sec)
        .bind(entry.heartbeat_sec)
        .bind(entry.store_history)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "upsert_register_catalog_entry"))?;
        Ok(())
    }
}
