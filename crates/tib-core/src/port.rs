//! Abstract persistence port. `tib-db` provides the Postgres implementation;
//! `tib-core::testkit` provides an in-memory fake so the decision pipeline
//! can be exercised without a live database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tib_schemas::{CatalogEntry, CatalogKey, Event, GpsFix, GpsRawRecord, HistoryRow, LatestStateRow};

use crate::error::PersistError;

pub type CatalogMap = HashMap<CatalogKey, CatalogEntry>;

/// Tables the retention sweeper is allowed to age out. Never `latest_state`
/// or `gps_latest_filtered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionTable {
    GpsRawHistory,
    History,
    Events,
}

impl RetentionTable {
    pub fn table_name(self) -> &'static str {
        match self {
            RetentionTable::GpsRawHistory => "gps_raw_history",
            RetentionTable::History => "history",
            RetentionTable::Events => "events",
        }
    }

    pub fn timestamp_column(self) -> &'static str {
        match self {
            RetentionTable::GpsRawHistory => "received_at",
            RetentionTable::History => "received_at",
            RetentionTable::Events => "created_at",
        }
    }
}

#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn upsert_object(&self, router_sn: &str) -> Result<(), PersistError>;

    async fn upsert_equipment(
        &self,
        router_sn: &str,
        equip_type: &str,
        panel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PersistError>;

    async fn load_catalog(&self) -> Result<CatalogMap, PersistError>;

    async fn insert_gps_raw(&self, record: &GpsRawRecord) -> Result<i64, PersistError>;

    async fn upsert_gps_latest(&self, fix: &GpsFix) -> Result<(), PersistError>;

    async fn load_gps_latest_all(&self) -> Result<HashMap<String, GpsFix>, PersistError>;

    async fn upsert_latest_state(&self, row: &LatestStateRow) -> Result<(), PersistError>;

    async fn insert_history(&self, row: &HistoryRow) -> Result<(), PersistError>;

    /// Reloads `last_stored_value/ts/reason` for every register on startup.
    async fn load_latest_state_all(
        &self,
    ) -> Result<HashMap<tib_schemas::RegisterKey, LatestStateRow>, PersistError>;

    async fn insert_event(&self, event: &Event) -> Result<(), PersistError>;

    /// Bounded deletion: never deletes more than `batch_size` rows per call.
    /// Returns the number of rows actually deleted (0 signals the table is
    /// now clean for the given cutoff).
    async fn delete_older_than(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, PersistError>;
}
