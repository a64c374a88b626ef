//! In-memory `PersistencePort` fake for exercising the router end to end
//! without a live database. Mirrors the shape of the real store closely
//! enough that scenario tests can assert on row counts and contents.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tib_schemas::{CatalogEntry, CatalogKey, Event, GpsFix, GpsRawRecord, HistoryRow, LatestStateRow, RegisterKey};

use crate::error::PersistError;
use crate::port::{CatalogMap, PersistencePort, RetentionTable};

#[derive(Debug, Default)]
struct Inner {
    objects: Vec<String>,
    equipment: Vec<(String, String, String)>,
    catalog: CatalogMap,
    gps_raw: Vec<GpsRawRecord>,
    gps_latest: HashMap<String, GpsFix>,
    latest_state: HashMap<RegisterKey, LatestStateRow>,
    history: Vec<HistoryRow>,
    events: Vec<Event>,
}

/// Thread-safe, in-process stand-in for the Postgres-backed store.
#[derive(Debug, Default)]
pub struct FakePersistence {
    inner: Mutex<Inner>,
}

impl FakePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: CatalogMap) -> Self {
        let mut inner = Inner::default();
        inner.catalog = catalog;
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn gps_raw_rows(&self) -> Vec<GpsRawRecord> {
        self.inner.lock().gps_raw.clone()
    }

    pub fn history_rows(&self) -> Vec<HistoryRow> {
        self.inner.lock().history.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    pub fn latest_state(&self, key: &RegisterKey) -> Option<LatestStateRow> {
        self.inner.lock().latest_state.get(key).cloned()
    }

    pub fn gps_latest(&self, router_sn: &str) -> Option<GpsFix> {
        self.inner.lock().gps_latest.get(router_sn).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

#[async_trait]
impl PersistencePort for FakePersistence {
    async fn upsert_object(&self, router_sn: &str) -> Result<(), PersistError> {
        let mut inner = self.inner.lock();
        if !inner.objects.iter().any(|o| o == router_sn) {
            inner.objects.push(router_sn.to_string());
        }
        Ok(())
    }

    async fn upsert_equipment(
        &self,
        router_sn: &str,
        equip_type: &str,
        panel_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.lock();
        let key = (router_sn.to_string(), equip_type.to_string(), panel_id.to_string());
        if !inner.equipment.contains(&key) {
            inner.equipment.push(key);
        }
        Ok(())
    }

    async fn load_catalog(&self) -> Result<CatalogMap, PersistError> {
        Ok(self.inner.lock().catalog.clone())
    }

    async fn insert_gps_raw(&self, record: &GpsRawRecord) -> Result<i64, PersistError> {
        let mut inner = self.inner.lock();
        inner.gps_raw.push(record.clone());
        Ok(inner.gps_raw.len() as i64)
    }

    async fn upsert_gps_latest(&self, fix: &GpsFix) -> Result<(), PersistError> {
        self.inner.lock().gps_latest.insert(fix.router_sn.clone(), fix.clone());
        Ok(())
    }

    async fn load_gps_latest_all(&self) -> Result<HashMap<String, GpsFix>, PersistError> {
        Ok(self.inner.lock().gps_latest.clone())
    }

    async fn upsert_latest_state(&self, row: &LatestStateRow) -> Result<(), PersistError> {
        self.inner.lock().latest_state.insert(row.key.clone(), row.clone());
        Ok(())
    }

    async fn insert_history(&self, row: &HistoryRow) -> Result<(), PersistError> {
        self.inner.lock().history.push(row.clone());
        Ok(())
    }

    async fn load_latest_state_all(&self) -> Result<HashMap<RegisterKey, LatestStateRow>, PersistError> {
        Ok(self.inner.lock().latest_state.clone())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), PersistError> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    async fn delete_older_than(
        &self,
        table: RetentionTable,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, PersistError> {
        let mut inner = self.inner.lock();
        match table {
            RetentionTable::GpsRawHistory => {
                delete_batch(&mut inner.gps_raw, batch_size, |r| r.received_at < cutoff)
            }
            RetentionTable::History => delete_batch(&mut inner.history, batch_size, |r| r.ts < cutoff),
            RetentionTable::Events => delete_batch(&mut inner.events, batch_size, |e| e.created_at < cutoff),
        }
    }
}

fn delete_batch<T>(rows: &mut Vec<T>, batch_size: u32, is_expired: impl Fn(&T) -> bool) -> Result<u64, PersistError> {
    let mut deleted = 0u64;
    let mut i = 0;
    while i < rows.len() && deleted < batch_size as u64 {
        if is_expired(&rows[i]) {
            rows.remove(i);
            deleted += 1;
        } else {
            i += 1;
        }
    }
    Ok(deleted)
}

/// Seeds a minimal catalog entry, handy for router tests that only care
/// about one register.
pub fn catalog_map(entries: impl IntoIterator<Item = (CatalogKey, CatalogEntry)>) -> CatalogMap {
    entries.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tib_schemas::ValueKind;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            name_default: "oil_temp".into(),
            unit_default: None,
            value_kind: ValueKind::Analog,
            tolerance: 0.5,
            min_interval_sec: 10,
            heartbeat_sec: 60,
            store_history: true,
        }
    }

    #[tokio::test]
    async fn round_trips_gps_raw_and_latest() {
        let store = FakePersistence::new();
        let fix = GpsFix {
            router_sn: "R1".into(),
            lat: 1.0,
            lon: 2.0,
            satellites: 8,
            fix_status: 1,
            gps_time: None,
            received_at: Utc::now(),
        };
        let raw = GpsRawRecord {
            router_sn: "R1".into(),
            gps_time: None,
            received_at: fix.received_at,
            lat: fix.lat,
            lon: fix.lon,
            satellites: fix.satellites,
            fix_status: fix.fix_status,
            accepted: true,
            reject_reason: None,
        };
        store.insert_gps_raw(&raw).await.unwrap();
        store.upsert_gps_latest(&fix).await.unwrap();
        assert_eq!(store.gps_raw_rows().len(), 1);
        assert_eq!(store.gps_latest("R1").unwrap(), fix);
    }

    #[tokio::test]
    async fn delete_older_than_respects_batch_size() {
        let store = FakePersistence::new();
        let old = Utc::now() - chrono::Duration::days(2);
        for _ in 0..5 {
            let event = Event::new("R1", tib_schemas::EventType::RouterOffline, "x", old);
            store.insert_event(&event).await.unwrap();
        }
        let deleted = store
            .delete_older_than(RetentionTable::Events, Utc::now(), 3)
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn catalog_round_trip() {
        let mut map = CatalogMap::new();
        map.insert(CatalogKey::new("pcc", 40034), entry());
        let store = FakePersistence::with_catalog(map);
        let loaded = store.load_catalog().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
