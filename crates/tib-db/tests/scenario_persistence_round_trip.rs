// DB-backed test, skipped if TIB_DATABASE_URL is not set.

use anyhow::Result;
use chrono::Utc;
use tib_core::port::PersistencePort;
use tib_schemas::{CatalogEntry, CatalogKey, Event, EventType, GpsFix, GpsRawRecord, ValueKind};

#[tokio::test]
async fn gps_raw_insert_and_latest_upsert_round_trip() -> Result<()> {
    let url = match std::env::var(tib_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: TIB_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(2).connect(&url).await?;
    tib_db::migrate(&pool).await?;
    let store = tib_db::PgPersistence::new(pool);

    store.upsert_object("TEST-ROUTER-1").await?;

    let now = Utc::now();
    let fix = GpsFix {
        router_sn: "TEST-ROUTER-1".into(),
        lat: 59.9,
        lon: 30.3,
        satellites: 8,
        fix_status: 1,
        gps_time: None,
        received_at: now,
    };
    let raw = GpsRawRecord {
        router_sn: fix.router_sn.clone(),
        gps_time: fix.gps_time,
        received_at: fix.received_at,
        lat: fix.lat,
        lon: fix.lon,
        satellites: fix.satellites,
        fix_status: fix.fix_status,
        accepted: true,
        reject_reason: None,
    };
    store.insert_gps_raw(&raw).await?;
    store.upsert_gps_latest(&fix).await?;

    let all = store.load_gps_latest_all().await?;
    assert_eq!(all.get("TEST-ROUTER-1").map(|f| f.lat), Some(59.9));

    let entry = CatalogEntry {
        name_default: "oil_temp".into(),
        unit_default: Some("C".into()),
        value_kind: ValueKind::Analog,
        tolerance: 0.5,
        min_interval_sec: 10,
        heartbeat_sec: 60,
        store_history: true,
    };
    let key = CatalogKey::new("pcc", 40034);
    store.upsert_register_catalog_entry(&key, &entry).await?;
    let catalog = store.load_catalog().await?;
    assert_eq!(catalog.get(&key).map(|e| e.name_default.clone()), Some("oil_temp".to_string()));

    let event = Event::new("TEST-ROUTER-1", EventType::RouterOffline, "test event", now);
    store.insert_event(&event).await?;

    Ok(())
}
