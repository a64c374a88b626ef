use chrono::{TimeZone, Utc};
use tib_core::catalog::CatalogCache;
use tib_core::clock::FakeClock;
use tib_core::gps::GpsFilterConfig;
use tib_core::port::CatalogMap;
use tib_core::router::{route, EventsPolicyConfig, RouterContext};
use tib_core::state::IngestState;
use tib_core::testkit::FakePersistence;
use tib_schemas::{CatalogEntry, CatalogKey, ValueKind, WriteReason};

fn decoded_payload(iso_ts: &str, value: f64) -> String {
    format!(
        r#"{{"timestamp":"{iso_ts}","router_sn":"ROUTER1","bserver_id":null,"registers":[{{"addr":40034,"name":"oil_temp","value":{value},"text":null,"unit":"C","raw":null,"reason":null}}]}}"#
    )
}

fn catalog() -> CatalogMap {
    let mut map = CatalogMap::new();
    map.insert(
        CatalogKey::new("pcc", 40034),
        CatalogEntry {
            name_default: "oil_temp".into(),
            unit_default: Some("C".into()),
            value_kind: ValueKind::Analog,
            tolerance: 0.5,
            min_interval_sec: 10,
            heartbeat_sec: 60,
            store_history: true,
        },
    );
    map
}

#[tokio::test]
async fn scenario_tolerance_interval_and_heartbeat_gate_history_writes() {
    let store = FakePersistence::new();
    let catalog = CatalogCache::new(catalog());
    let mut state = IngestState::new();
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let clock = FakeClock::new(base);
    let gps_config = GpsFilterConfig::default();
    let events_config = EventsPolicyConfig::default();
    let topic = "cg/v1/decoded/SN/ROUTER1/pcc/1";

    let mut ctx = RouterContext {
        catalog: &catalog,
        state: &mut state,
        port: &store,
        clock: &clock,
        gps_config: &gps_config,
        events_config: &events_config,
    };

    // t=0: first sample always writes.
    route(topic, decoded_payload("2023-11-14T22:13:20Z", 150.0).as_bytes(), &mut ctx)
        .await
        .unwrap();
    // t=5: within tolerance -> suppressed.
    route(topic, decoded_payload("2023-11-14T22:13:25Z", 150.2).as_bytes(), &mut ctx)
        .await
        .unwrap();
    // t=20: past tolerance and past min_interval_sec -> change.
    route(topic, decoded_payload("2023-11-14T22:13:40Z", 151.0).as_bytes(), &mut ctx)
        .await
        .unwrap();
    // t=90: unchanged value, heartbeat_sec elapsed since the t=20 write -> heartbeat.
    route(topic, decoded_payload("2023-11-14T22:14:50Z", 151.0).as_bytes(), &mut ctx)
        .await
        .unwrap();

    let rows = store.history_rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].write_reason, WriteReason::First);
    assert_eq!(rows[1].write_reason, WriteReason::Change);
    assert_eq!(rows[2].write_reason, WriteReason::Heartbeat);

    // latest_state is overwritten on every observation regardless of suppression.
    let key = tib_schemas::RegisterKey::new("ROUTER1", "pcc", "1", 40034);
    let latest = store.latest_state(&key).unwrap();
    assert_eq!(latest.value, Some(151.0));
}

#[tokio::test]
async fn scenario_unregistered_address_suppresses_and_reports_once() {
    let store = FakePersistence::new();
    let catalog = CatalogCache::empty();
    let mut state = IngestState::new();
    let clock = FakeClock::new(Utc::now());
    let gps_config = GpsFilterConfig::default();
    let events_config = EventsPolicyConfig::default();
    let topic = "cg/v1/decoded/SN/ROUTER1/pcc/1";

    let mut ctx = RouterContext {
        catalog: &catalog,
        state: &mut state,
        port: &store,
        clock: &clock,
        gps_config: &gps_config,
        events_config: &events_config,
    };

    route(topic, decoded_payload("2023-11-14T22:13:20Z", 1.0).as_bytes(), &mut ctx)
        .await
        .unwrap();
    route(topic, decoded_payload("2023-11-14T22:13:25Z", 2.0).as_bytes(), &mut ctx)
        .await
        .unwrap();

    assert!(store.history_rows().is_empty());
    let events = store.events();
    assert_eq!(events.len(), 1, "unknown_register fires once, not per message");
    assert_eq!(events[0].event_type, tib_schemas::EventType::UnknownRegister);
}
