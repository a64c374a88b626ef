use chrono::{Duration, TimeZone, Utc};
use tib_core::catalog::CatalogCache;
use tib_core::clock::FakeClock;
use tib_core::gps::GpsFilterConfig;
use tib_core::router::{route, EventsPolicyConfig, RouterContext};
use tib_core::state::IngestState;
use tib_core::testkit::FakePersistence;
use tib_core::watchdog::{self, WatchdogConfig};

fn decoded_payload(iso_ts: &str) -> String {
    format!(
        r#"{{"timestamp":"{iso_ts}","router_sn":"ROUTER1","bserver_id":null,"registers":[]}}"#
    )
}

#[tokio::test]
async fn scenario_panel_goes_offline_then_recovers_on_next_message() {
    let store = FakePersistence::new();
    let catalog = CatalogCache::empty();
    let mut state = IngestState::new();
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let clock = FakeClock::new(base);
    let gps_config = GpsFilterConfig::default();
    let events_config = EventsPolicyConfig::default();
    let topic = "cg/v1/decoded/SN/ROUTER1/pcc/1";
    let watchdog_config = WatchdogConfig::default();

    {
        let mut ctx = RouterContext {
            catalog: &catalog,
            state: &mut state,
            port: &store,
            clock: &clock,
            gps_config: &gps_config,
            events_config: &events_config,
        };
        route(topic, decoded_payload("2023-11-14T22:13:20Z").as_bytes(), &mut ctx)
            .await
            .unwrap();
    }

    // 301s later (past router_offline_sec=300) with no new message: watchdog fires.
    let scan_time = base + Duration::seconds(301);
    let events = watchdog::scan(
        &mut state.watchdog,
        &watchdog_config,
        scan_time,
        &state.last_seen,
        &state.last_sample_ts,
        &std::collections::HashMap::new(),
    );
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, tib_schemas::EventType::RouterOffline);

    // Panel resumes publishing: the next routed message flips it back online.
    clock.set(scan_time + Duration::seconds(5));
    let mut ctx = RouterContext {
        catalog: &catalog,
        state: &mut state,
        port: &store,
        clock: &clock,
        gps_config: &gps_config,
        events_config: &events_config,
    };
    route(topic, decoded_payload("2023-11-14T22:18:26Z").as_bytes(), &mut ctx)
        .await
        .unwrap();

    let online_events: Vec<_> = store
        .events()
        .into_iter()
        .filter(|e| e.event_type == tib_schemas::EventType::RouterOnline)
        .collect();
    assert_eq!(online_events.len(), 1);
}
