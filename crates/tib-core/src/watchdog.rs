//! Liveness watchdog. A periodic, pure scan over the last-seen snapshot the
//! caller hands it — it emits events, it never suspends or touches the
//! persistence port itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tib_schemas::{Event, EventType, RegisterKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub watchdog_interval_sec: i64,
    pub router_offline_sec: i64,
    pub stale_register_sec: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_sec: 30,
            router_offline_sec: 300,
            stale_register_sec: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPanelStatus {
    Online,
    Offline,
}

/// `(router_sn, equip_type, panel_id)` — the granularity the watchdog
/// tracks liveness at.
pub type PanelId = (String, String, String);

#[derive(Debug, Default)]
pub struct WatchdogState {
    pub status: HashMap<PanelId, RouterPanelStatus>,
    /// Last time a `stale_register` event fired for a key, so repeats are
    /// throttled to at most one per `stale_register_sec` window.
    pub last_stale_event: HashMap<RegisterKey, DateTime<Utc>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the message router on every inbound message for a panel.
    /// Returns a `router_online` event if the panel was offline.
    pub fn record_sighting(&mut self, panel: &PanelId, now: DateTime<Utc>) -> Option<Event> {
        let prior = self.status.insert(panel.clone(), RouterPanelStatus::Online);
        match prior {
            Some(RouterPanelStatus::Offline) => Some(
                Event::new(
                    panel.0.clone(),
                    EventType::RouterOnline,
                    format!("{}/{}/{} back online", panel.0, panel.1, panel.2),
                    now,
                )
                .with_equip(panel.1.clone(), panel.2.clone()),
            ),
            _ => None,
        }
    }
}

/// Periodic scan. `last_seen` and `last_sample_ts` are caller-supplied
/// snapshots; `register_heartbeats` maps a register key
/// to its catalog `heartbeat_sec` (only registers with `heartbeat_sec > 0`
/// are eligible for `stale_register`).
pub fn scan(
    state: &mut WatchdogState,
    config: &WatchdogConfig,
    now: DateTime<Utc>,
    last_seen: &HashMap<PanelId, DateTime<Utc>>,
    last_sample_ts: &HashMap<RegisterKey, DateTime<Utc>>,
    register_heartbeats: &HashMap<RegisterKey, i64>,
) -> Vec<Event> {
    let mut events = Vec::new();

    for (panel, seen_at) in last_seen {
        let age = (now - *seen_at).num_seconds();
        let current = state
            .status
            .get(panel)
            .copied()
            .unwrap_or(RouterPanelStatus::Online);

        if age >= config.router_offline_sec && current == RouterPanelStatus::Online {
            state.status.insert(panel.clone(), RouterPanelStatus::Offline);
            events.push(
                Event::new(
                    panel.0.clone(),
                    EventType::RouterOffline,
                    format!("{}/{}/{} offline ({age}s since last message)", panel.0, panel.1, panel.2),
                    now,
                )
                .with_equip(panel.1.clone(), panel.2.clone()),
            );
        }
    }

    for (key, heartbeat_sec) in register_heartbeats {
        if *heartbeat_sec <= 0 {
            continue;
        }
        let Some(sample_at) = last_sample_ts.get(key) else {
            continue;
        };
        let age = (now - *sample_at).num_seconds();
        if age < config.stale_register_sec {
            continue;
        }
        let last_fired = state.last_stale_event.get(key);
        let should_fire = match last_fired {
            Some(t) => (now - *t).num_seconds() >= config.stale_register_sec,
            None => true,
        };
        if should_fire {
            state.last_stale_event.insert(key.clone(), now);
            events.push(
                Event::new(
                    key.router_sn.clone(),
                    EventType::StaleRegister,
                    format!(
                        "register {}/{} on panel {} stale ({age}s since last sample)",
                        key.equip_type, key.addr, key.panel_id
                    ),
                    now,
                )
                .with_equip(key.equip_type.clone(), key.panel_id.clone()),
            );
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn panel() -> PanelId {
        ("R1".into(), "pcc".into(), "1".into())
    }

    #[test]
    fn s5_offline_then_online() {
        let mut state = WatchdogState::new();
        let cfg = WatchdogConfig {
            watchdog_interval_sec: 30,
            router_offline_sec: 300,
            stale_register_sec: 600,
        };
        let t0 = Utc::now();
        let mut last_seen = HashMap::new();
        last_seen.insert(panel(), t0);
        state.status.insert(panel(), RouterPanelStatus::Online);

        let events = scan(
            &mut state,
            &cfg,
            t0 + Duration::seconds(301),
            &last_seen,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RouterOffline);
        assert_eq!(state.status[&panel()], RouterPanelStatus::Offline);

        // A second scan at the same offline state emits nothing more.
        let events2 = scan(
            &mut state,
            &cfg,
            t0 + Duration::seconds(330),
            &last_seen,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert!(events2.is_empty());

        // Resume publishing: record_sighting flips it back online.
        let online_event = state.record_sighting(&panel(), t0 + Duration::seconds(340));
        assert!(matches!(
            online_event,
            Some(ref e) if e.event_type == EventType::RouterOnline
        ));
    }

    #[test]
    fn stale_register_fires_once_per_window() {
        let mut state = WatchdogState::new();
        let cfg = WatchdogConfig {
            watchdog_interval_sec: 30,
            router_offline_sec: 300,
            stale_register_sec: 600,
        };
        let key = RegisterKey::new("R1", "pcc", "1", 40034);
        let t0 = Utc::now();
        let mut last_sample = HashMap::new();
        last_sample.insert(key.clone(), t0);
        let mut heartbeats = HashMap::new();
        heartbeats.insert(key.clone(), 60);

        let e1 = scan(
            &mut state,
            &cfg,
            t0 + Duration::seconds(601),
            &HashMap::new(),
            &last_sample,
            &heartbeats,
        );
        assert_eq!(e1.len(), 1);

        let e2 = scan(
            &mut state,
            &cfg,
            t0 + Duration::seconds(650),
            &HashMap::new(),
            &last_sample,
            &heartbeats,
        );
        assert!(e2.is_empty());
    }
}
