//! Message router: topic parsing, payload parsing, dispatch into the GPS
//! filter and history policy, and persistence. One `route` call handles
//! exactly one inbound broker message end to end.

use chrono::{DateTime, TimeZone, Utc};
use tib_schemas::{
    wire, CatalogKey, Event, EventType, GpsFix, GpsRawRecord, HistoryRow, LatestStateRow,
    RegisterKey, RegisterObservation,
};
use tracing::{debug, warn};

use crate::catalog::{CatalogCache, CatalogLookup};
use crate::clock::Clock;
use crate::error::PersistError;
use crate::gps::{self, GpsFilterConfig};
use crate::history::{self, HistoryDecision};
use crate::port::PersistencePort;
use crate::state::IngestState;
use crate::watchdog::PanelId;

/// Fixed equipment type carried in the `pcc/<panel_id>` topic segment.
const PCC_EQUIP_TYPE: &str = "pcc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    Gps { router_sn: String },
    Decoded { router_sn: String, panel_id: String },
}

/// `cg/v1/telemetry/SN/<router_sn>` or
/// `cg/v1/decoded/SN/<router_sn>/pcc/<panel_id>`.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["cg", "v1", "telemetry", "SN", router_sn] => Some(ParsedTopic::Gps {
            router_sn: router_sn.to_string(),
        }),
        ["cg", "v1", "decoded", "SN", router_sn, "pcc", panel_id] => Some(ParsedTopic::Decoded {
            router_sn: router_sn.to_string(),
            panel_id: panel_id.to_string(),
        }),
        _ => None,
    }
}

/// Governs which derived events the router is allowed to raise. Kept
/// separate from the GPS filter's own tuning knobs since an operator may
/// want the filter active without the chattier reject events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventsPolicyConfig {
    pub enable_gps_reject_events: bool,
    pub enable_unknown_register_events: bool,
    /// Minimum spacing between repeated `gps_low_sats`/`gps_bad_fix` events
    /// for the same object.
    pub gps_reject_event_throttle_sec: i64,
}

impl Default for EventsPolicyConfig {
    fn default() -> Self {
        Self {
            enable_gps_reject_events: true,
            enable_unknown_register_events: true,
            gps_reject_event_throttle_sec: 60,
        }
    }
}

/// Everything a single `route` call needs, bundled so call sites don't pass
/// eight separate arguments.
pub struct RouterContext<'a> {
    pub catalog: &'a CatalogCache,
    pub state: &'a mut IngestState,
    pub port: &'a (dyn PersistencePort + 'a),
    pub clock: &'a (dyn Clock + 'a),
    pub gps_config: &'a GpsFilterConfig,
    pub events_config: &'a EventsPolicyConfig,
}

/// Routes one inbound broker message. Malformed topics and payloads are
/// logged and dropped (returns `Ok(())`); only persistence failures
/// propagate, so the caller can retry the whole message.
pub async fn route(topic: &str, payload: &[u8], ctx: &mut RouterContext<'_>) -> Result<(), PersistError> {
    match parse_topic(topic) {
        Some(ParsedTopic::Gps { router_sn }) => handle_gps(&router_sn, payload, ctx).await,
        Some(ParsedTopic::Decoded { router_sn, panel_id }) => {
            handle_decoded(&router_sn, &panel_id, payload, ctx).await
        }
        None => {
            ctx.state.record_topic_mismatch();
            debug!(topic, "topic did not match any known pattern, dropping");
            Ok(())
        }
    }
}

fn gps_time_from_wire(payload: &wire::GpsPayload) -> Option<DateTime<Utc>> {
    if let Some(iso) = &payload.date_iso_8601 {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(iso) {
            return Some(parsed.with_timezone(&Utc));
        }
        return None;
    }
    payload
        .timestamp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

async fn handle_gps(router_sn: &str, payload: &[u8], ctx: &mut RouterContext<'_>) -> Result<(), PersistError> {
    let envelope: wire::GpsEnvelope = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            ctx.state.record_malformed_payload();
            debug!(router_sn, error = %e, "malformed gps payload, dropping");
            return Ok(());
        }
    };

    let now = ctx.clock.now();
    let gps_time = gps_time_from_wire(&envelope.gps);
    let fix = GpsFix {
        router_sn: router_sn.to_string(),
        lat: envelope.gps.latitude,
        lon: envelope.gps.longitude,
        satellites: envelope.gps.satellites,
        fix_status: envelope.gps.fix_status,
        gps_time,
        received_at: now,
    };

    ctx.port.upsert_object(router_sn).await?;

    let filter_state = ctx.state.gps_state_for(router_sn);
    let decision = gps::decide(filter_state, ctx.gps_config, fix.clone());

    let reject_reason = match &decision {
        gps::GpsDecision::Accept => None,
        gps::GpsDecision::Reject(r) => Some(*r),
    };

    let raw = GpsRawRecord {
        router_sn: router_sn.to_string(),
        gps_time: fix.gps_time,
        received_at: now,
        lat: fix.lat,
        lon: fix.lon,
        satellites: fix.satellites,
        fix_status: fix.fix_status,
        accepted: decision.is_accept(),
        reject_reason,
    };
    ctx.port.insert_gps_raw(&raw).await?;

    if decision.is_accept() {
        ctx.port.upsert_gps_latest(&fix).await?;
    }

    if let Some(reason) = reject_reason {
        maybe_emit_gps_reject_event(router_sn, reason, now, ctx).await?;
    }

    Ok(())
}

async fn maybe_emit_gps_reject_event(
    router_sn: &str,
    reason: tib_schemas::RejectReason,
    now: DateTime<Utc>,
    ctx: &mut RouterContext<'_>,
) -> Result<(), PersistError> {
    use tib_schemas::RejectReason;

    if !ctx.events_config.enable_gps_reject_events {
        return Ok(());
    }

    let (event_type, throttle_map_is_low_sats) = match reason {
        RejectReason::LowSats => (EventType::GpsLowSats, true),
        RejectReason::BadFix => (EventType::GpsBadFix, false),
        // Sustained jumps are rare and individually meaningful: never throttled.
        RejectReason::JumpDistance { .. } | RejectReason::JumpSpeed { .. } => {
            let event = Event::new(router_sn, EventType::GpsJumpRejected, reason.to_string(), now);
            ctx.port.insert_event(&event).await?;
            return Ok(());
        }
    };

    let throttle_map = if throttle_map_is_low_sats {
        &mut ctx.state.low_sats_last_event
    } else {
        &mut ctx.state.bad_fix_last_event
    };

    let should_fire = match throttle_map.get(router_sn) {
        Some(last) => (now - *last).num_seconds() >= ctx.events_config.gps_reject_event_throttle_sec,
        None => true,
    };
    if !should_fire {
        return Ok(());
    }
    throttle_map.insert(router_sn.to_string(), now);

    let event = Event::new(router_sn, event_type, reason.to_string(), now);
    ctx.port.insert_event(&event).await?;
    Ok(())
}

async fn handle_decoded(
    router_sn: &str,
    panel_id: &str,
    payload: &[u8],
    ctx: &mut RouterContext<'_>,
) -> Result<(), PersistError> {
    let decoded: wire::DecodedPayload = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            ctx.state.record_malformed_payload();
            debug!(router_sn, panel_id, error = %e, "malformed decoded payload, dropping");
            return Ok(());
        }
    };

    let ts = match DateTime::parse_from_rfc3339(&decoded.timestamp) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            ctx.state.record_malformed_payload();
            warn!(router_sn, panel_id, error = %e, "malformed decoded timestamp, dropping");
            return Ok(());
        }
    };

    let now = ctx.clock.now();

    ctx.port.upsert_object(router_sn).await?;
    ctx.port
        .upsert_equipment(router_sn, PCC_EQUIP_TYPE, panel_id, now)
        .await?;

    let panel: PanelId = (router_sn.to_string(), PCC_EQUIP_TYPE.to_string(), panel_id.to_string());
    ctx.state.last_seen.insert(panel.clone(), now);
    if let Some(online_event) = ctx.state.watchdog.record_sighting(&panel, now) {
        ctx.port.insert_event(&online_event).await?;
    }

    for register in &decoded.registers {
        let key = RegisterKey::new(router_sn, PCC_EQUIP_TYPE, panel_id, register.addr);
        let obs = RegisterObservation {
            key: key.clone(),
            ts,
            name: register.name.clone(),
            unit: register.unit.clone(),
            value: register.value,
            raw: register.raw,
            text: register.text.clone(),
            reason: register.reason.clone(),
        };

        ctx.port
            .upsert_latest_state(&LatestStateRow {
                key: key.clone(),
                ts,
                value: obs.value,
                raw: obs.raw,
                text: obs.text.clone(),
                reason: obs.reason.clone(),
            })
            .await?;

        ctx.state.last_sample_ts.insert(key.clone(), ts);

        let catalog_key: CatalogKey = key.catalog_key();
        let lookup = ctx.catalog.lookup(&catalog_key);
        let history_state = ctx.state.history_state_for(&key);
        let decision = history::decide(history_state, &lookup, &obs);

        match decision {
            HistoryDecision::Write(write_reason) => {
                ctx.port
                    .insert_history(&HistoryRow {
                        key: key.clone(),
                        ts,
                        value: obs.value,
                        raw: obs.raw,
                        text: obs.text.clone(),
                        reason: obs.reason.clone(),
                        write_reason,
                    })
                    .await?;
            }
            HistoryDecision::Suppress { unknown_register } => {
                if unknown_register
                    && ctx.events_config.enable_unknown_register_events
                    && ctx
                        .state
                        .mark_unknown_reported((router_sn.to_string(), panel_id.to_string(), register.addr))
                {
                    let event = Event::new(
                        router_sn,
                        EventType::UnknownRegister,
                        format!("unregistered address {} on {}/{}", register.addr, PCC_EQUIP_TYPE, panel_id),
                        now,
                    )
                    .with_equip(PCC_EQUIP_TYPE, panel_id);
                    ctx.port.insert_event(&event).await?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gps_topic() {
        let parsed = parse_topic("cg/v1/telemetry/SN/ROUTER123");
        assert_eq!(
            parsed,
            Some(ParsedTopic::Gps {
                router_sn: "ROUTER123".to_string()
            })
        );
    }

    #[test]
    fn parses_decoded_topic() {
        let parsed = parse_topic("cg/v1/decoded/SN/ROUTER123/pcc/7");
        assert_eq!(
            parsed,
            Some(ParsedTopic::Decoded {
                router_sn: "ROUTER123".to_string(),
                panel_id: "7".to_string()
            })
        );
    }

    #[test]
    fn unrecognised_topic_is_none() {
        assert_eq!(parse_topic("cg/v1/telemetry/SN"), None);
        assert_eq!(parse_topic("cg/v2/telemetry/SN/R1"), None);
        assert_eq!(parse_topic("some/other/topic"), None);
    }
}
