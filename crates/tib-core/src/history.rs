//! History write policy. Pure, deterministic: first matching rule wins.
//! `latest_state` is always upserted by the caller regardless of what this
//! function decides for `history`.

use chrono::{DateTime, Utc};
use tib_schemas::{RegisterObservation, ValueKind, WriteReason};

use crate::catalog::CatalogLookup;

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryDecision {
    Write(WriteReason),
    /// `unknown_register` is set when the suppression is because the
    /// catalog entry is missing or `store_history = false` — the caller
    /// uses it to decide whether an `unknown_register` event is due.
    Suppress { unknown_register: bool },
}

/// Per-key in-memory state.
#[derive(Debug, Clone, Default)]
pub struct HistoryKeyState {
    pub last_stored_value: Option<f64>,
    pub last_stored_raw: Option<i64>,
    pub last_stored_text: Option<String>,
    pub last_stored_reason: Option<String>,
    pub last_stored_ts: Option<DateTime<Utc>>,
    pub last_heartbeat_ts: Option<DateTime<Utc>>,
}

impl HistoryKeyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `last_stored_*` from a restored `latest_state` row.
    /// `last_heartbeat_ts` is reset to `now` — no retroactive heartbeat.
    pub fn restored(
        value: Option<f64>,
        raw: Option<i64>,
        text: Option<String>,
        reason: Option<String>,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            last_stored_value: value,
            last_stored_raw: raw,
            last_stored_text: text,
            last_stored_reason: reason,
            last_stored_ts: Some(ts),
            last_heartbeat_ts: Some(now),
        }
    }

    fn record_write(&mut self, obs: &RegisterObservation) {
        self.last_stored_value = obs.value;
        self.last_stored_raw = obs.raw;
        self.last_stored_text = obs.text.clone();
        self.last_stored_reason = obs.reason.clone();
        self.last_stored_ts = Some(obs.ts);
        self.last_heartbeat_ts = Some(obs.ts);
    }
}

fn non_numeric_changed(state: &HistoryKeyState, obs: &RegisterObservation) -> bool {
    state.last_stored_raw != obs.raw || state.last_stored_text != obs.text
}

/// Decision order: unknown/non-stored catalog entry, then first sample,
/// then reason transition, then tolerance+interval change, then heartbeat.
pub fn decide(
    state: &mut HistoryKeyState,
    catalog: &CatalogLookup,
    obs: &RegisterObservation,
) -> HistoryDecision {
    let entry = match catalog {
        CatalogLookup::Unknown => {
            return HistoryDecision::Suppress {
                unknown_register: true,
            }
        }
        CatalogLookup::Known(entry) if !entry.store_history => {
            return HistoryDecision::Suppress {
                unknown_register: false,
            }
        }
        CatalogLookup::Known(entry) => entry,
    };

    if state.last_stored_ts.is_none() {
        state.record_write(obs);
        return HistoryDecision::Write(WriteReason::First);
    }

    if state.last_stored_reason != obs.reason {
        state.record_write(obs);
        return HistoryDecision::Write(WriteReason::ReasonChange);
    }

    let last_ts = state.last_stored_ts.expect("checked above");
    let min_interval_elapsed =
        (obs.ts - last_ts).num_seconds() >= entry.min_interval_sec;

    let value_changed = if entry.value_kind.is_numeric() {
        match (obs.value, state.last_stored_value) {
            (Some(v), Some(last_v)) => (v - last_v).abs() > entry.tolerance,
            (Some(_), None) => true,
            _ => false,
        }
    } else {
        non_numeric_changed(state, obs)
    };

    if value_changed && min_interval_elapsed {
        state.record_write(obs);
        return HistoryDecision::Write(WriteReason::Change);
    }

    if entry.heartbeat_sec > 0 {
        let last_hb = state.last_heartbeat_ts.unwrap_or(last_ts);
        if (obs.ts - last_hb).num_seconds() >= entry.heartbeat_sec {
            state.record_write(obs);
            return HistoryDecision::Write(WriteReason::Heartbeat);
        }
    }

    HistoryDecision::Suppress {
        unknown_register: false,
    }
}
