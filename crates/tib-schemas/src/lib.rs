//! Wire and domain value types for the telemetry ingestion bridge.
//!
//! Everything here is plain data: the JSON payloads exactly as they arrive
//! on the broker (`wire` module) and the explicit, statically-typed domain
//! values the rest of the workspace operates on. Parsing from wire to
//! domain happens once, at the message router boundary, so downstream code
//! never touches a loosely-typed JSON value again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod wire {
    use super::*;

    /// `cg/v1/telemetry/SN/<router_sn>` payload.
    #[derive(Debug, Clone, Deserialize)]
    pub struct GpsEnvelope {
        #[serde(rename = "GPS")]
        pub gps: GpsPayload,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct GpsPayload {
        pub latitude: f64,
        pub longitude: f64,
        pub satellites: i32,
        pub fix_status: i32,
        /// Epoch seconds. Ignored if `date_iso_8601` is also present.
        pub timestamp: Option<i64>,
        pub date_iso_8601: Option<String>,
    }

    /// `cg/v1/decoded/SN/<router_sn>/pcc/<panel_id>` payload.
    #[derive(Debug, Clone, Deserialize)]
    pub struct DecodedPayload {
        pub timestamp: String,
        pub router_sn: String,
        pub bserver_id: Option<i64>,
        pub registers: Vec<RegisterWire>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RegisterWire {
        pub addr: i32,
        pub name: Option<String>,
        pub value: Option<f64>,
        pub text: Option<String>,
        pub unit: Option<String>,
        pub raw: Option<i64>,
        pub reason: Option<String>,
    }
}

// ---------------------------------------------------------------------------
// Register catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Analog,
    Discrete,
    Counter,
    Enum,
    Text,
}

impl ValueKind {
    /// Non-numeric kinds ignore tolerance: any change in `raw`/`text` counts.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueKind::Analog | ValueKind::Discrete | ValueKind::Counter)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Analog => "analog",
            ValueKind::Discrete => "discrete",
            ValueKind::Counter => "counter",
            ValueKind::Enum => "enum",
            ValueKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Per-register policy, loaded once at startup by the register catalog cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name_default: String,
    pub unit_default: Option<String>,
    pub value_kind: ValueKind,
    pub tolerance: f64,
    pub min_interval_sec: i64,
    pub heartbeat_sec: i64,
    pub store_history: bool,
}

/// Catalog entries are keyed by `(equip_type, addr)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub equip_type: String,
    pub addr: i32,
}

impl CatalogKey {
    pub fn new(equip_type: impl Into<String>, addr: i32) -> Self {
        Self {
            equip_type: equip_type.into(),
            addr,
        }
    }
}

// ---------------------------------------------------------------------------
// GPS
// ---------------------------------------------------------------------------

/// A single GPS fix, already parsed into domain types.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub router_sn: String,
    pub lat: f64,
    pub lon: f64,
    pub satellites: i32,
    pub fix_status: i32,
    pub gps_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Why a GPS fix was rejected by the anti-teleport filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    LowSats,
    BadFix,
    JumpDistance { meters: f64 },
    JumpSpeed { kmh: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LowSats => f.write_str("low_sats"),
            RejectReason::BadFix => f.write_str("bad_fix"),
            RejectReason::JumpDistance { .. } => f.write_str("jump_distance"),
            RejectReason::JumpSpeed { .. } => f.write_str("jump_speed"),
        }
    }
}

/// Append-only row written for every inbound GPS fix, accepted or not.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsRawRecord {
    pub router_sn: String,
    pub gps_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub satellites: i32,
    pub fix_status: i32,
    pub accepted: bool,
    pub reject_reason: Option<RejectReason>,
}

// ---------------------------------------------------------------------------
// Registers / history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterKey {
    pub router_sn: String,
    pub equip_type: String,
    pub panel_id: String,
    pub addr: i32,
}

impl RegisterKey {
    pub fn new(
        router_sn: impl Into<String>,
        equip_type: impl Into<String>,
        panel_id: impl Into<String>,
        addr: i32,
    ) -> Self {
        Self {
            router_sn: router_sn.into(),
            equip_type: equip_type.into(),
            panel_id: panel_id.into(),
            addr,
        }
    }

    pub fn catalog_key(&self) -> CatalogKey {
        CatalogKey::new(self.equip_type.clone(), self.addr)
    }
}

/// One decoded register observation, ready for the history policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterObservation {
    pub key: RegisterKey,
    pub ts: DateTime<Utc>,
    pub name: Option<String>,
    pub unit: Option<String>,
    pub value: Option<f64>,
    pub raw: Option<i64>,
    pub text: Option<String>,
    pub reason: Option<String>,
}

/// Reason a `history` row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReason {
    First,
    Change,
    Heartbeat,
    ReasonChange,
}

impl fmt::Display for WriteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteReason::First => "first",
            WriteReason::Change => "change",
            WriteReason::Heartbeat => "heartbeat",
            WriteReason::ReasonChange => "reason_change",
        };
        f.write_str(s)
    }
}

/// One `latest_state` row, overwritten on every observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestStateRow {
    pub key: RegisterKey,
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub raw: Option<i64>,
    pub text: Option<String>,
    pub reason: Option<String>,
}

/// One `history` row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub key: RegisterKey,
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub raw: Option<i64>,
    pub text: Option<String>,
    pub reason: Option<String>,
    pub write_reason: WriteReason,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RouterOffline,
    RouterOnline,
    GpsJumpRejected,
    GpsLowSats,
    GpsBadFix,
    UnknownRegister,
    StaleRegister,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::RouterOffline => "router_offline",
            EventType::RouterOnline => "router_online",
            EventType::GpsJumpRejected => "gps_jump_rejected",
            EventType::GpsLowSats => "gps_low_sats",
            EventType::GpsBadFix => "gps_bad_fix",
            EventType::UnknownRegister => "unknown_register",
            EventType::StaleRegister => "stale_register",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub router_sn: String,
    pub equip_type: Option<String>,
    pub panel_id: Option<String>,
    pub event_type: EventType,
    pub description: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        router_sn: impl Into<String>,
        event_type: EventType,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            router_sn: router_sn.into(),
            equip_type: None,
            panel_id: None,
            event_type,
            description: description.into(),
            payload: serde_json::Value::Null,
            created_at,
        }
    }

    pub fn with_equip(mut self, equip_type: impl Into<String>, panel_id: impl Into<String>) -> Self {
        self.equip_type = Some(equip_type.into());
        self.panel_id = Some(panel_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
