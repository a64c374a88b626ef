//! In-memory state owned by the supervisor and threaded into the decision
//! pipeline one message at a time. Ingest workers are partitioned by
//! `router_sn` for ordering, but all partitions share this one
//! `IngestState` behind a single mutex — correctness doesn't depend on
//! partitioning, only on messages for the same object never being
//! processed concurrently, which the mutex already guarantees.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tib_schemas::RegisterKey;

use crate::gps::GpsFilterState;
use crate::history::HistoryKeyState;
use crate::watchdog::{PanelId, WatchdogState};

/// `(router_sn, panel_id, addr)` — the key the unknown-register dedup set
/// is keyed by.
pub type UnknownKey = (String, String, i32);

#[derive(Debug, Default)]
pub struct IngestState {
    pub gps_filter: HashMap<String, GpsFilterState>,
    pub history: HashMap<RegisterKey, HistoryKeyState>,
    pub last_seen: HashMap<PanelId, DateTime<Utc>>,
    pub last_sample_ts: HashMap<RegisterKey, DateTime<Utc>>,
    pub unknown_reported: HashSet<UnknownKey>,
    pub low_sats_last_event: HashMap<String, DateTime<Utc>>,
    pub bad_fix_last_event: HashMap<String, DateTime<Utc>>,
    pub watchdog: WatchdogState,

    /// Diagnostic counters. Plain atomics so a read-only health probe can
    /// sample them without locking.
    pub topic_mismatches: AtomicU64,
    pub malformed_payloads: AtomicU64,
    pub dropped_after_retries: AtomicU64,
    pub queue_drops: AtomicU64,
}

impl IngestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gps_state_for(&mut self, router_sn: &str) -> &mut GpsFilterState {
        self.gps_filter
            .entry(router_sn.to_string())
            .or_insert_with(GpsFilterState::new)
    }

    pub fn history_state_for(&mut self, key: &RegisterKey) -> &mut HistoryKeyState {
        self.history
            .entry(key.clone())
            .or_insert_with(HistoryKeyState::new)
    }

    pub fn mark_unknown_reported(&mut self, key: UnknownKey) -> bool {
        self.unknown_reported.insert(key)
    }

    pub fn record_topic_mismatch(&self) {
        self.topic_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_payload(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_after_retries(&self) {
        self.dropped_after_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }
}
