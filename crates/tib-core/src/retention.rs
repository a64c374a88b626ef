//! Retention sweeper. The bounded-deletion loop itself is I/O and lives in
//! `tib-daemon`; this module only carries the pure configuration/plan so
//! the loop logic has no magic numbers scattered around it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::port::RetentionTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub gps_raw_hours: i64,
    pub history_days: i64,
    pub events_days: i64,
    pub batch_size: u32,
    pub cleanup_interval_sec: i64,
    pub max_batches_per_cycle: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            gps_raw_hours: 72,
            history_days: 30,
            events_days: 90,
            batch_size: 5000,
            cleanup_interval_sec: 3600,
            max_batches_per_cycle: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTask {
    pub table: RetentionTable,
    pub cutoff: DateTime<Utc>,
    pub batch_size: u32,
    pub max_batches: u32,
}

/// Produces the per-table sweep plan for one cleanup cycle. Never touches
/// `latest_state` or `gps_latest_filtered` — those tables have no entry
/// here by construction.
pub fn sweep_plan(config: &RetentionConfig, now: DateTime<Utc>) -> Vec<SweepTask> {
    vec![
        SweepTask {
            table: RetentionTable::GpsRawHistory,
            cutoff: now - Duration::hours(config.gps_raw_hours),
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_cycle,
        },
        SweepTask {
            table: RetentionTable::History,
            cutoff: now - Duration::days(config.history_days),
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_cycle,
        },
        SweepTask {
            table: RetentionTable::Events,
            cutoff: now - Duration::days(config.events_days),
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_cycle,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_covers_exactly_the_three_retained_tables() {
        let cfg = RetentionConfig::default();
        let now = Utc::now();
        let plan = sweep_plan(&cfg, now);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().any(|t| t.table == RetentionTable::GpsRawHistory));
        assert!(plan.iter().any(|t| t.table == RetentionTable::History));
        assert!(plan.iter().any(|t| t.table == RetentionTable::Events));
    }

    #[test]
    fn cutoffs_respect_configured_horizons() {
        let cfg = RetentionConfig {
            gps_raw_hours: 72,
            history_days: 30,
            events_days: 90,
            ..RetentionConfig::default()
        };
        let now = Utc::now();
        let plan = sweep_plan(&cfg, now);
        let events_task = plan.iter().find(|t| t.table == RetentionTable::Events).unwrap();
        assert_eq!(events_task.cutoff, now - Duration::days(90));
    }
}
