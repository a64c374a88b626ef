//! GPS anti-teleport filter. Pure, deterministic: a function of the
//! per-object state plus one inbound fix. Must never suspend — no I/O, no
//! clock reads beyond what the caller supplies on the fix itself.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tib_schemas::{GpsFix, RejectReason};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsFilterConfig {
    pub sats_min: i32,
    pub fix_min: i32,
    pub max_jump_m: f64,
    pub max_speed_kmh: f64,
    pub confirm_points: usize,
    pub confirm_radius_m: f64,
}

impl Default for GpsFilterConfig {
    fn default() -> Self {
        Self {
            sats_min: 4,
            fix_min: 1,
            max_jump_m: 1000.0,
            max_speed_kmh: 150.0,
            confirm_points: 3,
            confirm_radius_m: 50.0,
        }
    }
}

/// Per-object filter state: last accepted fix plus a confirmation buffer.
/// The confirmation buffer is bounded to `confirm_points` entries,
/// evicting the oldest candidate on overflow — otherwise an object stuck
/// jumping forever would grow the buffer without bound, and the original
/// outlier that triggered confirmation would never age out of the
/// pairwise-distance check.
#[derive(Debug, Clone, Default)]
pub struct GpsFilterState {
    pub last_accepted: Option<GpsFix>,
    pub confirm_buffer: VecDeque<GpsFix>,
}

impl GpsFilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `last_accepted` from a restored `gps_latest_filtered` row.
    /// The buffer always starts empty.
    pub fn restored(last_accepted: GpsFix) -> Self {
        Self {
            last_accepted: Some(last_accepted),
            confirm_buffer: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpsDecision {
    Accept,
    Reject(RejectReason),
}

impl GpsDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GpsDecision::Accept)
    }
}

/// Great-circle distance in meters (Haversine, earth radius 6,371,000 m).
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

fn implied_speed_kmh(distance_m: f64, from: &GpsFix, to: &GpsFix) -> f64 {
    let secs = (to.received_at - from.received_at).num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        return f64::INFINITY;
    }
    (distance_m / secs) * 3.6
}

fn all_pairwise_within(points: &VecDeque<GpsFix>, radius_m: f64) -> bool {
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let d = haversine_m(points[i].lat, points[i].lon, points[j].lat, points[j].lon);
            if d > radius_m {
                return false;
            }
        }
    }
    true
}

/// Decision procedure: satellite/fix gates, then jump distance, then
/// implied speed, then multi-point confirmation for sustained jumps.
pub fn decide(state: &mut GpsFilterState, config: &GpsFilterConfig, fix: GpsFix) -> GpsDecision {
    if fix.satellites < config.sats_min {
        return GpsDecision::Reject(RejectReason::LowSats);
    }
    if fix.fix_status < config.fix_min {
        return GpsDecision::Reject(RejectReason::BadFix);
    }

    let last = match &state.last_accepted {
        None => {
            state.last_accepted = Some(fix);
            state.confirm_buffer.clear();
            return GpsDecision::Accept;
        }
        Some(last) => last.clone(),
    };

    let distance = haversine_m(last.lat, last.lon, fix.lat, fix.lon);
    if distance <= config.max_jump_m {
        state.last_accepted = Some(fix);
        state.confirm_buffer.clear();
        return GpsDecision::Accept;
    }

    let speed = implied_speed_kmh(distance, &last, &fix);
    if speed <= config.max_speed_kmh {
        state.last_accepted = Some(fix);
        state.confirm_buffer.clear();
        return GpsDecision::Accept;
    }

    state.confirm_buffer.push_back(fix.clone());
    while state.confirm_buffer.len() > config.confirm_points {
        state.confirm_buffer.pop_front();
    }

    if state.confirm_buffer.len() >= config.confirm_points
        && all_pairwise_within(&state.confirm_buffer, config.confirm_radius_m)
    {
        state.last_accepted = Some(fix);
        state.confirm_buffer.clear();
        GpsDecision::Accept
    } else {
        GpsDecision::Reject(RejectReason::JumpDistance { meters: distance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn fix(router_sn: &str, lat: f64, lon: f64, sats: i32, fix_status: i32, secs: i64) -> GpsFix {
        GpsFix {
            router_sn: router_sn.to_string(),
            lat,
            lon,
            satellites: sats,
            fix_status,
            gps_time: None,
            received_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn first_fix_is_always_accepted() {
        let mut state = GpsFilterState::new();
        let cfg = GpsFilterConfig::default();
        let d = decide(&mut state, &cfg, fix("R1", 59.851624, 30.479838, 8, 1, 0));
        assert_eq!(d, GpsDecision::Accept);
        assert!(state.last_accepted.is_some());
    }

    #[test]
    fn low_sats_rejected_state_unchanged() {
        let mut state = GpsFilterState::new();
        let cfg = GpsFilterConfig::default();
        decide(&mut state, &cfg, fix("R1", 59.0, 30.0, 8, 1, 0));
        let before = state.last_accepted.clone();
        let d = decide(&mut state, &cfg, fix("R1", 59.001, 30.001, 1, 1, 10));
        assert_eq!(d, GpsDecision::Reject(RejectReason::LowSats));
        assert_eq!(state.last_accepted, before);
        assert!(state.confirm_buffer.is_empty());
    }

    #[test]
    fn bad_fix_rejected_state_unchanged() {
        let mut state = GpsFilterState::new();
        let cfg = GpsFilterConfig::default();
        decide(&mut state, &cfg, fix("R1", 59.0, 30.0, 8, 1, 0));
        let d = decide(&mut state, &cfg, fix("R1", 59.001, 30.001, 8, 0, 10));
        assert_eq!(d, GpsDecision::Reject(RejectReason::BadFix));
    }

    #[test]
    fn s1_accept_then_teleport_reject() {
        let mut state = GpsFilterState::new();
        let cfg = GpsFilterConfig::default();

        let a = fix("R1", 59.851624, 30.479838, 8, 1, 0);
        let d1 = decide(&mut state, &cfg, a.clone());
        assert_eq!(d1, GpsDecision::Accept);

        let b = fix("R1", 55.751244, 37.618423, 10, 1, 60);
        let d2 = decide(&mut state, &cfg, b);
        match d2 {
            GpsDecision::Reject(RejectReason::JumpDistance { meters }) => {
                assert!(meters > cfg.max_jump_m)
            }
            other => panic!("expected jump_distance reject, got {other:?}"),
        }
        assert_eq!(state.last_accepted.as_ref().unwrap().lat, a.lat);
    }

    #[test]
    fn s2_confirm_after_jump_accepts_third_nearby_fix() {
        let mut state = GpsFilterState::new();
        let cfg = GpsFilterConfig::default();

        decide(&mut state, &cfg, fix("R1", 59.851624, 30.479838, 8, 1, 0));
        decide(&mut state, &cfg, fix("R1", 55.751244, 37.618423, 10, 1, 60));

        // A cluster ~195 m away from B (outside confirm_radius_m of B) but
        // mutually within a couple of meters of each other, so the buffer
        // only agrees once B has aged out of the bounded confirm window.
        let f1 = fix("R1", 55.753000, 37.618420, 9, 1, 120);
        let f2 = fix("R1", 55.753010, 37.618430, 9, 1, 180);
        let f3 = fix("R1", 55.753005, 37.618425, 9, 1, 240);

        let r1 = decide(&mut state, &cfg, f1);
        assert!(matches!(r1, GpsDecision::Reject(_)));
        let r2 = decide(&mut state, &cfg, f2);
        assert!(matches!(r2, GpsDecision::Reject(_)));
        let r3 = decide(&mut state, &cfg, f3.clone());
        assert_eq!(r3, GpsDecision::Accept);
        assert_eq!(state.last_accepted.as_ref().unwrap().lat, f3.lat);
        assert!(state.confirm_buffer.is_empty());
    }

    #[test]
    fn haversine_known_distance() {
        // Moscow to Saint Petersburg is roughly 635 km.
        let d = haversine_m(55.751244, 37.618423, 59.851624, 30.479838) / 1000.0;
        assert!((600.0..=670.0).contains(&d), "distance was {d} km");
    }
}
