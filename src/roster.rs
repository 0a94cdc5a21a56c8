//! Fleet roster: last report per robot and offline detection.
//!
//! Each report and each online/offline transition is mirrored into the sync
//! log as `robots/<label>`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::sync_log::SyncLog;
use crate::types::{RobotLabel, RobotReport};

struct RosterEntry {
    last_seen: Instant,
    report: RobotReport,
}

struct RosterState {
    robots: HashMap<RobotLabel, RosterEntry>,
    offline: HashSet<RobotLabel>,
}

#[derive(Serialize)]
struct RobotStatus<'a> {
    online: bool,
    #[serde(flatten)]
    report: &'a RobotReport,
}

pub struct FleetRoster {
    state: Mutex<RosterState>,
    sync: Arc<SyncLog>,
}

impl FleetRoster {
    fn overdue_robots(state: &RosterState, now: Instant, timeout: Duration) -> Vec<RobotLabel> {
        state
            .robots
            .iter()
            .filter(|(label, entry)| {
                now.duration_since(entry.last_seen) > timeout && !state.offline.contains(*label)
            })
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn new(sync: Arc<SyncLog>) -> Self {
        Self {
            state: Mutex::new(RosterState {
                robots: HashMap::new(),
                offline: HashSet::new(),
            }),
            sync,
        }
    }

    /// Store the latest report; clears any prior offline mark for the robot.
    pub fn record(&self, report: &RobotReport) {
        let came_back = {
            let mut guard = self.state.lock().expect("roster mutex poisoned");
            guard.robots.insert(
                report.label.clone(),
                RosterEntry {
                    last_seen: Instant::now(),
                    report: report.clone(),
                },
            );
            guard.offline.remove(&report.label)
        };
        if came_back {
            info!(robot = %report.label, "robot back online");
        }
        if let Some(err) = &report.fatal_err {
            warn!(robot = %report.label, error = %err, "robot reports fatal error");
        }
        self.publish(report, true);
    }

    /// Mark robots silent for longer than `timeout`; returns the full offline set.
    pub fn detect_offline(&self, timeout: Duration) -> HashSet<RobotLabel> {
        let (newly_offline, offline) = {
            let mut guard = self.state.lock().expect("roster mutex poisoned");
            let overdue = Self::overdue_robots(&guard, Instant::now(), timeout);
            let mut reports = Vec::with_capacity(overdue.len());
            for label in overdue {
                if let Some(entry) = guard.robots.get(&label) {
                    reports.push(entry.report.clone());
                }
                guard.offline.insert(label);
            }
            (reports, guard.offline.clone())
        };
        for report in &newly_offline {
            warn!(robot = %report.label, "robot marked offline");
            self.publish(report, false);
        }
        offline
    }

    pub fn offline_robots(&self) -> HashSet<RobotLabel> {
        let guard = self.state.lock().expect("roster mutex poisoned");
        guard.offline.clone()
    }

    pub fn last_report(&self, label: &RobotLabel) -> Option<RobotReport> {
        let guard = self.state.lock().expect("roster mutex poisoned");
        guard.robots.get(label).map(|entry| entry.report.clone())
    }

    pub fn len(&self) -> usize {
        let guard = self.state.lock().expect("roster mutex poisoned");
        guard.robots.len()
    }

    fn publish(&self, report: &RobotReport, online: bool) {
        let status = RobotStatus { online, report };
        match serde_json::to_string(&status) {
            Ok(text) => {
                self.sync.notify(&format!("robots/{}", report.label), text);
            }
            Err(err) => warn!(robot = %report.label, error = %err, "robot status not published"),
        }
    }

    #[cfg(test)]
    fn set_last_seen_for_test(&self, label: &RobotLabel, instant: Instant) {
        let mut guard = self.state.lock().expect("roster mutex poisoned");
        if let Some(entry) = guard.robots.get_mut(label) {
            entry.last_seen = instant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;

    fn roster() -> (Arc<SyncLog>, FleetRoster) {
        let sync = Arc::new(SyncLog::new());
        let roster = FleetRoster::new(Arc::clone(&sync));
        (sync, roster)
    }

    #[test]
    fn report_is_mirrored_into_sync_log() {
        let (sync, roster) = roster();
        let mut report = RobotReport::new("storage.main.t1", Vec3::new(1, 2, 3));
        report.fuel_lvl = 77;
        roster.record(&report);

        let update = sync.refresh(0).update;
        let status: serde_json::Value =
            serde_json::from_str(&update["robots/storage.main.t1"]).expect("status json");
        assert_eq!(status["online"], true);
        assert_eq!(status["fuel_lvl"], 77);
        assert_eq!(roster.last_report(&report.label), Some(report));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn silent_robot_goes_offline_once_and_recovers() {
        let (sync, roster) = roster();
        let report = RobotReport::new("mine.a.t1", Vec3::ZERO);
        roster.record(&report);
        roster.set_last_seen_for_test(&report.label, Instant::now() - Duration::from_secs(5));

        let offline = roster.detect_offline(Duration::from_secs(1));
        assert!(offline.contains(&report.label));
        let seq = sync.refresh(0).seq;
        // Already offline: no second transition is published.
        roster.detect_offline(Duration::from_secs(1));
        assert_eq!(sync.refresh(0).seq, seq);
        let status: serde_json::Value =
            serde_json::from_str(&sync.refresh(0).update["robots/mine.a.t1"]).expect("json");
        assert_eq!(status["online"], false);

        roster.record(&report);
        assert!(roster.offline_robots().is_empty());
    }

    #[test]
    fn fresh_reports_stay_online() {
        let (_sync, roster) = roster();
        roster.record(&RobotReport::new("farm.x.t1", Vec3::ZERO));
        assert!(roster.detect_offline(Duration::from_secs(60)).is_empty());
    }
}
