//! Exclusive per-cell occupancy for robots moving through queue lanes.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::types::{RobotLabel, Vec3};

pub struct LaneOccupancy {
    occupied: Mutex<HashMap<Vec3, RobotLabel>>,
    available: Condvar,
}

impl LaneOccupancy {
    pub fn new() -> Self {
        Self {
            occupied: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        }
    }

    /// Take `cell` for `robot` if it is free or already held by `robot`.
    pub fn try_acquire(&self, cell: Vec3, robot: &RobotLabel) -> bool {
        let mut guard = self.occupied.lock().expect("lane mutex poisoned");
        match guard.get(&cell) {
            Some(owner) => owner == robot,
            None => {
                guard.insert(cell, robot.clone());
                true
            }
        }
    }

    /// Block until `cell` can be taken or the timeout elapses.
    pub fn acquire_timeout(&self, cell: Vec3, robot: &RobotLabel, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.occupied.lock().expect("lane mutex poisoned");
        loop {
            match guard.get(&cell) {
                Some(owner) if owner == robot => return true,
                Some(_) => {}
                None => {
                    guard.insert(cell, robot.clone());
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .available
                .wait_timeout(guard, deadline - now)
                .expect("condvar wait failed");
            guard = next;
        }
    }

    pub fn release(&self, cell: Vec3, robot: &RobotLabel) -> bool {
        let mut guard = self.occupied.lock().expect("lane mutex poisoned");
        match guard.get(&cell) {
            Some(owner) if owner == robot => {
                guard.remove(&cell);
                self.available.notify_all();
                true
            }
            Some(owner) => {
                warn!(%cell, robot = %robot, owner = %owner, "lane release by non-owner");
                debug_assert!(false, "lane release by non-owner: cell={cell} robot={robot}");
                false
            }
            None => {
                warn!(%cell, robot = %robot, "lane release on free cell");
                debug_assert!(false, "lane release on free cell: cell={cell}");
                false
            }
        }
    }

    /// Free every cell held by `robot`, e.g. after it went offline.
    pub fn release_all(&self, robot: &RobotLabel) -> usize {
        let mut guard = self.occupied.lock().expect("lane mutex poisoned");
        let before = guard.len();
        guard.retain(|_, owner| owner != robot);
        let freed = before - guard.len();
        if freed > 0 {
            self.available.notify_all();
        }
        freed
    }

    /// True when `cell` is held by anyone other than `robot`.
    pub fn is_blocked_for(&self, cell: Vec3, robot: &RobotLabel) -> bool {
        let guard = self.occupied.lock().expect("lane mutex poisoned");
        guard.get(&cell).is_some_and(|owner| owner != robot)
    }

    pub fn occupied_cells(&self) -> HashSet<Vec3> {
        let guard = self.occupied.lock().expect("lane mutex poisoned");
        guard.keys().copied().collect()
    }
}

impl Default for LaneOccupancy {
    fn default() -> Self {
        Self::new()
    }
}
