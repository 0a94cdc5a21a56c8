//! Farm: stacked 9x9 plots served by an elevator and a wait queue.
//!
//! Plot `n` sits `3 * n` blocks below the top level. Every trip to a box
//! passes level 0 first.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::area::{DecideCtx, RefuelPlan, fuel_item, refuel_plan};
use crate::error::{DecideError, PersistError};
use crate::job::{Decision, Job};
use crate::persist::{DETAILS_FILE, Persister};
use crate::queue::QueueCoords;
use crate::types::{AreaId, ItemId, RobotLabel, RobotReport, Vec3, WorkId};

const PLOT_EDGE: u32 = 9;
const PLOT_AREA: u32 = PLOT_EDGE * PLOT_EDGE - 1;
const LEVEL_HEIGHT: i32 = 3;
const WAIT_SECONDS: u32 = 10;
const SURPLUS_BOX: usize = 0;
const FUEL_BOX: usize = 1;
const FIRST_SEED_BOX: usize = 2;

/// Serpentine walk over one plot, relative to the area origin at plot height.
const PLOT_WALK: [(i32, i32); 22] = [
    (-4, 4),
    (-4, -4),
    (-3, -4),
    (-3, 4),
    (-2, 4),
    (-2, -4),
    (-1, -4),
    (-1, 4),
    // The elevator column interrupts the middle row.
    (0, 4),
    (0, 1),
    (1, 1),
    (1, -1),
    (0, -1),
    (0, -4),
    (1, -4),
    (1, 4),
    (2, 4),
    (2, -4),
    (3, -4),
    (3, 4),
    (4, 4),
    (4, -4),
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmPlot {
    pub seeds: Vec<ItemId>,
    /// RFC 3339; empty or unparsable means never planted.
    #[serde(default)]
    pub plant_time: String,
    #[serde(default)]
    pub assignee: Option<RobotLabel>,
    #[serde(default)]
    pub work_id: WorkId,
}

impl FarmPlot {
    pub fn new(seeds: Vec<ItemId>) -> Self {
        Self {
            seeds,
            plant_time: String::new(),
            assignee: None,
            work_id: WorkId::NONE,
        }
    }

    fn planted_at(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.plant_time)
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FarmArea {
    pub id: AreaId,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub work_id_seq: i64,
    /// Minutes between replants of a plot.
    pub interval: u32,
    pub pos: Vec3,
    /// Seed stocked in box `2 + index`.
    #[serde(default)]
    pub seeds: Vec<ItemId>,
    #[serde(default)]
    pub plots: Vec<FarmPlot>,
}

impl FarmArea {
    pub fn new(
        id: AreaId,
        pos: Vec3,
        interval: u32,
        seeds: Vec<ItemId>,
        plots: Vec<FarmPlot>,
    ) -> Self {
        Self {
            id,
            enabled: true,
            work_id_seq: 0,
            interval,
            pos,
            seeds,
            plots,
        }
    }

    pub fn create(
        persister: &Persister,
        id: AreaId,
        pos: Vec3,
        interval: u32,
        seeds: Vec<ItemId>,
        plots: Vec<FarmPlot>,
    ) -> Result<Self, PersistError> {
        let area = Self::new(id, pos, interval, seeds, plots);
        area.store(persister)?;
        Ok(area)
    }

    pub fn load(persister: &Persister, id: &AreaId) -> Result<Self, PersistError> {
        let path = persister.area_dir(id).join(DETAILS_FILE);
        let area: FarmArea =
            persister
                .read(id, DETAILS_FILE)?
                .ok_or_else(|| PersistError::InvalidArea {
                    path: path.clone(),
                    reason: "missing details record".to_string(),
                })?;
        if area.id != *id {
            return Err(PersistError::InvalidArea {
                path,
                reason: format!("record names area {}", area.id),
            });
        }
        Ok(area)
    }

    pub fn store(&self, persister: &Persister) -> Result<(), PersistError> {
        persister.write(&self.id, DETAILS_FILE, self)
    }

    fn box_load_dir(&self) -> Vec3 {
        Vec3::new(0, 0, 1)
    }

    fn box_load_pos(&self, box_id: usize) -> Vec3 {
        let coord = self.pos + Vec3::new(-4 + box_id as i32, 2, 9);
        coord - self.box_load_dir()
    }

    fn descend_origin(&self) -> Vec3 {
        self.pos + Vec3::new(-4, 2, 6)
    }

    fn ascend_origin(&self) -> Vec3 {
        self.pos + Vec3::new(-3, 2, 6)
    }

    pub fn wait_queue(&self) -> QueueCoords {
        QueueCoords {
            face_dir: Vec3::new(-1, 0, 0),
            origin: self.pos + Vec3::new(-1, 2, 6),
            q_dir: Vec3::new(0, 0, -1),
            o_q0_dir: Vec3::new(1, 0, 0),
            q0_t0_dir: Vec3::new(0, 0, 1),
        }
    }

    pub fn level_of(&self, pos: Vec3) -> i32 {
        (-(pos.y() - self.pos.y() - 2) / LEVEL_HEIGHT).max(0)
    }

    /// Ride to `level`, or `None` when already there.
    fn elevator_job(&self, report: &RobotReport, level: i32) -> Option<Job> {
        let cur = self.level_of(report.cur_pos);
        if cur == level {
            return None;
        }
        let shaft = if cur < level {
            self.ascend_origin()
        } else {
            self.descend_origin()
        };
        let at_level = |n: i32| shaft - Vec3::new(0, n * LEVEL_HEIGHT, 0);
        Some(Job::go(WorkId::TRANSIENT, vec![at_level(cur), at_level(level)]))
    }

    fn wait_job(&self, report: &RobotReport) -> Job {
        let queue = self.wait_queue();
        if report.cur_pos == queue.origin {
            return Job::idle(WorkId::TRANSIENT, WAIT_SECONDS);
        }
        self.elevator_job(report, 0)
            .unwrap_or_else(|| queue.job(WorkId::TRANSIENT))
    }

    pub fn decide(
        &mut self,
        report: &RobotReport,
        ctx: &DecideCtx<'_>,
    ) -> Result<Decision, DecideError> {
        if report.is_busy() {
            return Ok(Decision::Continue);
        }
        if !self.enabled {
            return Ok(Decision::Assign(self.wait_job(report)));
        }
        let mut dirty = false;

        let mut finished = None;
        for (level, plot) in self.plots.iter().enumerate() {
            if plot.assignee.as_ref() != Some(&report.label) {
                continue;
            }
            if report.current_job_id() != Some(plot.work_id) {
                return Ok(Decision::Assign(self.plot_job(report, level)));
            }
            finished = Some(level);
            break;
        }
        if let Some(level) = finished {
            let plot = &mut self.plots[level];
            plot.plant_time = ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true);
            plot.assignee = None;
            plot.work_id = WorkId::NONE;
            info!(area = %self.id, level, robot = %report.label, "plot replanted");
            dirty = true;
        }

        let job = match self.try_refuel(report) {
            Some(job) => job,
            None => match self.try_reload(report) {
                Some(job) => job,
                None => match self.try_farm(report, ctx.now) {
                    Some(job) => {
                        dirty = true;
                        job
                    }
                    None => self.wait_job(report),
                },
            },
        };
        if dirty {
            self.store(ctx.persister)?;
        }
        Ok(Decision::Assign(job))
    }

    fn try_refuel(&self, report: &RobotReport) -> Option<Job> {
        match refuel_plan(report) {
            RefuelPlan::Skip => None,
            RefuelPlan::Burn(count) => Some(Job::refuel(WorkId::TRANSIENT, fuel_item(), count)),
            RefuelPlan::Fetch { amount, .. } => {
                if let Some(job) = self.elevator_job(report, 0) {
                    return Some(job);
                }
                let load_pos = self.box_load_pos(FUEL_BOX);
                if report.cur_pos != load_pos {
                    return Some(Job::go_to(load_pos));
                }
                Some(Job::suck(
                    WorkId::TRANSIENT,
                    Some(fuel_item()),
                    amount,
                    self.box_load_dir(),
                ))
            }
        }
    }

    /// Seeds each robot carries: enough for the most demanding plot.
    fn seed_requirements(&self) -> BTreeMap<ItemId, u32> {
        let mut required: BTreeMap<ItemId, u32> = BTreeMap::new();
        for plot in &self.plots {
            let n = plot.seeds.len() as u32;
            if n == 0 {
                continue;
            }
            let amount = (PLOT_EDGE + PLOT_AREA).div_ceil(n);
            for seed in &plot.seeds {
                let entry = required.entry(seed.clone()).or_default();
                *entry = (*entry).max(amount);
            }
        }
        required
    }

    /// Balance the inventory one item at a time: surplus into box 0,
    /// shortfall from the seed's own box.
    fn try_reload(&self, report: &RobotReport) -> Option<Job> {
        let mut balance: BTreeMap<ItemId, i64> = self
            .seed_requirements()
            .into_iter()
            .map(|(item, amount)| (item, -i64::from(amount)))
            .collect();
        for (item, held) in report.inv_count.held() {
            *balance.entry(item.clone()).or_default() += i64::from(held);
        }

        for (item, delta) in balance {
            let box_id = if delta > 0 {
                SURPLUS_BOX
            } else if delta < 0 {
                match self.seeds.iter().position(|seed| *seed == item) {
                    Some(index) => FIRST_SEED_BOX + index,
                    // No box stocks this seed.
                    None => continue,
                }
            } else {
                continue;
            };
            if let Some(job) = self.elevator_job(report, 0) {
                return Some(job);
            }
            let load_pos = self.box_load_pos(box_id);
            if report.cur_pos != load_pos {
                return Some(Job::go_to(load_pos));
            }
            let amount = delta.unsigned_abs() as u32;
            return Some(if delta > 0 {
                Job::drop(
                    WorkId::TRANSIENT,
                    BTreeMap::from([(item, amount)]),
                    self.box_load_dir(),
                )
            } else {
                Job::suck(WorkId::TRANSIENT, Some(item), amount, self.box_load_dir())
            });
        }
        None
    }

    /// Claim the first unassigned plot due for replanting.
    fn try_farm(&mut self, report: &RobotReport, now: DateTime<Utc>) -> Option<Job> {
        let interval = TimeDelta::minutes(i64::from(self.interval));
        let level = self
            .plots
            .iter()
            .position(|plot| plot.assignee.is_none() && now - plot.planted_at() >= interval)?;
        self.work_id_seq += 1;
        let plot = &mut self.plots[level];
        plot.assignee = Some(report.label.clone());
        plot.work_id = WorkId(self.work_id_seq);
        Some(self.plot_job(report, level))
    }

    fn plot_job(&self, report: &RobotReport, level: usize) -> Job {
        let level_i = level as i32;
        if let Some(job) = self.elevator_job(report, level_i) {
            return job;
        }
        let y_offset = 2 - LEVEL_HEIGHT * level_i;
        let start = self.pos + Vec3::new(-4, y_offset, 4);
        if report.cur_pos != start {
            return Job::go_to(start);
        }
        let plot = &self.plots[level];
        let waypoints = PLOT_WALK
            .iter()
            .map(|&(x, z)| self.pos + Vec3::new(x, y_offset, z))
            .collect();
        Job::farm(plot.work_id, waypoints, plot.seeds.clone(), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Task;
    use crate::sync_log::SyncLog;
    use crate::types::ReportedJob;
    use std::sync::Arc;

    const SEED: &str = "minecraft:wheat_seeds/0";
    const CROP: &str = "minecraft:wheat/0";

    fn setup(plots: usize) -> (tempfile::TempDir, Persister, FarmArea) {
        let dir = tempfile::tempdir().expect("tempdir");
        let persister = Persister::new(dir.path(), Arc::new(SyncLog::new()));
        let plots = (0..plots)
            .map(|_| FarmPlot::new(vec![ItemId::from(SEED)]))
            .collect();
        let area = FarmArea::create(
            &persister,
            AreaId::new("farm.wheat"),
            Vec3::new(0, 70, 0),
            60,
            vec![ItemId::from(SEED)],
            plots,
        )
        .expect("create farm");
        (dir, persister, area)
    }

    fn robot(pos: Vec3) -> RobotReport {
        let mut report = RobotReport::new("farm.wheat.t1", pos);
        report.fuel_lvl = 3000;
        report.inv_count.free_slots = 10;
        report.inv_count.grouped.insert(ItemId::from(SEED), 89);
        report
    }

    fn assigned(decision: Decision) -> Job {
        match decision {
            Decision::Assign(job) => job,
            Decision::Continue => panic!("expected a job, got Continue"),
        }
    }

    #[test]
    fn plot_replants_only_after_interval() {
        let (_dir, persister, mut area) = setup(1);
        let now = Utc::now();
        area.plots[0].plant_time = (now - TimeDelta::minutes(30)).to_rfc3339();
        let start = area.pos + Vec3::new(-4, 2, 4);
        let report = robot(start);
        let ctx = DecideCtx {
            persister: &persister,
            now,
        };

        // Not due: the robot heads for the wait queue.
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(job, area.wait_queue().job(WorkId::TRANSIENT));
        assert!(area.plots[0].assignee.is_none());

        area.plots[0].plant_time = (now - TimeDelta::minutes(61)).to_rfc3339();
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(job.id, WorkId(1));
        let Task::Farm {
            waypoints,
            seeds,
            col_mod,
        } = &job.task
        else {
            panic!("expected farm job");
        };
        assert_eq!(waypoints.len(), 22);
        assert_eq!(waypoints[0], start);
        assert_eq!(seeds, &vec![ItemId::from(SEED)]);
        assert_eq!(*col_mod, 1);
        assert_eq!(area.plots[0].assignee, Some(report.label.clone()));
    }

    #[test]
    fn completed_plot_is_stamped_and_released() {
        let (_dir, persister, mut area) = setup(1);
        let now = Utc::now();
        let start = area.pos + Vec3::new(-4, 2, 4);
        let mut report = robot(start);
        let ctx = DecideCtx {
            persister: &persister,
            now,
        };
        let job = assigned(area.decide(&report, &ctx).expect("decide"));

        report.cur_work = Some(ReportedJob::new(job.id, "farm", false));
        assert_eq!(area.decide(&report, &ctx).expect("decide"), Decision::Continue);

        // Lost job: re-issued unchanged.
        report.cur_work = None;
        assert_eq!(assigned(area.decide(&report, &ctx).expect("decide")), job);

        report.cur_work = Some(ReportedJob::new(job.id, "farm", true));
        let next = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(next, area.wait_queue().job(WorkId::TRANSIENT));
        let plot = &area.plots[0];
        assert!(plot.assignee.is_none());
        assert_eq!(plot.work_id, WorkId::NONE);
        assert_eq!(plot.planted_at().timestamp(), now.timestamp());

        let reloaded = FarmArea::load(&persister, &area.id).expect("reload");
        assert_eq!(reloaded.plots, area.plots);
    }

    #[test]
    fn disabled_farm_only_waits() {
        let (_dir, persister, mut area) = setup(2);
        area.enabled = false;
        let ctx = DecideCtx {
            persister: &persister,
            now: Utc::now(),
        };
        let report = robot(area.wait_queue().origin);
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(job, Job::idle(WorkId::TRANSIENT, 10));
        assert_eq!(area.work_id_seq, 0);
    }

    #[test]
    fn reload_drops_surplus_then_fetches_seeds() {
        let (_dir, persister, mut area) = setup(1);
        let ctx = DecideCtx {
            persister: &persister,
            now: Utc::now(),
        };
        let mut report = robot(area.box_load_pos(SURPLUS_BOX));
        report.inv_count.grouped.insert(ItemId::from(CROP), 40);
        report.inv_count.grouped.insert(ItemId::from(SEED), 20);

        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(
            job,
            Job::drop(
                WorkId::TRANSIENT,
                BTreeMap::from([(ItemId::from(CROP), 40)]),
                Vec3::new(0, 0, 1)
            )
        );

        report.inv_count.grouped.remove(&ItemId::from(CROP));
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(job, Job::go_to(area.box_load_pos(FIRST_SEED_BOX)));
        report.cur_pos = area.box_load_pos(FIRST_SEED_BOX);
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        assert_eq!(
            job,
            Job::suck(
                WorkId::TRANSIENT,
                Some(ItemId::from(SEED)),
                69,
                Vec3::new(0, 0, 1)
            )
        );
    }

    #[test]
    fn lower_plots_are_reached_by_elevator() {
        let (_dir, persister, mut area) = setup(3);
        let now = Utc::now();
        let fresh = now.to_rfc3339();
        area.plots[0].plant_time = fresh.clone();
        area.plots[1].plant_time = fresh;
        let ctx = DecideCtx {
            persister: &persister,
            now,
        };
        let report = robot(area.pos + Vec3::new(-4, 2, 4));
        let job = assigned(area.decide(&report, &ctx).expect("decide"));
        let ascend = area.ascend_origin();
        assert_eq!(
            job,
            Job::go(
                WorkId::TRANSIENT,
                vec![ascend, ascend - Vec3::new(0, 6, 0)]
            )
        );
        assert_eq!(area.plots[2].assignee, Some(report.label.clone()));

        // Back up from level 2 for refuelling goes through the descend shaft.
        let mut low = robot(area.pos + Vec3::new(-4, -4, 4));
        assert_eq!(area.level_of(low.cur_pos), 2);
        low.label = RobotLabel::new("farm.wheat.t2");
        low.fuel_lvl = 0;
        let job = assigned(area.decide(&low, &ctx).expect("decide"));
        let descend = area.descend_origin();
        assert_eq!(
            job,
            Job::go(
                WorkId::TRANSIENT,
                vec![descend - Vec3::new(0, 6, 0), descend]
            )
        );
    }
}
