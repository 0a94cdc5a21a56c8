//! Mine: a square spiral of mines, each drilled through five boreholes.
//!
//! A mine floor is cleared (and lit) ahead of drilling; the clear frontier
//! `next_clear` is kept up to `CLEAR_AHEAD` mines in front of `next_mine`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::area::{DecideCtx, RefuelPlan, fuel_item, refuel_plan};
use crate::error::{DecideError, PersistError};
use crate::job::{Decision, Job};
use crate::persist::{DETAILS_FILE, Persister};
use crate::types::{AreaId, ItemId, RobotLabel, RobotReport, Vec3, WorkId};

pub const BOREHOLES_PER_MINE: u32 = 5;
/// How far the clear frontier is kept ahead of the drill frontier.
pub const CLEAR_AHEAD: u32 = 8;
pub const LANTERN_ITEM: &str = "Railcraft:lantern.stone/9";
const LANTERNS_NEEDED: u32 = 2;
const MINE_X_LEN: i32 = 10;
const MINE_Z_LEN: i32 = 5;
const IDLE_SECONDS: u32 = 10;

/// Down/up shaft offsets for each borehole, relative to the mine corner.
const BOREHOLE_OFFSETS: [(Vec3, Vec3); BOREHOLES_PER_MINE as usize] = [
    (Vec3::new(0, -1, 0), Vec3::new(1, -1, -2)),
    (Vec3::new(2, -1, -4), Vec3::new(3, -1, -1)),
    (Vec3::new(4, -1, -3), Vec3::new(5, -1, 0)),
    (Vec3::new(6, -1, -2), Vec3::new(7, -1, -4)),
    (Vec3::new(8, -1, -1), Vec3::new(9, -1, -3)),
];

const LANTERN_OFFSETS: [Vec3; 2] = [Vec3::new(2, 0, -2), Vec3::new(7, 0, -2)];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoreholeState {
    Undrilled,
    InProgress,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MineOrderKind {
    /// Clear the floor of mine `next_clear` and light it.
    Clear,
    Drill,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MineOrder {
    pub id: WorkId,
    pub kind: MineOrderKind,
    #[serde(default)]
    pub borehole_id: u32,
    /// Clear orders count down: 2 sweeps the floor, 1 and 0 place lanterns.
    #[serde(default)]
    pub state: u8,
}

/// Mine id and offset within the mine for a global borehole id.
pub fn borehole_location(borehole_id: u32) -> (u32, usize) {
    (
        borehole_id / BOREHOLES_PER_MINE,
        (borehole_id % BOREHOLES_PER_MINE) as usize,
    )
}

#[derive(Serialize)]
struct BoreholeStats<'a> {
    time: String,
    borehole_id: u32,
    mine_id: u32,
    mine_borehole_offs: usize,
    robot: &'a RobotLabel,
    items: BTreeMap<&'a ItemId, u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MineArea {
    pub id: AreaId,
    #[serde(default)]
    pub work_id_seq: i64,
    pub pos: Vec3,
    pub depth: i32,
    #[serde(default)]
    pub next_clear: u32,
    #[serde(default)]
    pub next_mine: u32,
    /// Mines with at least one borehole not yet complete.
    #[serde(default)]
    pub mine_progress: BTreeMap<u32, [BoreholeState; BOREHOLES_PER_MINE as usize]>,
    #[serde(default)]
    pub mine_allocs: BTreeMap<RobotLabel, MineOrder>,
}

impl MineArea {
    pub fn new(id: AreaId, pos: Vec3, depth: i32) -> Self {
        Self {
            id,
            work_id_seq: 0,
            pos,
            depth,
            next_clear: 0,
            next_mine: 0,
            mine_progress: BTreeMap::new(),
            mine_allocs: BTreeMap::new(),
        }
    }

    pub fn create(
        persister: &Persister,
        id: AreaId,
        pos: Vec3,
        depth: i32,
    ) -> Result<Self, PersistError> {
        let area = Self::new(id, pos, depth);
        area.store(persister)?;
        Ok(area)
    }

    pub fn load(persister: &Persister, id: &AreaId) -> Result<Self, PersistError> {
        let path = persister.area_dir(id).join(DETAILS_FILE);
        let area: MineArea =
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

    fn fuel_box_load_pos(&self) -> Vec3 {
        self.pos + Vec3::new(3, 1, 0) + Vec3::DOWN
    }

    fn lantern_box_load_pos(&self) -> Vec3 {
        self.pos + Vec3::new(3, 1, -4) + Vec3::DOWN
    }

    fn unload_box_load_pos(&self) -> Vec3 {
        self.pos + Vec3::new(5, 1, -2) + Vec3::DOWN
    }

    /// Corner of mine `mine_id` on the square spiral around the area origin.
    pub fn mine_coord(&self, mine_id: u32) -> Vec3 {
        let ring = ((f64::from(mine_id).sqrt() + 1.0) / 2.0).floor() as i32;
        let inner_edge = (ring * 2 - 1).max(0);
        let mut offset = mine_id as i32 - inner_edge * inner_edge;
        let segments = [ring + 1, 2 * ring, 2 * ring, 2 * ring, ring - 1];
        let mut segment = segments.len() - 1;
        for (i, len) in segments.into_iter().enumerate() {
            if offset < len {
                segment = i;
                break;
            }
            offset -= len;
        }
        let (x, z) = match segment {
            0 => (-offset, -ring),
            1 => (-ring, -ring + offset + 1),
            2 => (-ring + offset + 1, ring),
            3 => (ring, ring - offset - 1),
            _ => (ring - offset - 1, -ring),
        };
        self.pos + Vec3::new(x * MINE_X_LEN, 0, z * MINE_Z_LEN)
    }

    /// Down shaft, its bottom, the up shaft bottom and the up shaft top.
    pub fn borehole_waypoints(&self, borehole_id: u32) -> Vec<Vec3> {
        let (mine_id, offs) = borehole_location(borehole_id);
        let corner = self.mine_coord(mine_id);
        let (down_offs, up_offs) = BOREHOLE_OFFSETS[offs];
        let down = corner + down_offs;
        let up = corner + up_offs;
        let bottom = Vec3::new(0, -self.depth, 0);
        vec![down, down + bottom, up + bottom, up]
    }

    pub fn decide(
        &mut self,
        report: &RobotReport,
        ctx: &DecideCtx<'_>,
    ) -> Result<Decision, DecideError> {
        if report.is_busy() {
            return Ok(Decision::Continue);
        }
        let mut dirty = false;

        if let Some(order) = self.mine_allocs.get(&report.label).cloned() {
            if report.current_job_id() != Some(order.id) {
                // Intermediary step done, or the order never reached the robot.
                return self.order_job(report, &order).map(Decision::Assign);
            }
            if order.state > 0 {
                self.work_id_seq += 1;
                let next = MineOrder {
                    id: WorkId(self.work_id_seq),
                    state: order.state - 1,
                    ..order
                };
                self.mine_allocs.insert(report.label.clone(), next.clone());
                self.store(ctx.persister)?;
                return self.order_job(report, &next).map(Decision::Assign);
            }
            match order.kind {
                MineOrderKind::Clear => {
                    self.next_clear += 1;
                    info!(area = %self.id, next_clear = self.next_clear, "mine floor cleared");
                }
                MineOrderKind::Drill => self.complete_borehole(report, &order, ctx)?,
            }
            self.mine_allocs.remove(&report.label);
            dirty = true;
        }

        let job = match self.try_refuel(report) {
            Some(job) => job,
            None => match self.try_unload(report) {
                Some(job) => job,
                None => match self.try_clear(report, &mut dirty)? {
                    Some(job) => job,
                    None => match self.try_drill(report, &mut dirty)? {
                        Some(job) => job,
                        None => Job::idle(WorkId::TRANSIENT, IDLE_SECONDS),
                    },
                },
            },
        };
        if dirty {
            self.store(ctx.persister)?;
        }
        Ok(Decision::Assign(job))
    }

    fn complete_borehole(
        &mut self,
        report: &RobotReport,
        order: &MineOrder,
        ctx: &DecideCtx<'_>,
    ) -> Result<(), DecideError> {
        let (mine_id, offs) = borehole_location(order.borehole_id);
        let progress = self
            .mine_progress
            .get_mut(&mine_id)
            .filter(|progress| progress[offs] == BoreholeState::InProgress)
            .ok_or_else(|| {
                DecideError::reconcile(
                    &report.label,
                    format!(
                        "drill order for borehole {} does not match mine progress",
                        order.borehole_id
                    ),
                )
            })?;
        progress[offs] = BoreholeState::Complete;
        if progress.iter().all(|state| *state == BoreholeState::Complete) {
            self.mine_progress.remove(&mine_id);
            info!(area = %self.id, mine_id, "mine completed");
        }

        let stats = BoreholeStats {
            time: ctx.now.format("%Y-%m-%d %H:%M:%S").to_string(),
            borehole_id: order.borehole_id,
            mine_id,
            mine_borehole_offs: offs,
            robot: &report.label,
            items: report.inv_count.held().collect(),
        };
        let file = format!("stats/{}", order.borehole_id);
        if !ctx.persister.write_once(&self.id, &file, &stats)? {
            warn!(area = %self.id, borehole = order.borehole_id, "borehole statistics already recorded");
        }
        Ok(())
    }

    fn try_refuel(&self, report: &RobotReport) -> Option<Job> {
        match refuel_plan(report) {
            RefuelPlan::Skip => None,
            RefuelPlan::Burn(count) => Some(Job::refuel(WorkId::TRANSIENT, fuel_item(), count)),
            RefuelPlan::Fetch { amount, .. } => {
                let load_pos = self.fuel_box_load_pos();
                if report.cur_pos != load_pos {
                    return Some(Job::go_to(load_pos));
                }
                Some(Job::suck(WorkId::TRANSIENT, Some(fuel_item()), amount, Vec3::UP))
            }
        }
    }

    fn try_unload(&self, report: &RobotReport) -> Option<Job> {
        if report.inv_count.is_empty() {
            return None;
        }
        let load_pos = self.unload_box_load_pos();
        if report.cur_pos != load_pos {
            return Some(Job::go_to(load_pos));
        }
        let items = report
            .inv_count
            .held()
            .map(|(item, n)| (item.clone(), n))
            .collect();
        Some(Job::drop(WorkId::TRANSIENT, items, Vec3::UP))
    }

    fn try_clear(
        &mut self,
        report: &RobotReport,
        dirty: &mut bool,
    ) -> Result<Option<Job>, DecideError> {
        if self.next_clear.saturating_sub(self.next_mine) >= CLEAR_AHEAD {
            return Ok(None);
        }
        // One clearing robot at a time.
        if self
            .mine_allocs
            .values()
            .any(|order| order.kind == MineOrderKind::Clear)
        {
            return Ok(None);
        }
        self.work_id_seq += 1;
        let order = MineOrder {
            id: WorkId(self.work_id_seq),
            kind: MineOrderKind::Clear,
            borehole_id: 0,
            state: 2,
        };
        self.mine_allocs.insert(report.label.clone(), order.clone());
        *dirty = true;
        self.order_job(report, &order).map(Some)
    }

    fn try_drill(
        &mut self,
        report: &RobotReport,
        dirty: &mut bool,
    ) -> Result<Option<Job>, DecideError> {
        let open = self.mine_progress.iter().find_map(|(mine_id, progress)| {
            progress
                .iter()
                .position(|state| *state == BoreholeState::Undrilled)
                .map(|offs| (*mine_id, offs))
        });
        let (mine_id, offs) = match open {
            Some(found) => found,
            None if self.next_mine < self.next_clear => {
                let mine_id = self.next_mine;
                self.mine_progress
                    .insert(mine_id, [BoreholeState::Undrilled; BOREHOLES_PER_MINE as usize]);
                self.next_mine += 1;
                info!(area = %self.id, mine_id, "opened mine");
                (mine_id, 0)
            }
            None => return Ok(None),
        };
        if let Some(progress) = self.mine_progress.get_mut(&mine_id) {
            progress[offs] = BoreholeState::InProgress;
        }
        self.work_id_seq += 1;
        let order = MineOrder {
            id: WorkId(self.work_id_seq),
            kind: MineOrderKind::Drill,
            borehole_id: mine_id * BOREHOLES_PER_MINE + offs as u32,
            state: 0,
        };
        self.mine_allocs.insert(report.label.clone(), order.clone());
        *dirty = true;
        self.order_job(report, &order).map(Some)
    }

    fn order_job(&self, report: &RobotReport, order: &MineOrder) -> Result<Job, DecideError> {
        match order.kind {
            MineOrderKind::Clear => {
                let lantern = ItemId::from(LANTERN_ITEM);
                let corner = self.mine_coord(self.next_clear);
                match order.state {
                    2 => {
                        let held = report.inv_count.count(&lantern);
                        if held < LANTERNS_NEEDED {
                            let load_pos = self.lantern_box_load_pos();
                            if report.cur_pos != load_pos {
                                return Ok(Job::go_to(load_pos));
                            }
                            return Ok(Job::suck(
                                WorkId::TRANSIENT,
                                Some(lantern),
                                LANTERNS_NEEDED - held,
                                Vec3::UP,
                            ));
                        }
                        Ok(self.clear_floor_job(report, order, corner))
                    }
                    1 | 0 => {
                        let place_pos = corner + LANTERN_OFFSETS[order.state as usize] + Vec3::UP;
                        if report.cur_pos != place_pos {
                            return Ok(Job::go_to(place_pos));
                        }
                        Ok(Job::construct(order.id, lantern, vec![place_pos], Vec3::DOWN))
                    }
                    state => Err(DecideError::invariant(
                        &self.id,
                        format!("clear order {} has unknown state {state}", order.id),
                    )),
                }
            }
            MineOrderKind::Drill => {
                let waypoints = self.borehole_waypoints(order.borehole_id);
                let start = waypoints[0] + Vec3::UP;
                if report.cur_pos != start {
                    return Ok(Job::go_to(start));
                }
                Ok(Job::mine(order.id, waypoints, Vec::new(), true, false))
            }
        }
    }

    /// Serpentine sweep of the mine floor, entered from the side facing away
    /// from the area origin.
    fn clear_floor_job(&self, report: &RobotReport, order: &MineOrder, corner: Vec3) -> Job {
        let x_pos = corner.x() >= self.pos.x();
        let z_pos = corner.z() >= self.pos.z();
        let attack_dir = match (x_pos, z_pos) {
            (false, false) => Vec3::new(-1, 0, 0),
            (false, true) => Vec3::new(0, 0, 1),
            (true, true) => Vec3::new(1, 0, 0),
            (true, false) => Vec3::new(0, 0, -1),
        };
        let offs_x = if attack_dir.x() == -1 {
            MINE_X_LEN
        } else {
            -attack_dir.x()
        };
        let offs_z = if attack_dir.z() == 1 {
            -MINE_Z_LEN
        } else {
            -attack_dir.z()
        };
        let attack_pos = corner + Vec3::new(offs_x, 0, offs_z);
        if report.cur_pos != attack_pos {
            return Job::go_to(attack_pos);
        }

        let start = attack_pos + attack_dir;
        let mut waypoints = vec![start];
        let mut cur = start;
        let z_step = if start.z() < corner.z() { 1 } else { -1 };
        for lane in 0..MINE_Z_LEN {
            if lane > 0 {
                cur.2 += z_step;
                waypoints.push(cur);
            }
            cur.0 = if cur.x() > corner.x() {
                corner.x()
            } else {
                corner.x() + MINE_X_LEN - 1
            };
            waypoints.push(cur);
        }
        Job::mine(order.id, waypoints, vec![Vec3::UP], false, true)
    }
}
