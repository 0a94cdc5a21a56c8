//! Storage depot: box inventory, load orders and export demand.
//!
//! Boxes ring a rectangle of `x_len` by `z_len` on each plane, one plane per
//! row going down. Robots move items between their inventory and boxes with
//! tracked load orders; items wanted for export are carried to the export
//! queue and dropped there.
//!
//! `exporting[item]` is the total outstanding demand for an item. Per-robot
//! claims in `export_allocs` are carved out of that total, so the unclaimed
//! part of the demand is `exporting[item]` minus the sum of all claims.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::area::{RefuelPlan, fuel_item, refuel_plan};
use crate::error::{DecideError, PersistError};
use crate::job::{Decision, Job};
use crate::persist::{DETAILS_FILE, Persister};
use crate::queue::QueueCoords;
use crate::types::{AreaId, ItemId, RobotLabel, RobotReport, Vec3, WorkId};

pub const BOX_CAPACITY: i32 = 2048;
/// Box amount marking a hole (no container, never allocated).
pub const HOLE: i32 = -1;

/// Item identities that cannot be told apart in storage and are always exported.
pub const EXPORT_BLACKLIST: [&str; 2] = [
    "Thaumcraft:ItemWispEssence/0",
    "Thaumcraft:ItemManaBean/0",
];

fn default_holes() -> Vec<usize> {
    vec![4, 5, 6]
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBox {
    pub amount: i32,
    /// Set while the box holds anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemId>,
}

impl StorageBox {
    pub fn is_hole(&self) -> bool {
        self.amount < 0
    }

    fn holds(&self, item: &ItemId) -> bool {
        self.item.as_ref() == Some(item)
    }
}

/// Target of a load order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTarget {
    Box(usize),
    /// Virtual box behind the export queue.
    ExportSink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLoadCount {
    /// Robot's count of the item when the order was issued.
    pub pre_count: u32,
    pub abs_delta: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOrder {
    pub id: WorkId,
    pub target: LoadTarget,
    /// Suck orders carry exactly one item.
    pub items: BTreeMap<ItemId, ItemLoadCount>,
    pub drop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxOrient {
    pub box_pos: Vec3,
    /// Direction a robot faces to reach the box from its load position.
    pub load_dir: Vec3,
}

impl BoxOrient {
    pub fn load_pos(&self) -> Vec3 {
        self.box_pos - self.load_dir
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BoxCandidate {
    dist: i32,
    id: usize,
    item: ItemId,
}

/// Inventory split against export demand.
#[derive(Debug, Default)]
struct InventorySplit {
    /// Held and not wanted.
    keep: BTreeMap<ItemId, u32>,
    /// Held and wanted for export.
    export: BTreeMap<ItemId, u32>,
    /// Wanted and not held.
    fetch: BTreeMap<ItemId, u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageArea {
    pub id: AreaId,
    #[serde(default)]
    pub work_id_seq: i64,
    pub pos: Vec3,
    pub x_len: i32,
    pub z_len: i32,
    pub rows: i32,
    #[serde(default = "default_holes")]
    pub holes: Vec<usize>,
    #[serde(default)]
    pub load_orders: BTreeMap<RobotLabel, LoadOrder>,
    #[serde(default)]
    pub exporting: BTreeMap<ItemId, u32>,
    #[serde(default)]
    pub export_allocs: BTreeMap<RobotLabel, BTreeMap<ItemId, u32>>,
    #[serde(skip)]
    pub boxes: Vec<StorageBox>,
    #[serde(skip)]
    dirty_planes: BTreeSet<usize>,
}

impl StorageArea {
    pub fn new(id: AreaId, pos: Vec3, x_len: i32, z_len: i32, rows: i32) -> Self {
        let mut area = Self {
            id,
            work_id_seq: 0,
            pos,
            x_len,
            z_len,
            rows,
            holes: default_holes(),
            load_orders: BTreeMap::new(),
            exporting: BTreeMap::new(),
            export_allocs: BTreeMap::new(),
            boxes: Vec::new(),
            dirty_planes: BTreeSet::new(),
        };
        area.boxes = vec![StorageBox::default(); area.box_count()];
        area.apply_holes();
        area
    }

    /// Create a fresh area on disk with every plane written.
    pub fn create(
        persister: &Persister,
        id: AreaId,
        pos: Vec3,
        x_len: i32,
        z_len: i32,
        rows: i32,
    ) -> Result<Self, PersistError> {
        let area = Self::new(id, pos, x_len, z_len, rows);
        area.store_all(persister)?;
        Ok(area)
    }

    pub fn load(persister: &Persister, id: &AreaId) -> Result<Self, PersistError> {
        let path = persister.area_dir(id).join(DETAILS_FILE);
        let mut area: StorageArea =
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
        if area.x_len <= 0 || area.z_len <= 0 || area.rows <= 0 {
            return Err(PersistError::InvalidArea {
                path,
                reason: "storage dimensions must be positive".to_string(),
            });
        }
        area.boxes = vec![StorageBox::default(); area.box_count()];
        let per_plane = area.boxes_per_plane();
        for name in persister.list(id)? {
            let Some(plane) = name
                .strip_prefix("plane.")
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if plane >= area.rows as usize {
                warn!(area = %id, plane, "ignoring plane outside of configured rows");
                continue;
            }
            let boxes: Vec<StorageBox> = persister.read(id, &name)?.unwrap_or_default();
            for (offset, stored) in boxes.into_iter().take(per_plane).enumerate() {
                area.boxes[plane * per_plane + offset] = stored;
            }
        }
        area.apply_holes();
        Ok(area)
    }

    fn apply_holes(&mut self) {
        for &hole in &self.holes {
            if let Some(slot) = self.boxes.get_mut(hole) {
                *slot = StorageBox {
                    amount: HOLE,
                    item: None,
                };
            }
        }
    }

    /// Write the details record plus any box planes touched since the last store.
    pub fn store(&mut self, persister: &Persister) -> Result<(), PersistError> {
        persister.write(&self.id, DETAILS_FILE, self)?;
        let planes = std::mem::take(&mut self.dirty_planes);
        for plane in planes {
            self.store_plane(persister, plane)?;
        }
        Ok(())
    }

    pub fn store_all(&self, persister: &Persister) -> Result<(), PersistError> {
        persister.write(&self.id, DETAILS_FILE, self)?;
        for plane in 0..self.rows.max(0) as usize {
            self.store_plane(persister, plane)?;
        }
        Ok(())
    }

    fn store_plane(&self, persister: &Persister, plane: usize) -> Result<(), PersistError> {
        let per_plane = self.boxes_per_plane();
        let start = plane * per_plane;
        let end = (start + per_plane).min(self.boxes.len());
        persister.write(&self.id, &format!("plane.{plane}"), &self.boxes[start..end])
    }

    pub fn boxes_per_plane(&self) -> usize {
        (2 * self.x_len + 2 * self.z_len).max(0) as usize
    }

    pub fn box_count(&self) -> usize {
        self.boxes_per_plane() * self.rows.max(0) as usize
    }

    pub fn box_orient(&self, id: usize) -> BoxOrient {
        let per_plane = self.boxes_per_plane() as i32;
        let id = id as i32;
        let plane_id = id % per_plane;
        let y = -(id / per_plane) - 2;
        let (x, z, load_dir) = if plane_id < self.x_len * 2 {
            let x = -self.x_len + plane_id % self.x_len;
            if plane_id < self.x_len {
                (x, -self.z_len - 1, Vec3::new(0, 0, -1))
            } else {
                (x, 0, Vec3::new(0, 0, 1))
            }
        } else {
            let z_id = plane_id - self.x_len * 2;
            let z = -self.z_len + z_id % self.z_len;
            if z_id < self.z_len {
                (-self.x_len - 1, z, Vec3::new(-1, 0, 0))
            } else {
                (0, z, Vec3::new(1, 0, 0))
            }
        };
        BoxOrient {
            box_pos: self.pos + Vec3::new(x, y, z),
            load_dir,
        }
    }

    pub fn export_queue(&self) -> QueueCoords {
        QueueCoords {
            face_dir: Vec3::UP,
            origin: self.pos + Vec3::new(-2, -1, 1),
            q_dir: Vec3::new(0, 0, -1),
            o_q0_dir: Vec3::new(0, -1, 0),
            q0_t0_dir: Vec3::new(-1, 0, 0),
        }
    }

    pub fn import_queue(&self) -> QueueCoords {
        QueueCoords {
            face_dir: Vec3::UP,
            origin: self.pos + Vec3::new(-4, -1, 1),
            q_dir: Vec3::new(0, 0, -1),
            o_q0_dir: Vec3::new(0, -1, 0),
            q0_t0_dir: Vec3::new(1, 0, 0),
        }
    }

    /// Units of `item` stored across all boxes.
    pub fn stock(&self, item: &ItemId) -> u32 {
        self.boxes
            .iter()
            .filter(|b| b.amount > 0 && b.holds(item))
            .map(|b| b.amount as u32)
            .sum()
    }

    pub fn claimed(&self, item: &ItemId) -> u32 {
        self.export_allocs
            .values()
            .filter_map(|claims| claims.get(item))
            .sum()
    }

    /// Export demand for `item` not yet claimed by any robot.
    pub fn unclaimed(&self, item: &ItemId) -> u32 {
        self.exporting
            .get(item)
            .copied()
            .unwrap_or(0)
            .saturating_sub(self.claimed(item))
    }

    fn own_claim(&self, label: &RobotLabel, item: &ItemId) -> u32 {
        self.export_allocs
            .get(label)
            .and_then(|claims| claims.get(item))
            .copied()
            .unwrap_or(0)
    }

    /// Closest box to `pos` for dropping or sucking `item`. A box already in
    /// use for the item beats an empty (drop) or full (suck) one at any distance.
    fn closest_box(&self, pos: Vec3, item: &ItemId, drop: bool) -> Option<BoxCandidate> {
        let mut fresh: Option<BoxCandidate> = None;
        let mut used: Option<BoxCandidate> = None;
        for (id, slot) in self.boxes.iter().enumerate() {
            if slot.is_hole() {
                continue;
            }
            let is_fresh = if drop {
                slot.amount == 0
            } else {
                slot.amount >= BOX_CAPACITY && slot.holds(item)
            };
            let is_used = slot.amount > 0 && slot.amount < BOX_CAPACITY && slot.holds(item);
            let best = if is_fresh {
                &mut fresh
            } else if is_used {
                &mut used
            } else {
                continue;
            };
            let dist = pos.l1_dist(self.box_orient(id).load_pos());
            if best.as_ref().is_none_or(|b| dist < b.dist) {
                *best = Some(BoxCandidate {
                    dist,
                    id,
                    item: item.clone(),
                });
            }
        }
        used.or(fresh)
    }

    /// Apply a content change to a box. Any change that would leave the box
    /// out of range or mixed is an invariant violation.
    fn update_box(&mut self, box_id: usize, item: &ItemId, delta: i32) -> Result<(), DecideError> {
        let area = self.id.clone();
        let slot = self
            .boxes
            .get_mut(box_id)
            .ok_or_else(|| DecideError::invariant(&area, format!("box {box_id} does not exist")))?;
        if slot.is_hole() {
            return Err(DecideError::invariant(
                &area,
                format!("attempting to update hole box {box_id}"),
            ));
        }
        let amount = slot.amount + delta;
        if !(0..=BOX_CAPACITY).contains(&amount) {
            return Err(DecideError::invariant(
                &area,
                format!("box {box_id} would hold {amount} items"),
            ));
        }
        if amount == 0 {
            slot.item = None;
        } else {
            match &slot.item {
                None => slot.item = Some(item.clone()),
                Some(tag) if tag != item => {
                    return Err(DecideError::invariant(
                        &area,
                        format!("attempting to load {item} in {tag} box {box_id}"),
                    ));
                }
                Some(_) => {}
            }
        }
        slot.amount = amount;
        self.dirty_planes.insert(box_id / self.boxes_per_plane());
        Ok(())
    }

    /// Set the export demand for `item` to its current value plus `delta`,
    /// clamped to what the boxes hold and never below outstanding claims.
    pub fn adjust_export_demand(
        &mut self,
        item: &ItemId,
        delta: i64,
        persister: &Persister,
    ) -> Result<u32, DecideError> {
        let current = i64::from(self.exporting.get(item).copied().unwrap_or(0));
        let claimed = self.claimed(item);
        let ceiling = i64::from(self.stock(item).max(claimed));
        let demand = current.saturating_add(delta).clamp(i64::from(claimed), ceiling) as u32;
        if demand == 0 {
            self.exporting.remove(item);
        } else {
            self.exporting.insert(item.clone(), demand);
        }
        info!(area = %self.id, item = %item, delta, demand, "export demand adjusted");
        self.store(persister)?;
        Ok(demand)
    }

    fn load_order_job(&self, order: &LoadOrder) -> Result<Job, DecideError> {
        let load_dir = match order.target {
            LoadTarget::ExportSink => self.export_queue().face_dir,
            LoadTarget::Box(box_id) if box_id < self.boxes.len() => {
                self.box_orient(box_id).load_dir
            }
            LoadTarget::Box(box_id) => {
                return Err(DecideError::invariant(
                    &self.id,
                    format!("load order {} targets missing box {box_id}", order.id),
                ));
            }
        };
        if order.drop {
            let items = order
                .items
                .iter()
                .map(|(item, count)| (item.clone(), count.abs_delta))
                .collect();
            return Ok(Job::drop(order.id, items, load_dir));
        }
        let mut items = order.items.iter();
        match (items.next(), items.next()) {
            (Some((item, count)), None) => Ok(Job::suck(
                order.id,
                Some(item.clone()),
                count.abs_delta,
                load_dir,
            )),
            _ => Err(DecideError::invariant(
                &self.id,
                format!("suck order {} must carry exactly one item", order.id),
            )),
        }
    }

    pub fn decide(
        &mut self,
        report: &RobotReport,
        persister: &Persister,
    ) -> Result<Decision, DecideError> {
        if report.is_busy() {
            return Ok(Decision::Continue);
        }
        let mut dirty = false;

        if let Some(order) = self.load_orders.get(&report.label).cloned() {
            let reissue = match &report.cur_work {
                None => true,
                Some(job) => job.id != order.id && job.complete,
            };
            if reissue {
                warn!(
                    area = %self.id,
                    robot = %report.label,
                    order = %order.id,
                    "load order was not picked up, re-issuing"
                );
                return Ok(Decision::Assign(self.load_order_job(&order)?));
            }
            self.reconcile(&order, report)?;
            self.load_orders.remove(&report.label);
            dirty = true;
        }

        let result = self.next_job(report, &mut dirty);
        if dirty {
            self.store(persister)?;
        }
        result
    }

    /// Account for a finished load order. Nothing is mutated unless every
    /// item in the order checks out.
    fn reconcile(&mut self, order: &LoadOrder, report: &RobotReport) -> Result<(), DecideError> {
        let label = &report.label;
        let expected_kind = if order.drop { "drop" } else { "suck" };
        if let Some(job) = &report.cur_work {
            if job.id != order.id || job.kind != expected_kind {
                return Err(DecideError::reconcile(
                    label,
                    format!(
                        "current work {} ({}) does not match load order {} ({expected_kind})",
                        job.id, job.kind, order.id
                    ),
                ));
            }
        }

        let mut moved = Vec::with_capacity(order.items.len());
        for (item, count) in &order.items {
            let current = i64::from(report.inv_count.count(item));
            let delta = current - i64::from(count.pre_count);
            if (delta < 0 && !order.drop) || (delta > 0 && order.drop) {
                return Err(DecideError::reconcile(
                    label,
                    format!("{item} moved {delta} against the direction of order {}", order.id),
                ));
            }
            if let LoadTarget::Box(box_id) = order.target {
                let slot = self.boxes.get(box_id).ok_or_else(|| {
                    DecideError::invariant(&self.id, format!("box {box_id} does not exist"))
                })?;
                if slot.is_hole() {
                    return Err(DecideError::invariant(
                        &self.id,
                        format!("load order {} targets hole box {box_id}", order.id),
                    ));
                }
                let after = i64::from(slot.amount) - delta;
                let tag_clash = slot.item.as_ref().is_some_and(|tag| tag != item);
                if after < 0 || after > i64::from(BOX_CAPACITY) || (tag_clash && delta != 0) {
                    return Err(DecideError::reconcile(
                        label,
                        format!(
                            "load of {delta} {item} is incompatible with box {box_id} ({} {:?})",
                            slot.amount, slot.item
                        ),
                    ));
                }
            }
            moved.push((item.clone(), delta));
        }

        for (item, delta) in moved {
            match order.target {
                LoadTarget::Box(box_id) => {
                    if delta != 0 {
                        self.update_box(box_id, &item, -(delta as i32))?;
                    }
                }
                LoadTarget::ExportSink => self.account_export(label, &item, (-delta) as u32),
            }
        }
        debug!(area = %self.id, robot = %label, order = %order.id, "load order reconciled");
        Ok(())
    }

    /// Exported units reduce the robot's claim first; the rest is taken
    /// from unclaimed demand, floored at zero.
    fn account_export(&mut self, label: &RobotLabel, item: &ItemId, exported: u32) {
        if exported == 0 {
            return;
        }
        let claim = self.own_claim(label, item);
        let unclaimed = self.unclaimed(item);
        let from_claim = exported.min(claim);
        let spill = exported - from_claim;
        let accounted = from_claim + spill.min(unclaimed);

        if let Some(demand) = self.exporting.get_mut(item) {
            *demand = demand.saturating_sub(accounted);
            if *demand == 0 {
                self.exporting.remove(item);
            }
        }
        if from_claim > 0 {
            if let Some(claims) = self.export_allocs.get_mut(label) {
                let left = claim - from_claim;
                if left == 0 {
                    claims.remove(item);
                } else {
                    claims.insert(item.clone(), left);
                }
                if claims.is_empty() {
                    self.export_allocs.remove(label);
                }
            }
        }
        info!(robot = %label, item = %item, exported, accounted, "export delivered");
    }

    /// Demand this robot should serve: its own claims where present,
    /// otherwise the unclaimed share of global demand.
    fn wanted(&self, label: &RobotLabel) -> BTreeMap<ItemId, u32> {
        let mut wanted: BTreeMap<ItemId, u32> = self
            .export_allocs
            .get(label)
            .map(|claims| {
                claims
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(item, n)| (item.clone(), *n))
                    .collect()
            })
            .unwrap_or_default();
        for item in self.exporting.keys() {
            if wanted.contains_key(item) {
                continue;
            }
            let unclaimed = self.unclaimed(item);
            if unclaimed > 0 {
                wanted.insert(item.clone(), unclaimed);
            }
        }
        wanted
    }

    fn split_inventory(&self, report: &RobotReport) -> InventorySplit {
        let mut split = InventorySplit {
            fetch: self.wanted(&report.label),
            ..InventorySplit::default()
        };
        for (item, held) in report.inv_count.held() {
            let want = split.fetch.get(item).copied().unwrap_or(0);
            let mut export = want;
            if EXPORT_BLACKLIST.contains(&item.as_str()) {
                export = export.max(held);
            }
            if export == 0 {
                split.keep.insert(item.clone(), held);
                continue;
            }
            let out = export.min(held);
            if held > out {
                split.keep.insert(item.clone(), held - out);
            }
            split.export.insert(item.clone(), out);
            if want > out {
                split.fetch.insert(item.clone(), want - out);
            } else {
                split.fetch.remove(item);
            }
        }
        split
    }

    fn next_job(&mut self, report: &RobotReport, dirty: &mut bool) -> Result<Decision, DecideError> {
        let split = self.split_inventory(report);

        if let Some(job) = self.try_refuel(report, dirty) {
            return Ok(Decision::Assign(job));
        }
        if report.inv_count.free_slots > 0 {
            if let Some(job) = self.try_box_load(report, &split.fetch, false, dirty) {
                return Ok(Decision::Assign(job));
            }
            if let Some(job) = self.try_export(report, &split.export, dirty) {
                return Ok(Decision::Assign(job));
            }
            if let Some(job) = self.try_box_load(report, &split.keep, true, dirty) {
                return Ok(Decision::Assign(job));
            }
            return Ok(self.import_queue_decision(report));
        }
        if let Some(job) = self.try_box_load(report, &split.keep, true, dirty) {
            return Ok(Decision::Assign(job));
        }
        if let Some(job) = self.try_export(report, &split.export, dirty) {
            return Ok(Decision::Assign(job));
        }
        warn!(area = %self.id, robot = %report.label, "no free slots and nothing to drop");
        Err(DecideError::no_work(
            &report.label,
            "no free slots and nothing to drop",
        ))
    }

    fn try_refuel(&mut self, report: &RobotReport, dirty: &mut bool) -> Option<Job> {
        match refuel_plan(report) {
            RefuelPlan::Skip => None,
            RefuelPlan::Burn(count) => Some(Job::refuel(WorkId::TRANSIENT, fuel_item(), count)),
            RefuelPlan::Fetch { amount, held } => {
                let fuel = fuel_item();
                match self.closest_box(report.cur_pos, &fuel, false) {
                    Some(cand) => Some(self.box_load_job(report, &cand, false, amount, dirty)),
                    None => {
                        warn!(area = %self.id, robot = %report.label, "no fuel left in storage");
                        (held > 0).then(|| Job::refuel(WorkId::TRANSIENT, fuel, held))
                    }
                }
            }
        }
    }

    /// Walk to a box, or issue the tracked load order when already there.
    fn box_load_job(
        &mut self,
        report: &RobotReport,
        cand: &BoxCandidate,
        drop: bool,
        abs_delta: u32,
        dirty: &mut bool,
    ) -> Job {
        let orient = self.box_orient(cand.id);
        let load_pos = orient.load_pos();
        if report.cur_pos != load_pos {
            return Job::go_to(load_pos);
        }
        let in_box = self.boxes[cand.id].amount.max(0) as u32;
        let abs_delta = if drop {
            abs_delta.min(BOX_CAPACITY as u32 - in_box.min(BOX_CAPACITY as u32))
        } else {
            abs_delta.min(in_box)
        };
        self.work_id_seq += 1;
        let id = WorkId(self.work_id_seq);
        let mut items = BTreeMap::new();
        items.insert(
            cand.item.clone(),
            ItemLoadCount {
                pre_count: report.inv_count.count(&cand.item),
                abs_delta,
            },
        );
        self.load_orders.insert(
            report.label.clone(),
            LoadOrder {
                id,
                target: LoadTarget::Box(cand.id),
                items,
                drop,
            },
        );
        *dirty = true;
        debug!(area = %self.id, robot = %report.label, box_id = cand.id, drop, abs_delta, "load order issued");
        if drop {
            let mut items = BTreeMap::new();
            items.insert(cand.item.clone(), abs_delta);
            Job::drop(id, items, orient.load_dir)
        } else {
            Job::suck(id, Some(cand.item.clone()), abs_delta, orient.load_dir)
        }
    }

    /// Drop `items` into boxes (`drop`) or fetch them for export.
    fn try_box_load(
        &mut self,
        report: &RobotReport,
        items: &BTreeMap<ItemId, u32>,
        drop: bool,
        dirty: &mut bool,
    ) -> Option<Job> {
        let mut best: Option<BoxCandidate> = None;
        for item in items.keys() {
            match self.closest_box(report.cur_pos, item, drop) {
                Some(cand) => {
                    if best.as_ref().is_none_or(|b| cand.dist < b.dist) {
                        best = Some(cand);
                    }
                }
                None if drop => {
                    warn!(area = %self.id, robot = %report.label, item = %item, "no free box to unload into");
                }
                None => {
                    warn!(area = %self.id, robot = %report.label, item = %item, "out of stock, nothing to export");
                    self.release_stale_claim(report, item, dirty);
                }
            }
        }
        let cand = best?;
        let amount = items.get(&cand.item).copied().unwrap_or(0);
        if !drop && self.own_claim(&report.label, &cand.item) == 0 {
            let in_box = self.boxes[cand.id].amount.max(0) as u32;
            let claim = amount.min(in_box);
            self.export_allocs
                .entry(report.label.clone())
                .or_default()
                .insert(cand.item.clone(), claim);
            *dirty = true;
            info!(area = %self.id, robot = %report.label, item = %cand.item, claim, "export claimed");
        }
        Some(self.box_load_job(report, &cand, drop, amount, dirty))
    }

    /// A claim nobody can fill any more goes back to unclaimed demand.
    fn release_stale_claim(&mut self, report: &RobotReport, item: &ItemId, dirty: &mut bool) {
        if report.inv_count.count(item) > 0 {
            return;
        }
        let Some(claims) = self.export_allocs.get_mut(&report.label) else {
            return;
        };
        if claims.remove(item).is_some() {
            if claims.is_empty() {
                self.export_allocs.remove(&report.label);
            }
            *dirty = true;
            info!(area = %self.id, robot = %report.label, item = %item, "released unfillable export claim");
        }
    }

    fn try_export(
        &mut self,
        report: &RobotReport,
        items: &BTreeMap<ItemId, u32>,
        dirty: &mut bool,
    ) -> Option<Job> {
        if items.is_empty() {
            return None;
        }
        let queue = self.export_queue();
        if report.cur_pos != queue.origin {
            return Some(queue.job(WorkId::TRANSIENT));
        }
        self.work_id_seq += 1;
        let order = LoadOrder {
            id: WorkId(self.work_id_seq),
            target: LoadTarget::ExportSink,
            items: items
                .iter()
                .map(|(item, n)| {
                    (
                        item.clone(),
                        ItemLoadCount {
                            pre_count: report.inv_count.count(item),
                            abs_delta: *n,
                        },
                    )
                })
                .collect(),
            drop: true,
        };
        let items = order
            .items
            .iter()
            .map(|(item, count)| (item.clone(), count.abs_delta))
            .collect();
        let job = Job::drop(order.id, items, queue.face_dir);
        self.load_orders.insert(report.label.clone(), order);
        *dirty = true;
        Some(job)
    }

    fn import_queue_decision(&self, report: &RobotReport) -> Decision {
        let queue = self.import_queue();
        let running = |id: WorkId| {
            report
                .cur_work
                .as_ref()
                .is_some_and(|job| job.id == id && !job.complete)
        };
        if report.cur_pos == queue.origin {
            if running(WorkId::IMPORT_SUCK) {
                return Decision::Continue;
            }
            return Decision::Assign(Job::suck(WorkId::IMPORT_SUCK, None, 0, queue.face_dir));
        }
        if running(WorkId::IMPORT_QUEUE) {
            return Decision::Continue;
        }
        Decision::Assign(queue.job(WorkId::IMPORT_QUEUE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Task;
    use crate::sync_log::SyncLog;
    use crate::types::ReportedJob;
    use std::sync::Arc;

    fn iron() -> ItemId {
        ItemId::from("minecraft:iron_ingot/0")
    }

    fn setup() -> (tempfile::TempDir, Persister, StorageArea) {
        let dir = tempfile::tempdir().expect("tempdir");
        let persister = Persister::new(dir.path(), Arc::new(SyncLog::new()));
        let area = StorageArea::create(
            &persister,
            AreaId::new("storage.main"),
            Vec3::new(0, 64, 0),
            4,
            4,
            2,
        )
        .expect("create storage");
        (dir, persister, area)
    }

    fn fill(area: &mut StorageArea, box_id: usize, item: &ItemId, amount: i32) {
        area.boxes[box_id] = StorageBox {
            amount,
            item: Some(item.clone()),
        };
    }

    fn robot(name: &str, pos: Vec3, free_slots: u32) -> RobotReport {
        let mut report = RobotReport::new(format!("storage.main.{name}"), pos);
        report.fuel_lvl = 4000;
        report.inv_count.free_slots = free_slots;
        report
    }

    fn assigned(decision: Decision) -> Job {
        match decision {
            Decision::Assign(job) => job,
            Decision::Continue => panic!("expected a job, got Continue"),
        }
    }

    fn assert_claims_within_demand(area: &StorageArea) {
        let items: BTreeSet<&ItemId> = area.export_allocs.values().flat_map(|c| c.keys()).collect();
        for item in items {
            let demand = area.exporting.get(item).copied().unwrap_or(0);
            assert!(
                area.claimed(item) <= demand,
                "claims for {item} exceed demand {demand}"
            );
        }
    }

    fn assert_box_ranges(area: &StorageArea) {
        for slot in &area.boxes {
            assert!(slot.amount == HOLE || (0..=BOX_CAPACITY).contains(&slot.amount));
        }
    }

    #[test]
    fn box_geometry_rings_the_rectangle_per_plane() {
        let (_dir, _persister, area) = setup();
        assert_eq!(area.boxes_per_plane(), 16);
        assert_eq!(area.box_count(), 32);
        let first = area.box_orient(0);
        assert_eq!(first.box_pos, Vec3::new(-4, 62, -5));
        assert_eq!(first.load_pos(), Vec3::new(-4, 62, -4));
        // Same slot one plane down.
        assert_eq!(area.box_orient(16).box_pos, Vec3::new(-4, 61, -5));
        assert_eq!(area.box_orient(12).load_dir, Vec3::new(1, 0, 0));
        assert!(area.boxes[4].is_hole() && area.boxes[6].is_hole());
        assert!(!area.boxes[20].is_hole());
    }

    #[test]
    fn export_demand_makes_an_empty_robot_fetch_not_drop() {
        let (_dir, persister, mut area) = setup();
        fill(&mut area, 0, &iron(), 100);
        area.exporting.insert(iron(), 10);

        let far = robot("t1", Vec3::new(10, 70, 10), 1);
        let job = assigned(area.decide(&far, &persister).expect("decide"));
        assert_eq!(job, Job::go_to(area.box_orient(0).load_pos()));

        let at_box = robot("t1", area.box_orient(0).load_pos(), 1);
        let job = assigned(area.decide(&at_box, &persister).expect("decide"));
        match &job.task {
            Task::Suck { item, amount, .. } => {
                assert_eq!(item.as_ref(), Some(&iron()));
                assert!(*amount <= 10 && *amount > 0);
            }
            other => panic!("expected suck, got {other:?}"),
        }
        assert!(job.id.is_tracked());
        assert_eq!(area.own_claim(&at_box.label, &iron()), 10);
        assert_claims_within_demand(&area);
    }

    #[test]
    fn low_fuel_without_free_slots_routes_to_fuel_before_refuelling() {
        let (_dir, persister, mut area) = setup();
        fill(&mut area, 1, &fuel_item(), 500);

        let mut report = robot("t1", Vec3::new(8, 64, 8), 0);
        report.fuel_lvl = 50;
        report.inv_count.grouped.insert(fuel_item(), 0);

        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, Job::go_to(area.box_orient(1).load_pos()));

        report.cur_pos = area.box_orient(1).load_pos();
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job.kind(), crate::job::JobKind::Suck);
        let order = area.load_orders.get(&report.label).expect("fuel load order");
        assert_eq!(order.target, LoadTarget::Box(1));

        // Picked up the fuel: the next decision burns it.
        report.cur_work = Some(ReportedJob::new(job.id, "suck", true));
        report.inv_count.grouped.insert(fuel_item(), 62);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, Job::refuel(WorkId::TRANSIENT, fuel_item(), 62));
        assert_eq!(area.boxes[1].amount, 438);
    }

    #[test]
    fn repeat_decisions_are_idempotent() {
        let (_dir, persister, mut area) = setup();
        let cobble = ItemId::from("minecraft:cobblestone/0");
        fill(&mut area, 2, &cobble, 10);
        let mut report = robot("t1", area.box_orient(2).load_pos(), 3);
        report.inv_count.grouped.insert(cobble.clone(), 20);

        let job = assigned(area.decide(&report, &persister).expect("decide"));
        let seq = area.work_id_seq;
        let orders = area.load_orders.clone();

        // Running the job: nothing changes.
        report.cur_work = Some(ReportedJob::new(job.id, "drop", false));
        assert_eq!(area.decide(&report, &persister).expect("decide"), Decision::Continue);
        assert_eq!(area.decide(&report, &persister).expect("decide"), Decision::Continue);
        assert_eq!(area.work_id_seq, seq);
        assert_eq!(area.load_orders, orders);

        // Job was lost (e.g. robot restarted): the same order is re-issued.
        report.cur_work = None;
        let again = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(again, job);
        assert_eq!(area.work_id_seq, seq);
    }

    #[test]
    fn drop_into_box_updates_stock_and_plane_file() {
        let (_dir, persister, mut area) = setup();
        let cobble = ItemId::from("minecraft:cobblestone/0");
        fill(&mut area, 20, &cobble, 10);
        // Used box on plane 1 beats the nearby empty box on plane 0.
        let mut report = robot("t1", area.box_orient(0).load_pos(), 3);
        report.inv_count.grouped.insert(cobble.clone(), 20);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, Job::go_to(area.box_orient(20).load_pos()));

        report.cur_pos = area.box_orient(20).load_pos();
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job.kind(), crate::job::JobKind::Drop);

        report.cur_work = Some(ReportedJob::new(job.id, "drop", true));
        report.inv_count.grouped.insert(cobble.clone(), 0);
        let next = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(next.id, WorkId::IMPORT_QUEUE);
        assert_eq!(area.boxes[20].amount, 30);
        assert!(area.load_orders.is_empty());

        let reloaded = StorageArea::load(&persister, &area.id).expect("reload");
        assert_eq!(reloaded.boxes[20], area.boxes[20]);
        assert!(reloaded.boxes[5].is_hole());
    }

    #[test]
    fn overflowing_drop_is_rejected_before_mutation() {
        let (_dir, persister, mut area) = setup();
        let cobble = ItemId::from("minecraft:cobblestone/0");
        fill(&mut area, 2, &cobble, 2040);
        let mut report = robot("t1", area.box_orient(2).load_pos(), 3);
        report.inv_count.grouped.insert(cobble.clone(), 5);
        let job = assigned(area.decide(&report, &persister).expect("decide"));

        // Firmware claims to have dropped far more than it held.
        report.cur_work = Some(ReportedJob::new(job.id, "drop", true));
        let mut order = area.load_orders[&report.label].clone();
        order.items.get_mut(&cobble).expect("cobble").pre_count = 64;
        area.load_orders.insert(report.label.clone(), order);
        report.inv_count.grouped.insert(cobble.clone(), 0);

        let err = area.decide(&report, &persister).expect_err("must reject");
        assert!(matches!(err, DecideError::Reconcile { .. }));
        assert_eq!(area.boxes[2].amount, 2040);
        assert!(area.load_orders.contains_key(&report.label));
        assert_box_ranges(&area);
    }

    #[test]
    fn drop_into_nearly_full_box_only_fills_the_room_left() {
        let (_dir, persister, mut area) = setup();
        let cobble = ItemId::from("minecraft:cobblestone/0");
        fill(&mut area, 2, &cobble, 2040);
        let mut report = robot("t1", area.box_orient(2).load_pos(), 3);
        report.inv_count.grouped.insert(cobble.clone(), 20);

        let job = assigned(area.decide(&report, &persister).expect("decide"));
        match &job.task {
            Task::Drop { items, .. } => assert_eq!(items.get(&cobble), Some(&8)),
            other => panic!("expected drop, got {other:?}"),
        }

        report.cur_work = Some(ReportedJob::new(job.id, "drop", true));
        report.inv_count.grouped.insert(cobble.clone(), 12);
        let next = assigned(area.decide(&report, &persister).expect("reconciles"));
        assert_ne!(next.id, job.id);
        assert_eq!(area.boxes[2].amount, BOX_CAPACITY);
        assert!(
            area.load_orders
                .get(&report.label)
                .is_none_or(|order| order.target != LoadTarget::Box(2))
        );
        assert_box_ranges(&area);
    }

    #[test]
    fn mismatched_job_is_recoverable() {
        let (_dir, persister, mut area) = setup();
        let cobble = ItemId::from("minecraft:cobblestone/0");
        let mut report = robot("t1", area.box_orient(0).load_pos(), 3);
        report.inv_count.grouped.insert(cobble, 5);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        report.cur_work = Some(ReportedJob::new(job.id, "suck", true));
        let err = area.decide(&report, &persister).expect_err("type mismatch");
        assert!(!err.is_fatal());
    }

    #[test]
    fn export_drop_consumes_claim_then_unclaimed_demand() {
        let (_dir, persister, mut area) = setup();
        area.exporting.insert(iron(), 30);
        area.export_allocs
            .entry(RobotLabel::new("storage.main.t1"))
            .or_default()
            .insert(iron(), 10);
        area.export_allocs
            .entry(RobotLabel::new("storage.main.t2"))
            .or_default()
            .insert(iron(), 5);

        let mut report = robot("t1", area.export_queue().origin, 2);
        report.inv_count.grouped.insert(iron(), 18);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        match &job.task {
            Task::Drop { items, dir } => {
                assert_eq!(items[&iron()], 10);
                assert_eq!(*dir, Vec3::UP);
            }
            other => panic!("expected export drop, got {other:?}"),
        }

        // Firmware exported more than asked: 10 from the claim, 8 spill.
        report.cur_work = Some(ReportedJob::new(job.id, "drop", true));
        report.inv_count.grouped.insert(iron(), 0);
        area.decide(&report, &persister).expect("decide");

        assert_eq!(area.own_claim(&report.label, &iron()), 0);
        // Unclaimed was 30 - 15 = 15, so the whole spill is accounted.
        assert_eq!(area.exporting.get(&iron()).copied(), Some(12));
        assert_eq!(area.claimed(&iron()), 5);
        assert_claims_within_demand(&area);
    }

    #[test]
    fn competing_export_claims_never_exceed_demand() {
        let (_dir, persister, mut area) = setup();
        fill(&mut area, 0, &iron(), 60);
        fill(&mut area, 3, &iron(), 60);
        area.adjust_export_demand(&iron(), 100, &persister)
            .expect("adjust");
        assert_eq!(area.exporting[&iron()], 100);

        // Physical box contents as the stand-in firmware sees them.
        let mut physical: Vec<i32> = area.boxes.iter().map(|b| b.amount).collect();
        let mut robots: Vec<RobotReport> = (1..=3)
            .map(|n| robot(&format!("t{n}"), Vec3::new(20, 64, 20), 4))
            .collect();
        for round in 0..12 {
            for report in robots.iter_mut() {
                let decision = area.decide(report, &persister).expect("decide");
                assert_claims_within_demand(&area);
                assert_box_ranges(&area);
                let Decision::Assign(job) = decision else {
                    continue;
                };
                let target = area.load_orders.get(&report.label).map(|o| o.target);
                // Stand-in firmware: walk instantly, load what is physically there.
                match &job.task {
                    Task::Go { waypoints } => {
                        report.cur_pos = *waypoints.last().expect("target");
                    }
                    Task::Queue { .. } => report.cur_pos = area.export_queue().origin,
                    Task::Suck { item: Some(item), amount, .. } => {
                        let Some(LoadTarget::Box(box_id)) = target else {
                            panic!("tracked suck without a box target");
                        };
                        let taken = (*amount as i32).min(physical[box_id]).max(0);
                        physical[box_id] -= taken;
                        let held = report.inv_count.count(item);
                        report.inv_count.grouped.insert(item.clone(), held + taken as u32);
                    }
                    Task::Drop { items, .. } => {
                        for (item, n) in items {
                            if let Some(LoadTarget::Box(box_id)) = target {
                                physical[box_id] += *n as i32;
                            }
                            let held = report.inv_count.count(item);
                            report.inv_count.grouped.insert(item.clone(), held - n);
                        }
                    }
                    _ => {}
                }
                report.cur_work = Some(ReportedJob::new(job.id, job.kind().as_str(), true));
            }
            if round == 6 {
                area.adjust_export_demand(&iron(), -1000, &persister)
                    .expect("shrink demand");
                assert_eq!(area.exporting.get(&iron()).copied().unwrap_or(0), area.claimed(&iron()));
            }
        }
        assert_claims_within_demand(&area);
        assert!(area.stock(&iron()) >= 20);
    }

    #[test]
    fn adjust_export_demand_clamps_to_stock_and_claims() {
        let (_dir, persister, mut area) = setup();
        fill(&mut area, 0, &iron(), 40);
        assert_eq!(area.adjust_export_demand(&iron(), 500, &persister).expect("adjust"), 40);
        area.export_allocs
            .entry(RobotLabel::new("storage.main.t1"))
            .or_default()
            .insert(iron(), 25);
        assert_eq!(area.adjust_export_demand(&iron(), -100, &persister).expect("adjust"), 25);
        let gold = ItemId::from("minecraft:gold_ingot/0");
        assert_eq!(area.adjust_export_demand(&gold, 5, &persister).expect("adjust"), 0);
        assert!(!area.exporting.contains_key(&gold));
    }

    #[test]
    fn extreme_export_demand_deltas_saturate() {
        let (_dir, persister, mut area) = setup();
        fill(&mut area, 0, &iron(), 40);
        area.exporting.insert(iron(), 10);
        assert_eq!(area.adjust_export_demand(&iron(), i64::MAX, &persister).expect("max"), 40);
        assert_eq!(area.adjust_export_demand(&iron(), i64::MIN, &persister).expect("min"), 0);
        assert!(!area.exporting.contains_key(&iron()));
    }

    #[test]
    fn import_queue_is_low_priority_and_not_reissued_while_running() {
        let (_dir, persister, mut area) = setup();
        let mut report = robot("t1", Vec3::new(30, 64, 30), 8);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, area.import_queue().job(WorkId::IMPORT_QUEUE));

        report.cur_work = Some(ReportedJob::new(WorkId::IMPORT_QUEUE, "queue", false));
        assert_eq!(area.decide(&report, &persister).expect("decide"), Decision::Continue);

        // Demand shows up while queueing: the low priority job is replaced.
        fill(&mut area, 0, &iron(), 5);
        area.exporting.insert(iron(), 5);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, Job::go_to(area.box_orient(0).load_pos()));

        area.exporting.clear();
        area.export_allocs.clear();
        report.cur_pos = area.import_queue().origin;
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        assert_eq!(job, Job::suck(WorkId::IMPORT_SUCK, None, 0, Vec3::UP));
    }

    #[test]
    fn blacklisted_items_are_exported_without_demand() {
        let (_dir, persister, mut area) = setup();
        let wisp = ItemId::from(EXPORT_BLACKLIST[0]);
        let mut report = robot("t1", area.export_queue().origin, 2);
        report.inv_count.grouped.insert(wisp.clone(), 3);
        let job = assigned(area.decide(&report, &persister).expect("decide"));
        match job.task {
            Task::Drop { items, .. } => assert_eq!(items[&wisp], 3),
            other => panic!("expected export drop, got {other:?}"),
        }
    }

    #[test]
    fn full_inventory_with_nothing_to_drop_is_no_work() {
        let (_dir, persister, mut area) = setup();
        // Every box is taken by another item, so there is nowhere to drop.
        let dirt = ItemId::from("minecraft:dirt/0");
        let cobble = ItemId::from("minecraft:cobblestone/0");
        for id in 0..area.boxes.len() {
            if !area.boxes[id].is_hole() {
                fill(&mut area, id, &dirt, BOX_CAPACITY);
            }
        }
        let mut report = robot("t1", Vec3::new(0, 64, 0), 0);
        report.inv_count.grouped.insert(cobble, 64);
        let err = area.decide(&report, &persister).expect_err("no work");
        assert!(matches!(err, DecideError::NoWork { .. }));
    }
}
