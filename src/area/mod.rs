//! Resource areas and the registry the work manager routes reports through.

pub mod farm;
pub mod mine;
pub mod storage;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{DecideError, PersistError};
use crate::job::Decision;
use crate::persist::Persister;
use crate::types::{AreaId, ItemId, RobotLabel, RobotReport};

pub use farm::FarmArea;
pub use mine::MineArea;
pub use storage::StorageArea;

pub const FUEL_ITEM: &str = "minecraft:coal/0";
/// Robots at or below this fuel level refuel before anything else.
pub const REFUEL_THRESHOLD: i64 = 500;
pub const FUEL_PER_ITEM: u32 = 80;
pub const FUEL_TARGET: u32 = 5000;

pub fn fuel_item() -> ItemId {
    ItemId::from(FUEL_ITEM)
}

/// What the refuel rung of a decision ladder should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefuelPlan {
    Skip,
    /// Burn this many fuel items from the inventory.
    Burn(u32),
    /// Collect `amount` more fuel; `held` is already on board.
    Fetch { amount: u32, held: u32 },
}

pub(crate) fn refuel_plan(report: &RobotReport) -> RefuelPlan {
    if report.fuel_lvl > REFUEL_THRESHOLD {
        return RefuelPlan::Skip;
    }
    let fuel = fuel_item();
    let held = report.inv_count.count(&fuel);
    let need = FUEL_TARGET / FUEL_PER_ITEM;
    if held >= need {
        return RefuelPlan::Burn(need);
    }
    if !report.inv_count.can_accept(&fuel) {
        return RefuelPlan::Skip;
    }
    RefuelPlan::Fetch {
        amount: need - held,
        held,
    }
}

/// Inputs shared by every area decision.
pub struct DecideCtx<'a> {
    pub persister: &'a Persister,
    pub now: DateTime<Utc>,
}

pub enum Area {
    Storage(StorageArea),
    Mine(MineArea),
    Farm(FarmArea),
}

impl Area {
    pub const KINDS: [&'static str; 3] = ["storage", "mine", "farm"];

    pub fn id(&self) -> &AreaId {
        match self {
            Area::Storage(area) => &area.id,
            Area::Mine(area) => &area.id,
            Area::Farm(area) => &area.id,
        }
    }

    pub fn decide(
        &mut self,
        report: &RobotReport,
        ctx: &DecideCtx<'_>,
    ) -> Result<Decision, DecideError> {
        match self {
            Area::Storage(area) => area.decide(report, ctx.persister),
            Area::Mine(area) => area.decide(report, ctx),
            Area::Farm(area) => area.decide(report, ctx),
        }
    }

    pub fn store(&self, persister: &Persister) -> Result<(), PersistError> {
        match self {
            Area::Storage(area) => area.store_all(persister),
            Area::Mine(area) => area.store(persister),
            Area::Farm(area) => area.store(persister),
        }
    }

    /// Load an area from `<state>/<id>/`, dispatching on the id's kind.
    pub fn load(persister: &Persister, id: &AreaId) -> Result<Area, PersistError> {
        let path = persister.area_dir(id);
        match id.kind() {
            Some("storage") => Ok(Area::Storage(StorageArea::load(persister, id)?)),
            Some("mine") => Ok(Area::Mine(MineArea::load(persister, id)?)),
            Some("farm") => Ok(Area::Farm(FarmArea::load(persister, id)?)),
            _ => Err(PersistError::InvalidArea {
                path,
                reason: format!("unknown area kind in {id}"),
            }),
        }
    }
}

/// Explicit area registry owned by the work manager.
#[derive(Default)]
pub struct AreaRegistry {
    areas: BTreeMap<AreaId, Area>,
}

impl AreaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every area directory under the state root.
    pub fn load(persister: &Persister) -> Result<Self, PersistError> {
        let mut registry = Self::new();
        for id in persister.area_ids()? {
            if !id.kind().is_some_and(|kind| Area::KINDS.contains(&kind)) {
                warn!(area = %id, "skipping directory with unknown area kind");
                continue;
            }
            let area = Area::load(persister, &id)?;
            info!(area = %id, "loaded area");
            registry.insert(area);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, area: Area) -> Option<Area> {
        self.areas.insert(area.id().clone(), area)
    }

    pub fn get(&self, id: &AreaId) -> Option<&Area> {
        self.areas.get(id)
    }

    pub fn get_mut(&mut self, id: &AreaId) -> Option<&mut Area> {
        self.areas.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &AreaId> {
        self.areas.keys()
    }

    /// Resolve the area owning `label`.
    pub fn route(&mut self, label: &RobotLabel) -> Result<&mut Area, DecideError> {
        let area_id = label
            .area_id()
            .ok_or_else(|| DecideError::InvalidLabel(label.clone()))?;
        let kind = area_id.kind().unwrap_or_default();
        if !Area::KINDS.contains(&kind) {
            return Err(DecideError::UnknownAreaKind {
                kind: kind.to_string(),
                label: label.clone(),
            });
        }
        self.areas
            .get_mut(&area_id)
            .ok_or(DecideError::UnknownArea(area_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_log::SyncLog;
    use crate::types::Vec3;
    use std::sync::Arc;

    #[test]
    fn refuel_plan_follows_inventory() {
        let mut report = RobotReport::new("storage.main.t1", Vec3::ZERO);
        report.fuel_lvl = 900;
        assert_eq!(refuel_plan(&report), RefuelPlan::Skip);

        report.fuel_lvl = 100;
        report.inv_count.free_slots = 0;
        assert_eq!(refuel_plan(&report), RefuelPlan::Skip);

        report.inv_count.grouped.insert(fuel_item(), 0);
        assert_eq!(
            refuel_plan(&report),
            RefuelPlan::Fetch {
                amount: 62,
                held: 0
            }
        );

        report.inv_count.grouped.insert(fuel_item(), 64);
        assert_eq!(refuel_plan(&report), RefuelPlan::Burn(62));
    }

    #[test]
    fn routing_rejects_bad_labels_and_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persister = Persister::new(dir.path(), Arc::new(SyncLog::new()));
        let mut registry = AreaRegistry::new();
        let storage = StorageArea::create(
            &persister,
            AreaId::new("storage.main"),
            Vec3::new(0, 64, 0),
            4,
            4,
            1,
        )
        .expect("create storage");
        registry.insert(Area::Storage(storage));

        assert!(matches!(
            registry.route(&RobotLabel::new("storage.main")),
            Err(DecideError::InvalidLabel(_))
        ));
        assert!(matches!(
            registry.route(&RobotLabel::new("lab.main.t1")),
            Err(DecideError::UnknownAreaKind { .. })
        ));
        assert!(matches!(
            registry.route(&RobotLabel::new("mine.other.t1")),
            Err(DecideError::UnknownArea(_))
        ));
        assert!(registry.route(&RobotLabel::new("storage.main.t1")).is_ok());
    }

    #[test]
    fn registry_loads_known_areas_and_skips_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persister = Persister::new(dir.path(), Arc::new(SyncLog::new()));
        StorageArea::create(
            &persister,
            AreaId::new("storage.main"),
            Vec3::new(0, 64, 0),
            4,
            4,
            2,
        )
        .expect("create storage");
        MineArea::create(&persister, AreaId::new("mine.a"), Vec3::new(100, 12, 0), 30)
            .expect("create mine");
        std::fs::create_dir_all(dir.path().join("web")).expect("stray dir");

        let registry = AreaRegistry::load(&persister).expect("load registry");
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&AreaId::new("mine.a")).is_some());
    }
}
