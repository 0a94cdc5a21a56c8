//! Shared identifiers, coordinates and the inbound robot report model.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Integer block coordinate; serialized as `[x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vec3(pub i32, pub i32, pub i32);

impl Vec3 {
    pub const ZERO: Vec3 = Vec3(0, 0, 0);
    pub const UP: Vec3 = Vec3(0, 1, 0);
    pub const DOWN: Vec3 = Vec3(0, -1, 0);

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self(x, y, z)
    }

    pub fn x(self) -> i32 {
        self.0
    }

    pub fn y(self) -> i32 {
        self.1
    }

    pub fn z(self) -> i32 {
        self.2
    }

    /// Manhattan distance.
    pub fn l1_dist(self, other: Vec3) -> i32 {
        (self.0 - other.0).abs() + (self.1 - other.1).abs() + (self.2 - other.2).abs()
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Vec3::ZERO
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3(self.0 + rhs.0, self.1 + rhs.1, self.2 + rhs.2)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3(self.0 - rhs.0, self.1 - rhs.1, self.2 - rhs.2)
    }
}

impl Mul<i32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: i32) -> Vec3 {
        Vec3(self.0 * rhs, self.1 * rhs, self.2 * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Vec3 {
        Vec3(-self.0, -self.1, -self.2)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0, self.1, self.2)
    }
}

/// Work identifier, namespaced per area.
///
/// Positive ids are handed out from the area's sequence. Negative ids are
/// sentinels that the engine never tracks as allocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub i64);

impl WorkId {
    /// No work assigned.
    pub const NONE: WorkId = WorkId(0);
    /// Fire-and-forget step that needs no tracking (e.g. go to a coordinate).
    pub const TRANSIENT: WorkId = WorkId(-1);
    /// Low priority: waiting in the import queue.
    pub const IMPORT_QUEUE: WorkId = WorkId(-2);
    /// Low priority: generic intake suck at the import point.
    pub const IMPORT_SUCK: WorkId = WorkId(-3);

    /// Low priority work is re-decided on every report, complete or not.
    pub fn is_low_priority(self) -> bool {
        self == Self::IMPORT_QUEUE || self == Self::IMPORT_SUCK
    }

    pub fn is_tracked(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item identity as reported by firmware, e.g. `minecraft:coal/0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Area identifier of the form `<kind>.<instance>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaId(pub String);

impl AreaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading segment naming the area variant, if the id is well formed.
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.0.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(instance), None) if !kind.is_empty() && !instance.is_empty() => {
                Some(kind)
            }
            _ => None,
        }
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Robot label of the form `<kind>.<instance>.<name>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RobotLabel(pub String);

impl RobotLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning area: the first two of exactly three dot-separated segments.
    pub fn area_id(&self) -> Option<AreaId> {
        let parts: Vec<&str> = self.0.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|part| part.is_empty()) {
            return None;
        }
        Some(AreaId(format!("{}.{}", parts[0], parts[1])))
    }
}

impl fmt::Display for RobotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A robot's last-known task as reported by firmware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedJob {
    #[serde(alias = "ID")]
    pub id: WorkId,
    #[serde(rename = "type", alias = "Type", default)]
    pub kind: String,
    #[serde(alias = "Complete", default)]
    pub complete: bool,
}

impl ReportedJob {
    pub fn new(id: WorkId, kind: impl Into<String>, complete: bool) -> Self {
        Self {
            id,
            kind: kind.into(),
            complete,
        }
    }
}

/// Reported inventory: free slot count plus item counts grouped by identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub free_slots: u32,
    #[serde(alias = "Grouped", default)]
    pub grouped: BTreeMap<ItemId, u32>,
}

impl Inventory {
    pub fn count(&self, item: &ItemId) -> u32 {
        self.grouped.get(item).copied().unwrap_or(0)
    }

    /// Items actually held; zero-count entries only mark a reserved stack.
    pub fn held(&self) -> impl Iterator<Item = (&ItemId, u32)> {
        self.grouped
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(item, count)| (item, *count))
    }

    pub fn is_empty(&self) -> bool {
        self.held().next().is_none()
    }

    /// True when the robot can take in `item`: a free slot or an existing stack.
    pub fn can_accept(&self, item: &ItemId) -> bool {
        self.free_slots > 0 || self.grouped.contains_key(item)
    }
}

/// Inbound robot report. Unknown fields (navigation internals) are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotReport {
    #[serde(alias = "Version", default)]
    pub version: u32,
    #[serde(alias = "Label")]
    pub label: RobotLabel,
    #[serde(default)]
    pub new_kernel: bool,
    #[serde(default)]
    pub cur_action: String,
    #[serde(default)]
    pub cur_pos: Vec3,
    #[serde(default)]
    pub cur_rot: Vec3,
    #[serde(default)]
    pub cur_work: Option<ReportedJob>,
    #[serde(default)]
    pub fuel_lvl: i64,
    #[serde(default)]
    pub inv_count: Inventory,
    #[serde(default)]
    pub fatal_err: Option<String>,
    #[serde(default)]
    pub refuel_err: Option<String>,
    #[serde(default)]
    pub work_err: Option<String>,
}

impl RobotReport {
    pub fn new(label: impl Into<String>, pos: Vec3) -> Self {
        Self {
            label: RobotLabel::new(label),
            cur_pos: pos,
            ..Self::default()
        }
    }

    /// Whether the robot is still busy with work that must not be interrupted.
    pub fn is_busy(&self) -> bool {
        match &self.cur_work {
            Some(job) => !job.id.is_low_priority() && !job.complete,
            None => false,
        }
    }

    pub fn current_job_id(&self) -> Option<WorkId> {
        self.cur_work.as_ref().map(|job| job.id)
    }
}
