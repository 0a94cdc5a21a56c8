//! Job descriptors: the closed instruction vocabulary emitted to firmware.
//!
//! Firmware receives jobs as Lua table text (`new_job = { ... },`) spliced into
//! the report response, so rendering lives here next to the model.

use std::collections::BTreeMap;

use crate::types::{ItemId, Vec3, WorkId};

/// Job type tag as firmware names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Idle,
    Go,
    Suck,
    Drop,
    Refuel,
    Queue,
    Mine,
    Construct,
    Farm,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Idle => "idle",
            JobKind::Go => "go",
            JobKind::Suck => "suck",
            JobKind::Drop => "drop",
            JobKind::Refuel => "refuel",
            JobKind::Queue => "queue",
            JobKind::Mine => "mine",
            JobKind::Construct => "construct",
            JobKind::Farm => "farm",
        }
    }
}

/// Instructions for one job. Waypoint lists are in visiting order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    Idle {
        seconds: u32,
    },
    Go {
        waypoints: Vec<Vec3>,
    },
    /// `item: None` takes whatever the container offers.
    Suck {
        item: Option<ItemId>,
        amount: u32,
        dir: Vec3,
    },
    Drop {
        items: BTreeMap<ItemId, u32>,
        dir: Vec3,
    },
    Refuel {
        item: ItemId,
        count: u32,
    },
    Queue {
        origin: Vec3,
        q_dir: Vec3,
        o_q0_dir: Vec3,
        q0_t0_dir: Vec3,
    },
    /// `dynamic` scans for and clears interesting blocks along the way;
    /// `clear` waits for falling blocks to settle after each step.
    Mine {
        waypoints: Vec<Vec3>,
        extra_dirs: Vec<Vec3>,
        dynamic: bool,
        clear: bool,
    },
    /// Places `item` towards `dir` before starting and after each step.
    Construct {
        item: ItemId,
        waypoints: Vec<Vec3>,
        dir: Vec3,
    },
    Farm {
        waypoints: Vec<Vec3>,
        seeds: Vec<ItemId>,
        col_mod: u32,
    },
}

/// A job descriptor: work id plus instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: WorkId,
    pub task: Task,
}

impl Job {
    pub fn new(id: WorkId, task: Task) -> Self {
        Self { id, task }
    }

    pub fn idle(id: WorkId, seconds: u32) -> Self {
        Self::new(id, Task::Idle { seconds })
    }

    pub fn go(id: WorkId, waypoints: Vec<Vec3>) -> Self {
        Self::new(id, Task::Go { waypoints })
    }

    /// Transient single-target walk, the most common intermediary step.
    pub fn go_to(target: Vec3) -> Self {
        Self::go(WorkId::TRANSIENT, vec![target])
    }

    pub fn suck(id: WorkId, item: Option<ItemId>, amount: u32, dir: Vec3) -> Self {
        Self::new(id, Task::Suck { item, amount, dir })
    }

    pub fn drop(id: WorkId, items: BTreeMap<ItemId, u32>, dir: Vec3) -> Self {
        Self::new(id, Task::Drop { items, dir })
    }

    pub fn refuel(id: WorkId, item: ItemId, count: u32) -> Self {
        Self::new(id, Task::Refuel { item, count })
    }

    pub fn mine(
        id: WorkId,
        waypoints: Vec<Vec3>,
        extra_dirs: Vec<Vec3>,
        dynamic: bool,
        clear: bool,
    ) -> Self {
        Self::new(
            id,
            Task::Mine {
                waypoints,
                extra_dirs,
                dynamic,
                clear,
            },
        )
    }

    pub fn construct(id: WorkId, item: ItemId, waypoints: Vec<Vec3>, dir: Vec3) -> Self {
        Self::new(
            id,
            Task::Construct {
                item,
                waypoints,
                dir,
            },
        )
    }

    pub fn farm(id: WorkId, waypoints: Vec<Vec3>, seeds: Vec<ItemId>, col_mod: u32) -> Self {
        Self::new(
            id,
            Task::Farm {
                waypoints,
                seeds,
                col_mod,
            },
        )
    }

    pub fn kind(&self) -> JobKind {
        match &self.task {
            Task::Idle { .. } => JobKind::Idle,
            Task::Go { .. } => JobKind::Go,
            Task::Suck { .. } => JobKind::Suck,
            Task::Drop { .. } => JobKind::Drop,
            Task::Refuel { .. } => JobKind::Refuel,
            Task::Queue { .. } => JobKind::Queue,
            Task::Mine { .. } => JobKind::Mine,
            Task::Construct { .. } => JobKind::Construct,
            Task::Farm { .. } => JobKind::Farm,
        }
    }

    /// Instruction fields in the order firmware expects them.
    fn instructions(&self) -> Vec<(&'static str, String)> {
        match &self.task {
            Task::Idle { seconds } => vec![("time", seconds.to_string())],
            Task::Go { waypoints } => {
                vec![("waypoint_stack", format!("{{{}}}", lua_stack(waypoints)))]
            }
            Task::Suck { item, amount, dir } => {
                let item = item
                    .as_ref()
                    .map(|item| lua_quote(item.as_str()))
                    .unwrap_or_else(|| "nil".to_string());
                vec![
                    ("item_id", item),
                    ("amount", amount.to_string()),
                    ("dir", lua_vec(*dir)),
                ]
            }
            Task::Drop { items, dir } => {
                let items: String = items
                    .iter()
                    .map(|(item, count)| format!("[{}] = {count},", lua_quote(item.as_str())))
                    .collect();
                vec![("items", format!("{{{items}}}")), ("dir", lua_vec(*dir))]
            }
            Task::Refuel { item, count } => vec![
                ("item", lua_quote(item.as_str())),
                ("count", count.to_string()),
            ],
            Task::Queue {
                origin,
                q_dir,
                o_q0_dir,
                q0_t0_dir,
            } => vec![
                ("origin", lua_vec(*origin)),
                ("q_dir", lua_vec(*q_dir)),
                ("o_q0_dir", lua_vec(*o_q0_dir)),
                ("q0_t0_dir", lua_vec(*q0_t0_dir)),
            ],
            Task::Mine {
                waypoints,
                extra_dirs,
                dynamic,
                clear,
            } => vec![
                ("waypoint_stack", format!("{{{}}}", lua_stack(waypoints))),
                ("extra_dirs", format!("{{{}}}", lua_list(extra_dirs))),
                ("dynamic", dynamic.to_string()),
                ("clear", clear.to_string()),
            ],
            Task::Construct {
                item,
                waypoints,
                dir,
            } => vec![
                ("item", lua_quote(item.as_str())),
                ("waypoint_stack", format!("{{{}}}", lua_stack(waypoints))),
                ("dir", lua_vec(*dir)),
            ],
            Task::Farm {
                waypoints,
                seeds,
                col_mod,
            } => {
                let seeds: String = seeds
                    .iter()
                    .map(|seed| format!("{},", lua_quote(seed.as_str())))
                    .collect();
                vec![
                    ("waypoint_stack", format!("{{{}}}", lua_stack(waypoints))),
                    ("seeds", format!("{{{seeds}}}")),
                    ("col_mod", col_mod.to_string()),
                ]
            }
        }
    }

    /// Render as the firmware's `new_job` table entry.
    pub fn to_lua(&self) -> String {
        let body: String = self
            .instructions()
            .into_iter()
            .map(|(key, value)| format!("        {key} = {value},\n"))
            .collect();
        format!(
            "new_job = {{\n    id = {},\n    type = \"{}\",\n    instructions = {{\n{body}    }},\n}},\n",
            self.id,
            self.kind().as_str(),
        )
    }
}

/// Outcome of one decision round for a reporting robot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// A new or re-issued job.
    Assign(Job),
    /// Keep executing the current job.
    Continue,
}

impl Decision {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Decision::Assign(job) => Some(job),
            Decision::Continue => None,
        }
    }

    /// Response fragment; empty when the robot should carry on.
    pub fn to_lua(&self) -> String {
        match self {
            Decision::Assign(job) => job.to_lua(),
            Decision::Continue => String::new(),
        }
    }
}

fn lua_vec(v: Vec3) -> String {
    format!("{{{}, {}, {}}}", v.0, v.1, v.2)
}

fn lua_list(vecs: &[Vec3]) -> String {
    vecs.iter().map(|v| format!("{},", lua_vec(*v))).collect()
}

/// Waypoints are popped from the end of the stack, so the first target goes last.
fn lua_stack(vecs: &[Vec3]) -> String {
    vecs.iter().rev().map(|v| format!("{},", lua_vec(*v))).collect()
}

/// Quote a string as a Lua literal.
pub fn lua_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for ch in raw.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\{:03}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
