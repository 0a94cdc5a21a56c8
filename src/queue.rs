//! Queue coordinate protocol for single-file access to a contested point.
//!
//! A queue is anchored at its `origin` (where the resource is used). The
//! q-lane starts one step from the origin (`q0 = origin + o_q0_dir`) and runs
//! along `q_dir`; a parallel t-lane sits `q0_t0_dir` beside it. Robots enter
//! the t-lane at its far end, merge into the q-lane, shuffle towards the head
//! one slot at a time and finally step into the origin.

use serde::{Deserialize, Serialize};

use crate::job::{Job, Task};
use crate::types::{Vec3, WorkId};

/// Number of slots in each lane.
pub const LANE_LEN: i32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCoords {
    /// Direction to face when acting at the origin.
    pub face_dir: Vec3,
    pub origin: Vec3,
    pub q_dir: Vec3,
    pub o_q0_dir: Vec3,
    pub q0_t0_dir: Vec3,
}

impl QueueCoords {
    pub fn q_slot(&self, k: i32) -> Vec3 {
        self.origin + self.o_q0_dir + self.q_dir * k
    }

    pub fn t_slot(&self, k: i32) -> Vec3 {
        self.q_slot(k) + self.q0_t0_dir
    }

    /// Where robots join: the far end of the t-lane.
    pub fn entry(&self) -> Vec3 {
        self.t_slot(LANE_LEN - 1)
    }

    fn q_index(&self, pos: Vec3) -> Option<i32> {
        (0..LANE_LEN).find(|&k| self.q_slot(k) == pos)
    }

    fn t_index(&self, pos: Vec3) -> Option<i32> {
        (0..LANE_LEN).find(|&k| self.t_slot(k) == pos)
    }

    pub fn job(&self, id: WorkId) -> Job {
        Job::new(
            id,
            Task::Queue {
                origin: self.origin,
                q_dir: self.q_dir,
                o_q0_dir: self.o_q0_dir,
                q0_t0_dir: self.q0_t0_dir,
            },
        )
    }

    /// Recover coordinates from a queue job (the face direction is not sent).
    pub fn from_task(task: &Task, face_dir: Vec3) -> Option<Self> {
        match task {
            Task::Queue {
                origin,
                q_dir,
                o_q0_dir,
                q0_t0_dir,
            } => Some(Self {
                face_dir,
                origin: *origin,
                q_dir: *q_dir,
                o_q0_dir: *o_q0_dir,
                q0_t0_dir: *q0_t0_dir,
            }),
            _ => None,
        }
    }
}

/// Traversal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Walking to the t-lane entry point.
    Approach,
    /// In the t-lane, looking for a gap in the q-lane.
    Merge,
    /// In the q-lane, advancing towards the head.
    Advance,
    /// At the head, stepping into the origin.
    Enter,
    Done,
}

/// Single step decided by the traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStep {
    /// Move to this position (a walk in `Approach`, one block otherwise).
    Move(Vec3),
    /// Next slot is taken; report and try again later.
    Wait,
    Done,
}

#[derive(Clone, Copy, Debug)]
pub struct QueueTraversal {
    coords: QueueCoords,
    state: QueueState,
}

impl QueueTraversal {
    /// Resume from wherever the robot currently stands.
    pub fn resume(coords: QueueCoords, pos: Vec3) -> Self {
        let state = if pos == coords.origin {
            QueueState::Done
        } else if coords.q_index(pos) == Some(0) {
            QueueState::Enter
        } else if coords.q_index(pos).is_some() {
            QueueState::Advance
        } else if coords.t_index(pos).is_some() {
            QueueState::Merge
        } else {
            QueueState::Approach
        };
        Self { coords, state }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Decide the next move from `pos`; `occupied` reports contested slots.
    pub fn step(&mut self, pos: Vec3, occupied: impl Fn(Vec3) -> bool) -> QueueStep {
        let c = self.coords;
        loop {
            match self.state {
                QueueState::Approach => {
                    if pos == c.entry() {
                        self.state = QueueState::Merge;
                        continue;
                    }
                    if occupied(c.entry()) {
                        return QueueStep::Wait;
                    }
                    return QueueStep::Move(c.entry());
                }
                QueueState::Merge => {
                    let Some(k) = c.t_index(pos) else {
                        self.state = QueueState::Approach;
                        continue;
                    };
                    if !occupied(c.q_slot(k)) {
                        self.state = if k == 0 {
                            QueueState::Enter
                        } else {
                            QueueState::Advance
                        };
                        return QueueStep::Move(c.q_slot(k));
                    }
                    if k > 0 && !occupied(c.t_slot(k - 1)) {
                        return QueueStep::Move(c.t_slot(k - 1));
                    }
                    return QueueStep::Wait;
                }
                QueueState::Advance => {
                    let Some(k) = c.q_index(pos) else {
                        self.state = QueueState::Approach;
                        continue;
                    };
                    if k == 0 {
                        self.state = QueueState::Enter;
                        continue;
                    }
                    if occupied(c.q_slot(k - 1)) {
                        return QueueStep::Wait;
                    }
                    if k == 1 {
                        self.state = QueueState::Enter;
                    }
                    return QueueStep::Move(c.q_slot(k - 1));
                }
                QueueState::Enter => {
                    if pos == c.origin {
                        self.state = QueueState::Done;
                        continue;
                    }
                    if occupied(c.origin) {
                        return QueueStep::Wait;
                    }
                    self.state = QueueState::Done;
                    return QueueStep::Move(c.origin);
                }
                QueueState::Done => return QueueStep::Done,
            }
        }
    }
}
