//! Fleet simulator: demo, benchmark and stress runners that drive the work
//! manager with in-process robots.
//!
//! Each robot thread plays the firmware: it reports, takes the decision and
//! executes the job against a shared physical world (box contents, an import
//! chest and an export sink). Queue jobs walk the lanes one cell at a time
//! under [`LaneOccupancy`]. Afterwards the persisted ledger is reloaded and
//! compared with the physical world.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::area::storage::BOX_CAPACITY;
use crate::area::{Area, AreaRegistry, FUEL_PER_ITEM, StorageArea, fuel_item};
use crate::error::DecideError;
use crate::job::{Decision, Job, Task};
use crate::lanes::LaneOccupancy;
use crate::persist::Persister;
use crate::queue::{QueueCoords, QueueStep, QueueTraversal};
use crate::roster::FleetRoster;
use crate::sync_log::SyncLog;
use crate::types::{AreaId, Inventory, ItemId, ReportedJob, RobotLabel, RobotReport, Vec3};
use crate::work_mgr::WorkManager;

// Demo/offline timing knobs (small for quick CLI feedback).
const DEMO_OFFLINE_TIMEOUT_MS: u64 = 200;
const DEMO_OFFLINE_MAX_WAIT_MS: u64 = 600;
// Benchmark offline timing (looser to reduce false positives).
const BENCH_OFFLINE_TIMEOUT_MS: u64 = 500;
const BENCH_OFFLINE_MAX_WAIT_MS: u64 = 1000;
// Polling interval used while waiting for offline detection.
const OFFLINE_POLL_MS: u64 = 50;

const SIM_AREA: &str = "storage.sim";
const INVENTORY_SLOTS: u32 = 16;
const STACK_SIZE: u32 = 64;
/// Lane moves a robot attempts per round before reporting back.
const LANE_STEPS_PER_ROUND: usize = 8;
/// How long a robot already in a lane waits for the next cell to clear.
const LANE_STEP_WAIT: Duration = Duration::from_millis(2);
const START_FUEL: i64 = 3000;
/// Below the refuel threshold, so the first robot fetches coal first.
const LOW_START_FUEL: i64 = 300;

fn iron() -> ItemId {
    ItemId::from("minecraft:iron_ingot/0")
}

fn cobblestone() -> ItemId {
    ItemId::from("minecraft:cobblestone/0")
}

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; getrusage fills it in.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Physical state the robots act on, independent of the area's ledger.
struct World {
    /// Box contents keyed by box position; holes are absent.
    boxes: HashMap<Vec3, (Option<ItemId>, u32)>,
    import_chest: Vec3,
    /// Stacks waiting in the import chest, taken front first.
    import_stock: Vec<(ItemId, u32)>,
    export_sink: Vec3,
    exported: BTreeMap<ItemId, u32>,
}

impl World {
    fn from_area(area: &StorageArea, import_stock: Vec<(ItemId, u32)>) -> Self {
        let boxes = area
            .boxes
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_hole())
            .map(|(id, slot)| {
                let item = if slot.amount > 0 { slot.item.clone() } else { None };
                (area.box_orient(id).box_pos, (item, slot.amount as u32))
            })
            .collect();
        let import = area.import_queue();
        let export = area.export_queue();
        Self {
            boxes,
            import_chest: import.origin + import.face_dir,
            import_stock,
            export_sink: export.origin + export.face_dir,
            exported: BTreeMap::new(),
        }
    }

    fn exported_total(&self) -> u32 {
        self.exported.values().sum()
    }
}

/// Per-cell lane counters; a second robot in a cell is a violation.
struct LaneMetrics {
    cells: Mutex<HashMap<Vec3, usize>>,
    moves: AtomicUsize,
    lane_violation: AtomicBool,
}

impl LaneMetrics {
    fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            moves: AtomicUsize::new(0),
            lane_violation: AtomicBool::new(false),
        }
    }

    fn enter(&self, cell: Vec3) {
        let mut guard = self.cells.lock().expect("lane metrics mutex poisoned");
        let count = guard.entry(cell).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.lane_violation.store(true, Ordering::SeqCst);
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self, cell: Vec3) {
        let mut guard = self.cells.lock().expect("lane metrics mutex poisoned");
        if let Some(count) = guard.get_mut(&cell) {
            debug_assert!(*count > 0, "lane counter underflow");
            *count -= 1;
            if *count == 0 {
                guard.remove(&cell);
            }
        }
    }

    fn moves(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    fn has_violation(&self) -> bool {
        self.lane_violation.load(Ordering::SeqCst)
    }
}

/// Shared handles every robot thread needs.
#[derive(Clone)]
struct Fleet {
    manager: Arc<WorkManager>,
    roster: Arc<FleetRoster>,
    world: Arc<Mutex<World>>,
    lanes: Arc<LaneOccupancy>,
    metrics: Arc<LaneMetrics>,
    work: Duration,
}

/// Firmware stand-in for one robot.
struct SimRobot {
    label: RobotLabel,
    pos: Vec3,
    fuel: i64,
    stacks: BTreeMap<ItemId, u32>,
    job: Option<Job>,
    complete: bool,
    /// Lane cell taken through the queue protocol, if any.
    lane_cell: Option<Vec3>,
}

impl SimRobot {
    fn new(label: RobotLabel, pos: Vec3, fuel: i64) -> Self {
        Self {
            label,
            pos,
            fuel,
            stacks: BTreeMap::new(),
            job: None,
            complete: false,
            lane_cell: None,
        }
    }

    fn used_slots(&self) -> u32 {
        self.stacks.values().map(|n| n.div_ceil(STACK_SIZE)).sum()
    }

    /// Units of `item` that still fit.
    fn room_for(&self, item: &ItemId) -> u32 {
        let free = INVENTORY_SLOTS.saturating_sub(self.used_slots());
        let held = self.stacks.get(item).copied().unwrap_or(0);
        let partial = match held % STACK_SIZE {
            0 => 0,
            rest => STACK_SIZE - rest,
        };
        free * STACK_SIZE + partial
    }

    fn take(&mut self, item: &ItemId, wanted: u32) -> u32 {
        let held = self.stacks.get(item).copied().unwrap_or(0);
        let n = wanted.min(held);
        if n == held {
            self.stacks.remove(item);
        } else {
            self.stacks.insert(item.clone(), held - n);
        }
        n
    }

    fn give(&mut self, item: &ItemId, n: u32) {
        if n > 0 {
            *self.stacks.entry(item.clone()).or_insert(0) += n;
        }
    }

    fn report(&self) -> RobotReport {
        let mut report = RobotReport::new(self.label.as_str(), self.pos);
        report.version = 1;
        report.fuel_lvl = self.fuel;
        report.cur_work = self
            .job
            .as_ref()
            .map(|job| ReportedJob::new(job.id, job.kind().as_str(), self.complete));
        report.inv_count = Inventory {
            free_slots: INVENTORY_SLOTS.saturating_sub(self.used_slots()),
            grouped: self.stacks.clone(),
        };
        report
    }

    fn assign(&mut self, job: Job) {
        self.job = Some(job);
        self.complete = false;
    }

    fn walk_to(&mut self, target: Vec3, fleet: &Fleet) {
        if let Some(cell) = self.lane_cell.take() {
            fleet.metrics.leave(cell);
            fleet.lanes.release_all(&self.label);
        }
        self.fuel -= i64::from(self.pos.l1_dist(target));
        self.pos = target;
    }

    /// Work on the current job for one round.
    fn execute(&mut self, fleet: &Fleet) {
        thread::sleep(fleet.work);
        let Some(job) = self.job.clone() else {
            return;
        };
        if self.complete {
            return;
        }
        self.complete = match &job.task {
            Task::Idle { .. } => true,
            Task::Go { waypoints } => {
                if let Some(last) = waypoints.last() {
                    self.walk_to(*last, fleet);
                }
                true
            }
            // The traversal never looks at the face direction.
            Task::Queue { .. } => match QueueCoords::from_task(&job.task, Vec3::UP) {
                Some(coords) => self.walk_queue(coords, fleet),
                None => true,
            },
            Task::Suck { item, amount, dir } => {
                self.suck(item.as_ref(), *amount, *dir, fleet);
                true
            }
            Task::Drop { items, dir } => {
                self.drop_items(items, *dir, fleet);
                true
            }
            Task::Refuel { item, count } => {
                let burnt = self.take(item, *count);
                self.fuel += i64::from(burnt * FUEL_PER_ITEM);
                true
            }
            Task::Mine { .. } | Task::Construct { .. } | Task::Farm { .. } => {
                warn!(robot = %self.label, kind = job.kind().as_str(), "job not simulated");
                true
            }
        };
        if self.complete && job.id.is_tracked() {
            debug!(robot = %self.label, job = %job.id, "tracked job done");
        }
    }

    /// Advance through the lanes; true once the origin is reached.
    fn walk_queue(&mut self, coords: QueueCoords, fleet: &Fleet) -> bool {
        let mut traversal = QueueTraversal::resume(coords, self.pos);
        for _ in 0..LANE_STEPS_PER_ROUND {
            let step = traversal.step(self.pos, |cell| {
                fleet.lanes.is_blocked_for(cell, &self.label)
            });
            match step {
                QueueStep::Done => return true,
                QueueStep::Wait => thread::sleep(Duration::from_millis(1)),
                QueueStep::Move(next) => {
                    // Walking up to the entry never blocks; lane steps wait briefly.
                    let acquired = match self.lane_cell {
                        None => fleet.lanes.try_acquire(next, &self.label),
                        Some(_) => fleet.lanes.acquire_timeout(next, &self.label, LANE_STEP_WAIT),
                    };
                    if !acquired {
                        traversal = QueueTraversal::resume(coords, self.pos);
                        continue;
                    }
                    fleet.metrics.enter(next);
                    if let Some(cell) = self.lane_cell.replace(next) {
                        fleet.metrics.leave(cell);
                        fleet.lanes.release(cell, &self.label);
                    }
                    self.fuel -= i64::from(self.pos.l1_dist(next));
                    self.pos = next;
                }
            }
        }
        self.pos == coords.origin
    }

    fn suck(&mut self, item: Option<&ItemId>, amount: u32, dir: Vec3, fleet: &Fleet) {
        let target = self.pos + dir;
        let mut world = fleet.world.lock().expect("world mutex poisoned");
        if target == world.import_chest {
            let Some((stack_item, left)) = world.import_stock.first().cloned() else {
                return;
            };
            let n = left.min(STACK_SIZE).min(self.room_for(&stack_item));
            self.give(&stack_item, n);
            if n == left {
                world.import_stock.remove(0);
            } else {
                world.import_stock[0].1 = left - n;
            }
            debug!(robot = %self.label, item = %stack_item, n, "imported");
            return;
        }
        let room = item.map(|item| self.room_for(item)).unwrap_or(0);
        let Some((tag, held)) = world.boxes.get_mut(&target) else {
            warn!(robot = %self.label, pos = %target, "nothing to suck from");
            return;
        };
        let Some(item) = item.filter(|item| tag.as_ref() == Some(*item)) else {
            return;
        };
        let n = amount.min(*held).min(room);
        *held -= n;
        if *held == 0 {
            *tag = None;
        }
        self.give(item, n);
    }

    fn drop_items(&mut self, items: &BTreeMap<ItemId, u32>, dir: Vec3, fleet: &Fleet) {
        let target = self.pos + dir;
        let mut world = fleet.world.lock().expect("world mutex poisoned");
        for (item, count) in items {
            if target == world.export_sink {
                let n = self.take(item, *count);
                *world.exported.entry(item.clone()).or_insert(0) += n;
                continue;
            }
            let Some((tag, held)) = world.boxes.get_mut(&target) else {
                warn!(robot = %self.label, pos = %target, "nothing to drop into");
                return;
            };
            if tag.as_ref().is_some_and(|tag| tag != item) {
                continue;
            }
            let space = (BOX_CAPACITY as u32).saturating_sub(*held);
            let n = self.take(item, (*count).min(space));
            if n > 0 {
                *held += n;
                *tag = Some(item.clone());
            }
        }
    }
}

/// Counters a robot thread hands back when it finishes.
#[derive(Default)]
struct RobotOutcome {
    decisions: usize,
    failures: usize,
}

fn run_robot(
    mut robot: SimRobot,
    rounds: usize,
    silent_after: Option<usize>,
    fleet: &Fleet,
) -> RobotOutcome {
    let mut outcome = RobotOutcome::default();
    for round in 0..rounds {
        let report = robot.report();
        fleet.roster.record(&report);
        outcome.decisions += 1;
        match fleet.manager.decide(report) {
            Ok(Decision::Assign(job)) => robot.assign(job),
            Ok(Decision::Continue) => {}
            Err(DecideError::ManagerStopped) => {
                outcome.failures += 1;
                return outcome;
            }
            Err(err) => {
                debug!(robot = %robot.label, error = %err, "no job this round");
                outcome.failures += 1;
            }
        }
        // Going silent right after a decision leaves the ledger in step with
        // the world: the new job is never executed.
        if silent_after == Some(round) {
            info!(robot = %robot.label, round, "robot stops reporting");
            return outcome;
        }
        robot.execute(fleet);
    }
    // Final report so the last executed job is reconciled.
    let report = robot.report();
    fleet.roster.record(&report);
    outcome.decisions += 1;
    if fleet.manager.decide(report).is_err() {
        outcome.failures += 1;
    }
    outcome
}

fn spawn_offline_watch(
    roster: Arc<FleetRoster>,
    stop_flag: Arc<AtomicBool>,
    timeout: Duration,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("offline-watch".to_string())
        .spawn(move || {
            let mut already_offline = HashSet::new();
            while !stop_flag.load(Ordering::SeqCst) {
                for robot in roster.detect_offline(timeout) {
                    if already_offline.insert(robot.clone()) {
                        let last_pos = roster.last_report(&robot).map(|report| report.cur_pos);
                        info!(robot = %robot, ?last_pos, "offline detected");
                    }
                }
                thread::sleep(Duration::from_millis(OFFLINE_POLL_MS));
            }
        })
}

/// Wait until at least one robot is offline or a max wait is reached.
fn wait_for_offline(roster: &FleetRoster, timeout_ms: u64, max_wait_ms: u64) {
    let max_wait = Duration::from_millis(max_wait_ms);
    let timeout = Duration::from_millis(timeout_ms);
    let start = Instant::now();
    loop {
        if !roster.detect_offline(timeout).is_empty() || start.elapsed() >= max_wait {
            return;
        }
        thread::sleep(Duration::from_millis(OFFLINE_POLL_MS));
    }
}

/// Storage layout and stock the simulated fleet starts from.
fn seed_storage(persister: &Persister) -> Result<StorageArea, SimError> {
    let mut area = StorageArea::new(AreaId::new(SIM_AREA), Vec3::new(0, 64, 0), 4, 4, 2);
    area.boxes[0].amount = 512;
    area.boxes[0].item = Some(fuel_item());
    area.boxes[1].amount = 600;
    area.boxes[1].item = Some(iron());
    area.boxes[9].amount = 300;
    area.boxes[9].item = Some(iron());
    area.store_all(persister)?;
    Ok(area)
}

fn import_stock() -> Vec<(ItemId, u32)> {
    let mut stock = Vec::new();
    for i in 0..24 {
        let item = if i % 3 == 0 { iron() } else { cobblestone() };
        stock.push((item, STACK_SIZE));
    }
    stock
}

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error(transparent)]
    Persist(#[from] crate::error::PersistError),
    #[error(transparent)]
    Decide(#[from] DecideError),
    #[error("simulator io: {0}")]
    Io(#[from] io::Error),
    #[error("thread {0} panicked")]
    Panicked(String),
}

/// Everything one simulated run measured.
struct SimResult {
    robots: usize,
    rounds: usize,
    decisions: usize,
    per_robot_decisions: Vec<usize>,
    failures: usize,
    elapsed_ms: f64,
    decisions_per_s: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    lane_moves: usize,
    /// Cells still taken when the run ends (robots parked at an origin).
    lane_cells_held: usize,
    exported: u32,
    lane_violation: bool,
    ledger_mismatch: bool,
    export_invariant_violation: bool,
    offline: BTreeSet<String>,
}

struct SimParams {
    robots: usize,
    rounds: usize,
    work_ms: u64,
    simulate_offline: bool,
    offline_timeout_ms: u64,
    offline_max_wait_ms: u64,
}

fn simulate(params: &SimParams) -> Result<SimResult, SimError> {
    debug_assert!(params.robots > 0, "robots must be > 0");
    debug_assert!(params.rounds > 0, "rounds must be > 0");
    let scratch = tempfile::tempdir()?;
    let sync = Arc::new(SyncLog::new());
    let persister = Persister::new(scratch.path(), Arc::clone(&sync));
    let area = seed_storage(&persister)?;
    let world = World::from_area(&area, import_stock());

    let mut registry = AreaRegistry::new();
    registry.insert(Area::Storage(area));
    let manager = Arc::new(WorkManager::start(registry, persister.clone())?);
    manager.adjust_export_demand(AreaId::new(SIM_AREA), iron(), 400)?;

    let roster = Arc::new(FleetRoster::new(Arc::clone(&sync)));
    let fleet = Fleet {
        manager: Arc::clone(&manager),
        roster: Arc::clone(&roster),
        world: Arc::new(Mutex::new(world)),
        lanes: Arc::new(LaneOccupancy::new()),
        metrics: Arc::new(LaneMetrics::new()),
        work: Duration::from_millis(params.work_ms),
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let watch = spawn_offline_watch(
        Arc::clone(&roster),
        Arc::clone(&stop_flag),
        Duration::from_millis(params.offline_timeout_ms),
    )?;

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    let mut handles = Vec::with_capacity(params.robots);
    for i in 0..params.robots {
        let label = RobotLabel::new(format!("{SIM_AREA}.t{i}"));
        let fuel = if i == 0 { LOW_START_FUEL } else { START_FUEL };
        let robot = SimRobot::new(label.clone(), Vec3::new(3 + i as i32, 64, 3), fuel);
        // Robot 1 stops reporting halfway to trigger offline detection.
        let silent_after = (params.simulate_offline && params.robots > 1 && i == 1)
            .then_some(params.rounds / 2);
        let fleet = fleet.clone();
        let rounds = params.rounds;
        let handle = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || run_robot(robot, rounds, silent_after, &fleet))?;
        handles.push((label, handle));
    }

    let mut per_robot_decisions = Vec::with_capacity(params.robots);
    let mut failures = 0;
    for (label, handle) in handles {
        let outcome = handle
            .join()
            .map_err(|_| SimError::Panicked(label.to_string()))?;
        per_robot_decisions.push(outcome.decisions);
        failures += outcome.failures;
    }
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    if params.simulate_offline {
        wait_for_offline(&roster, params.offline_timeout_ms, params.offline_max_wait_ms);
    }
    stop_flag.store(true, Ordering::SeqCst);
    watch
        .join()
        .map_err(|_| SimError::Panicked("offline-watch".to_string()))?;
    manager.shutdown();

    let ledger = StorageArea::load(&persister, &AreaId::new(SIM_AREA))?;
    let world = fleet.world.lock().expect("world mutex poisoned");
    let ledger_mismatch = ledger_mismatches(&ledger, &world) > 0;
    let export_invariant_violation = ledger
        .exporting
        .keys()
        .chain(ledger.export_allocs.values().flat_map(|claims| claims.keys()))
        .any(|item| ledger.claimed(item) > ledger.exporting.get(item).copied().unwrap_or(0));

    let decisions: usize = per_robot_decisions.iter().sum();
    let decisions_per_s = if elapsed_ms > 0.0 {
        decisions as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    Ok(SimResult {
        robots: params.robots,
        rounds: params.rounds,
        decisions,
        per_robot_decisions,
        failures,
        elapsed_ms,
        decisions_per_s,
        cpu_user_s,
        cpu_sys_s,
        lane_moves: fleet.metrics.moves(),
        lane_cells_held: fleet.lanes.occupied_cells().len(),
        exported: world.exported_total(),
        lane_violation: fleet.metrics.has_violation(),
        ledger_mismatch,
        export_invariant_violation,
        offline: roster
            .offline_robots()
            .into_iter()
            .map(|label| label.to_string())
            .collect(),
    })
}

/// Boxes whose persisted contents differ from what is physically there.
fn ledger_mismatches(ledger: &StorageArea, world: &World) -> usize {
    let mut mismatches = 0;
    for (id, slot) in ledger.boxes.iter().enumerate() {
        if slot.is_hole() {
            continue;
        }
        let pos = ledger.box_orient(id).box_pos;
        let recorded_item = if slot.amount > 0 { slot.item.clone() } else { None };
        let physical = world.boxes.get(&pos).cloned().unwrap_or((None, 0));
        if physical != (recorded_item, slot.amount as u32) {
            warn!(box_id = id, ?physical, recorded = ?slot, "ledger differs from world");
            mismatches += 1;
        }
    }
    mismatches
}

const CSV_HEADER: &str = "robots,rounds,decisions,elapsed_ms,decisions_per_s,failures,cpu_user_s,cpu_sys_s,lane_moves,exported,lane_violation,ledger_mismatch,export_invariant_violation,offline_robots";

fn print_csv_row(result: &SimResult) {
    let cpu_user = result
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = result
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{},{:.2},{:.2},{},{},{},{},{},{},{},{},{}",
        result.robots,
        result.rounds,
        result.decisions,
        result.elapsed_ms,
        result.decisions_per_s,
        result.failures,
        cpu_user,
        cpu_sys,
        result.lane_moves,
        result.exported,
        result.lane_violation,
        result.ledger_mismatch,
        result.export_invariant_violation,
        result.offline.len()
    );
}

fn report_violations(result: &SimResult) {
    if result.lane_violation {
        eprintln!("# violation,lane_exclusivity");
    }
    if result.ledger_mismatch {
        eprintln!("# violation,ledger_mismatch");
    }
    if result.export_invariant_violation {
        eprintln!("# violation,export_claims_exceed_demand");
    }
}

/// Run the default demo: three robots, one of which goes silent mid-run.
pub fn run_demo() -> bool {
    let params = SimParams {
        robots: 3,
        rounds: 40,
        work_ms: 2,
        simulate_offline: true,
        offline_timeout_ms: DEMO_OFFLINE_TIMEOUT_MS,
        offline_max_wait_ms: DEMO_OFFLINE_MAX_WAIT_MS,
    };
    let result = match simulate(&params) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("demo error: {err}");
            return false;
        }
    };
    println!("DEMO SUMMARY");
    println!("robots={} rounds={}", result.robots, result.rounds);
    println!("decisions_per_robot={:?}", result.per_robot_decisions);
    println!("failed_decisions={}", result.failures);
    println!(
        "lane_moves={} lane_cells_held_at_end={}",
        result.lane_moves, result.lane_cells_held
    );
    println!("exported_items={}", result.exported);
    println!("lane_violation={}", result.lane_violation);
    println!("ledger_mismatch={}", result.ledger_mismatch);
    println!(
        "export_invariant_violation={}",
        result.export_invariant_violation
    );
    println!("offline_robots={:?}", result.offline);
    true
}

/// Run a single benchmark with optional parameter overrides.
pub fn run_benchmark(
    robots: Option<usize>,
    rounds: Option<usize>,
    work_ms: Option<u64>,
    validate: bool,
    simulate_offline: bool,
) -> bool {
    let robots = robots.unwrap_or(4);
    let rounds = rounds.unwrap_or(50);
    let work_ms = work_ms.unwrap_or(1);
    if robots == 0 {
        eprintln!("benchmark error: robots must be > 0");
        return false;
    }
    if rounds == 0 {
        eprintln!("benchmark error: rounds must be > 0");
        return false;
    }
    let params = SimParams {
        robots,
        rounds,
        work_ms,
        simulate_offline,
        offline_timeout_ms: BENCH_OFFLINE_TIMEOUT_MS,
        offline_max_wait_ms: BENCH_OFFLINE_MAX_WAIT_MS,
    };
    let result = match simulate(&params) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("benchmark error: {err}");
            return false;
        }
    };
    println!("{CSV_HEADER}");
    print_csv_row(&result);
    if validate {
        report_violations(&result);
    }
    true
}

/// Sweep multiple benchmark configurations and print CSV output.
pub fn run_stress(
    robot_sets: Option<Vec<usize>>,
    round_sets: Option<Vec<usize>>,
    work_ms: Option<u64>,
    validate: bool,
    simulate_offline: bool,
) -> bool {
    let robot_sets = robot_sets.unwrap_or_else(|| vec![1, 2, 4, 8]);
    let round_sets = round_sets.unwrap_or_else(|| vec![20, 50]);
    let work_ms = work_ms.unwrap_or(1);
    if robot_sets.contains(&0) {
        eprintln!("stress error: robot_sets must be > 0");
        return false;
    }
    if round_sets.contains(&0) {
        eprintln!("stress error: round_sets must be > 0");
        return false;
    }

    println!("{CSV_HEADER}");
    for robots in robot_sets {
        for rounds in round_sets.iter().copied() {
            let params = SimParams {
                robots,
                rounds,
                work_ms,
                simulate_offline,
                offline_timeout_ms: BENCH_OFFLINE_TIMEOUT_MS,
                offline_max_wait_ms: BENCH_OFFLINE_MAX_WAIT_MS,
            };
            match simulate(&params) {
                Ok(result) => {
                    print_csv_row(&result);
                    if validate {
                        report_violations(&result);
                    }
                }
                Err(err) => {
                    eprintln!("stress error: robots={robots} rounds={rounds}: {err}");
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(robots: usize, rounds: usize, simulate_offline: bool) -> SimResult {
        simulate(&SimParams {
            robots,
            rounds,
            work_ms: 0,
            simulate_offline,
            offline_timeout_ms: 100,
            offline_max_wait_ms: 400,
        })
        .expect("simulation")
    }

    #[test]
    fn robot_inventory_tracks_slots_and_room() {
        let mut robot = SimRobot::new(RobotLabel::new("storage.sim.t0"), Vec3::ZERO, 0);
        assert_eq!(robot.room_for(&iron()), INVENTORY_SLOTS * STACK_SIZE);
        robot.give(&iron(), 70);
        assert_eq!(robot.used_slots(), 2);
        assert_eq!(robot.room_for(&iron()), 14 * STACK_SIZE + 58);
        assert_eq!(robot.room_for(&cobblestone()), 14 * STACK_SIZE);
        assert_eq!(robot.take(&iron(), 100), 70);
        assert!(robot.stacks.is_empty());
        assert_eq!(robot.report().inv_count.free_slots, INVENTORY_SLOTS);
    }

    #[test]
    fn lane_metrics_flag_double_occupancy() {
        let metrics = LaneMetrics::new();
        let cell = Vec3::new(1, 2, 3);
        metrics.enter(cell);
        metrics.leave(cell);
        metrics.enter(cell);
        assert!(!metrics.has_violation());
        metrics.enter(cell);
        assert!(metrics.has_violation());
        assert_eq!(metrics.moves(), 3);
    }

    #[test]
    fn fleet_keeps_ledger_and_lanes_consistent() {
        let result = quick(3, 30, false);
        assert!(!result.lane_violation);
        assert!(!result.ledger_mismatch);
        assert!(!result.export_invariant_violation);
        assert_eq!(result.per_robot_decisions, vec![31, 31, 31]);
        assert!(result.exported > 0, "export demand should be served");
    }

    #[test]
    fn silent_robot_is_reported_offline() {
        let result = quick(2, 20, true);
        assert!(result.offline.contains("storage.sim.t1"));
        assert!(!result.ledger_mismatch);
    }
}
