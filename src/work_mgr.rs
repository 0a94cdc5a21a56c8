//! Work manager: a single owner thread holds every area and serializes all
//! decisions and demand changes through a closable mailbox.
//!
//! Callers block on a per-request reply channel. A fatal invariant violation
//! closes the mailbox; queued and later requests fail with `ManagerStopped`.

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::area::{Area, AreaRegistry, DecideCtx};
use crate::error::DecideError;
use crate::job::Decision;
use crate::mailbox::Mailbox;
use crate::persist::Persister;
use crate::types::{AreaId, ItemId, RobotReport};

enum Request {
    Decide {
        report: RobotReport,
        reply: mpsc::Sender<Result<Decision, DecideError>>,
    },
    AdjustExport {
        area: AreaId,
        item: ItemId,
        delta: i64,
        reply: mpsc::Sender<Result<bool, DecideError>>,
    },
    #[cfg(test)]
    Crash,
}

pub struct WorkManager {
    mailbox: Arc<Mailbox<Request>>,
    owner: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkManager {
    /// Spawn the owner thread; it takes the registry for its whole lifetime.
    pub fn start(registry: AreaRegistry, persister: Persister) -> io::Result<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let owner = {
            let mailbox = Arc::clone(&mailbox);
            thread::Builder::new()
                .name("work-manager".to_string())
                .spawn(move || run_owner(registry, &persister, &mailbox))?
        };
        Ok(Self {
            mailbox,
            owner: Mutex::new(Some(owner)),
        })
    }

    /// Decide the next job for the robot that sent `report`.
    pub fn decide(&self, report: RobotReport) -> Result<Decision, DecideError> {
        let (reply, response) = mpsc::channel();
        self.mailbox
            .push(Request::Decide { report, reply })
            .map_err(|_| DecideError::ManagerStopped)?;
        response.recv().map_err(|_| DecideError::ManagerStopped)?
    }

    /// Adjust export demand on a storage area. `Ok(false)` when `area` is not
    /// a known storage area.
    pub fn adjust_export_demand(
        &self,
        area: AreaId,
        item: ItemId,
        delta: i64,
    ) -> Result<bool, DecideError> {
        let (reply, response) = mpsc::channel();
        self.mailbox
            .push(Request::AdjustExport {
                area,
                item,
                delta,
                reply,
            })
            .map_err(|_| DecideError::ManagerStopped)?;
        response.recv().map_err(|_| DecideError::ManagerStopped)?
    }

    pub fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Close the mailbox, let queued requests finish and join the owner.
    pub fn shutdown(&self) {
        self.mailbox.close();
        let handle = self
            .owner
            .lock()
            .expect("work manager mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("work manager thread panicked");
            }
        }
    }
}

impl Drop for WorkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Closes the mailbox when the owner exits, including by panic, so no caller
/// waits on a reply that will never come.
struct StopOnExit<'a>(&'a Mailbox<Request>);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let dropped = self.0.close_and_drain().len();
            error!(dropped, "work manager panicked");
        } else {
            self.0.close_and_drain();
        }
    }
}

fn run_owner(mut registry: AreaRegistry, persister: &Persister, mailbox: &Mailbox<Request>) {
    let _stop = StopOnExit(mailbox);
    info!(areas = registry.len(), "work manager started");
    while let Some(request) = mailbox.pop_blocking_or_closed() {
        let fatal = match request {
            Request::Decide { report, reply } => {
                let result = decide_one(&mut registry, persister, &report);
                let fatal = result.as_ref().is_err_and(DecideError::is_fatal);
                // The caller may have given up waiting.
                let _ = reply.send(result);
                fatal
            }
            Request::AdjustExport {
                area,
                item,
                delta,
                reply,
            } => {
                let result = adjust_one(&mut registry, persister, &area, &item, delta);
                let fatal = result.as_ref().is_err_and(DecideError::is_fatal);
                let _ = reply.send(result);
                fatal
            }
            #[cfg(test)]
            Request::Crash => panic!("work manager crash requested"),
        };
        if fatal {
            let dropped = mailbox.close_and_drain().len();
            error!(dropped, "work manager stopped after invariant violation");
            return;
        }
    }
    info!("work manager stopped");
}

fn decide_one(
    registry: &mut AreaRegistry,
    persister: &Persister,
    report: &RobotReport,
) -> Result<Decision, DecideError> {
    let ctx = DecideCtx {
        persister,
        now: Utc::now(),
    };
    let result = registry
        .route(&report.label)
        .and_then(|area| area.decide(report, &ctx));
    match &result {
        Ok(decision) => {
            debug!(robot = %report.label, job = ?decision.job().map(|job| job.id), "decided");
        }
        Err(err) if err.is_fatal() => error!(robot = %report.label, error = %err, "decision failed"),
        Err(err) => warn!(robot = %report.label, error = %err, "no decision this tick"),
    }
    result
}

fn adjust_one(
    registry: &mut AreaRegistry,
    persister: &Persister,
    area: &AreaId,
    item: &ItemId,
    delta: i64,
) -> Result<bool, DecideError> {
    match registry.get_mut(area) {
        Some(Area::Storage(storage)) => {
            storage.adjust_export_demand(item, delta, persister)?;
            Ok(true)
        }
        _ => {
            warn!(area = %area, item = %item, "export demand for unknown storage area ignored");
            Ok(false)
        }
    }
}
