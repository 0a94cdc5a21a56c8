//! Error types for decisions, persistence, configuration and firmware loading.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{AreaId, RobotLabel};

/// Failure to produce a decision for one report.
#[derive(Debug, Error)]
pub enum DecideError {
    #[error("invalid robot label {0:?}: expected <kind>.<instance>.<name>")]
    InvalidLabel(RobotLabel),
    #[error("unknown area kind {kind:?} for robot {label}")]
    UnknownAreaKind { kind: String, label: RobotLabel },
    #[error("area {0} is not loaded")]
    UnknownArea(AreaId),
    /// Reported state disagrees with a recorded order; the order stays put.
    #[error("robot {label}: {reason}")]
    Reconcile { label: RobotLabel, reason: String },
    /// Nothing applicable for the robot this round.
    #[error("robot {label}: no work available: {reason}")]
    NoWork { label: RobotLabel, reason: String },
    /// Persistent state is inconsistent; processing must stop.
    #[error("invariant violated in area {area}: {reason}")]
    Invariant { area: AreaId, reason: String },
    #[error("work manager stopped")]
    ManagerStopped,
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl DecideError {
    /// Fatal errors stop the work manager.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecideError::Invariant { .. })
    }

    pub(crate) fn reconcile(label: &RobotLabel, reason: impl Into<String>) -> Self {
        DecideError::Reconcile {
            label: label.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn no_work(label: &RobotLabel, reason: impl Into<String>) -> Self {
        DecideError::NoWork {
            label: label.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(area: &AreaId, reason: impl Into<String>) -> Self {
        DecideError::Invariant {
            area: area.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{action} {path} failed: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {path} failed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize {path} failed: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid area snapshot {path}: {reason}")]
    InvalidArea { path: PathBuf, reason: String },
}

impl PersistError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config {path} failed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("read firmware {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("firmware {path} declares no positive `version = N`")]
    MissingVersion { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("server io failed: {0}")]
    Io(#[from] io::Error),
}
