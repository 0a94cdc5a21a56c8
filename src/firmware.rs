//! Firmware catalog: the current robot firmware source and its version.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FirmwareError;
use crate::job::lua_quote;

#[derive(Clone, Debug)]
pub struct FirmwareCatalog {
    source: String,
    version: u32,
}

impl FirmwareCatalog {
    pub fn load(path: &Path) -> Result<Self, FirmwareError> {
        let source = fs::read_to_string(path).map_err(|source| FirmwareError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_source(source, path)
    }

    /// `origin` only names the source in errors.
    pub fn from_source(source: String, origin: impl Into<PathBuf>) -> Result<Self, FirmwareError> {
        let version = declared_version(&source).ok_or_else(|| FirmwareError::MissingVersion {
            path: origin.into(),
        })?;
        Ok(Self { source, version })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Upgrade fragment for a robot on `reported` firmware, unless it is
    /// current or already carries the new firmware.
    pub fn upgrade_for(&self, reported: u32, has_new_kernel: bool) -> Option<String> {
        if reported >= self.version || has_new_kernel {
            return None;
        }
        Some(format!("new_kernel = {},", lua_quote(&self.source)))
    }
}

/// First top-level `version = N` assignment with a positive `N`.
fn declared_version(source: &str) -> Option<u32> {
    source.lines().find_map(|line| {
        let line = line.trim();
        let line = line.strip_prefix("local ").unwrap_or(line);
        let (name, value) = line.split_once('=')?;
        if name.trim() != "version" {
            return None;
        }
        let value = value.trim().trim_end_matches(';');
        value.parse::<u32>().ok().filter(|v| *v > 0)
    })
}
