//! Area snapshot files: atomic JSON writes mirrored into the sync log.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistError;
use crate::sync_log::SyncLog;
use crate::types::AreaId;

/// Area-wide record file name.
pub const DETAILS_FILE: &str = "details";

/// Writes area files under `<root>/<area>/` and mirrors them as `<area>/<file>`.
#[derive(Clone)]
pub struct Persister {
    root: PathBuf,
    sync: Arc<SyncLog>,
}

impl Persister {
    pub fn new(root: impl Into<PathBuf>, sync: Arc<SyncLog>) -> Self {
        Self {
            root: root.into(),
            sync,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sync_log(&self) -> &Arc<SyncLog> {
        &self.sync
    }

    pub fn area_dir(&self, area: &AreaId) -> PathBuf {
        self.root.join(area.as_str())
    }

    /// Replace `<area>/<file>` with `value` via temp file and rename.
    pub fn write<T: Serialize + ?Sized>(
        &self,
        area: &AreaId,
        file: &str,
        value: &T,
    ) -> Result<(), PersistError> {
        let path = self.area_dir(area).join(file);
        let text = encode(&path, value)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| PersistError::io("create dir", parent, err))?;
        }
        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, text.as_bytes())
            .map_err(|err| PersistError::io("write temp", &temp_path, err))?;
        fs::rename(&temp_path, &path).map_err(|err| PersistError::io("rename", &path, err))?;
        self.sync.notify(&sync_key(area, file), text);
        Ok(())
    }

    /// Create `<area>/<file>` only if it does not exist yet. The content is
    /// written to a temp file first, so the final file is never partial.
    /// Returns false, leaving the file untouched, when it already exists.
    pub fn write_once<T: Serialize + ?Sized>(
        &self,
        area: &AreaId,
        file: &str,
        value: &T,
    ) -> Result<bool, PersistError> {
        let path = self.area_dir(area).join(file);
        let text = encode(&path, value)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| PersistError::io("create dir", parent, err))?;
        }
        if path.exists() {
            return Ok(false);
        }
        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, text.as_bytes())
            .map_err(|err| PersistError::io("write temp", &temp_path, err))?;
        // hard_link fails on an existing target, so a complete file is never replaced.
        let linked = fs::hard_link(&temp_path, &path);
        fs::remove_file(&temp_path)
            .map_err(|err| PersistError::io("remove temp", &temp_path, err))?;
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(PersistError::io("link", &path, err)),
        }
        self.sync.notify(&sync_key(area, file), text);
        Ok(true)
    }

    /// Read `<area>/<file>`; a missing file is `None`.
    pub fn read<T: DeserializeOwned>(
        &self,
        area: &AreaId,
        file: &str,
    ) -> Result<Option<T>, PersistError> {
        let path = self.area_dir(area).join(file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PersistError::io("read", &path, err)),
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|source| PersistError::Parse { path, source })?;
        Ok(Some(value))
    }

    /// File names directly inside the area directory.
    pub fn list(&self, area: &AreaId) -> Result<Vec<String>, PersistError> {
        let dir = self.area_dir(area);
        let entries = fs::read_dir(&dir).map_err(|err| PersistError::io("list", &dir, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PersistError::io("list", &dir, err))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Area ids found as directories under the state root.
    pub fn area_ids(&self) -> Result<Vec<AreaId>, PersistError> {
        let entries =
            fs::read_dir(&self.root).map_err(|err| PersistError::io("list", &self.root, err))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PersistError::io("list", &self.root, err))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| PersistError::io("stat", entry.path(), err))?
                .is_dir();
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                ids.push(AreaId::new(name));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn encode<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<String, PersistError> {
    serde_json::to_string(value).map_err(|source| PersistError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_key(area: &AreaId, file: &str) -> String {
    format!("{area}/{file}")
}
