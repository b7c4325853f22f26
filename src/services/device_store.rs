//! Persistence of the selected device set
//!
//! The store is fail-open: a missing, empty or corrupt file reads as an empty
//! set, and failed writes are logged. Callers never see persistence errors.

use crate::types::DeviceSet;
use anyhow::{Context, Result};
use log::{debug, error, info};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// JSON file backed store of the selected devices
#[derive(Clone, Debug)]
pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved device set
    ///
    /// # Returns
    /// The saved devices in save order, or an empty set if the file is
    /// absent, empty or cannot be parsed
    pub fn load(&self) -> DeviceSet {
        match Self::read(&self.path) {
            Ok(devices) => devices,
            Err(e) => {
                error!("failed to load devices from {:?}: {e:#}", self.path);
                DeviceSet::new()
            }
        }
    }

    /// Replace the saved device set
    ///
    /// Writes to a temporary sibling file first and renames it over the
    /// target, so concurrent readers see either the old or the new set.
    ///
    /// # Returns
    /// true if the set was written, false if writing failed (the cause is logged)
    pub fn save(&self, devices: &DeviceSet) -> bool {
        match Self::write_atomically(&self.path, devices) {
            Ok(()) => {
                info!("saved {} devices to {:?}", devices.len(), self.path);
                true
            }
            Err(e) => {
                error!("failed to save devices to {:?}: {e:#}", self.path);
                false
            }
        }
    }

    fn read(path: &Path) -> Result<DeviceSet> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no device file at {path:?}");
                return Ok(DeviceSet::new());
            }
            Err(e) => return Err(e).context(format!("failed to read {path:?}")),
        };

        if contents.trim().is_empty() {
            return Ok(DeviceSet::new());
        }

        serde_json::from_str(&contents).context(format!("failed to parse {path:?}"))
    }

    fn write_atomically(path: &Path, devices: &DeviceSet) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!("failed to create {parent:?}"))?;
        }

        let json = serde_json::to_string_pretty(devices).context("failed to serialize devices")?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        fs::write(&tmp_path, json).context(format!("failed to write {tmp_path:?}"))?;

        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).context(format!("failed to rename {tmp_path:?} to {path:?}"));
        }

        Ok(())
    }
}
