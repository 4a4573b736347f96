/*
 * Copyright (C) 2025 The PMEM-CSI Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::pmem_csi::logger::log_warn;
use crate::pmem_csi::util::error::{new_error, with_context, DynError};
use crate::pmem_csi::volume::VolumeRecord;

const COMPONENT: &str = "state";
const LOCK_FILE_NAME: &str = ".lock";
const RECORD_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// Durable `{volume id → record}` map, one JSON file per volume.
///
/// Writes go through a temp file that is fsynced and renamed into place, so
/// a crash at any point leaves either the old or the new record, never a
/// torn one. An exclusive advisory lock on the directory keeps a second
/// driver process from sharing the state.
pub struct FileState {
    base: PathBuf,
    _lock: File,
}

impl FileState {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, DynError> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|err| {
            with_context(
                err,
                format!("Failed to create state directory {}", base.display()),
            )
        })?;

        let lock_path = base.join(LOCK_FILE_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                with_context(
                    err,
                    format!("Failed to open state lock {}", lock_path.display()),
                )
            })?;
        lock.try_lock_exclusive().map_err(|err| {
            with_context(
                err,
                format!(
                    "State directory {} is locked by another driver process",
                    base.display()
                ),
            )
        })?;

        let state = Self { base, _lock: lock };
        state.sweep_temp_files();
        Ok(state)
    }

    /// Leftovers of writes that were interrupted before the rename. The
    /// rename is the commit point, so these are safe to drop.
    fn sweep_temp_files(&self) {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) {
                if let Err(err) = fs::remove_file(entry.path()) {
                    log_warn(
                        COMPONENT,
                        "Failed to remove stale temp file",
                        &[("file", &name.to_string()), ("error", &err.to_string())],
                    );
                }
            }
        }
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, DynError> {
        if id.is_empty() || id.contains('/') || id.starts_with('.') {
            return Err(new_error(format!("invalid volume id '{}'", id)));
        }
        Ok(self.base.join(format!("{}{}", id, RECORD_SUFFIX)))
    }

    /// Store (or overwrite) the record for `id`. The record is durable
    /// when this returns: file contents and the directory entry are both
    /// synced.
    pub fn create(&self, id: &str, record: &VolumeRecord) -> Result<(), DynError> {
        let final_path = self.record_path(id)?;
        let temp_path = self.base.join(format!("{}{}", id, TEMP_SUFFIX));

        let payload = serde_json::to_vec(record)
            .map_err(|err| with_context(err, format!("Failed to serialize volume {}", id)))?;

        let mut temp = File::create(&temp_path).map_err(|err| {
            with_context(
                err,
                format!("Failed to create temp file {}", temp_path.display()),
            )
        })?;
        let written = temp
            .write_all(&payload)
            .and_then(|_| temp.sync_all())
            .map_err(|err| {
                with_context(
                    err,
                    format!("Failed to write temp file {}", temp_path.display()),
                )
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        drop(temp);

        if let Err(err) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(with_context(
                err,
                format!("Failed to commit record {}", final_path.display()),
            ));
        }

        self.sync_dir()
    }

    pub fn get(&self, id: &str) -> Result<VolumeRecord, DynError> {
        let path = self.record_path(id)?;
        let data = fs::read(&path)
            .map_err(|err| with_context(err, format!("Failed to read record for {}", id)))?;
        serde_json::from_slice(&data)
            .map_err(|err| with_context(err, format!("Failed to decode record for {}", id)))
    }

    pub fn get_all(&self) -> Result<Vec<String>, DynError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.base)
            .map_err(|err| with_context(err, "Failed to list state directory"))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(RECORD_SUFFIX) {
                if !id.is_empty() && !name.ends_with(TEMP_SUFFIX) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove the record. Missing records are success.
    pub fn delete(&self, id: &str) -> Result<(), DynError> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => self.sync_dir(),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(with_context(
                err,
                format!("Failed to delete record for {}", id),
            )),
        }
    }

    fn sync_dir(&self) -> Result<(), DynError> {
        File::open(&self.base)
            .and_then(|dir| dir.sync_all())
            .map_err(|err| {
                with_context(
                    err,
                    format!("Failed to sync state directory {}", self.base.display()),
                )
            })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }
}
