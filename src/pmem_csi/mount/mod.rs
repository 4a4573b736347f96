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

pub mod filesystem;
pub mod image;

use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::pmem_csi::logger::{log_debug, log_info};
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::{with_context, DynError};

const COMPONENT: &str = "mount";

/// The plain `dax` option is nominally deprecated in favor of
/// `dax=always`, but it works across a wider range of kernels and the two
/// are treated as equivalent when comparing mounts.
pub const DAX_FLAG: &str = "dax";

#[derive(Debug)]
pub enum MountError {
    /// Target or device is occupied by something incompatible.
    AlreadyExists(String),
    /// Caller asked for something this driver does not do.
    Unsupported(String),
    Internal(DynError),
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::AlreadyExists(msg) => write!(f, "{}", msg),
            MountError::Unsupported(msg) => write!(f, "{}", msg),
            MountError::Internal(err) => write!(f, "mount pipeline failure: {}", err),
        }
    }
}

impl Error for MountError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MountError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl MountError {
    pub fn internal(err: impl Into<DynError>) -> Self {
        MountError::Internal(err.into())
    }
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    /// Per-mount and per-superblock options, combined.
    pub options: Vec<String>,
}

/// Decode the octal escapes mountinfo uses for whitespace in paths.
fn unescape_mount_path(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 && digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(ch);
    }
    out
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let mut halves = line.splitn(2, " - ");
        let before = match halves.next() {
            Some(before) => before,
            None => continue,
        };
        let after = match halves.next() {
            Some(after) => after,
            None => continue,
        };

        let before_fields: Vec<&str> = before.split(' ').collect();
        if before_fields.len() < 6 {
            continue;
        }
        let path = unescape_mount_path(before_fields[4]);
        let mount_options = before_fields[5];

        let after_fields: Vec<&str> = after.split(' ').collect();
        if after_fields.len() < 3 {
            continue;
        }
        let fs_type = after_fields[0];
        let device = unescape_mount_path(after_fields[1]);
        let super_options = after_fields[2];

        let mut options: Vec<String> = mount_options
            .split(',')
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        for option in super_options.split(',').filter(|o| !o.is_empty()) {
            if !options.iter().any(|existing| existing == option) {
                options.push(option.to_string());
            }
        }

        entries.push(MountEntry {
            device,
            path: PathBuf::from(path),
            fs_type: fs_type.to_string(),
            options,
        });
    }
    entries
}

pub fn list_mounts() -> Result<Vec<MountEntry>, DynError> {
    let content = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|err| with_context(err, "Failed to read mountinfo"))?;
    Ok(parse_mountinfo(&content))
}

pub fn is_mount_point(path: &Path) -> Result<bool, DynError> {
    let mounts = list_mounts()?;
    Ok(mounts.iter().any(|entry| entry.path == path))
}

/// The device currently mounted at `path`, if any. Used to find the staged
/// device during NodeUnstage.
pub fn device_for_path(path: &Path) -> Result<Option<String>, DynError> {
    let mounts = list_mounts()?;
    // Walk backwards so an over-mount shadows earlier entries.
    Ok(mounts
        .iter()
        .rev()
        .find(|entry| entry.path == path)
        .map(|entry| entry.device.clone()))
}

/// The most recent mount entry for `path`.
pub fn mount_for_path(path: &Path) -> Result<Option<MountEntry>, DynError> {
    let mounts = list_mounts()?;
    Ok(mounts.iter().rev().find(|entry| entry.path == path).cloned())
}

/// Do the requested flags all appear in the options of an existing mount?
/// `bind` never shows up in mount options and is skipped; `dax` and
/// `dax=always` count as the same thing.
pub fn find_mount_flags(flags: &[String], existing: &[String]) -> bool {
    for flag in flags {
        if flag == "bind" {
            continue;
        }
        let found = existing.iter().any(|have| {
            flag == have
                || (flag == "dax=always" && have == "dax")
                || (flag == "dax" && have == "dax=always")
        });
        if !found {
            return false;
        }
    }
    true
}

/// Create the target and mount the source there. Idempotent: an existing
/// mount at the target is left alone (compatibility is the caller's
/// check). Raw-block targets are regular files, filesystem targets are
/// directories.
pub async fn mount_device(
    source: &Path,
    target: &Path,
    options: &[String],
    raw_block: bool,
) -> Result<(), MountError> {
    if is_mount_point(target).map_err(MountError::internal)? {
        log_debug(
            COMPONENT,
            "Target already mounted",
            &[("target", &target.display().to_string())],
        );
        return Ok(());
    }

    if raw_block {
        match OpenOptions::new().create(true).truncate(false).write(true).open(target) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(MountError::internal(with_context(
                    err,
                    format!("create target device file {}", target.display()),
                )));
            }
        }
    } else {
        match fs::create_dir(target) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(MountError::internal(with_context(
                    err,
                    format!("create target directory {}", target.display()),
                )));
            }
        }
    }

    // The -c (canonical) form matters: the path recorded in mountinfo then
    // matches the logical device path, which the unmount side looks up.
    let mut args: Vec<String> = vec!["-c".to_string()];
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    args.push(source.display().to_string());
    args.push(target.display().to_string());

    run_command("mount", &args)
        .await
        .map_err(|err| MountError::internal(with_context(err, "mount failed")))?;

    // Make the new directory entry and mount record survive a power cut.
    sync_path(target).await.map_err(MountError::internal)?;

    log_info(
        COMPONENT,
        "Mounted",
        &[
            ("source", &source.display().to_string()),
            ("target", &target.display().to_string()),
            ("options", &options.join(",")),
        ],
    );
    Ok(())
}

/// `sync -f` on the filesystem containing `path`.
pub async fn sync_path(path: &Path) -> Result<(), DynError> {
    let path_str = path.display().to_string();
    run_command("sync", ["-f", path_str.as_str()])
        .await
        .map(|_| ())
        .map_err(|err| with_context(err, format!("sync of {} failed", path.display())))
}

pub fn unmount(target: &Path) -> Result<(), DynError> {
    umount2(target, MntFlags::empty())
        .map_err(|err| with_context(err, format!("Failed to unmount {}", target.display())))?;
    log_info(
        COMPONENT,
        "Unmounted",
        &[("target", &target.display().to_string())],
    );
    Ok(())
}

/// Unmount if (and only if) the path is a mount point right now.
pub fn unmount_if_mounted(target: &Path) -> Result<(), DynError> {
    if is_mount_point(target)? {
        unmount(target)
    } else {
        Ok(())
    }
}
