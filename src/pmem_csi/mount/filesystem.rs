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

use std::path::Path;

use crate::pmem_csi::logger::{log_debug, log_info};
use crate::pmem_csi::mount::MountError;
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "filesystem";

pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Detect the filesystem on a device, empty string meaning "none".
///
/// `file -bsL` answers the is-there-anything question (its output is the
/// literal word "data" for a blank device); `blkid` then names the
/// filesystem. `lsblk` is unsuitable here: it believes udev's cache, which
/// lags behind devices that were just written with dd-like tools.
pub async fn determine_filesystem_type(device: &Path) -> Result<String, DynError> {
    let device_str = device.display().to_string();
    if device_str.is_empty() {
        return Err(new_error("null device path"));
    }
    let output = run_command("file", ["-bsL", device_str.as_str()])
        .await
        .map_err(|err| with_context(err, format!("probing {}", device_str)))?;
    if output.trim() == "data" {
        return Ok(String::new());
    }

    let output = run_command("blkid", ["-c", "/dev/null", "-o", "full", device_str.as_str()])
        .await
        .map_err(|err| with_context(err, format!("blkid of {}", device_str)))?;
    parse_blkid_output(&output)
}

/// Expected shape: `devicepath: UUID="..." TYPE="<filesystem>"`.
pub fn parse_blkid_output(output: &str) -> Result<String, DynError> {
    let output = output.trim();
    if output.is_empty() {
        return Err(new_error("no device information from blkid"));
    }
    let attrs: Vec<&str> = output.splitn(2, ':').collect();
    if attrs.len() != 2 {
        return Err(new_error(format!("cannot parse blkid output: {}", output)));
    }
    for field in attrs[1].split_whitespace() {
        let attr: Vec<&str> = field.splitn(2, '=').collect();
        if attr.len() == 2 && attr[0] == "TYPE" {
            return Ok(attr[1].trim_matches('"').to_string());
        }
    }
    Err(new_error(format!(
        "no filesystem type in blkid output: {}",
        output
    )))
}

/// Put the requested filesystem on the device. Idempotent: a matching
/// existing filesystem is kept, a different one is refused so data cannot
/// be destroyed by a retry with changed parameters.
pub async fn provision_device(device: &Path, fs_type: &str) -> Result<(), MountError> {
    let fs_type = if fs_type.is_empty() {
        DEFAULT_FS_TYPE
    } else {
        fs_type
    };

    let existing = determine_filesystem_type(device)
        .await
        .map_err(MountError::internal)?;
    if !existing.is_empty() {
        if existing == fs_type {
            log_debug(
                COMPONENT,
                "Filesystem already present, skipping mkfs",
                &[
                    ("device", &device.display().to_string()),
                    ("fs-type", &existing),
                ],
            );
            return Ok(());
        }
        return Err(MountError::AlreadyExists(format!(
            "file system with different type {} exists on {}",
            existing,
            device.display()
        )));
    }

    let device_str = device.display().to_string();
    // Block size pinned to 4k: smaller blocks break the dax mount option.
    let (command, args): (&str, Vec<&str>) = match fs_type {
        "ext4" => (
            "mkfs.ext4",
            vec![
                "-b",
                "4096",
                "-E",
                "stride=512,stripe_width=512",
                "-F",
                device_str.as_str(),
            ],
        ),
        "xfs" => (
            // reflink and DAX are mutually exclusive; su/sw make the
            // allocator work in 2 MiB-aligned units.
            "mkfs.xfs",
            vec![
                "-b",
                "size=4096",
                "-m",
                "reflink=0",
                "-d",
                "su=2m,sw=1",
                "-f",
                device_str.as_str(),
            ],
        ),
        other => {
            return Err(MountError::Unsupported(format!(
                "unsupported filesystem '{}': supported types: ext4, xfs",
                other
            )));
        }
    };

    run_command(command, &args)
        .await
        .map_err(|err| MountError::internal(with_context(err, "mkfs failed")))?;
    log_info(
        COMPONENT,
        "Filesystem created",
        &[("device", &device_str), ("fs-type", &fs_type.to_string())],
    );
    Ok(())
}
