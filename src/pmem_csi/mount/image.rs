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

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;

use crate::pmem_csi::logger::{log_info, log_warn};
use crate::pmem_csi::mount::MountError;
use crate::pmem_csi::pmem::MIB;
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::{with_context, DynError};

const COMPONENT: &str = "image";

/// The image file a confidential-VM runtime maps into the guest as a PMEM
/// device. The name is fixed; the runtime looks for exactly this file.
pub const IMAGE_FILE_NAME: &str = "kata-containers-pmem-csi-vm.img";

/// Bytes reserved in front of the partition for the image header. The
/// partition is attached at exactly this offset; if the layout ever
/// changes, the offset has to be discovered dynamically instead.
pub const HEADER_SIZE: u64 = 2 * MIB;

pub fn image_path(host_mount: &Path) -> PathBuf {
    host_mount.join(IMAGE_FILE_NAME)
}

/// Create the image file filling the mounted volume, with a GPT label and
/// one partition starting at the fixed header offset. Idempotent: an
/// existing file is left untouched (it may hold data from an earlier
/// publish of the same volume).
pub async fn create_image_file(image: &Path, fs_type: &str) -> Result<(), MountError> {
    if image.exists() {
        return Ok(());
    }

    let parent = image
        .parent()
        .ok_or_else(|| MountError::internal("image path has no parent"))?;
    let stats = statvfs(parent).map_err(|err| {
        MountError::internal(with_context(
            err,
            format!("statvfs of {} failed", parent.display()),
        ))
    })?;
    let usable = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    if usable <= 2 * HEADER_SIZE {
        return Err(MountError::internal(format!(
            "volume too small for an image file: {} usable bytes",
            usable
        )));
    }
    // Round down to MiB so the partition end lands on an alignment
    // boundary parted accepts.
    let size = usable / MIB * MIB;

    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(image)
        .map_err(|err| {
            MountError::internal(with_context(
                err,
                format!("create image file {}", image.display()),
            ))
        })?;
    file.set_len(size).map_err(|err| {
        MountError::internal(with_context(
            err,
            format!("size image file {} to {} bytes", image.display(), size),
        ))
    })?;
    drop(file);

    let image_str = image.display().to_string();
    let partition_type = match fs_type {
        "" | "ext4" => "ext4",
        "xfs" => "xfs",
        other => {
            return Err(MountError::Unsupported(format!(
                "fsType '{}' not supported for the nested-image path",
                other
            )));
        }
    };
    let partition_start = format!("{}B", HEADER_SIZE);
    run_command(
        "parted",
        [
            "-s",
            image_str.as_str(),
            "mklabel",
            "gpt",
            "mkpart",
            "primary",
            partition_type,
            partition_start.as_str(),
            "100%",
        ],
    )
    .await
    .map_err(|err| MountError::internal(with_context(err, "partitioning image file failed")))?;

    log_info(
        COMPONENT,
        "Image file created",
        &[("image", &image_str), ("size", &size.to_string())],
    );
    Ok(())
}

/// Attach the image's partition to a loop device and return its path.
/// Reuses an existing attachment of the same file.
pub async fn attach_loop_device(image: &Path) -> Result<PathBuf, DynError> {
    let image_str = image.display().to_string();
    let existing = run_command("losetup", ["-j", image_str.as_str()]).await?;
    if let Some(device) = parse_losetup_output(&existing) {
        return Ok(PathBuf::from(device));
    }

    let offset = HEADER_SIZE.to_string();
    let output = run_command(
        "losetup",
        ["--offset", offset.as_str(), "--find", "--show", image_str.as_str()],
    )
    .await
    .map_err(|err| with_context(err, format!("attaching {} to a loop device", image_str)))?;
    let device = output.trim().to_string();
    if device.is_empty() {
        return Err(format!("losetup reported no device for {}", image_str).into());
    }
    log_info(
        COMPONENT,
        "Loop device attached",
        &[("image", &image_str), ("device", &device)],
    );
    Ok(PathBuf::from(device))
}

/// Detach the loop device backing the image, if one exists. A missing
/// attachment is not an error; an interrupted unpublish may already have
/// removed it.
pub async fn detach_loop_device(image: &Path) -> Result<(), DynError> {
    let image_str = image.display().to_string();
    let output = run_command("losetup", ["-j", image_str.as_str()]).await?;
    let device = match parse_losetup_output(&output) {
        Some(device) => device,
        None => {
            log_warn(
                COMPONENT,
                "No loop device found for image, nothing to detach",
                &[("image", &image_str)],
            );
            return Ok(());
        }
    };
    run_command("losetup", ["-d", device.as_str()])
        .await
        .map_err(|err| with_context(err, format!("detaching {}", device)))?;
    log_info(
        COMPONENT,
        "Loop device detached",
        &[("image", &image_str), ("device", &device)],
    );
    Ok(())
}

/// `losetup -j` prints `/dev/loopN: [...]: (<file>)` per attachment.
fn parse_losetup_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let device = line.split(':').next()?.trim();
        if device.starts_with("/dev/loop") {
            Some(device.to_string())
        } else {
            None
        }
    })
}
