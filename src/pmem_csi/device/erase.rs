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

use tokio::time::sleep;

use crate::pmem_csi::logger::{log_debug, log_warn};
use crate::pmem_csi::util::backoff::ExponentialBackoff;
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "erase";
const APPEAR_ATTEMPTS: u32 = 10;

/// Erase a block device before it is handed out or given back.
///
/// `full` shreds the whole device with one overwrite pass (best effort: a
/// shred failure is logged and the deletion continues). Otherwise only the
/// first 4 KiB are zeroed so the next allocation cannot recognize a stale
/// filesystem signature.
pub async fn clear_device(path: &Path, size: u64, full: bool) -> Result<(), DynError> {
    log_debug(
        COMPONENT,
        "Clearing device",
        &[
            ("path", &path.display().to_string()),
            ("full", &full.to_string()),
        ],
    );
    if full {
        if let Err(err) = shred_device(path).await {
            log_warn(
                COMPONENT,
                "Full erase failed, continuing with deletion",
                &[
                    ("path", &path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
        return Ok(());
    }
    zero_start(path, size, 4).await
}

async fn shred_device(path: &Path) -> Result<(), DynError> {
    ensure_exists(path)?;
    // One pass instead of shred's default of three; PMEM has no remanence
    // concerns that would justify more.
    let path_str = path.display().to_string();
    run_command("shred", ["-n", "1", path_str.as_str()])
        .await
        .map(|_| ())
        .map_err(|err| with_context(err, format!("shred of '{}' failed", path.display())))
}

/// Zero `blocks` KiB at the start of the device, clamped to the device
/// size.
pub async fn zero_start(path: &Path, size: u64, blocks: u64) -> Result<(), DynError> {
    ensure_exists(path)?;
    let mut blocks = blocks;
    if blocks * 1024 > size {
        blocks = size / 1024;
    }
    if blocks == 0 {
        return Ok(());
    }
    run_command(
        "dd",
        [
            "if=/dev/zero".to_string(),
            format!("of={}", path.display()),
            "bs=1024".to_string(),
            format!("count={}", blocks),
        ],
    )
    .await
    .map(|_| ())
    .map_err(|err| with_context(err, format!("zeroing start of '{}' failed", path.display())))
}

fn ensure_exists(path: &Path) -> Result<(), DynError> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|err| with_context(err, format!("device '{}' is not accessible", path.display())))
}

/// Namespace block devices show up with a short delay after creation.
/// Polls with the capped backoff until the node exists.
pub async fn wait_device_appears(path: &Path) -> Result<(), DynError> {
    let mut backoff = ExponentialBackoff::default();
    for attempt in 0..APPEAR_ATTEMPTS {
        if path.exists() {
            return Ok(());
        }
        let delay = backoff.next();
        log_warn(
            COMPONENT,
            "Device not present yet, retrying",
            &[
                ("path", &path.display().to_string()),
                ("attempt", &attempt.to_string()),
                ("delay", &format!("{:?}", delay)),
            ],
        );
        sleep(delay).await;
    }
    Err(new_error(format!(
        "device {} did not appear after {} retries",
        path.display(),
        APPEAR_ATTEMPTS
    )))
}
