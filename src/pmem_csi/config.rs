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

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, PathBuf};
use std::str::FromStr;

use crate::pmem_csi::device::DeviceMode;
use crate::pmem_csi::logger::LogFormat;
use crate::pmem_csi::util::error::{new_error, DynError};

/// Enum for supported path-valued configuration parameters.
///
/// The state directory must live on a non-tmpfs filesystem in production so
/// that volume records survive a hard power loss; placing it on tmpfs is a
/// test-only configuration (volumes are then re-created by the
/// orchestrator's own reconciliation).
#[derive(Debug)]
pub enum Config {
    /// Persistent volume records, one file per volume.
    StateDir,
    /// Engine-private mount points, used by the nested-image publish path.
    /// Must not overlap the orchestrator-controlled staging/target roots.
    MountDir,
    /// Unix socket the CSI services listen on.
    Socket,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::StateDir => "PMEM_CSI_STATE_DIR",
            Config::MountDir => "PMEM_CSI_MOUNT_DIR",
            Config::Socket => "PMEM_CSI_ENDPOINT",
        }
    }

    /// Returns the default value for the config parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::StateDir => {
                #[cfg(test)]
                {
                    "/tmp/pmem-csi-test/state"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/pmem-csi"
                }
            }
            Config::MountDir => {
                #[cfg(test)]
                {
                    "/tmp/pmem-csi-test/mounts"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/pmem-csi/mounts"
                }
            }
            Config::Socket => {
                #[cfg(test)]
                {
                    "/tmp/pmem-csi-test/csi.sock"
                }
                #[cfg(not(test))]
                {
                    "/run/pmem-csi/csi.sock"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Create the directory if needed and apply the expected permissions.
    pub fn verify(&self) -> Result<PathBuf, DynError> {
        let path = self.get_path();

        if !&path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| format!("Failed to create directory '{}': {}", path.display(), e))?;
        } else if !path.is_dir() {
            return Err(format!("Path '{}' exists but is not a directory", path.display()).into());
        }

        if let Some(mode) = self.desired_mode() {
            let permissions = fs::Permissions::from_mode(mode);
            if let Err(error) = fs::set_permissions(&path, permissions) {
                return Err(std::io::Error::other(format!(
                    "Failed to set permissions on '{}': {}",
                    path.display(),
                    error
                ))
                .into());
            }
        }

        Ok(path)
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }

    fn desired_mode(&self) -> Option<u32> {
        match self {
            Config::StateDir => Some(0o750),
            Config::MountDir => Some(0o750),
            Config::Socket => None,
        }
    }
}

const DEFAULT_DRIVER_NAME: &str = "pmem-csi.local";

/// Non-path driver settings, assembled from `PMEM_CSI_*` variables once at
/// startup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub device_manager: DeviceMode,
    /// Share of each PMEM region handed to the LVM pools, in percent.
    /// Fixed per deployment; a restart with a different value is rejected.
    pub pmem_percentage: u32,
    pub log_format: LogFormat,
}

impl DriverConfig {
    pub fn from_env() -> Result<Self, DynError> {
        let driver_name = env::var("PMEM_CSI_DRIVER_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DRIVER_NAME.to_string());

        let node_id = env::var("PMEM_CSI_NODE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| new_error("PMEM_CSI_NODE_ID must be set"))?;

        let device_manager = match env::var("PMEM_CSI_DEVICE_MANAGER") {
            Ok(value) => DeviceMode::from_str(value.trim())?,
            Err(_) => DeviceMode::Lvm,
        };

        let pmem_percentage = match env::var("PMEM_CSI_PMEM_PERCENTAGE") {
            Ok(value) => {
                let parsed: u32 = value.trim().parse().map_err(|err| {
                    new_error(format!(
                        "Failed to parse PMEM_CSI_PMEM_PERCENTAGE '{}': {}",
                        value, err
                    ))
                })?;
                if !(1..=100).contains(&parsed) {
                    return Err(new_error(format!(
                        "PMEM_CSI_PMEM_PERCENTAGE must be within [1,100], got {}",
                        parsed
                    )));
                }
                parsed
            }
            Err(_) => 100,
        };

        let log_format = match env::var("PMEM_CSI_LOG_FORMAT") {
            Ok(value) if value.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            driver_name,
            node_id,
            device_manager,
            pmem_percentage,
            log_format,
        })
    }

    /// Topology key reported with every volume: `<driver>/node`.
    pub fn topology_key(&self) -> String {
        format!("{}/node", self.driver_name)
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
