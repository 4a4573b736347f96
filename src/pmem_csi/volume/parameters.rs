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

use std::collections::HashMap;
use std::str::FromStr;

use crate::pmem_csi::device::{DeviceMode, Usage};
use crate::pmem_csi::util::error::{new_error, DynError};

pub const KEY_SIZE: &str = "size";
pub const KEY_ERASE_AFTER: &str = "eraseAfter";
pub const KEY_USAGE: &str = "usage";
pub const KEY_KATA_CONTAINERS: &str = "kataContainers";
pub const KEY_NAME: &str = "name";
pub const KEY_DEVICE_MODE: &str = "deviceMode";
pub const KEY_PERSISTENCY: &str = "persistency";
/// Set by the orchestrator on inline-ephemeral publishes.
pub const KEY_EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
/// Present in the volume context of orchestrator-provisioned volumes.
pub const KEY_PROVISIONER_IDENTITY: &str = "storage.kubernetes.io/csiProvisionerIdentity";

/// Pod-info keys the orchestrator may add to publish requests; they carry
/// no meaning for the driver.
const IGNORED_PREFIX: &str = "csi.storage.k8s.io/";

/// Where a parameter map comes from. Each origin has its own set of legal
/// keys; anything else is an orchestrator configuration error and gets
/// rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// `CreateVolume.parameters` from the storage class.
    CreateVolume,
    /// `NodePublishVolume.volume_context` of an inline-ephemeral publish.
    EphemeralPublish,
    /// Parameters the driver itself persisted, and volume contexts handed
    /// back on publish/stage of driver-provisioned volumes.
    NodeVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistency {
    Persistent,
    Ephemeral,
}

impl Persistency {
    fn as_str(&self) -> &'static str {
        match self {
            Persistency::Persistent => "persistent",
            Persistency::Ephemeral => "ephemeral",
        }
    }
}

impl FromStr for Persistency {
    type Err = DynError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "persistent" => Ok(Persistency::Persistent),
            "ephemeral" => Ok(Persistency::Ephemeral),
            other => Err(format!("unknown persistency '{}'", other).into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeParameters {
    pub size: Option<i64>,
    pub erase_after: Option<bool>,
    pub usage: Option<Usage>,
    pub kata_containers: Option<bool>,
    pub persistency: Option<Persistency>,
    pub name: Option<String>,
    pub device_mode: Option<DeviceMode>,
}

impl VolumeParameters {
    pub fn parse(origin: Origin, map: &HashMap<String, String>) -> Result<Self, DynError> {
        let mut parameters = VolumeParameters::default();

        for (key, value) in map {
            match key.as_str() {
                KEY_SIZE => {
                    legal(
                        origin,
                        key,
                        &[Origin::CreateVolume, Origin::EphemeralPublish, Origin::NodeVolume],
                    )?;
                    parameters.size = Some(parse_quantity(value)?);
                }
                KEY_ERASE_AFTER => {
                    legal(origin, key, &[Origin::CreateVolume, Origin::NodeVolume])?;
                    parameters.erase_after = Some(parse_bool(key, value)?);
                }
                KEY_USAGE => {
                    legal(origin, key, &[Origin::CreateVolume, Origin::NodeVolume])?;
                    parameters.usage = Some(value.parse()?);
                }
                KEY_KATA_CONTAINERS => {
                    legal(origin, key, &[Origin::CreateVolume, Origin::NodeVolume])?;
                    parameters.kata_containers = Some(parse_bool(key, value)?);
                }
                KEY_EPHEMERAL => {
                    legal(origin, key, &[Origin::EphemeralPublish, Origin::NodeVolume])?;
                    if parse_bool(key, value)? {
                        parameters.persistency = Some(Persistency::Ephemeral);
                    }
                }
                KEY_PERSISTENCY => {
                    legal(origin, key, &[Origin::NodeVolume])?;
                    parameters.persistency = Some(value.parse()?);
                }
                KEY_NAME => {
                    legal(origin, key, &[Origin::NodeVolume])?;
                    parameters.name = Some(value.clone());
                }
                KEY_DEVICE_MODE => {
                    legal(origin, key, &[Origin::NodeVolume])?;
                    parameters.device_mode = Some(value.parse()?);
                }
                KEY_PROVISIONER_IDENTITY => {
                    legal(origin, key, &[Origin::NodeVolume])?;
                    // Recorded by the provisioner sidecar, no meaning here.
                }
                other if other.starts_with(IGNORED_PREFIX)
                    && matches!(origin, Origin::EphemeralPublish | Origin::NodeVolume) =>
                {
                    // Pod info added by the orchestrator on publish.
                }
                other => {
                    return Err(new_error(format!(
                        "parameter '{}' is invalid in this context",
                        other
                    )));
                }
            }
        }

        Ok(parameters)
    }

    /// Encode back into the string map stored with the volume and returned
    /// as volume context. `parse(NodeVolume, to_context(p))` produces a
    /// semantically equal value.
    pub fn to_context(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(size) = self.size {
            map.insert(KEY_SIZE.to_string(), size.to_string());
        }
        if let Some(erase_after) = self.erase_after {
            map.insert(KEY_ERASE_AFTER.to_string(), erase_after.to_string());
        }
        if let Some(usage) = self.usage {
            map.insert(KEY_USAGE.to_string(), usage.as_str().to_string());
        }
        if let Some(kata) = self.kata_containers {
            map.insert(KEY_KATA_CONTAINERS.to_string(), kata.to_string());
        }
        if let Some(persistency) = self.persistency {
            map.insert(KEY_PERSISTENCY.to_string(), persistency.as_str().to_string());
        }
        if let Some(name) = self.name.as_ref() {
            map.insert(KEY_NAME.to_string(), name.clone());
        }
        if let Some(mode) = self.device_mode {
            map.insert(KEY_DEVICE_MODE.to_string(), mode.as_str().to_string());
        }
        map
    }

    pub fn get_size(&self) -> i64 {
        self.size.unwrap_or(0)
    }

    /// Full erase on delete unless explicitly disabled.
    pub fn get_erase_after(&self) -> bool {
        self.erase_after.unwrap_or(true)
    }

    pub fn get_usage(&self) -> Usage {
        self.usage.unwrap_or_default()
    }

    pub fn get_kata_containers(&self) -> bool {
        self.kata_containers.unwrap_or(false)
    }

    pub fn get_persistency(&self) -> Persistency {
        self.persistency.unwrap_or(Persistency::Persistent)
    }
}

fn legal(origin: Origin, key: &str, allowed: &[Origin]) -> Result<(), DynError> {
    if allowed.contains(&origin) {
        Ok(())
    } else {
        Err(new_error(format!(
            "parameter '{}' is invalid in this context",
            key
        )))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DynError> {
    value
        .parse()
        .map_err(|_| new_error(format!("parameter '{}': invalid boolean '{}'", key, value)))
}

/// Parse a size with an optional binary or decimal suffix, e.g. `100Mi`,
/// `1G`, `4194304`.
pub fn parse_quantity(value: &str) -> Result<i64, DynError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(new_error("empty size"));
    }
    let suffixes: [(&str, i64); 9] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("", 1),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(digits) = value.strip_suffix(suffix) {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let base: i64 = digits
                .parse()
                .map_err(|err| new_error(format!("invalid size '{}': {}", value, err)))?;
            return base
                .checked_mul(multiplier)
                .ok_or_else(|| new_error(format!("size '{}' overflows", value)));
        }
    }
    Err(new_error(format!("invalid size '{}'", value)))
}
