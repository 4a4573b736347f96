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

pub mod direct;
pub mod erase;
pub mod lvm;

pub use direct::DirectManager;
pub use lvm::{CliLvm, LvmManager, LvmOps};

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pmem_csi::pmem::NamespaceMode;
use crate::pmem_csi::util::error::DynError;

/// Which back-end carved a device out of the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Lvm,
    Direct,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Lvm => "lvm",
            DeviceMode::Direct => "direct",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = DynError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lvm" => Ok(DeviceMode::Lvm),
            "direct" => Ok(DeviceMode::Direct),
            other => Err(format!("unsupported device manager mode '{}'", other).into()),
        }
    }
}

/// How the volume is meant to be consumed. `appDirect` devices are fsdax
/// namespaces mounted with the dax option; `sector` namespaces trade DAX
/// for power-fail write atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Usage {
    #[default]
    Fsdax,
    Sector,
    AppDirect,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Usage::Fsdax => "fsdax",
            Usage::Sector => "sector",
            Usage::AppDirect => "appDirect",
        }
    }

    pub fn namespace_mode(&self) -> NamespaceMode {
        match self {
            Usage::Fsdax | Usage::AppDirect => NamespaceMode::Fsdax,
            Usage::Sector => NamespaceMode::Sector,
        }
    }

    /// Whether mounts of this device get the `dax` option.
    pub fn wants_dax(&self) -> bool {
        matches!(self, Usage::Fsdax | Usage::AppDirect)
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Usage {
    type Err = DynError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fsdax" => Ok(Usage::Fsdax),
            "sector" => Ok(Usage::Sector),
            "appDirect" => Ok(Usage::AppDirect),
            other => Err(format!("unsupported usage '{}'", other).into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub volume_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub mode: DeviceMode,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityInfo {
    /// Total bytes that could still be allocated, summed over all pools or
    /// regions.
    pub available: u64,
    /// Largest single volume that can still be created. Smaller than
    /// `available` when free space is fragmented.
    pub max_volume_size: u64,
}

#[derive(Debug)]
pub enum DeviceError {
    NotFound(String),
    NotEnoughSpace { requested: u64 },
    InUse(String),
    Internal(DynError),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotFound(id) => write!(f, "no device for volume '{}'", id),
            DeviceError::NotEnoughSpace { requested } => {
                write!(f, "not enough space for {} bytes", requested)
            }
            DeviceError::InUse(id) => write!(f, "device for volume '{}' is in use", id),
            DeviceError::Internal(err) => write!(f, "device manager failure: {}", err),
        }
    }
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DeviceError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl DeviceError {
    pub fn internal(err: impl Into<DynError>) -> Self {
        DeviceError::Internal(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DeviceError::NotFound(_))
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
pub type DeviceFuture<T> = Pin<Box<dyn Future<Output = DeviceResult<T>> + Send>>;

/// Uniform capability set over the two back-ends. Callers must not branch
/// on the mode; the behavioral differences (fragmentation, locking
/// granularity, alignment) stay behind this interface.
pub trait DeviceManager: Send + Sync {
    fn mode(&self) -> DeviceMode;

    /// Allocate a device of at least `size` bytes and return the actual
    /// size after alignment.
    fn create_device(&self, volume_id: &str, size: u64, usage: Usage) -> DeviceFuture<u64>;

    /// Erase and free the device. Unknown ids are success.
    fn delete_device(&self, volume_id: &str, erase: bool) -> DeviceFuture<()>;

    fn get_device(&self, volume_id: &str) -> DeviceFuture<DeviceInfo>;

    fn list_devices(&self) -> DeviceFuture<Vec<DeviceInfo>>;

    fn capacity(&self) -> DeviceFuture<CapacityInfo>;
}

/// Produces a manager for a given mode. The reconciler needs this to query
/// the back-end that created a stored volume even when the node is now
/// running the other one.
pub trait DeviceManagerFactory: Send + Sync {
    fn manager_for(&self, mode: DeviceMode) -> DeviceFuture<Arc<dyn DeviceManager>>;
}

/// Lazily constructs and caches one manager per mode, sharing the probe
/// and the LVM ops. The LVM manager converges its pools on first use.
pub struct ManagerRegistry {
    probe: Arc<dyn crate::pmem_csi::pmem::PmemProbe>,
    lvm_ops: Arc<dyn LvmOps>,
    pmem_percentage: u32,
    cache: Arc<tokio::sync::Mutex<std::collections::HashMap<DeviceMode, Arc<dyn DeviceManager>>>>,
}

impl ManagerRegistry {
    pub fn new(
        probe: Arc<dyn crate::pmem_csi::pmem::PmemProbe>,
        lvm_ops: Arc<dyn LvmOps>,
        pmem_percentage: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            lvm_ops,
            pmem_percentage,
            cache: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
        })
    }
}

impl DeviceManagerFactory for ManagerRegistry {
    fn manager_for(&self, mode: DeviceMode) -> DeviceFuture<Arc<dyn DeviceManager>> {
        let probe = Arc::clone(&self.probe);
        let lvm_ops = Arc::clone(&self.lvm_ops);
        let cache = Arc::clone(&self.cache);
        let pmem_percentage = self.pmem_percentage;
        Box::pin(async move {
            let mut cache = cache.lock().await;
            if let Some(manager) = cache.get(&mode) {
                return Ok(Arc::clone(manager));
            }
            let manager: Arc<dyn DeviceManager> = match mode {
                DeviceMode::Lvm => LvmManager::new(probe, lvm_ops, pmem_percentage)
                    .await
                    .map_err(DeviceError::Internal)?,
                DeviceMode::Direct => DirectManager::new(probe),
            };
            cache.insert(mode, Arc::clone(&manager));
            Ok(manager)
        })
    }
}

/// Round `size` up to a multiple of `align`. Zero stays zero.
pub fn align_up(size: u64, align: u64) -> u64 {
    if align == 0 {
        return size;
    }
    size.div_ceil(align) * align
}

/// Round `size` down to a multiple of `align`.
pub fn align_down(size: u64, align: u64) -> u64 {
    if align == 0 {
        return size;
    }
    (size / align) * align
}
