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

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::pmem_csi::device::erase::{clear_device, wait_device_appears};
use crate::pmem_csi::device::{
    align_up, CapacityInfo, DeviceError, DeviceFuture, DeviceInfo, DeviceManager, DeviceMode,
    DeviceResult, Usage,
};
use crate::pmem_csi::logger::log_info;
use crate::pmem_csi::pmem::{
    CreateNamespaceRequest, Namespace, NamespaceMode, PmemProbe, ProbeError, MIB,
};

const COMPONENT: &str = "direct";

const DIRECT_ALIGN: u64 = 2 * MIB;
/// The platform library hands out slightly less than asked for; adding this
/// keeps the usable size at or above the request.
const ALLOCATION_SLACK: u64 = 4 * MIB;

/// One namespace per volume, no pooling. Freed space only coalesces with
/// adjacent free space, so capacity fragments as volumes come and go.
pub struct DirectManager {
    probe: Arc<dyn PmemProbe>,
    /// Namespace creation and destruction race in the platform layer when
    /// issued concurrently, so both ops serialize on this.
    guard: Arc<Mutex<()>>,
}

fn namespace_usage(mode: NamespaceMode) -> Usage {
    match mode {
        NamespaceMode::Sector => Usage::Sector,
        NamespaceMode::Fsdax | NamespaceMode::Raw => Usage::Fsdax,
    }
}

fn namespace_to_info(ns: &Namespace) -> DeviceInfo {
    DeviceInfo {
        volume_id: ns.name.clone(),
        path: ns.device.clone(),
        size: ns.size,
        mode: DeviceMode::Direct,
        usage: namespace_usage(ns.mode),
    }
}

impl DirectManager {
    pub fn new(probe: Arc<dyn PmemProbe>) -> Arc<Self> {
        Arc::new(Self {
            probe,
            guard: Arc::new(Mutex::new(())),
        })
    }

    async fn regions(probe: &Arc<dyn PmemProbe>) -> DeviceResult<Vec<crate::pmem_csi::pmem::Region>> {
        let mut all = Vec::new();
        let buses = probe
            .buses()
            .await
            .map_err(|err| DeviceError::internal(err))?;
        for bus in buses {
            let regions = probe
                .active_regions(&bus.dev)
                .await
                .map_err(|err| DeviceError::internal(err))?;
            all.extend(regions);
        }
        Ok(all)
    }
}

impl DeviceManager for DirectManager {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Direct
    }

    fn create_device(&self, volume_id: &str, size: u64, usage: Usage) -> DeviceFuture<u64> {
        let volume_id = volume_id.to_string();
        let probe = Arc::clone(&self.probe);
        let guard = Arc::clone(&self.guard);
        Box::pin(async move {
            let _guard = guard.lock().await;

            // Repeated creation attempts for a name whose namespace exists
            // but never got its device node would slowly eat the region.
            match probe.get_namespace_by_name(&volume_id).await {
                Ok(_) => {
                    return Err(DeviceError::internal(format!(
                        "namespace '{}' already exists",
                        volume_id
                    )));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(DeviceError::internal(err)),
            }

            let padded = align_up(size.max(1), DIRECT_ALIGN) + ALLOCATION_SLACK;
            let regions = Self::regions(&probe).await?;
            let mut chosen = None;
            for region in regions {
                let final_size = align_up(padded, region.align);
                if region.max_available_extent >= final_size {
                    chosen = Some((region, final_size));
                    break;
                }
            }
            let (region, final_size) = match chosen {
                Some(found) => found,
                None => return Err(DeviceError::NotEnoughSpace { requested: padded }),
            };

            let namespace = probe
                .create_namespace(CreateNamespaceRequest {
                    name: volume_id.clone(),
                    size: final_size,
                    mode: usage.namespace_mode(),
                    align: DIRECT_ALIGN,
                    region: Some(region.dev.clone()),
                })
                .await
                .map_err(|err| DeviceError::internal(err))?;

            let device = namespace.device.clone();
            wait_device_appears(&device)
                .await
                .map_err(DeviceError::internal)?;
            // Old data at the start of the region must not be taken for a
            // filesystem on the new device.
            clear_device(&device, namespace.size, false)
                .await
                .map_err(DeviceError::internal)?;

            log_info(
                COMPONENT,
                "Namespace allocated",
                &[
                    ("volume-id", &volume_id),
                    ("region", &region.dev),
                    ("size", &namespace.size.to_string()),
                ],
            );
            Ok(namespace.size)
        })
    }

    fn delete_device(&self, volume_id: &str, erase: bool) -> DeviceFuture<()> {
        let volume_id = volume_id.to_string();
        let probe = Arc::clone(&self.probe);
        let guard = Arc::clone(&self.guard);
        Box::pin(async move {
            let _guard = guard.lock().await;

            let namespace = match probe.get_namespace_by_name(&volume_id).await {
                Ok(ns) => ns,
                Err(ProbeError::DeviceNotFound(_)) => return Ok(()),
                Err(err) => return Err(DeviceError::internal(err)),
            };
            // A namespace that is still mounted somewhere must not be
            // destroyed under the workload.
            let device_str = namespace.device.display().to_string();
            if let Ok(mounts) = crate::pmem_csi::mount::list_mounts() {
                if mounts.iter().any(|entry| entry.device == device_str) {
                    return Err(DeviceError::InUse(volume_id.clone()));
                }
            }
            clear_device(&namespace.device, namespace.size, erase)
                .await
                .map_err(DeviceError::internal)?;
            probe
                .destroy_namespace_by_name(&volume_id)
                .await
                .map_err(|err| match err {
                    ProbeError::DeviceNotFound(_) => DeviceError::NotFound(volume_id.clone()),
                    other => DeviceError::internal(other),
                })?;
            log_info(COMPONENT, "Namespace destroyed", &[("volume-id", &volume_id)]);
            Ok(())
        })
    }

    fn get_device(&self, volume_id: &str) -> DeviceFuture<DeviceInfo> {
        let volume_id = volume_id.to_string();
        let probe = Arc::clone(&self.probe);
        Box::pin(async move {
            match probe.get_namespace_by_name(&volume_id).await {
                Ok(ns) => Ok(namespace_to_info(&ns)),
                Err(ProbeError::DeviceNotFound(_)) => Err(DeviceError::NotFound(volume_id)),
                Err(err) => Err(DeviceError::internal(err)),
            }
        })
    }

    fn list_devices(&self) -> DeviceFuture<Vec<DeviceInfo>> {
        let probe = Arc::clone(&self.probe);
        Box::pin(async move {
            let namespaces = probe
                .active_namespaces()
                .await
                .map_err(|err| DeviceError::internal(err))?;
            Ok(namespaces.iter().map(namespace_to_info).collect())
        })
    }

    fn capacity(&self) -> DeviceFuture<CapacityInfo> {
        let probe = Arc::clone(&self.probe);
        Box::pin(async move {
            let regions = Self::regions(&probe).await?;
            let mut available = 0;
            let mut max_volume_size = 0;
            for region in regions {
                // Free space split by live namespaces counts towards
                // `available` but cannot be merged into one allocation, so
                // the largest volume is bounded by the largest contiguous
                // extent of any single region.
                available += region.available;
                max_volume_size = max_volume_size.max(region.max_available_extent);
            }
            Ok(CapacityInfo {
                available,
                max_volume_size,
            })
        })
    }
}
