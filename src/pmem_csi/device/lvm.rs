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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::pmem_csi::device::erase::{clear_device, wait_device_appears, zero_start};
use crate::pmem_csi::device::{
    align_down, align_up, CapacityInfo, DeviceError, DeviceFuture, DeviceInfo, DeviceManager,
    DeviceMode, Usage,
};
use crate::pmem_csi::logger::log_info;
use crate::pmem_csi::pmem::{CreateNamespaceRequest, NamespaceMode, PmemProbe, MIB};
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::{with_context, DynError};

const COMPONENT: &str = "lvm";

/// All pool namespaces carry this name; they are looked up through their
/// volume group, never by namespace name.
const POOL_NAMESPACE_NAME: &str = "pmem-csi";

/// Logical volumes are carved in multiples of this.
pub const LVM_ALIGN: u64 = 4 * MIB;

const VG_SUFFIX: &str = "fsdax";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroupInfo {
    pub name: String,
    pub size: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub vg: String,
}

/// Volume-group manipulation boundary. The CLI implementation shells out to
/// the LVM tools; tests substitute an in-memory pool model.
pub trait LvmOps: Send + Sync {
    fn list_volume_groups(&self) -> DeviceFuture<Vec<VolumeGroupInfo>>;

    fn create_physical_volume(&self, device: &Path) -> DeviceFuture<()>;

    fn create_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()>;

    fn extend_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()>;

    fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> DeviceFuture<LogicalVolumeInfo>;

    fn remove_logical_volume(&self, path: &Path) -> DeviceFuture<()>;

    fn list_logical_volumes(&self) -> DeviceFuture<Vec<LogicalVolumeInfo>>;
}

pub fn vg_name(bus: &str, region: &str) -> String {
    format!("{}{}{}", bus, region, VG_SUFFIX)
}

const PERCENTAGE_MARKER: &str = ".pmem-percentage";

/// The share of PMEM handed to the pools is fixed for the lifetime of a
/// deployment: pools are only ever grown towards the recorded target, so a
/// changed percentage would silently mean something different per region.
/// The first run records the value next to the volume records; later runs
/// must match it.
pub fn check_percentage_marker(state_dir: &Path, pmem_percentage: u32) -> Result<(), DynError> {
    let marker = state_dir.join(PERCENTAGE_MARKER);
    match std::fs::read_to_string(&marker) {
        Ok(recorded) => {
            let recorded: u32 = recorded.trim().parse().map_err(|err| {
                with_context(err, format!("corrupt percentage marker {}", marker.display()))
            })?;
            if recorded != pmem_percentage {
                return Err(format!(
                    "pmemPercentage changed from {} to {}: not supported on an existing deployment",
                    recorded, pmem_percentage
                )
                .into());
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&marker, pmem_percentage.to_string()).map_err(|err| {
                with_context(err, format!("writing percentage marker {}", marker.display()))
            })
        }
        Err(err) => Err(with_context(
            err,
            format!("reading percentage marker {}", marker.display()),
        )),
    }
}

fn is_pool_vg(name: &str) -> bool {
    name.ends_with(VG_SUFFIX)
}

/// Pool-based back-end: one volume group per PMEM region, logical volumes
/// per request. Free space within a group coalesces, so deleting volumes
/// gives back contiguous capacity.
pub struct LvmManager {
    probe: Arc<dyn PmemProbe>,
    ops: Arc<dyn LvmOps>,
}

impl LvmManager {
    /// Builds the manager and converges every PMEM region into its pool.
    /// `pmem_percentage` is the share of each region handed to the pools.
    pub async fn new(
        probe: Arc<dyn PmemProbe>,
        ops: Arc<dyn LvmOps>,
        pmem_percentage: u32,
    ) -> Result<Arc<Self>, DynError> {
        let manager = Arc::new(Self { probe, ops });
        manager.setup_pools(pmem_percentage).await?;
        Ok(manager)
    }

    /// Startup convergence: make sure each active region is backed by one
    /// volume group, creating or extending pool namespaces as needed. Runs
    /// again on every driver restart and picks up capacity that appeared
    /// since the previous run.
    async fn setup_pools(&self, pmem_percentage: u32) -> Result<(), DynError> {
        let buses = self
            .probe
            .buses()
            .await
            .map_err(|err| with_context(err, "enumerating buses"))?;
        for bus in buses {
            let regions = self
                .probe
                .active_regions(&bus.dev)
                .await
                .map_err(|err| with_context(err, format!("listing regions of {}", bus.dev)))?;
            let groups = self
                .ops
                .list_volume_groups()
                .await
                .map_err(|err| with_context(err, "listing volume groups"))?;
            for region in regions {
                let vg = vg_name(&bus.dev, &region.dev);
                let target =
                    align_down(region.available * u64::from(pmem_percentage) / 100, LVM_ALIGN);
                match groups.iter().find(|g| g.name == vg) {
                    None => {
                        if target < LVM_ALIGN {
                            continue;
                        }
                        let device = self.add_pool_namespace(&region.dev, target).await?;
                        self.ops
                            .create_volume_group(&vg, &device)
                            .await
                            .map_err(|err| {
                                with_context(err, format!("creating volume group {}", vg))
                            })?;
                        log_info(
                            COMPONENT,
                            "Volume group created",
                            &[("vg", &vg), ("size", &target.to_string())],
                        );
                    }
                    Some(group) => {
                        // The region grew (or the namespace was created by
                        // an older deployment with less capacity): pull the
                        // remaining free space into the group.
                        if target >= LVM_ALIGN && group.free < target {
                            let device = self.add_pool_namespace(&region.dev, target).await?;
                            self.ops
                                .extend_volume_group(&vg, &device)
                                .await
                                .map_err(|err| {
                                    with_context(err, format!("extending volume group {}", vg))
                                })?;
                            log_info(
                                COMPONENT,
                                "Volume group extended",
                                &[("vg", &vg), ("added", &target.to_string())],
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn add_pool_namespace(&self, region: &str, size: u64) -> Result<PathBuf, DynError> {
        let namespace = self
            .probe
            .create_namespace(CreateNamespaceRequest {
                name: POOL_NAMESPACE_NAME.to_string(),
                size,
                mode: NamespaceMode::Fsdax,
                align: LVM_ALIGN,
                region: Some(region.to_string()),
            })
            .await
            .map_err(|err| with_context(err, format!("creating pool namespace in {}", region)))?;
        let device = namespace.device.clone();
        wait_device_appears(&device).await?;
        // Wipe the first MiB so an old filesystem or LVM label on the
        // region cannot resurface in the new pool.
        zero_start(&device, namespace.size, 1024).await?;
        self.ops
            .create_physical_volume(&device)
            .await
            .map_err(|err| {
                with_context(err, format!("pvcreate of {}", device.display()))
            })?;
        Ok(device)
    }

    fn lv_to_info(lv: LogicalVolumeInfo) -> DeviceInfo {
        DeviceInfo {
            volume_id: lv.name,
            path: lv.path,
            size: lv.size,
            mode: DeviceMode::Lvm,
            usage: Usage::Fsdax,
        }
    }
}

impl DeviceManager for LvmManager {
    fn mode(&self) -> DeviceMode {
        DeviceMode::Lvm
    }

    fn create_device(&self, volume_id: &str, size: u64, _usage: Usage) -> DeviceFuture<u64> {
        let volume_id = volume_id.to_string();
        let ops = Arc::clone(&self.ops);
        Box::pin(async move {
            let size = align_up(size.max(1), LVM_ALIGN);
            let groups = ops.list_volume_groups().await?;
            let group = groups
                .iter()
                .filter(|g| is_pool_vg(&g.name))
                .find(|g| g.free >= size)
                .ok_or(DeviceError::NotEnoughSpace { requested: size })?;
            let lv = ops
                .create_logical_volume(&group.name, &volume_id, size)
                .await?;
            log_info(
                COMPONENT,
                "Logical volume created",
                &[
                    ("volume-id", &volume_id),
                    ("vg", &group.name),
                    ("size", &lv.size.to_string()),
                ],
            );
            Ok(lv.size)
        })
    }

    fn delete_device(&self, volume_id: &str, erase: bool) -> DeviceFuture<()> {
        let volume_id = volume_id.to_string();
        let ops = Arc::clone(&self.ops);
        Box::pin(async move {
            let volumes = ops.list_logical_volumes().await?;
            let lv = match volumes
                .into_iter()
                .filter(|lv| is_pool_vg(&lv.vg))
                .find(|lv| lv.name == volume_id)
            {
                Some(lv) => lv,
                // Deleting what is already gone is success.
                None => return Ok(()),
            };
            clear_device(&lv.path, lv.size, erase)
                .await
                .map_err(DeviceError::internal)?;
            ops.remove_logical_volume(&lv.path).await?;
            log_info(
                COMPONENT,
                "Logical volume removed",
                &[("volume-id", &volume_id), ("vg", &lv.vg)],
            );
            Ok(())
        })
    }

    fn get_device(&self, volume_id: &str) -> DeviceFuture<DeviceInfo> {
        let volume_id = volume_id.to_string();
        let ops = Arc::clone(&self.ops);
        Box::pin(async move {
            let volumes = ops.list_logical_volumes().await?;
            volumes
                .into_iter()
                .filter(|lv| is_pool_vg(&lv.vg))
                .find(|lv| lv.name == volume_id)
                .map(Self::lv_to_info)
                .ok_or(DeviceError::NotFound(volume_id))
        })
    }

    fn list_devices(&self) -> DeviceFuture<Vec<DeviceInfo>> {
        let ops = Arc::clone(&self.ops);
        Box::pin(async move {
            let volumes = ops.list_logical_volumes().await?;
            Ok(volumes
                .into_iter()
                .filter(|lv| is_pool_vg(&lv.vg))
                .map(Self::lv_to_info)
                .collect())
        })
    }

    fn capacity(&self) -> DeviceFuture<CapacityInfo> {
        let ops = Arc::clone(&self.ops);
        Box::pin(async move {
            let groups = ops.list_volume_groups().await?;
            let mut available = 0;
            let mut max_volume_size = 0;
            for group in groups.iter().filter(|g| is_pool_vg(&g.name)) {
                let free = align_down(group.free, LVM_ALIGN);
                available += free;
                max_volume_size = max_volume_size.max(free);
            }
            Ok(CapacityInfo {
                available,
                max_volume_size,
            })
        })
    }
}

/// LVM tool invocations. Listing output is requested without headings and
/// with byte units so the lines split on whitespace.
pub struct CliLvm;

fn parse_vgs(output: &str) -> Result<Vec<VolumeGroupInfo>, DynError> {
    let mut groups = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 3 {
            return Err(format!("unexpected vgs line '{}'", line).into());
        }
        groups.push(VolumeGroupInfo {
            name: fields[0].to_string(),
            size: fields[1].parse().map_err(|err| {
                with_context(err, format!("bad vg_size in '{}'", line))
            })?,
            free: fields[2].parse().map_err(|err| {
                with_context(err, format!("bad vg_free in '{}'", line))
            })?,
        });
    }
    Ok(groups)
}

fn parse_lvs(output: &str) -> Result<Vec<LogicalVolumeInfo>, DynError> {
    let mut volumes = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 4 {
            return Err(format!("unexpected lvs line '{}'", line).into());
        }
        volumes.push(LogicalVolumeInfo {
            name: fields[0].to_string(),
            path: PathBuf::from(fields[1]),
            size: fields[2].parse().map_err(|err| {
                with_context(err, format!("bad lv_size in '{}'", line))
            })?,
            vg: fields[3].to_string(),
        });
    }
    Ok(volumes)
}

fn internal(err: DynError, what: &str) -> DeviceError {
    DeviceError::Internal(with_context(err, what.to_string()))
}

impl LvmOps for CliLvm {
    fn list_volume_groups(&self) -> DeviceFuture<Vec<VolumeGroupInfo>> {
        Box::pin(async move {
            let output = run_command(
                "vgs",
                [
                    "--noheadings",
                    "--nosuffix",
                    "--units",
                    "b",
                    "-o",
                    "vg_name,vg_size,vg_free",
                ],
            )
            .await
            .map_err(|err| internal(err, "vgs failed"))?;
            parse_vgs(&output).map_err(|err| internal(err, "parsing vgs output"))
        })
    }

    fn create_physical_volume(&self, device: &Path) -> DeviceFuture<()> {
        let device = device.display().to_string();
        Box::pin(async move {
            run_command("pvcreate", ["--force", device.as_str()])
                .await
                .map(|_| ())
                .map_err(|err| internal(err, "pvcreate failed"))
        })
    }

    fn create_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()> {
        let name = name.to_string();
        let device = device.display().to_string();
        Box::pin(async move {
            run_command("vgcreate", ["--force", name.as_str(), device.as_str()])
                .await
                .map(|_| ())
                .map_err(|err| internal(err, "vgcreate failed"))
        })
    }

    fn extend_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()> {
        let name = name.to_string();
        let device = device.display().to_string();
        Box::pin(async move {
            run_command("vgextend", [name.as_str(), device.as_str()])
                .await
                .map(|_| ())
                .map_err(|err| internal(err, "vgextend failed"))
        })
    }

    fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> DeviceFuture<LogicalVolumeInfo> {
        let vg = vg.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let lv_size = format!("{}b", size);
            let result = run_command(
                "lvcreate",
                ["-L", lv_size.as_str(), "-n", name.as_str(), vg.as_str()],
            )
            .await;
            if let Err(err) = result {
                let message = err.to_string();
                if message.to_lowercase().contains("insufficient free space") {
                    return Err(DeviceError::NotEnoughSpace { requested: size });
                }
                return Err(internal(err, "lvcreate failed"));
            }
            Ok(LogicalVolumeInfo {
                path: PathBuf::from(format!("/dev/{}/{}", vg, name)),
                name,
                size,
                vg,
            })
        })
    }

    fn remove_logical_volume(&self, path: &Path) -> DeviceFuture<()> {
        let path = path.display().to_string();
        Box::pin(async move {
            if let Err(err) = run_command("lvremove", ["-f", path.as_str()]).await {
                let message = err.to_string().to_lowercase();
                if message.contains("in use") || message.contains("busy") {
                    return Err(DeviceError::InUse(path));
                }
                return Err(internal(err, "lvremove failed"));
            }
            Ok(())
        })
    }

    fn list_logical_volumes(&self) -> DeviceFuture<Vec<LogicalVolumeInfo>> {
        Box::pin(async move {
            let output = run_command(
                "lvs",
                [
                    "--noheadings",
                    "--nosuffix",
                    "--units",
                    "b",
                    "-o",
                    "lv_name,lv_path,lv_size,vg_name",
                ],
            )
            .await
            .map_err(|err| internal(err, "lvs failed"))?;
            parse_lvs(&output).map_err(|err| internal(err, "parsing lvs output"))
        })
    }
}
