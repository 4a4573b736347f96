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
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tonic::{Code, Status};

use crate::pmem_csi::device::{
    DeviceError, DeviceInfo, DeviceManager, DeviceManagerFactory, DeviceMode,
};
use crate::pmem_csi::logger::{log_debug, log_error, log_info};
use crate::pmem_csi::mount::{
    device_for_path, filesystem, image, is_mount_point, mount_device, mount_for_path, unmount,
    unmount_if_mounted, MountError, DAX_FLAG,
};
use crate::pmem_csi::state::FileState;
use crate::pmem_csi::util::keymutex::KeyMutex;
use crate::pmem_csi::volume::parameters::{KEY_EPHEMERAL, KEY_PROVISIONER_IDENTITY};
use crate::pmem_csi::volume::{
    generate_volume_id, Origin, Persistency, VolumeParameters, VolumeRecord,
};

const COMPONENT: &str = "driver";

/// How the workload wants to access the volume, already stripped of proto
/// envelope details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    Block,
}

impl AccessType {
    fn fs_type(&self) -> &str {
        match self {
            AccessType::Mount { fs_type, .. } => fs_type,
            AccessType::Block => "",
        }
    }

    fn mount_flags(&self) -> &[String] {
        match self {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

/// Node-local volume lifecycle engine behind the CSI services.
///
/// Owns the in-memory volume table, the persistent state, the active device
/// manager and the mount pipeline. Mutating calls serialize per volume
/// through hashed key locks: controller-side operations (create/delete) and
/// node-side operations (stage/publish and friends) use separate lock
/// spaces, which lets an unpublish of an ephemeral volume call into the
/// delete path without self-deadlocking.
pub struct CsiDriver {
    driver_name: String,
    node_id: String,
    dm: Arc<dyn DeviceManager>,
    factory: Arc<dyn DeviceManagerFactory>,
    state: FileState,
    mount_dir: PathBuf,
    volumes: Mutex<HashMap<String, VolumeRecord>>,
    controller_locks: KeyMutex,
    node_locks: KeyMutex,
    ready: AtomicBool,
}

impl CsiDriver {
    pub async fn new(
        driver_name: impl Into<String>,
        node_id: impl Into<String>,
        dm: Arc<dyn DeviceManager>,
        factory: Arc<dyn DeviceManagerFactory>,
        state: FileState,
        mount_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let driver = Arc::new(Self {
            driver_name: driver_name.into(),
            node_id: node_id.into(),
            dm,
            factory,
            state,
            mount_dir: mount_dir.into(),
            volumes: Mutex::new(HashMap::new()),
            controller_locks: KeyMutex::default(),
            node_locks: KeyMutex::default(),
            ready: AtomicBool::new(false),
        });
        driver.reconcile().await;
        driver.ready.store(true, Ordering::Release);
        driver
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn topology_key(&self) -> String {
        format!("{}/node", self.driver_name)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.dm.mode()
    }

    fn status(&self, code: Code, message: impl Into<String>) -> Status {
        Status::new(
            code,
            format!("{} (node {})", message.into(), self.node_id),
        )
    }

    /// Rebuild the in-memory table from persisted state, dropping records
    /// whose device no longer exists. Devices without a record (created by
    /// an older lifetime of the driver) are left alone and simply not
    /// listed.
    async fn reconcile(&self) {
        let devices = match self.dm.list_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "Failed to list devices during reconciliation",
                    &[("error", &err.to_string())],
                );
                Vec::new()
            }
        };
        let ids = match self.state.get_all() {
            Ok(ids) => ids,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "Failed to load state during reconciliation",
                    &[("error", &err.to_string())],
                );
                Vec::new()
            }
        };

        let mut cleanup = Vec::new();
        for id in ids {
            let record = match self.state.get(&id) {
                Ok(record) => record,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to read persisted volume",
                        &[("volume-id", &id), ("error", &err.to_string())],
                    );
                    continue;
                }
            };
            let params = match VolumeParameters::parse(Origin::NodeVolume, &record.params) {
                Ok(params) => params,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to parse persisted volume parameters",
                        &[("volume-id", &id), ("error", &err.to_string())],
                    );
                    continue;
                }
            };

            let stored_mode = params.device_mode.unwrap_or(self.dm.mode());
            let found = if stored_mode != self.dm.mode() {
                // The volume was created by the other back-end. Ask that
                // back-end whether the device still exists.
                let manager = match self.factory.manager_for(stored_mode).await {
                    Ok(manager) => manager,
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "Failed to initialize device manager for stored volume",
                            &[
                                ("volume-id", &id),
                                ("device-mode", stored_mode.as_str()),
                                ("error", &err.to_string()),
                            ],
                        );
                        continue;
                    }
                };
                match manager.get_device(&id).await {
                    Ok(_) => true,
                    Err(DeviceError::NotFound(_)) => false,
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "Failed to query stored volume device",
                            &[("volume-id", &id), ("error", &err.to_string())],
                        );
                        continue;
                    }
                }
            } else {
                devices.iter().any(|device| device.volume_id == id)
            };

            if found {
                self.volumes
                    .lock()
                    .expect("volume table lock poisoned")
                    .insert(id.clone(), record);
            } else {
                cleanup.push(id);
            }
        }

        for id in cleanup {
            log_info(
                COMPONENT,
                "Dropping stale volume record without device",
                &[("volume-id", &id)],
            );
            if let Err(err) = self.state.delete(&id) {
                log_error(
                    COMPONENT,
                    "Failed to remove stale volume record",
                    &[("volume-id", &id), ("error", &err.to_string())],
                );
            }
        }
    }

    pub fn get_volume_by_id(&self, volume_id: &str) -> Option<VolumeRecord> {
        self.volumes
            .lock()
            .expect("volume table lock poisoned")
            .get(volume_id)
            .cloned()
    }

    pub fn get_volume_by_name(&self, name: &str) -> Option<VolumeRecord> {
        self.volumes
            .lock()
            .expect("volume table lock poisoned")
            .values()
            .find(|record| {
                record.params.get(crate::pmem_csi::volume::parameters::KEY_NAME).map(String::as_str)
                    == Some(name)
            })
            .cloned()
    }

    /// Snapshot of all known volumes, ordered by id so that pagination
    /// tokens stay meaningful across calls.
    pub fn volumes_snapshot(&self) -> Vec<VolumeRecord> {
        let mut volumes: Vec<VolumeRecord> = self
            .volumes
            .lock()
            .expect("volume table lock poisoned")
            .values()
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        volumes
    }

    pub async fn capacity(&self) -> Result<crate::pmem_csi::device::CapacityInfo, Status> {
        self.dm
            .capacity()
            .await
            .map_err(|err| self.status(Code::Internal, err.to_string()))
    }

    /// Create (or find) the volume for `name`. Returns the volume id, the
    /// actual size in bytes and the volume context for the response.
    pub async fn create_volume(
        &self,
        name: &str,
        required: i64,
        mut params: VolumeParameters,
    ) -> Result<(String, i64, HashMap<String, String>), Status> {
        let _lock = self.controller_locks.lock(name).await;
        let (id, size) = self.create_volume_locked(name, required, &mut params).await?;
        params.name = Some(name.to_string());
        Ok((id, size, params.to_context()))
    }

    async fn create_volume_locked(
        &self,
        name: &str,
        required: i64,
        params: &mut VolumeParameters,
    ) -> Result<(String, i64), Status> {
        params.name = Some(name.to_string());

        if let Some(existing) = self.get_volume_by_name(name) {
            if existing.size < required {
                return Err(self.status(
                    Code::AlreadyExists,
                    format!("smaller volume with the same name {:?} already exists", name),
                ));
            }
            // Idempotent retry: hand back what the caller created earlier.
            log_debug(
                COMPONENT,
                "Volume exists, reusing",
                &[("volume-id", &existing.id), ("name", name)],
            );
            return Ok((existing.id, existing.size));
        }

        let volume_id = generate_volume_id(name);
        if let Some(other) = self.get_volume_by_id(&volume_id) {
            // We just checked that no volume has this name, so an entry
            // under the same id means two names hashed identically.
            return Err(self.status(
                Code::Internal,
                format!(
                    "volume id hash collision between old name {:?} and new name {:?}",
                    other.params.get("name").cloned().unwrap_or_default(),
                    name
                ),
            ));
        }

        let mode = self.dm.mode();
        params.device_mode = Some(mode);

        let mut record = VolumeRecord {
            id: volume_id.clone(),
            size: required,
            params: params.to_context(),
        };

        // Persist intent first. Losing the race the other way around would
        // leak an unrecorded device on crash; a stale record is cleaned up
        // by the next reconciliation.
        if let Err(err) = self.state.create(&volume_id, &record) {
            return Err(self.status(Code::Internal, format!("store state: {}", err)));
        }

        let usage = params.get_usage();
        let actual = match self
            .dm
            .create_device(&volume_id, required.max(0) as u64, usage)
            .await
        {
            Ok(actual) => actual,
            Err(err) => {
                // The device was not created; removing the record may fail,
                // in which case reconciliation picks it up later.
                if let Err(cleanup_err) = self.state.delete(&volume_id) {
                    log_error(
                        COMPONENT,
                        "Failed to remove record after device creation failure",
                        &[("volume-id", &volume_id), ("error", &cleanup_err.to_string())],
                    );
                }
                let code = match err {
                    DeviceError::NotEnoughSpace { .. } => Code::ResourceExhausted,
                    _ => Code::Internal,
                };
                return Err(self.status(code, format!("device creation failed: {}", err)));
            }
        };

        let actual = actual as i64;
        if record.size != actual {
            record.size = actual;
            if let Err(err) = self.state.create(&volume_id, &record) {
                // The device exists; the worst outcome of proceeding is a
                // record with the requested instead of the rounded size.
                log_error(
                    COMPONENT,
                    "Failed to update record with actual size",
                    &[("volume-id", &volume_id), ("error", &err.to_string())],
                );
            }
        }

        self.volumes
            .lock()
            .expect("volume table lock poisoned")
            .insert(volume_id.clone(), record);
        log_info(
            COMPONENT,
            "Volume created",
            &[
                ("volume-id", &volume_id),
                ("name", name),
                ("size", &actual.to_string()),
            ],
        );
        Ok((volume_id, actual))
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), Status> {
        let _lock = self.controller_locks.lock(volume_id).await;

        let record = match self.get_volume_by_id(volume_id) {
            Some(record) => record,
            // Already deleted.
            None => return Ok(()),
        };
        let params = self.stored_parameters(volume_id, &record)?;
        let manager = self.manager_for_mode(params.device_mode).await?;

        if let Err(err) = manager
            .delete_device(volume_id, params.get_erase_after())
            .await
        {
            return match err {
                DeviceError::InUse(_) => {
                    Err(self.status(Code::FailedPrecondition, err.to_string()))
                }
                other => Err(self.status(
                    Code::Internal,
                    format!("failed to delete volume: {}", other),
                )),
            };
        }

        if let Err(err) = self.state.delete(volume_id) {
            log_error(
                COMPONENT,
                "Failed to remove volume from state",
                &[("volume-id", volume_id), ("error", &err.to_string())],
            );
        }
        self.volumes
            .lock()
            .expect("volume table lock poisoned")
            .remove(volume_id);
        log_info(COMPONENT, "Volume deleted", &[("volume-id", volume_id)]);
        Ok(())
    }

    fn stored_parameters(
        &self,
        volume_id: &str,
        record: &VolumeRecord,
    ) -> Result<VolumeParameters, Status> {
        VolumeParameters::parse(Origin::NodeVolume, &record.params).map_err(|err| {
            // The driver wrote these itself; failing loudly beats guessing
            // and possibly destroying data.
            self.status(
                Code::Internal,
                format!(
                    "previously stored volume parameters for volume with id {:?}: {}",
                    volume_id, err
                ),
            )
        })
    }

    async fn manager_for_mode(
        &self,
        mode: Option<DeviceMode>,
    ) -> Result<Arc<dyn DeviceManager>, Status> {
        let mode = mode.unwrap_or(self.dm.mode());
        if mode == self.dm.mode() {
            return Ok(Arc::clone(&self.dm));
        }
        self.factory.manager_for(mode).await.map_err(|err| {
            self.status(
                Code::Internal,
                format!("failed to initialize device manager for mode {}: {}", mode, err),
            )
        })
    }

    /// The device manager that created a known volume; NotFound when the
    /// volume is not on this node.
    async fn manager_for_volume(
        &self,
        volume_id: &str,
    ) -> Result<Arc<dyn DeviceManager>, Status> {
        let record = self
            .get_volume_by_id(volume_id)
            .ok_or_else(|| self.status(Code::NotFound, format!("unknown volume: {}", volume_id)))?;
        let params = self.stored_parameters(volume_id, &record)?;
        self.manager_for_mode(params.device_mode).await
    }

    async fn device_for_volume(
        &self,
        manager: &Arc<dyn DeviceManager>,
        volume_id: &str,
    ) -> Result<DeviceInfo, Status> {
        match manager.get_device(volume_id).await {
            Ok(device) => Ok(device),
            Err(DeviceError::NotFound(_)) => Err(self.status(
                Code::NotFound,
                format!("no device found with volume id {:?}", volume_id),
            )),
            Err(err) => Err(self.status(
                Code::Internal,
                format!(
                    "failed to get device details for volume id {:?}: {}",
                    volume_id, err
                ),
            )),
        }
    }

    fn map_mount_error(&self, err: MountError) -> Status {
        match err {
            MountError::AlreadyExists(msg) => self.status(Code::AlreadyExists, msg),
            MountError::Unsupported(msg) => self.status(Code::InvalidArgument, msg),
            MountError::Internal(err) => self.status(Code::Internal, err.to_string()),
        }
    }

    /// NodeStageVolume: make sure the device carries the requested
    /// filesystem and mount it at the staging path. Raw-block volumes have
    /// nothing to stage.
    pub async fn stage_volume(
        &self,
        volume_id: &str,
        staging_path: &str,
        access: &AccessType,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), Status> {
        if matches!(access, AccessType::Block) {
            return Ok(());
        }

        let params = VolumeParameters::parse(Origin::NodeVolume, volume_context)
            .map_err(|err| {
                self.status(
                    Code::InvalidArgument,
                    format!("persistent volume context: {}", err),
                )
            })?;

        let _lock = self.node_locks.lock(volume_id).await;

        let manager = self.manager_for_volume(volume_id).await?;
        let device = self.device_for_volume(&manager, volume_id).await?;

        let requested_fs = if access.fs_type().is_empty() {
            filesystem::DEFAULT_FS_TYPE
        } else {
            access.fs_type()
        };
        filesystem::provision_device(&device.path, requested_fs)
            .await
            .map_err(|err| self.map_mount_error(err))?;

        let mut options: Vec<String> = access.mount_flags().to_vec();
        if params.get_usage().wants_dax() {
            options.push(DAX_FLAG.to_string());
        }
        mount_device(&device.path, Path::new(staging_path), &options, false)
            .await
            .map_err(|err| self.map_mount_error(err))?;
        Ok(())
    }

    /// NodeUnstageVolume: unmount whatever is staged. Nothing mounted is
    /// success, an unknown volume is NotFound.
    pub async fn unstage_volume(
        &self,
        volume_id: &str,
        staging_path: &str,
    ) -> Result<(), Status> {
        let _lock = self.node_locks.lock(volume_id).await;

        let manager = self.manager_for_volume(volume_id).await?;
        self.device_for_volume(&manager, volume_id).await?;

        let staged_device = device_for_path(Path::new(staging_path))
            .map_err(|err| self.status(Code::Internal, err.to_string()))?;
        match staged_device {
            None => {
                log_debug(
                    COMPONENT,
                    "Nothing mounted at staging path, skipping unmount",
                    &[("volume-id", volume_id), ("staging-path", staging_path)],
                );
                Ok(())
            }
            Some(device) => {
                log_debug(
                    COMPONENT,
                    "Unmounting staged device",
                    &[("volume-id", volume_id), ("device", &device)],
                );
                unmount(Path::new(staging_path))
                    .map_err(|err| self.status(Code::Internal, err.to_string()))
            }
        }
    }

    /// NodePublishVolume. For inline-ephemeral requests the volume is
    /// created here, with the same lifecycle as CreateVolume.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_volume(
        &self,
        volume_id: &str,
        staging_path: &str,
        target_path: &str,
        access: &AccessType,
        readonly: bool,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), Status> {
        let _lock = self.node_locks.lock(volume_id).await;

        let ephemeral = self.is_ephemeral_publish(volume_id, staging_path, volume_context).await?;

        let mut mount_flags: Vec<String> = access.mount_flags().to_vec();
        let fs_type = access.fs_type().to_string();

        let (params, device) = if ephemeral {
            let mut params =
                VolumeParameters::parse(Origin::EphemeralPublish, volume_context).map_err(
                    |err| {
                        self.status(
                            Code::InvalidArgument,
                            format!("ephemeral inline volume parameters: {}", err),
                        )
                    },
                )?;
            // The heuristic path arrives without the marker; pin it so the
            // stored parameters say what the volume is.
            params.persistency = Some(Persistency::Ephemeral);
            let device = self
                .create_ephemeral_device(volume_id, &mut params, &fs_type)
                .await?;
            if params.get_usage().wants_dax() {
                mount_flags.push(DAX_FLAG.to_string());
            }
            (params, device)
        } else {
            let params = VolumeParameters::parse(Origin::NodeVolume, volume_context)
                .map_err(|err| {
                    self.status(
                        Code::InvalidArgument,
                        format!("persistent volume context: {}", err),
                    )
                })?;
            let manager = self.manager_for_volume(volume_id).await?;
            let device = self.device_for_volume(&manager, volume_id).await?;
            mount_flags.push("bind".to_string());
            (params, device)
        };

        if readonly {
            mount_flags.push("ro".to_string());
        }

        let target = Path::new(target_path);
        let raw_block = matches!(access, AccessType::Block);
        // Filesystem publishes come from the staging mount; raw block and
        // ephemeral publishes come straight from the device.
        let source = match access {
            AccessType::Block => device.path.clone(),
            AccessType::Mount { .. } => {
                if !ephemeral && staging_path.is_empty() {
                    return Err(self.status(
                        Code::FailedPrecondition,
                        "staging target path missing in request",
                    ));
                }
                if is_mount_point(target)
                    .map_err(|err| self.status(Code::Internal, err.to_string()))?
                {
                    return self.check_existing_publish(target, &fs_type, &mount_flags);
                }
                if ephemeral {
                    device.path.clone()
                } else {
                    PathBuf::from(staging_path)
                }
            }
        };

        if raw_block && params.get_kata_containers() {
            // The confidential-VM runtime cannot consume a host block
            // device with DAX semantics.
            return Err(self.status(
                Code::InvalidArgument,
                "raw block volumes are incompatible with the nested-image path",
            ));
        }

        // Always bind-mount, even for the nested-image path where the
        // image could in principle live at the staging mount: unpublish
        // has no staging path and must be able to find everything again.
        let host_mount = if params.get_kata_containers() {
            fs::create_dir_all(&self.mount_dir).map_err(|err| {
                self.status(
                    Code::Internal,
                    format!("create parent directory for mounts: {}", err),
                )
            })?;
            self.mount_dir.join(volume_id)
        } else {
            PathBuf::from(target_path)
        };

        mount_device(&source, &host_mount, &mount_flags, raw_block)
            .await
            .map_err(|err| self.map_mount_error(err))?;

        if !params.get_kata_containers() {
            return Ok(());
        }

        // Nested-image path: the mounted volume holds one image file whose
        // partition is looped back and mounted at the real target.
        let image = image::image_path(&host_mount);
        image::create_image_file(&image, &fs_type)
            .await
            .map_err(|err| self.map_mount_error(err))?;
        let loop_device = image::attach_loop_device(&image)
            .await
            .map_err(|err| self.status(Code::Internal, format!("create loop device: {}", err)))?;
        filesystem::provision_device(&loop_device, &fs_type)
            .await
            .map_err(|err| self.map_mount_error(err))?;
        mount_device(&loop_device, target, &[], false)
            .await
            .map_err(|err| self.map_mount_error(err))?;
        Ok(())
    }

    /// A publish is ephemeral when the orchestrator says so, or (for older
    /// orchestrators) when the volume is entirely unknown: no device, no
    /// provisioner identity, no staging path.
    async fn is_ephemeral_publish(
        &self,
        volume_id: &str,
        staging_path: &str,
        volume_context: &HashMap<String, String>,
    ) -> Result<bool, Status> {
        if let Some(value) = volume_context.get(KEY_EPHEMERAL) {
            return value.parse().map_err(|_| {
                self.status(
                    Code::InvalidArgument,
                    format!("invalid {} value {:?}", KEY_EPHEMERAL, value),
                )
            });
        }

        let device_exists = match self.dm.get_device(volume_id).await {
            Ok(_) => true,
            Err(DeviceError::NotFound(_)) => false,
            Err(err) => {
                return Err(self.status(
                    Code::Internal,
                    format!(
                        "failed to get device details for volume id {:?}: {}",
                        volume_id, err
                    ),
                ));
            }
        };
        Ok(!device_exists
            && !volume_context.contains_key(KEY_PROVISIONER_IDENTITY)
            && staging_path.is_empty())
    }

    async fn create_ephemeral_device(
        &self,
        volume_id: &str,
        params: &mut VolumeParameters,
        fs_type: &str,
    ) -> Result<DeviceInfo, Status> {
        // Same path as CreateVolume, with the pod-scoped id as the name,
        // so the volume is tracked and reconciled like any other.
        let required = params.get_size();
        let (id, _actual) = {
            let _lock = self.controller_locks.lock(volume_id).await;
            self.create_volume_locked(volume_id, required, params).await?
        };

        let device = match self.device_for_volume(&self.dm, &id).await {
            Ok(device) => device,
            Err(err) => {
                return Err(self.status(
                    Code::Internal,
                    format!(
                        "ephemeral inline volume: device not found after creating volume {:?}: {}",
                        id,
                        err.message()
                    ),
                ));
            }
        };

        filesystem::provision_device(&device.path, fs_type)
            .await
            .map_err(|err| {
                self.status(
                    Code::Internal,
                    format!("ephemeral inline volume: failed to create filesystem: {}", err),
                )
            })?;
        Ok(device)
    }

    /// The target is already a mount point. That is fine exactly when the
    /// existing mount matches the request; anything else is a conflict.
    fn check_existing_publish(
        &self,
        target: &Path,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), Status> {
        let existing = mount_for_path(target)
            .map_err(|err| {
                self.status(
                    Code::Internal,
                    format!(
                        "failed to fetch existing mount details while checking {:?}: {}",
                        target, err
                    ),
                )
            })?;
        if let Some(entry) = existing {
            let fs_matches = fs_type.is_empty() || entry.fs_type == fs_type;
            if fs_matches && crate::pmem_csi::mount::find_mount_flags(mount_flags, &entry.options) {
                log_debug(
                    COMPONENT,
                    "Existing mount matches request, nothing to do",
                    &[("target", &target.display().to_string())],
                );
                return Ok(());
            }
        }
        Err(self.status(
            Code::AlreadyExists,
            "volume published but is incompatible",
        ))
    }

    /// NodeUnpublishVolume: unmount and clean up the target, unwind the
    /// nested-image path, and delete ephemeral volumes.
    pub async fn unpublish_volume(
        &self,
        volume_id: &str,
        target_path: &str,
    ) -> Result<(), Status> {
        let _lock = self.node_locks.lock(volume_id).await;

        let target = Path::new(target_path);
        // Ephemeral volumes are registered under their pod-scoped name.
        let record = self
            .get_volume_by_id(volume_id)
            .or_else(|| self.get_volume_by_name(volume_id));

        let mounted = is_mount_point(target)
            .map_err(|err| self.status(Code::Internal, err.to_string()))?;

        let record = match record {
            Some(record) => record,
            None => {
                if mounted {
                    // A mount we know nothing about: the call is invalid.
                    return Err(self.status(
                        Code::NotFound,
                        format!("no volume found with volume id {:?}", volume_id),
                    ));
                }
                // No volume, no mount: a repeat of an unpublish that
                // already finished.
                return Ok(());
            }
        };

        let params = self.stored_parameters(&record.id, &record)?;

        if mounted {
            unmount(target).map_err(|err| self.status(Code::Internal, err.to_string()))?;
        }

        if params.get_kata_containers() {
            self.unpublish_image_mount(volume_id).await?;
        }

        match fs::metadata(target) {
            Ok(meta) => {
                let removed = if meta.is_dir() {
                    fs::remove_dir(target)
                } else {
                    fs::remove_file(target)
                };
                if let Err(err) = removed {
                    if err.kind() != ErrorKind::NotFound {
                        return Err(self.status(
                            Code::Internal,
                            format!("unexpected error while removing target path: {}", err),
                        ));
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(self.status(
                    Code::Internal,
                    format!("unexpected error while removing target path: {}", err),
                ));
            }
        }

        if params.get_persistency() == Persistency::Ephemeral {
            if let Err(err) = self.delete_volume(&record.id).await {
                return Err(self.status(
                    Code::Internal,
                    format!(
                        "failed to delete ephemeral volume {}: {}",
                        volume_id,
                        err.message()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Undo the nested-image plumbing: detach the loop device, unmount the
    /// private mount and remove its directory. The image file itself stays
    /// until the volume is deleted.
    async fn unpublish_image_mount(&self, volume_id: &str) -> Result<(), Status> {
        let host_mount = self.mount_dir.join(volume_id);
        let image = image::image_path(&host_mount);

        image::detach_loop_device(&image).await.map_err(|err| {
            self.status(
                Code::Internal,
                format!("remove loop device for image file {:?}: {}", image, err),
            )
        })?;

        unmount_if_mounted(&host_mount)
            .map_err(|err| self.status(Code::Internal, err.to_string()))?;

        match fs::remove_dir(&host_mount) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.status(
                Code::Internal,
                format!("unexpected error while removing image mount point: {}", err),
            )),
        }
    }

    /// Validate capabilities for a known volume; only single-node writers
    /// are supported.
    pub fn validate_known_volume(&self, volume_id: &str) -> Result<VolumeRecord, Status> {
        self.get_volume_by_id(volume_id).ok_or_else(|| {
            self.status(Code::NotFound, "volume not created by this controller")
        })
    }
}
