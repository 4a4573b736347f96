//! Fake hardware for tests: an in-memory PMEM topology whose namespaces
//! and logical volumes are backed by sparse files, so the erase helpers
//! (`dd`, `shred`) run for real without needing devices or root.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::pmem_csi::device::lvm::{LogicalVolumeInfo, LvmOps, VolumeGroupInfo};
use crate::pmem_csi::device::{
    DeviceError, DeviceFuture, DeviceManager, DeviceManagerFactory, DeviceMode,
};
use crate::pmem_csi::pmem::{
    Bus, CreateNamespaceRequest, Namespace, NamespaceMode, PmemProbe, ProbeError, ProbeFuture,
    Region, MIB,
};

pub fn test_output_dir(component: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let base = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("target")
        });
    let path = base.join("test-output").join(component).join(format!(
        "pid{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("create test output directory");
    path
}

pub const FAKE_REGION_ALIGN: u64 = 2 * MIB;

#[derive(Debug, Clone)]
struct FakeNamespace {
    name: String,
    dev: String,
    mode: NamespaceMode,
    offset: u64,
    size: u64,
    path: PathBuf,
}

#[derive(Debug, Clone)]
struct FakeRegion {
    bus: String,
    dev: String,
    size: u64,
    align: u64,
    namespaces: Vec<FakeNamespace>,
}

impl FakeRegion {
    /// Free extents as (offset, length), in offset order. Adjacent freed
    /// space merges automatically because gaps are derived from what is
    /// still allocated.
    fn gaps(&self) -> Vec<(u64, u64)> {
        let mut namespaces = self.namespaces.clone();
        namespaces.sort_by_key(|ns| ns.offset);
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for ns in &namespaces {
            if ns.offset > cursor {
                gaps.push((cursor, ns.offset - cursor));
            }
            cursor = ns.offset + ns.size;
        }
        if cursor < self.size {
            gaps.push((cursor, self.size - cursor));
        }
        gaps
    }

    fn available(&self) -> u64 {
        self.gaps().iter().map(|(_, len)| len).sum()
    }

    fn max_available_extent(&self) -> u64 {
        self.gaps().iter().map(|(_, len)| *len).max().unwrap_or(0)
    }

    fn to_region(&self) -> Region {
        Region {
            bus: self.bus.clone(),
            dev: self.dev.clone(),
            size: self.size,
            available: self.available(),
            max_available_extent: self.max_available_extent(),
            align: self.align,
        }
    }
}

/// In-memory NVDIMM topology: one bus, any number of regions. Namespaces
/// occupy contiguous extents, allocated first-fit at the lowest offset,
/// exactly the behavior that makes the direct back-end fragment.
pub struct FakeProbe {
    regions: Mutex<Vec<FakeRegion>>,
    backing_dir: PathBuf,
    counter: AtomicU64,
}

impl FakeProbe {
    pub fn new(backing_dir: impl Into<PathBuf>, region_sizes: &[u64]) -> Arc<Self> {
        let backing_dir = backing_dir.into();
        fs::create_dir_all(&backing_dir).expect("create fake probe backing dir");
        let regions = region_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| FakeRegion {
                bus: "ndbus0".to_string(),
                dev: format!("region{}", i),
                size: *size,
                align: FAKE_REGION_ALIGN,
                namespaces: Vec::new(),
            })
            .collect();
        Arc::new(Self {
            regions: Mutex::new(regions),
            backing_dir,
            counter: AtomicU64::new(0),
        })
    }

    /// Grow the topology mid-test, as if more capacity was provisioned.
    pub fn add_region(&self, size: u64) {
        let mut regions = self.regions.lock().expect("fake probe lock");
        let index = regions.len();
        regions.push(FakeRegion {
            bus: "ndbus0".to_string(),
            dev: format!("region{}", index),
            size,
            align: FAKE_REGION_ALIGN,
            namespaces: Vec::new(),
        });
    }

    pub fn namespace_count(&self) -> usize {
        self.regions
            .lock()
            .expect("fake probe lock")
            .iter()
            .map(|r| r.namespaces.len())
            .sum()
    }

    fn allocate(&self, request: &CreateNamespaceRequest) -> Result<Namespace, ProbeError> {
        let mut regions = self.regions.lock().expect("fake probe lock");
        for region in regions.iter_mut() {
            if let Some(target) = request.region.as_ref() {
                if &region.dev != target {
                    continue;
                }
            }
            let slot = region
                .gaps()
                .into_iter()
                .find(|(_, len)| *len >= request.size);
            if let Some((offset, _)) = slot {
                let index = self.counter.fetch_add(1, Ordering::Relaxed);
                let dev = format!("namespace{}.{}", region.dev.trim_start_matches("region"), index);
                let path = self.backing_dir.join(format!("pmem{}", index));
                let file = File::create(&path).map_err(|err| ProbeError::Io(err.into()))?;
                file.set_len(request.size)
                    .map_err(|err| ProbeError::Io(err.into()))?;
                let namespace = FakeNamespace {
                    name: request.name.clone(),
                    dev: dev.clone(),
                    mode: request.mode,
                    offset,
                    size: request.size,
                    path: path.clone(),
                };
                region.namespaces.push(namespace);
                return Ok(Namespace {
                    name: request.name.clone(),
                    dev,
                    mode: request.mode,
                    size: request.size,
                    region: Some(region.dev.clone()),
                    device: path,
                });
            }
        }
        Err(ProbeError::Io(
            format!("no region with {} contiguous bytes", request.size).into(),
        ))
    }

    fn find(&self, name: &str) -> Result<Namespace, ProbeError> {
        let regions = self.regions.lock().expect("fake probe lock");
        for region in regions.iter() {
            if let Some(ns) = region.namespaces.iter().find(|ns| ns.name == name) {
                return Ok(Namespace {
                    name: ns.name.clone(),
                    dev: ns.dev.clone(),
                    mode: ns.mode,
                    size: ns.size,
                    region: Some(region.dev.clone()),
                    device: ns.path.clone(),
                });
            }
        }
        Err(ProbeError::DeviceNotFound(format!("namespace '{}'", name)))
    }

    fn destroy(&self, name: &str) -> Result<(), ProbeError> {
        let mut regions = self.regions.lock().expect("fake probe lock");
        for region in regions.iter_mut() {
            if let Some(index) = region.namespaces.iter().position(|ns| ns.name == name) {
                let ns = region.namespaces.remove(index);
                let _ = fs::remove_file(&ns.path);
                return Ok(());
            }
        }
        Err(ProbeError::DeviceNotFound(format!("namespace '{}'", name)))
    }
}

impl PmemProbe for FakeProbe {
    fn buses(&self) -> ProbeFuture<Vec<Bus>> {
        let buses = vec![Bus {
            dev: "ndbus0".to_string(),
            provider: "fake".to_string(),
        }];
        Box::pin(async move { Ok(buses) })
    }

    fn active_regions(&self, bus: &str) -> ProbeFuture<Vec<Region>> {
        let result = if bus == "ndbus0" {
            self.regions
                .lock()
                .expect("fake probe lock")
                .iter()
                .map(FakeRegion::to_region)
                .collect()
        } else {
            Vec::new()
        };
        Box::pin(async move { Ok(result) })
    }

    fn max_available_extent(&self, region: &str) -> ProbeFuture<u64> {
        let result = self
            .regions
            .lock()
            .expect("fake probe lock")
            .iter()
            .find(|r| r.dev == region)
            .map(FakeRegion::max_available_extent)
            .ok_or_else(|| ProbeError::DeviceNotFound(format!("region '{}'", region)));
        Box::pin(async move { result })
    }

    fn create_namespace(&self, request: CreateNamespaceRequest) -> ProbeFuture<Namespace> {
        let result = self.allocate(&request);
        Box::pin(async move { result })
    }

    fn destroy_namespace_by_name(&self, name: &str) -> ProbeFuture<()> {
        let result = self.destroy(name);
        Box::pin(async move { result })
    }

    fn get_namespace_by_name(&self, name: &str) -> ProbeFuture<Namespace> {
        let result = self.find(name);
        Box::pin(async move { result })
    }

    fn active_namespaces(&self) -> ProbeFuture<Vec<Namespace>> {
        let regions = self.regions.lock().expect("fake probe lock");
        let namespaces: Vec<Namespace> = regions
            .iter()
            .flat_map(|region| {
                region.namespaces.iter().map(|ns| Namespace {
                    name: ns.name.clone(),
                    dev: ns.dev.clone(),
                    mode: ns.mode,
                    size: ns.size,
                    region: Some(region.dev.clone()),
                    device: ns.path.clone(),
                })
            })
            .collect();
        Box::pin(async move { Ok(namespaces) })
    }
}

#[derive(Debug, Default)]
struct FakeVg {
    size: u64,
    free: u64,
    volumes: HashMap<String, (PathBuf, u64)>,
}

/// Pool-model volume groups: freeing always coalesces, matching LVM.
pub struct FakeLvm {
    groups: Mutex<HashMap<String, FakeVg>>,
    busy: Mutex<HashSet<PathBuf>>,
    backing_dir: PathBuf,
}

impl FakeLvm {
    pub fn new(backing_dir: impl Into<PathBuf>) -> Arc<Self> {
        let backing_dir = backing_dir.into();
        fs::create_dir_all(&backing_dir).expect("create fake lvm backing dir");
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            backing_dir,
        })
    }

    /// Pretend the logical volume at `path` is mounted, so removal fails
    /// the way `lvremove` fails on an open volume.
    pub fn mark_busy(&self, path: &Path, busy: bool) {
        let mut set = self.busy.lock().expect("fake lvm lock");
        if busy {
            set.insert(path.to_path_buf());
        } else {
            set.remove(path);
        }
    }

    pub fn group_free(&self, vg: &str) -> Option<u64> {
        self.groups
            .lock()
            .expect("fake lvm lock")
            .get(vg)
            .map(|g| g.free)
    }

    fn device_size(device: &Path) -> Result<u64, DeviceError> {
        fs::metadata(device)
            .map(|meta| meta.len())
            .map_err(|err| DeviceError::internal(err))
    }
}

impl LvmOps for FakeLvm {
    fn list_volume_groups(&self) -> DeviceFuture<Vec<VolumeGroupInfo>> {
        let groups: Vec<VolumeGroupInfo> = self
            .groups
            .lock()
            .expect("fake lvm lock")
            .iter()
            .map(|(name, vg)| VolumeGroupInfo {
                name: name.clone(),
                size: vg.size,
                free: vg.free,
            })
            .collect();
        Box::pin(async move { Ok(groups) })
    }

    fn create_physical_volume(&self, _device: &Path) -> DeviceFuture<()> {
        Box::pin(async move { Ok(()) })
    }

    fn create_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()> {
        let result = Self::device_size(device).map(|size| {
            self.groups.lock().expect("fake lvm lock").insert(
                name.to_string(),
                FakeVg {
                    size,
                    free: size,
                    volumes: HashMap::new(),
                },
            );
        });
        Box::pin(async move { result.map(|_| ()) })
    }

    fn extend_volume_group(&self, name: &str, device: &Path) -> DeviceFuture<()> {
        let result = Self::device_size(device).and_then(|size| {
            let mut groups = self.groups.lock().expect("fake lvm lock");
            let vg = groups
                .get_mut(name)
                .ok_or_else(|| DeviceError::internal(format!("no volume group '{}'", name)))?;
            vg.size += size;
            vg.free += size;
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn create_logical_volume(
        &self,
        vg: &str,
        name: &str,
        size: u64,
    ) -> DeviceFuture<LogicalVolumeInfo> {
        let result = (|| {
            let mut groups = self.groups.lock().expect("fake lvm lock");
            let group = groups
                .get_mut(vg)
                .ok_or_else(|| DeviceError::internal(format!("no volume group '{}'", vg)))?;
            if group.free < size {
                return Err(DeviceError::NotEnoughSpace { requested: size });
            }
            let path = self.backing_dir.join(format!("{}-{}", vg, name));
            let file = File::create(&path).map_err(DeviceError::internal)?;
            file.set_len(size).map_err(DeviceError::internal)?;
            group.free -= size;
            group.volumes.insert(name.to_string(), (path.clone(), size));
            Ok(LogicalVolumeInfo {
                name: name.to_string(),
                path,
                size,
                vg: vg.to_string(),
            })
        })();
        Box::pin(async move { result })
    }

    fn remove_logical_volume(&self, path: &Path) -> DeviceFuture<()> {
        let result = (|| {
            if self.busy.lock().expect("fake lvm lock").contains(path) {
                return Err(DeviceError::InUse(path.display().to_string()));
            }
            let mut groups = self.groups.lock().expect("fake lvm lock");
            for group in groups.values_mut() {
                let found = group
                    .volumes
                    .iter()
                    .find(|(_, (lv_path, _))| lv_path == path)
                    .map(|(name, (_, size))| (name.clone(), *size));
                if let Some((name, size)) = found {
                    group.volumes.remove(&name);
                    group.free += size;
                    let _ = fs::remove_file(path);
                    return Ok(());
                }
            }
            Err(DeviceError::internal(format!(
                "no logical volume at {}",
                path.display()
            )))
        })();
        Box::pin(async move { result })
    }

    fn list_logical_volumes(&self) -> DeviceFuture<Vec<LogicalVolumeInfo>> {
        let volumes: Vec<LogicalVolumeInfo> = self
            .groups
            .lock()
            .expect("fake lvm lock")
            .iter()
            .flat_map(|(vg, group)| {
                group
                    .volumes
                    .iter()
                    .map(move |(name, (path, size))| LogicalVolumeInfo {
                        name: name.clone(),
                        path: path.clone(),
                        size: *size,
                        vg: vg.clone(),
                    })
            })
            .collect();
        Box::pin(async move { Ok(volumes) })
    }
}

/// Factory handing out pre-built managers; tests wire in exactly the
/// back-ends a scenario needs.
#[derive(Default)]
pub struct FixedFactory {
    managers: Mutex<HashMap<DeviceMode, Arc<dyn DeviceManager>>>,
}

impl FixedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, mode: DeviceMode, manager: Arc<dyn DeviceManager>) {
        self.managers
            .lock()
            .expect("fixed factory lock")
            .insert(mode, manager);
    }
}

impl DeviceManagerFactory for FixedFactory {
    fn manager_for(&self, mode: DeviceMode) -> DeviceFuture<Arc<dyn DeviceManager>> {
        let result = self
            .managers
            .lock()
            .expect("fixed factory lock")
            .get(&mode)
            .map(Arc::clone)
            .ok_or_else(|| DeviceError::internal(format!("no device manager for mode {}", mode)));
        Box::pin(async move { result })
    }
}
