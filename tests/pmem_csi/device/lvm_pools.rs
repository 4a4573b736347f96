//! Pool convergence and allocation behavior of the LVM back-end.

use std::sync::Arc;

use tempfile::TempDir;

use pmem_csi::pmem_csi::device::lvm::{vg_name, LVM_ALIGN};
use pmem_csi::pmem_csi::device::{
    DeviceError, DeviceManager, DeviceMode, LvmManager, LvmOps, Usage,
};
use pmem_csi::pmem_csi::pmem::{CreateNamespaceRequest, NamespaceMode, PmemProbe};
use pmem_csi::pmem_csi::test_support::{FakeLvm, FakeProbe};

use crate::support::MIB;

struct LvmSetup {
    _dir: TempDir,
    probe: Arc<FakeProbe>,
    ops: Arc<FakeLvm>,
}

impl LvmSetup {
    fn new(region_sizes: &[u64]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let probe = FakeProbe::new(dir.path().join("pmem"), region_sizes);
        let ops = FakeLvm::new(dir.path().join("lvm"));
        Self {
            _dir: dir,
            probe,
            ops,
        }
    }

    async fn manager(&self, pmem_percentage: u32) -> Arc<LvmManager> {
        LvmManager::new(
            Arc::clone(&self.probe) as Arc<dyn PmemProbe>,
            Arc::clone(&self.ops) as Arc<dyn LvmOps>,
            pmem_percentage,
        )
        .await
        .expect("pool setup")
    }
}

#[tokio::test]
async fn startup_creates_one_pool_per_region() {
    let setup = LvmSetup::new(&[128 * MIB, 64 * MIB]);
    let manager = setup.manager(100).await;

    assert_eq!(setup.probe.namespace_count(), 2);
    assert_eq!(
        setup.ops.group_free(&vg_name("ndbus0", "region0")),
        Some(128 * MIB)
    );
    assert_eq!(
        setup.ops.group_free(&vg_name("ndbus0", "region1")),
        Some(64 * MIB)
    );

    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 192 * MIB);
    assert_eq!(capacity.max_volume_size, 128 * MIB);
}

#[tokio::test]
async fn percentage_limits_the_pool_share() {
    let setup = LvmSetup::new(&[128 * MIB]);
    let manager = setup.manager(50).await;

    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 64 * MIB);
}

#[tokio::test]
async fn second_startup_is_stable() {
    let setup = LvmSetup::new(&[128 * MIB]);
    let _first = setup.manager(100).await;
    assert_eq!(setup.probe.namespace_count(), 1);

    // A restart sees the region fully consumed by the pool namespace and
    // leaves everything as it is.
    let second = setup.manager(100).await;
    assert_eq!(setup.probe.namespace_count(), 1);
    let capacity = second.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 128 * MIB);
}

#[tokio::test]
async fn restart_pulls_new_region_capacity_into_a_new_pool() {
    let setup = LvmSetup::new(&[128 * MIB]);
    let _first = setup.manager(100).await;

    setup.probe.add_region(64 * MIB);
    let second = setup.manager(100).await;

    assert_eq!(setup.probe.namespace_count(), 2);
    let capacity = second.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 192 * MIB);
}

#[tokio::test]
async fn restart_extends_a_depleted_pool_when_the_region_has_room() {
    let setup = LvmSetup::new(&[128 * MIB]);

    // An older deployment claimed only half the region and spent most of
    // its pool on volumes.
    let namespace = setup
        .probe
        .create_namespace(CreateNamespaceRequest {
            name: "pmem-csi".to_string(),
            size: 64 * MIB,
            mode: NamespaceMode::Fsdax,
            align: LVM_ALIGN,
            region: Some("region0".to_string()),
        })
        .await
        .expect("pre-existing namespace");
    let vg = vg_name("ndbus0", "region0");
    setup
        .ops
        .create_volume_group(&vg, &namespace.device)
        .await
        .expect("pre-existing vg");
    setup
        .ops
        .create_logical_volume(&vg, "old-volume", 60 * MIB)
        .await
        .expect("pre-existing volume");
    assert_eq!(setup.ops.group_free(&vg), Some(4 * MIB));

    // The restart notices 64 MiB of unclaimed region space and adds it to
    // the pool as a second physical volume.
    let _manager = setup.manager(100).await;
    assert_eq!(setup.probe.namespace_count(), 2);
    assert_eq!(setup.ops.group_free(&vg), Some(68 * MIB));
}

#[tokio::test]
async fn create_aligns_and_picks_a_fitting_pool() {
    let setup = LvmSetup::new(&[128 * MIB]);
    let manager = setup.manager(100).await;

    let actual = manager
        .create_device("pv-1", 5 * MIB, Usage::Fsdax)
        .await
        .expect("create");
    assert_eq!(actual, 8 * MIB);

    let device = manager.get_device("pv-1").await.expect("get");
    assert_eq!(device.size, 8 * MIB);
    assert_eq!(device.mode, DeviceMode::Lvm);
    assert!(device.path.exists());

    // Zero-sized requests become one allocation unit.
    let minimum = manager
        .create_device("pv-0", 0, Usage::Fsdax)
        .await
        .expect("create");
    assert_eq!(minimum, LVM_ALIGN);
}

#[tokio::test]
async fn freed_pool_space_always_coalesces() {
    let setup = LvmSetup::new(&[128 * MIB]);
    let manager = setup.manager(100).await;

    for name in ["pv-1", "pv-2", "pv-3", "pv-4"] {
        manager
            .create_device(name, 16 * MIB, Usage::Fsdax)
            .await
            .expect("create");
    }
    for name in ["pv-1", "pv-3", "pv-4"] {
        manager.delete_device(name, false).await.expect("delete");
    }

    // Unlike the direct back-end, the pool does not care which volumes
    // were freed: all returned space is one extent again.
    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 112 * MIB);
    assert_eq!(capacity.max_volume_size, 112 * MIB);
    assert!(capacity.max_volume_size >= 3 * 16 * MIB);
}

#[tokio::test]
async fn fragmentation_across_pools_caps_the_largest_volume() {
    let setup = LvmSetup::new(&[64 * MIB, 64 * MIB]);
    let manager = setup.manager(100).await;

    manager
        .create_device("pv-1", 60 * MIB, Usage::Fsdax)
        .await
        .expect("create");

    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 68 * MIB);
    assert_eq!(capacity.max_volume_size, 64 * MIB);
}

#[tokio::test]
async fn exhausted_pools_refuse_creation() {
    let setup = LvmSetup::new(&[64 * MIB]);
    let manager = setup.manager(100).await;

    let err = manager
        .create_device("pv-big", 65 * MIB, Usage::Fsdax)
        .await
        .expect_err("must not fit");
    assert!(matches!(err, DeviceError::NotEnoughSpace { .. }));
}

#[tokio::test]
async fn busy_volumes_cannot_be_deleted() {
    let setup = LvmSetup::new(&[64 * MIB]);
    let manager = setup.manager(100).await;

    manager
        .create_device("pv-1", 8 * MIB, Usage::Fsdax)
        .await
        .expect("create");
    let device = manager.get_device("pv-1").await.expect("get");

    setup.ops.mark_busy(&device.path, true);
    let err = manager
        .delete_device("pv-1", false)
        .await
        .expect_err("busy volume");
    assert!(matches!(err, DeviceError::InUse(_)));

    setup.ops.mark_busy(&device.path, false);
    manager.delete_device("pv-1", false).await.expect("delete");
}

#[tokio::test]
async fn delete_of_unknown_volume_is_success() {
    let setup = LvmSetup::new(&[64 * MIB]);
    let manager = setup.manager(100).await;
    manager
        .delete_device("never-created", true)
        .await
        .expect("not found is success");
}
