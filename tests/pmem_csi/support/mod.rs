#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use pmem_csi::pmem_csi::csi::driver::CsiDriver;
use pmem_csi::pmem_csi::device::{
    DeviceManager, DeviceManagerFactory, DeviceMode, DirectManager, LvmManager, LvmOps,
};
use pmem_csi::pmem_csi::pmem::PmemProbe;
use pmem_csi::pmem_csi::state::FileState;
use pmem_csi::pmem_csi::test_support::{FakeLvm, FakeProbe, FixedFactory};

pub const TEST_DRIVER_NAME: &str = "pmem-csi.local";
pub const TEST_NODE_ID: &str = "worker-1";

pub const MIB: u64 = 1024 * 1024;

/// A complete fake node: probe, pool ops, one active device manager and a
/// driver over a private state directory.
pub struct Fixture {
    pub dir: TempDir,
    pub probe: Arc<FakeProbe>,
    pub lvm_ops: Arc<FakeLvm>,
    pub manager: Arc<dyn DeviceManager>,
    pub factory: Arc<FixedFactory>,
    driver: Option<Arc<CsiDriver>>,
}

impl Fixture {
    pub fn driver(&self) -> &Arc<CsiDriver> {
        self.driver.as_ref().expect("driver is running")
    }

    pub fn driver_arc(&self) -> Arc<CsiDriver> {
        Arc::clone(self.driver())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.dir.path().join("mounts")
    }

    /// Simulate a node reboot for the driver: tear down the running
    /// instance (releasing the state-directory lock), then bring up a
    /// fresh one over the same state and hardware. Reconciliation runs
    /// again as part of construction.
    pub async fn reboot(&mut self) {
        self.driver = None;
        let state = FileState::new(self.state_dir()).expect("reopen state after reboot");
        self.driver = Some(
            CsiDriver::new(
                TEST_DRIVER_NAME,
                TEST_NODE_ID,
                Arc::clone(&self.manager),
                Arc::clone(&self.factory) as Arc<dyn DeviceManagerFactory>,
                state,
                self.mount_dir(),
            )
            .await,
        );
    }
}

async fn build_fixture(active: DeviceMode, region_sizes: &[u64], pmem_percentage: u32) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let probe = FakeProbe::new(dir.path().join("pmem"), region_sizes);
    let lvm_ops = FakeLvm::new(dir.path().join("lvm"));

    let manager: Arc<dyn DeviceManager> = match active {
        DeviceMode::Lvm => LvmManager::new(
            Arc::clone(&probe) as Arc<dyn PmemProbe>,
            Arc::clone(&lvm_ops) as Arc<dyn LvmOps>,
            pmem_percentage,
        )
        .await
        .expect("lvm pool setup"),
        DeviceMode::Direct => DirectManager::new(Arc::clone(&probe) as Arc<dyn PmemProbe>),
    };
    let factory = FixedFactory::new();
    factory.insert(active, Arc::clone(&manager));

    let state = FileState::new(dir.path().join("state")).expect("state");
    let driver = CsiDriver::new(
        TEST_DRIVER_NAME,
        TEST_NODE_ID,
        Arc::clone(&manager),
        Arc::clone(&factory) as Arc<dyn DeviceManagerFactory>,
        state,
        dir.path().join("mounts"),
    )
    .await;

    Fixture {
        dir,
        probe,
        lvm_ops,
        manager,
        factory,
        driver: Some(driver),
    }
}

pub async fn lvm_fixture(region_sizes: &[u64]) -> Fixture {
    build_fixture(DeviceMode::Lvm, region_sizes, 100).await
}

pub async fn lvm_fixture_with_percentage(region_sizes: &[u64], pmem_percentage: u32) -> Fixture {
    build_fixture(DeviceMode::Lvm, region_sizes, pmem_percentage).await
}

pub async fn direct_fixture(region_sizes: &[u64]) -> Fixture {
    build_fixture(DeviceMode::Direct, region_sizes, 100).await
}
