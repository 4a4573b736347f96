//! Allocation behavior of the direct (one-namespace-per-volume) back-end,
//! in particular the fragmentation semantics that distinguish it from the
//! pooled back-end.

use std::sync::Arc;

use tempfile::TempDir;

use pmem_csi::pmem_csi::device::{DeviceError, DeviceManager, DeviceMode, DirectManager, Usage};
use pmem_csi::pmem_csi::pmem::PmemProbe;
use pmem_csi::pmem_csi::test_support::FakeProbe;

use crate::support::MIB;

/// Requests of this size become exactly 16 MiB namespaces: aligned up to
/// 2 MiB and padded with the 4 MiB allocation slack.
const REQUEST: u64 = 12 * MIB;
const SLOT: u64 = 16 * MIB;

fn direct_manager(region_sizes: &[u64]) -> (TempDir, Arc<FakeProbe>, Arc<DirectManager>) {
    let dir = TempDir::new().expect("tempdir");
    let probe = FakeProbe::new(dir.path().join("pmem"), region_sizes);
    let manager = DirectManager::new(Arc::clone(&probe) as Arc<dyn PmemProbe>);
    (dir, probe, manager)
}

#[tokio::test]
async fn create_pads_and_aligns_the_request() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT]);
    let actual = manager
        .create_device("pv-1", REQUEST, Usage::Fsdax)
        .await
        .expect("create");
    assert_eq!(actual, SLOT);

    let device = manager.get_device("pv-1").await.expect("get");
    assert_eq!(device.size, SLOT);
    assert_eq!(device.mode, DeviceMode::Direct);
    assert!(device.path.exists(), "backing device must exist");
}

#[tokio::test]
async fn zero_sized_requests_get_the_minimum() {
    let (_dir, _probe, manager) = direct_manager(&[64 * MIB]);
    let actual = manager
        .create_device("pv-0", 0, Usage::Fsdax)
        .await
        .expect("create");
    // 2 MiB minimum allocation plus the 4 MiB slack.
    assert_eq!(actual, 6 * MIB);
}

#[tokio::test]
async fn freed_slots_coalesce_only_when_adjacent() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT]);
    for name in ["pv-1", "pv-2", "pv-3", "pv-4"] {
        manager
            .create_device(name, REQUEST, Usage::Fsdax)
            .await
            .expect("create");
    }
    let full = manager.capacity().await.expect("capacity");
    assert_eq!(full.available, 0);
    assert_eq!(full.max_volume_size, 0);

    // Freeing the first slot and the last two leaves two runs of free
    // space: one slot, and two adjacent slots that merge.
    for name in ["pv-1", "pv-3", "pv-4"] {
        manager.delete_device(name, false).await.expect("delete");
    }

    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, 3 * SLOT);
    assert_eq!(capacity.max_volume_size, 2 * SLOT);

    // A volume filling the merged double slot still fits...
    let two_slots = manager
        .create_device("pv-big", 2 * SLOT - 4 * MIB, Usage::Fsdax)
        .await
        .expect("create in merged slot");
    assert_eq!(two_slots, 2 * SLOT);

    // ...after which only the single fragmented slot remains.
    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available, SLOT);
    assert_eq!(capacity.max_volume_size, SLOT);
}

#[tokio::test]
async fn capacity_accounts_for_every_byte() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT, 2 * SLOT]);
    let total = 6 * SLOT;

    let mut created = 0;
    for name in ["pv-1", "pv-2", "pv-3"] {
        created += manager
            .create_device(name, REQUEST, Usage::Fsdax)
            .await
            .expect("create");
    }

    let capacity = manager.capacity().await.expect("capacity");
    assert_eq!(capacity.available + created, total);
}

#[tokio::test]
async fn requests_beyond_any_region_are_refused() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT]);
    let err = manager
        .create_device("pv-huge", 5 * SLOT, Usage::Fsdax)
        .await
        .expect_err("must not fit");
    assert!(matches!(err, DeviceError::NotEnoughSpace { .. }));

    // Capacity that is fragmented across regions does not merge either:
    // two half-full regions cannot host one region-sized volume.
    let (_dir, _probe, manager) = direct_manager(&[2 * SLOT, 2 * SLOT]);
    manager
        .create_device("pv-a", REQUEST, Usage::Fsdax)
        .await
        .expect("create");
    manager
        .create_device("pv-b", REQUEST, Usage::Fsdax)
        .await
        .expect("create");
    let err = manager
        .create_device("pv-c", 2 * SLOT - 4 * MIB, Usage::Fsdax)
        .await
        .expect_err("no contiguous extent");
    assert!(matches!(err, DeviceError::NotEnoughSpace { .. }));
}

#[tokio::test]
async fn duplicate_names_are_refused() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT]);
    manager
        .create_device("pv-1", REQUEST, Usage::Fsdax)
        .await
        .expect("create");
    let err = manager
        .create_device("pv-1", REQUEST, Usage::Fsdax)
        .await
        .expect_err("duplicate");
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn delete_is_idempotent_and_erase_works() {
    let (_dir, probe, manager) = direct_manager(&[4 * SLOT]);
    manager
        .create_device("pv-1", REQUEST, Usage::Fsdax)
        .await
        .expect("create");
    assert_eq!(probe.namespace_count(), 1);

    manager.delete_device("pv-1", true).await.expect("delete");
    assert_eq!(probe.namespace_count(), 0);
    assert!(matches!(
        manager.get_device("pv-1").await,
        Err(DeviceError::NotFound(_))
    ));

    // A second delete of the same volume is success.
    manager.delete_device("pv-1", true).await.expect("repeat delete");
}

#[tokio::test]
async fn sector_usage_creates_sector_namespaces() {
    let (_dir, _probe, manager) = direct_manager(&[4 * SLOT]);
    manager
        .create_device("pv-s", REQUEST, Usage::Sector)
        .await
        .expect("create");
    let device = manager.get_device("pv-s").await.expect("get");
    assert_eq!(device.usage, Usage::Sector);

    let listed = manager.list_devices().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].volume_id, "pv-s");
}
