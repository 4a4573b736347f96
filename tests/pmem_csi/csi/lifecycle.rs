//! Volume lifecycle semantics of the driver engine: idempotence,
//! crash-safe ordering, reconciliation and the CSI error taxonomy.

use std::sync::Arc;

use tonic::Code;

use pmem_csi::pmem_csi::csi::driver::AccessType;
use pmem_csi::pmem_csi::device::{DeviceManager, DeviceMode, Usage};
use pmem_csi::pmem_csi::pmem::{CreateNamespaceRequest, NamespaceMode, PmemProbe};
use pmem_csi::pmem_csi::volume::{generate_volume_id, VolumeParameters, VolumeRecord};

use crate::support::{direct_fixture, lvm_fixture, MIB};

fn plain_params() -> VolumeParameters {
    VolumeParameters::default()
}

/// Drop a record file into the state directory the way an interrupted
/// driver lifetime would have left it, without going through the running
/// driver's locked state handle.
fn write_record(state_dir: &std::path::Path, record: &VolumeRecord) {
    let payload = serde_json::to_vec(record).expect("encode record");
    std::fs::write(state_dir.join(format!("{}.json", record.id)), payload)
        .expect("write record file");
}

#[tokio::test]
async fn create_is_idempotent_per_name() {
    let fixture = lvm_fixture(&[128 * MIB]).await;
    let driver = fixture.driver();

    let (id1, size1, context) = driver
        .create_volume("pvc-1", (11 * MIB) as i64, plain_params())
        .await
        .expect("create");
    assert_eq!(id1, generate_volume_id("pvc-1"));
    assert_eq!(size1, (12 * MIB) as i64);
    assert_eq!(context.get("name").map(String::as_str), Some("pvc-1"));
    assert_eq!(context.get("deviceMode").map(String::as_str), Some("lvm"));

    let (id2, size2, _) = driver
        .create_volume("pvc-1", (11 * MIB) as i64, plain_params())
        .await
        .expect("repeat create");
    assert_eq!(id2, id1);
    assert_eq!(size2, size1);

    // Only one device exists.
    assert_eq!(fixture.manager.list_devices().await.expect("list").len(), 1);
}

#[tokio::test]
async fn bigger_request_for_existing_name_is_a_conflict() {
    let fixture = lvm_fixture(&[128 * MIB]).await;
    let driver = fixture.driver();

    driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("create");
    let status = driver
        .create_volume("pvc-1", (32 * MIB) as i64, plain_params())
        .await
        .expect_err("must conflict");
    assert_eq!(status.code(), Code::AlreadyExists);
    assert!(status.message().contains("worker-1"), "node id missing");
}

#[tokio::test]
async fn recreate_after_delete_yields_the_same_id() {
    let fixture = lvm_fixture(&[128 * MIB]).await;
    let driver = fixture.driver();

    let (id1, _, _) = driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("create");
    driver.delete_volume(&id1).await.expect("delete");
    assert!(driver.get_volume_by_id(&id1).is_none());

    let (id2, _, _) = driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("recreate");
    assert_eq!(id2, id1);
    assert!(driver.get_volume_by_id(&id2).is_some());
}

#[tokio::test]
async fn delete_of_unknown_volume_is_a_no_op() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    fixture
        .driver()
        .delete_volume("no-such-volume")
        .await
        .expect("idempotent delete");
}

#[tokio::test]
async fn delete_of_busy_volume_is_a_failed_precondition() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let driver = fixture.driver();

    let (id, _, _) = driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("create");
    let device = fixture.manager.get_device(&id).await.expect("device");
    fixture.lvm_ops.mark_busy(&device.path, true);

    let status = driver.delete_volume(&id).await.expect_err("busy");
    assert_eq!(status.code(), Code::FailedPrecondition);

    fixture.lvm_ops.mark_busy(&device.path, false);
    driver.delete_volume(&id).await.expect("delete");
}

#[tokio::test]
async fn capacity_shrinks_with_creations_and_recovers_on_delete() {
    let fixture = lvm_fixture(&[128 * MIB]).await;
    let driver = fixture.driver();

    let before = driver.capacity().await.expect("capacity");
    assert_eq!(before.available, 128 * MIB);

    let (id, size, _) = driver
        .create_volume("pvc-1", (11 * MIB) as i64, plain_params())
        .await
        .expect("create");
    let after = driver.capacity().await.expect("capacity");
    assert_eq!(after.available, before.available - size as u64);

    driver.delete_volume(&id).await.expect("delete");
    let recovered = driver.capacity().await.expect("capacity");
    assert_eq!(recovered.available, before.available);
}

#[tokio::test]
async fn oversized_requests_exhaust_resources() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let status = fixture
        .driver()
        .create_volume("pvc-huge", (1024 * MIB) as i64, plain_params())
        .await
        .expect_err("too big");
    assert_eq!(status.code(), Code::ResourceExhausted);

    // The failed attempt must not leave a stale record behind.
    assert!(fixture.driver().get_volume_by_name("pvc-huge").is_none());
    let records = std::fs::read_dir(fixture.state_dir())
        .expect("read state dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
        .count();
    assert_eq!(records, 0);
}

#[tokio::test]
async fn reboot_retains_volumes_and_capacity() {
    let mut fixture = lvm_fixture(&[128 * MIB]).await;

    let (id, size, _) = fixture
        .driver()
        .create_volume("pvc-1", (11 * MIB) as i64, plain_params())
        .await
        .expect("create");
    let listed = fixture.driver().volumes_snapshot();
    assert_eq!(listed.len(), 1);

    fixture.reboot().await;

    let listed = fixture.driver().volumes_snapshot();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].size, size);

    let capacity = fixture.driver().capacity().await.expect("capacity");
    assert_eq!(capacity.available, 128 * MIB - size as u64);
}

#[tokio::test]
async fn reconciliation_drops_records_without_devices() {
    let mut fixture = lvm_fixture(&[128 * MIB]).await;

    // A crash after persist-intent but before device creation leaves a
    // record with no device.
    let mut params = plain_params();
    params.name = Some("pvc-ghost".to_string());
    params.device_mode = Some(DeviceMode::Lvm);
    let ghost_id = generate_volume_id("pvc-ghost");
    let record = VolumeRecord {
        id: ghost_id.clone(),
        size: (8 * MIB) as i64,
        params: params.to_context(),
    };
    // Write behind the driver's back, as the interrupted lifetime did.
    write_record(&fixture.state_dir(), &record);

    fixture.reboot().await;

    assert!(fixture.driver().get_volume_by_id(&ghost_id).is_none());
    let state_files: Vec<_> = std::fs::read_dir(fixture.state_dir())
        .expect("read state dir")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect();
    assert!(
        state_files.is_empty(),
        "stale record must be removed: {state_files:?}"
    );
}

#[tokio::test]
async fn reconciliation_ignores_orphan_devices() {
    let mut fixture = direct_fixture(&[128 * MIB]).await;

    // A device created by an older lifetime, never recorded.
    fixture
        .probe
        .create_namespace(CreateNamespaceRequest {
            name: "orphan".to_string(),
            size: 16 * MIB,
            mode: NamespaceMode::Fsdax,
            align: 2 * MIB,
            region: None,
        })
        .await
        .expect("orphan namespace");

    fixture.reboot().await;

    // Not listed, not deleted.
    assert!(fixture.driver().volumes_snapshot().is_empty());
    assert_eq!(fixture.probe.namespace_count(), 1);
}

#[tokio::test]
async fn reconciliation_consults_the_stored_device_mode() {
    // Only half the region goes to the pools, leaving room for the
    // direct-mode namespaces this scenario needs.
    let mut fixture = crate::support::lvm_fixture_with_percentage(&[128 * MIB], 50).await;

    // Two records claim to come from the direct back-end: one whose
    // namespace still exists, one whose namespace is gone.
    let direct = pmem_csi::pmem_csi::device::DirectManager::new(
        Arc::clone(&fixture.probe) as Arc<dyn PmemProbe>,
    );
    fixture
        .factory
        .insert(DeviceMode::Direct, Arc::clone(&direct) as Arc<dyn DeviceManager>);

    let kept_id = generate_volume_id("direct-kept");
    let kept_size = direct
        .create_device(&kept_id, 8 * MIB, Usage::Fsdax)
        .await
        .expect("direct device");
    let gone_id = generate_volume_id("direct-gone");

    for (name, id, size) in [
        ("direct-kept", &kept_id, kept_size as i64),
        ("direct-gone", &gone_id, (8 * MIB) as i64),
    ] {
        let mut params = plain_params();
        params.name = Some(name.to_string());
        params.device_mode = Some(DeviceMode::Direct);
        write_record(
            &fixture.state_dir(),
            &VolumeRecord {
                id: id.clone(),
                size,
                params: params.to_context(),
            },
        );
    }

    fixture.reboot().await;

    assert!(fixture.driver().get_volume_by_id(&kept_id).is_some());
    assert!(fixture.driver().get_volume_by_id(&gone_id).is_none());
}

#[tokio::test]
async fn unstage_of_unknown_volume_is_not_found() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let status = fixture
        .driver()
        .unstage_volume("no-such-volume", "/tmp/wherever")
        .await
        .expect_err("unknown volume");
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn unstage_with_nothing_mounted_is_success() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let driver = fixture.driver();

    let (id, _, _) = driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("create");
    let staging = fixture.dir.path().join("staging");
    std::fs::create_dir_all(&staging).expect("staging dir");
    driver
        .unstage_volume(&id, &staging.display().to_string())
        .await
        .expect("nothing mounted is fine");
}

#[tokio::test]
async fn stage_of_raw_block_volume_is_a_no_op() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let driver = fixture.driver();

    let (id, _, context) = driver
        .create_volume("pvc-1", (8 * MIB) as i64, plain_params())
        .await
        .expect("create");
    driver
        .stage_volume(&id, "/ignored", &AccessType::Block, &context)
        .await
        .expect("raw block staging is a no-op");
}

#[tokio::test]
async fn unpublish_with_no_mount_and_no_volume_is_success() {
    let fixture = lvm_fixture(&[64 * MIB]).await;
    let target = fixture.dir.path().join("never-published");
    fixture
        .driver()
        .unpublish_volume("unknown", &target.display().to_string())
        .await
        .expect("repeat unpublish");
}

#[tokio::test]
async fn parameters_survive_the_create_round_trip() {
    let fixture = lvm_fixture(&[128 * MIB]).await;
    let mut params = plain_params();
    params.erase_after = Some(false);
    params.usage = Some(Usage::AppDirect);

    let (_, _, context) = fixture
        .driver()
        .create_volume("pvc-1", (8 * MIB) as i64, params)
        .await
        .expect("create");
    assert_eq!(context.get("eraseAfter").map(String::as_str), Some("false"));
    assert_eq!(context.get("usage").map(String::as_str), Some("appDirect"));

    let parsed = VolumeParameters::parse(
        pmem_csi::pmem_csi::volume::Origin::NodeVolume,
        &context,
    )
    .expect("context parses as node volume");
    assert_eq!(parsed.erase_after, Some(false));
    assert_eq!(parsed.usage, Some(Usage::AppDirect));
}

#[tokio::test]
async fn hash_collisions_are_detected() {
    // Only reachable by corrupting the table, so go through the state:
    // an existing volume whose recorded name differs from the one that
    // hashes to the same id.
    let mut fixture = lvm_fixture(&[128 * MIB]).await;
    let id = generate_volume_id("pvc-other");
    let mut params = plain_params();
    params.name = Some("renamed-pvc".to_string());
    params.device_mode = Some(DeviceMode::Lvm);
    write_record(
        &fixture.state_dir(),
        &VolumeRecord {
            id: id.clone(),
            size: (8 * MIB) as i64,
            params: params.to_context(),
        },
    );
    // Back the record with a real device so reconciliation keeps it.
    fixture
        .manager
        .create_device(&id, 8 * MIB, Usage::Fsdax)
        .await
        .expect("device");

    fixture.reboot().await;

    let status = fixture
        .driver()
        .create_volume("pvc-other", (8 * MIB) as i64, plain_params())
        .await
        .expect_err("collision");
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("collision"));
}
