//! Crash behavior of the file-backed volume state.

use std::collections::HashMap;
use std::fs;

use tempfile::TempDir;

use pmem_csi::pmem_csi::state::FileState;
use pmem_csi::pmem_csi::volume::VolumeRecord;

fn record(id: &str, size: i64) -> VolumeRecord {
    let mut params = HashMap::new();
    params.insert("name".to_string(), format!("pvc-for-{}", id));
    params.insert("deviceMode".to_string(), "lvm".to_string());
    params.insert("eraseAfter".to_string(), "true".to_string());
    VolumeRecord {
        id: id.to_string(),
        size,
        params,
    }
}

#[test]
fn records_survive_a_process_restart() {
    let dir = TempDir::new().expect("tempdir");
    {
        let state = FileState::new(dir.path()).expect("state");
        for i in 0..10 {
            let id = format!("pv-{:02}", i);
            state.create(&id, &record(&id, i * 1024)).expect("create");
        }
        state.delete("pv-03").expect("delete");
    }

    let state = FileState::new(dir.path()).expect("reopen");
    let ids = state.get_all().expect("ids");
    assert_eq!(ids.len(), 9);
    assert!(!ids.contains(&"pv-03".to_string()));
    // Listing is sorted, so reconciliation and pagination see a stable
    // order.
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let restored = state.get("pv-07").expect("get");
    assert_eq!(restored, record("pv-07", 7 * 1024));
}

#[test]
fn interrupted_writes_leave_the_old_record_intact() {
    let dir = TempDir::new().expect("tempdir");
    let state = FileState::new(dir.path()).expect("state");
    state.create("pv-1", &record("pv-1", 100)).expect("create");

    // A crash between temp-file write and rename leaves a .tmp file
    // behind. The committed record must win and the leftover must not be
    // listed or resurrected.
    fs::write(dir.path().join("pv-1.json.tmp"), b"{\"id\":\"pv-1\",\"size\":999")
        .expect("simulate partial write");
    drop(state);

    let state = FileState::new(dir.path()).expect("reopen");
    assert_eq!(state.get("pv-1").expect("get").size, 100);
    assert_eq!(state.get_all().expect("ids"), vec!["pv-1".to_string()]);
    assert!(!dir.path().join("pv-1.json.tmp").exists());
}

#[test]
fn corrupt_records_fail_loudly_but_locally() {
    let dir = TempDir::new().expect("tempdir");
    let state = FileState::new(dir.path()).expect("state");
    state.create("pv-good", &record("pv-good", 1)).expect("create");
    fs::write(dir.path().join("pv-bad.json"), b"not json").expect("write");

    assert!(state.get("pv-bad").is_err());
    assert_eq!(state.get("pv-good").expect("get").size, 1);
    // Both ids are listed; the reconciler decides what to do with records
    // it cannot read.
    assert_eq!(state.get_all().expect("ids").len(), 2);
}
