//! Crash recovery: acked appends survive, torn tails are discarded.

mod common;

use std::fs;

use common::{download, open_store, upload};
use shale::CrdtData;
use shale::storage::CrdtStore;
use tempfile::TempDir;

fn wal_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(root.join("wal"))
        .unwrap()
        .map(|dirent| dirent.unwrap().path())
        .collect();
    files.sort();
    files
}

#[test]
fn acked_appends_survive_crash_before_drain() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        let mut sink = store.upload().unwrap();
        for key in 0..20u64 {
            sink.push(CrdtData::new(key, key + 1, format!("v{key}")))
                .unwrap();
        }
        // Crash: no close, no rotate, no drain.
    }

    let store = open_store(dir.path());
    let got = download(&store, 0);
    assert_eq!(got.len(), 20);
    assert_eq!(got[0], (0, 1, "v0".to_string()));
    assert_eq!(got[19], (19, 20, "v19".to_string()));
}

#[test]
fn torn_tail_loses_only_the_torn_record() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        let mut sink = store.upload().unwrap();
        sink.push(CrdtData::new(1, 1, "intact".to_string())).unwrap();
        sink.push(CrdtData::new(2, 1, "torn".to_string())).unwrap();
    }

    // Tear the last record's tail, as a crashed kernel write would.
    let files = wal_files(dir.path());
    assert_eq!(files.len(), 1);
    let bytes = fs::read(&files[0]).unwrap();
    fs::write(&files[0], &bytes[..bytes.len() - 3]).unwrap();

    let store = open_store(dir.path());
    assert_eq!(download(&store, 0), vec![(1, 1, "intact".to_string())]);
}

#[test]
fn corrupt_middle_record_truncates_from_there() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        let mut sink = store.upload().unwrap();
        sink.push(CrdtData::new(1, 1, "first".to_string())).unwrap();
        sink.push(CrdtData::new(2, 1, "second".to_string())).unwrap();
        sink.push(CrdtData::new(3, 1, "third".to_string())).unwrap();
    }

    let files = wal_files(dir.path());
    let mut bytes = fs::read(&files[0]).unwrap();
    // Flip one byte in the middle record's body.
    let offset = bytes.len() / 2;
    bytes[offset] ^= 0xff;
    fs::write(&files[0], &bytes).unwrap();

    let store = open_store(dir.path());
    let got = download(&store, 0);
    assert!(got.len() < 3, "corruption must drop at least one record");
    if let Some(first) = got.first() {
        assert_eq!(first, &(1, 1, "first".to_string()));
    }
}

#[test]
fn restart_after_clean_shutdown_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let store = open_store(dir.path());
        upload(&store, &[(1, 5, "a"), (2, 6, "b")]);
        download(&store, 0)
    };

    let store = open_store(dir.path());
    assert_eq!(download(&store, 0), expected);
    // Idempotent again.
    let store = open_store(dir.path());
    assert_eq!(download(&store, 0), expected);
}
