#![allow(dead_code)]

use rusqlite::Connection;
use tempfile::TempDir;

use covengine::builder;
use covengine::db;
use covengine::index::ReportIndex;
use covengine::model::Commit;
use covengine::storage::{chunks_key, ArchiveStorage, FsStorage};

/// Create a fresh temporary database and archive root, returning the
/// connection, the filesystem store, and the dir handle.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup() -> (Connection, FsStorage, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let conn = db::open(&dir.path().join("test.db")).unwrap();
    db::init_schema(&conn).unwrap();
    let storage = FsStorage::new(dir.path().join("archive"));
    (conn, storage, dir)
}

pub const REPO: &str = "acme/awesome";
pub const REPO_HASH: &str = "4434BC2A2EC4FCA57F77B473D83F928C";

/// Record a commit with its chunks blob and index, the way an upload
/// processor would leave them.
pub fn import(
    conn: &mut Connection,
    storage: &FsStorage,
    commitid: &str,
    parent: Option<&str>,
    chunks: &str,
    index: &str,
) -> Commit {
    let index = ReportIndex::parse(index).unwrap();
    let report = builder::build_report(chunks.to_string(), index.clone()).unwrap();
    let totals = report.totals().unwrap();

    let repository_id = db::upsert_repository(conn, REPO, REPO_HASH).unwrap();
    let id = db::insert_commit(conn, repository_id, commitid, parent, Some("main")).unwrap();
    storage
        .write(&chunks_key("v4", REPO_HASH, commitid), chunks.as_bytes())
        .unwrap();
    db::save_report_index(conn, id, &index, &totals).unwrap();

    commit(conn, commitid)
}

/// Record a commit whose report has not been processed yet.
pub fn commit_without_report(conn: &Connection, commitid: &str, parent: Option<&str>) -> Commit {
    let repository_id = db::upsert_repository(conn, REPO, REPO_HASH).unwrap();
    db::insert_commit(conn, repository_id, commitid, parent, None).unwrap();
    commit(conn, commitid)
}

pub fn commit(conn: &Connection, commitid: &str) -> Commit {
    use covengine::db::MetadataStore;
    conn.get_commit(REPO, commitid).unwrap().unwrap()
}

/// Three files, 20 lines, 17 hits, one session.
pub const SAMPLE_CHUNKS: &str = r#"{}
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[0,null,[[0,0]]]
[0,null,[[0,0]]]
<<<<< end_of_chunk >>>>>
{}
[1,null,[[0,1]]]

[1,null,[[0,1]]]
[0,null,[[0,0]]]
<<<<< end_of_chunk >>>>>
{}
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]
[1,null,[[0,1]]]"#;

pub const SAMPLE_INDEX: &str = r#"{
    "files": {
        "awesome/__init__.py": [0, [0, 10, 8, 2, 0, "80.00000", 0, 0, 0, 0, 0, 0, 0], null, null],
        "tests/__init__.py": [1, [0, 3, 2, 1, 0, "66.66667", 0, 0, 0, 0, 0, 0, 0], null, null],
        "tests/test_sample.py": [2, [0, 7, 7, 0, 0, "100", 0, 0, 0, 0, 0, 0, 0], null, null]
    },
    "sessions": {
        "0": {
            "t": [3, 20, 17, 3, 0, "85.00000", 0, 0, 0, 0, 0, 0, 0],
            "f": ["unittests"],
            "p": "travis",
            "b": "1234",
            "st": "uploaded",
            "se": {}
        }
    }
}"#;
