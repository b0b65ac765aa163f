mod common;

use pretty_assertions::assert_eq;

use covengine::builder::ReportService;
use covengine::report::Report;
use covengine::storage::FsStorage;
use covengine::tree::{build_tree, OrderingDirection, OrderingParameter, TreeFilters, TreeNode};

use common::{SAMPLE_CHUNKS, SAMPLE_INDEX};

fn sample_report(conn: &mut rusqlite::Connection, storage: &FsStorage) -> Report {
    let commit = common::import(conn, storage, "abc123", None, SAMPLE_CHUNKS, SAMPLE_INDEX);
    ReportService::new(storage, &*conn)
        .build_report_from_commit(&commit)
        .unwrap()
        .unwrap()
}

fn assert_consistent(node: &TreeNode) {
    assert_eq!(node.hits() + node.misses() + node.partials(), node.lines());
    if let TreeNode::Dir(dir) = node {
        let lines: u64 = dir.children.iter().map(TreeNode::lines).sum();
        let hits: u64 = dir.children.iter().map(TreeNode::hits).sum();
        assert_eq!((dir.lines, dir.hits), (lines, hits), "{}", dir.full_path);
        dir.children.iter().for_each(assert_consistent);
    }
}

#[test]
fn nested_tree_sums_children() {
    let (mut conn, storage, _dir) = common::setup();
    let report = sample_report(&mut conn, &storage);
    let paths: Vec<&str> = report.paths().collect();

    let nodes = build_tree(&paths, "", &TreeFilters::default(), &report).unwrap();
    let names: Vec<&str> = nodes.iter().map(TreeNode::name).collect();
    assert_eq!(names, vec!["awesome", "tests"]);
    nodes.iter().for_each(assert_consistent);

    let tests = &nodes[1];
    assert_eq!(tests.full_path(), "tests");
    assert_eq!((tests.lines(), tests.hits(), tests.misses()), (10, 9, 1));
    assert!((tests.coverage().unwrap() - 90.0).abs() < 1e-9);

    let total: u64 = nodes.iter().map(TreeNode::lines).sum();
    assert_eq!(total, report.totals().unwrap().lines);
}

#[test]
fn prefix_lists_directory_contents() {
    let (mut conn, storage, _dir) = common::setup();
    let report = sample_report(&mut conn, &storage);
    let paths: Vec<&str> = report.paths().collect();

    let nodes = build_tree(&paths, "tests/", &TreeFilters::default(), &report).unwrap();
    let full_paths: Vec<&str> = nodes.iter().map(TreeNode::full_path).collect();
    assert_eq!(full_paths, vec!["tests/__init__.py", "tests/test_sample.py"]);
    assert!(nodes.iter().all(|n| matches!(n, TreeNode::File(_))));

    assert!(build_tree(&paths, "nowhere", &TreeFilters::default(), &report)
        .unwrap()
        .is_empty());
}

#[test]
fn search_is_flat_and_ordered() {
    let (mut conn, storage, _dir) = common::setup();
    let report = sample_report(&mut conn, &storage);
    let paths: Vec<&str> = report.paths().collect();

    let filters = TreeFilters {
        search_value: Some("INIT".to_string()),
        ordering: Some((OrderingParameter::Coverage, OrderingDirection::Asc)),
    };
    let nodes = build_tree(&paths, "", &filters, &report).unwrap();
    let full_paths: Vec<&str> = nodes.iter().map(TreeNode::full_path).collect();
    assert_eq!(full_paths, vec!["tests/__init__.py", "awesome/__init__.py"]);
}

#[test]
fn tree_serializes_with_type_tags() {
    let (mut conn, storage, _dir) = common::setup();
    let report = sample_report(&mut conn, &storage);
    let paths: Vec<&str> = report.paths().collect();

    let nodes = build_tree(&paths, "awesome", &TreeFilters::default(), &report).unwrap();
    let json = serde_json::to_value(&nodes).unwrap();
    assert_eq!(json[0]["type"], "file");
    assert_eq!(json[0]["name"], "__init__.py");
    assert_eq!(json[0]["hits"], 8);
}

const EMPTY_CHUNKS: &str = "{}
<<<<< end_of_chunk >>>>>
{}
<<<<< end_of_chunk >>>>>
{}
[1,null,[[0,1]]]";

const EMPTY_INDEX: &str = r#"{
    "files": {
        "stub/a.py": [0, [0, 0, 0, 0, 0, null, 0, 0, 0, 0, 0, 0, 0], null, null],
        "stub/b.py": [1, [0, 0, 0, 0, 0, null, 0, 0, 0, 0, 0, 0, 0], null, null],
        "src/ok.py": [2, [1, 1, 1, 0, 0, "100", 0, 0, 0, 0, 0, 0, 0], null, null]
    },
    "sessions": {
        "0": {"f": ["unit"], "st": "uploaded"}
    }
}"#;

#[test]
fn directory_of_empty_files_has_no_coverage() {
    let (mut conn, storage, _dir) = common::setup();
    let commit = common::import(&mut conn, &storage, "empty", None, EMPTY_CHUNKS, EMPTY_INDEX);
    let report = ReportService::new(&storage, &conn)
        .build_report_from_commit(&commit)
        .unwrap()
        .unwrap();
    let paths: Vec<&str> = report.paths().collect();

    let nodes = build_tree(&paths, "", &TreeFilters::default(), &report).unwrap();
    let names: Vec<&str> = nodes.iter().map(TreeNode::name).collect();
    assert_eq!(names, vec!["src", "stub"]);
    nodes.iter().for_each(assert_consistent);

    let stub = &nodes[1];
    assert_eq!(stub.lines(), 0);
    assert_eq!(stub.coverage(), None);
    let json = serde_json::to_value(stub).unwrap();
    assert_eq!(json["type"], "dir");
    assert!(json["coverage"].is_null());

    assert_eq!(nodes[0].coverage(), Some(100.0));
}
