//! Command handler functions for the covengine CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::builder::{self, ReportService};
use crate::components;
use crate::comparison::{self, Comparison, ComparisonOutcome, FileChange, PullComparison, Side};
use crate::db::{self, MetadataStore};
use crate::diff;
use crate::error::ReportError;
use crate::index::ReportIndex;
use crate::model::{Commit, LineType, Totals};
use crate::report::Report;
use crate::storage::{chunks_key, comparison_key, ArchiveStorage};
use crate::tree::{self, OrderingDirection, OrderingParameter, TreeFilters};

/// Where the commit being imported comes from.
pub struct ImportArgs<'a> {
    pub repository: &'a str,
    pub repo_hash: &'a str,
    pub commitid: &'a str,
    pub parent: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub chunks: &'a Path,
    pub index: &'a Path,
}

pub struct CompareArgs<'a> {
    pub repository: &'a str,
    pub commitid: &'a str,
    /// Compare against this base instead of the parent commit.
    pub base: Option<&'a str>,
    pub first_pull: bool,
    pub diff_text: Option<&'a str>,
    pub path_prefix: Option<&'a str>,
    /// Store the impacted-files payload in the archive.
    pub save: bool,
}

fn load_report(service: &ReportService<'_>, repository: &str, commitid: &str) -> Result<(Commit, Report)> {
    let commit = service
        .store()
        .get_commit(repository, commitid)?
        .ok_or_else(|| ReportError::CommitNotFound(commitid.to_string()))?;
    let report = service
        .build_report_from_commit(&commit)?
        .ok_or_else(|| anyhow::anyhow!("No report has been processed for commit '{commitid}'"))?;
    Ok((commit, report))
}

fn with_flags(report: Report, flags: &[String]) -> Result<Report> {
    if flags.is_empty() {
        Ok(report)
    } else {
        Ok(report.filter(Some(flags), &[])?)
    }
}

fn coverage_label(totals: &Totals) -> String {
    match &totals.coverage {
        Some(c) => format!("{c}%"),
        None => "-".to_string(),
    }
}

/// Collapse sorted line numbers into ranges, e.g. `1-3, 7, 9-10`.
pub fn format_line_ranges(numbers: &[u32]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = numbers.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
    }
    ranges.join(", ")
}

pub fn cmd_import(
    conn: &mut Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    args: &ImportArgs<'_>,
) -> Result<String> {
    let text = std::fs::read_to_string(args.chunks)
        .with_context(|| format!("Failed to read {}", args.chunks.display()))?;
    let raw_index = std::fs::read_to_string(args.index)
        .with_context(|| format!("Failed to read {}", args.index.display()))?;
    let index = ReportIndex::parse(&raw_index).context("Invalid report index")?;

    let report = builder::build_report(text.clone(), index.clone())?;
    let totals = report.totals()?;

    let repository_id = db::upsert_repository(conn, args.repository, args.repo_hash)?;
    let commit_id = db::insert_commit(conn, repository_id, args.commitid, args.parent, args.branch)?;
    storage.write(
        &chunks_key(chunks_version, args.repo_hash, args.commitid),
        text.as_bytes(),
    )?;
    db::save_report_index(conn, commit_id, &index, &totals)?;

    Ok(format!(
        "Imported {} files and {} sessions for commit '{}' (coverage: {})\n",
        index.files.len(),
        index.sessions.len(),
        args.commitid,
        coverage_label(&totals),
    ))
}

pub fn cmd_summary(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    repository: &str,
    commitid: &str,
    flags: &[String],
) -> Result<String> {
    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let (commit, report) = load_report(&service, repository, commitid)?;
    let report = with_flags(report, flags)?;
    let totals = report.totals()?;

    let mut out = String::new();
    writeln!(out, "Commit:     {}", commit.commitid).unwrap();
    if let Some(branch) = &commit.branch {
        writeln!(out, "Branch:     {branch}").unwrap();
    }
    writeln!(out, "Files:      {}", totals.files).unwrap();
    writeln!(out, "Lines:      {}/{} ({})", totals.hits, totals.lines, coverage_label(&totals)).unwrap();
    writeln!(out, "Misses:     {}", totals.misses).unwrap();
    writeln!(out, "Partials:   {}", totals.partials).unwrap();
    if totals.branches > 0 {
        writeln!(out, "Branches:   {}", totals.branches).unwrap();
    }
    if totals.methods > 0 {
        writeln!(out, "Methods:    {}", totals.methods).unwrap();
    }
    writeln!(out, "Sessions:   {}", totals.sessions).unwrap();
    Ok(out)
}

pub fn cmd_files(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    repository: &str,
    commitid: &str,
    flags: &[String],
    sort_by_coverage: bool,
) -> Result<String> {
    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let (_, report) = load_report(&service, repository, commitid)?;
    let report = with_flags(report, flags)?;

    let mut files = report.files()?;
    if sort_by_coverage {
        files.sort_by(|a, b| {
            let rate = |t: &Totals| t.coverage_f64().unwrap_or(f64::NEG_INFINITY);
            rate(a.totals()).total_cmp(&rate(b.totals()))
        });
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<60} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "FILE", "LINES", "HITS", "MISSES", "PARTIAL", "COVERAGE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(107)).unwrap();
    for f in &files {
        let t = f.totals();
        writeln!(
            out,
            "{:<60} {:>8} {:>8} {:>8} {:>8} {:>10}",
            f.name(),
            t.lines,
            t.hits,
            t.misses,
            t.partials,
            coverage_label(t)
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_lines(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    repository: &str,
    commitid: &str,
    source_file: &str,
    flags: &[String],
    uncovered: bool,
) -> Result<String> {
    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let (_, report) = load_report(&service, repository, commitid)?;
    let report = with_flags(report, flags)?;
    let Some(file) = report.get(source_file)? else {
        anyhow::bail!("No coverage data for '{source_file}'");
    };

    if uncovered {
        let missed: Vec<u32> = file
            .lines()
            .iter()
            .filter(|l| l.line_type() != LineType::Hit)
            .map(|l| l.number)
            .collect();
        if missed.is_empty() {
            return Ok(format!(
                "All instrumentable lines are covered in '{source_file}'\n"
            ));
        }
        let mut out = String::new();
        writeln!(out, "Uncovered lines in '{source_file}':").unwrap();
        writeln!(out, "  {}", format_line_ranges(&missed)).unwrap();
        writeln!(out, "  ({} lines)", missed.len()).unwrap();
        return Ok(out);
    }

    let mut out = String::new();
    writeln!(out, "{:>6}  {:>10}  {:>8}", "LINE", "COVERAGE", "SESSIONS").unwrap();
    writeln!(out, "{}", "-".repeat(30)).unwrap();
    for line in file.lines() {
        let marker = match line.line_type() {
            LineType::Hit => "✓",
            LineType::Miss => "✗",
            LineType::Partial => "◐",
        };
        writeln!(
            out,
            "{:>6}  {:>10}  {:>8}  {}",
            line.number,
            line.coverage.to_json().to_string().trim_matches('"'),
            line.sessions.len(),
            marker
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_tree(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    repository: &str,
    commitid: &str,
    flags: &[String],
    path_prefix: &str,
    search: Option<&str>,
    order: Option<(OrderingParameter, OrderingDirection)>,
) -> Result<String> {
    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let (_, report) = load_report(&service, repository, commitid)?;
    let report = with_flags(report, flags)?;

    let paths: Vec<String> = report.paths().map(str::to_string).collect();
    let filters = TreeFilters {
        search_value: search.map(str::to_string),
        ordering: order,
    };
    let nodes = tree::build_tree(&paths, path_prefix, &filters, &report)?;
    let mut out = serde_json::to_string_pretty(&nodes)?;
    out.push('\n');
    Ok(out)
}

fn format_change(change: Option<f64>) -> String {
    match change {
        Some(delta) => format!("{delta:+.2}"),
        None => "-".to_string(),
    }
}

fn format_comparison(comparison: &Comparison) -> String {
    let mut out = String::new();
    writeln!(out, "Base:       {}", coverage_label(&comparison.base_totals)).unwrap();
    writeln!(out, "Head:       {}", coverage_label(&comparison.head_totals)).unwrap();
    writeln!(out, "Change:     {}", format_change(comparison.change())).unwrap();
    if let Some(patch) = comparison.patch_totals() {
        writeln!(
            out,
            "Patch:      {}/{} ({})",
            patch.hits,
            patch.lines,
            coverage_label(patch)
        )
        .unwrap();
    }

    let impacted: Vec<_> = comparison.impacted().collect();
    if impacted.is_empty() {
        writeln!(out, "No impacted files.").unwrap();
        return out;
    }
    writeln!(out).unwrap();
    writeln!(
        out,
        "{:<60} {:<10} {:>10} {:>10} {:>8}",
        "FILE", "CHANGE", "BASE", "HEAD", "DELTA"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(102)).unwrap();
    for file in impacted {
        let change = match file.change {
            FileChange::Added => "added",
            FileChange::Removed => "removed",
            FileChange::Modified => "modified",
            FileChange::Unchanged => "indirect",
        };
        let side = |t: &Option<Totals>| t.as_ref().map_or("-".to_string(), coverage_label);
        writeln!(
            out,
            "{:<60} {:<10} {:>10} {:>10} {:>8}",
            file.path,
            change,
            side(&file.base_totals),
            side(&file.head_totals),
            format_change(file.coverage_change())
        )
        .unwrap();
    }
    out
}

fn outcome_message(outcome: &ComparisonOutcome) -> &'static str {
    match outcome {
        ComparisonOutcome::Ready(_) => "Comparison ready.\n",
        ComparisonOutcome::FirstPullRequest => "First pull request: there is no base to compare with.\n",
        ComparisonOutcome::MissingBaseCommit => "Missing base commit: the base commit is unknown.\n",
        ComparisonOutcome::MissingHeadCommit => "Missing head commit: the head commit is unknown.\n",
        ComparisonOutcome::MissingReport(Side::Base) => {
            "Missing base report: the base commit has no report yet.\n"
        }
        ComparisonOutcome::MissingReport(Side::Head) => {
            "Missing head report: the head commit has no report yet.\n"
        }
    }
}

pub fn cmd_compare(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    args: &CompareArgs<'_>,
) -> Result<String> {
    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let patches = args.diff_text.map(|text| {
        let patches = diff::parse_patch(text);
        match args.path_prefix {
            Some(prefix) => diff::apply_path_prefix(patches, prefix),
            None => patches,
        }
    });

    let head = service
        .store()
        .get_commit(args.repository, args.commitid)?
        .ok_or_else(|| ReportError::CommitNotFound(args.commitid.to_string()))?;

    let (base_commitid, comparison) = if args.base.is_some() || args.first_pull {
        let pull = PullComparison {
            repository: args.repository.to_string(),
            base_commitid: args.base.map(str::to_string),
            head_commitid: Some(args.commitid.to_string()),
            is_first_pull: args.first_pull,
        };
        match pull.resolve(&service, patches.as_deref())? {
            ComparisonOutcome::Ready(comparison) => {
                (args.base.unwrap_or_default().to_string(), comparison)
            }
            other => return Ok(outcome_message(&other).to_string()),
        }
    } else {
        match comparison::compare_commit_with_parent(&service, &head, patches.as_deref())? {
            Some(comparison) => (head.parent_commitid.clone().unwrap_or_default(), comparison),
            None => {
                return Ok(format!(
                    "Commit '{}' has no parent commit to compare with.\n",
                    args.commitid
                ))
            }
        }
    };

    let mut out = format_comparison(&comparison);
    if args.save {
        let key = comparison_key(chunks_version, &head.repo_hash, &base_commitid, &head.commitid);
        let payload = comparison::impacted_files_json(&comparison);
        storage.write(&key, serde_json::to_string(&payload)?.as_bytes())?;
        let repository_id = db::upsert_repository(conn, &head.repository, &head.repo_hash)?;
        db::record_comparison(conn, repository_id, &base_commitid, &head.commitid, Some(key.as_str()))?;
        writeln!(out, "Saved impacted files to {key}").unwrap();
    }
    Ok(out)
}

pub fn cmd_impacted(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    repository: &str,
    base: &str,
    head: &str,
) -> Result<String> {
    let Some(record) = conn.get_comparison(repository, base, head)? else {
        return Ok(format!("No comparison recorded for {base}...{head}\n"));
    };
    let files = comparison::get_impacted_files(storage, &record);
    if files.is_empty() {
        return Ok("No impacted files.\n".to_string());
    }

    let mut out = String::new();
    writeln!(out, "{:<60} {:>10} {:>10} {:>10}", "FILE", "BASE", "HEAD", "PATCH").unwrap();
    writeln!(out, "{}", "-".repeat(93)).unwrap();
    for file in &files {
        let name = file
            .head_name
            .as_deref()
            .or(file.base_name.as_deref())
            .unwrap_or_default();
        let side = |t: &Option<Totals>| t.as_ref().map_or("-".to_string(), coverage_label);
        writeln!(
            out,
            "{:<60} {:>10} {:>10} {:>10}",
            name,
            side(&file.base_totals),
            side(&file.compare_totals),
            side(&file.patch)
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_components(
    conn: &Connection,
    storage: &dyn ArchiveStorage,
    chunks_version: &str,
    repository: &str,
    commitid: &str,
    yaml_path: &Path,
    ids: &[String],
) -> Result<String> {
    let yaml = std::fs::read_to_string(yaml_path)
        .with_context(|| format!("Failed to read {}", yaml_path.display()))?;
    let all = components::parse_components(&yaml)?;
    let selected: Vec<&components::Component> = if ids.is_empty() {
        all.iter().collect()
    } else {
        components::select(&all, ids)
    };

    let service = ReportService::new(storage, conn).with_chunks_version(chunks_version);
    let (_, report) = load_report(&service, repository, commitid)?;

    if selected.is_empty() {
        return Ok("No components defined.\n".to_string());
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<20} {:<30} {:>6} {:>8} {:>10}",
        "COMPONENT", "NAME", "FILES", "LINES", "COVERAGE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(78)).unwrap();
    for component in selected {
        let flags = component.flags_for(&report);
        let flags = (!flags.is_empty()).then_some(flags.as_slice());
        let view = report.filter(flags, std::slice::from_ref(component))?;
        let totals = view.totals()?;
        writeln!(
            out,
            "{:<20} {:<30} {:>6} {:>8} {:>10}",
            component.component_id,
            component.name,
            totals.files,
            totals.lines,
            coverage_label(&totals)
        )
        .unwrap();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const CHUNKS: &str = "{}\n[1,null,[[0,1]],null]\n[0,null,[[0,0]],null]\n[\"1/2\",\"b\",[[0,\"1/2\"]],null]\n<<<<< end_of_chunk >>>>>\n{}\n[1,null,[[1,1]],null]\n[1,null,[[1,1]],null]";

    const INDEX: &str = r#"{
        "files": {
            "api/handlers.py": [0, null, null, null],
            "web/views.py": [1, null, null, null]
        },
        "sessions": {
            "0": {"f": ["unit"], "st": "uploaded"},
            "1": {"f": ["e2e"], "st": "uploaded"}
        }
    }"#;

    /// Create an in-memory database with schema initialized.
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn seed(conn: &mut Connection, storage: &MemoryStorage, commitid: &str, parent: Option<&str>) {
        let dir = tempfile::tempdir().unwrap();
        let chunks = dir.path().join("chunks.txt");
        let index = dir.path().join("report.json");
        std::fs::write(&chunks, CHUNKS).unwrap();
        std::fs::write(&index, INDEX).unwrap();
        let args = ImportArgs {
            repository: "acme/app",
            repo_hash: "HASH",
            commitid,
            parent,
            branch: Some("main"),
            chunks: &chunks,
            index: &index,
        };
        let out = cmd_import(conn, storage, "v4", &args).unwrap();
        assert!(out.contains("Imported 2 files and 2 sessions"));
    }

    #[test]
    fn test_format_line_ranges() {
        assert_eq!(format_line_ranges(&[1, 2, 3, 7, 9, 10]), "1-3, 7, 9-10");
        assert_eq!(format_line_ranges(&[]), "");
    }

    #[test]
    fn test_cmd_summary() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "abc", None);

        let out = cmd_summary(&conn, &storage, "v4", "acme/app", "abc", &[]).unwrap();
        assert!(out.contains("Files:      2"));
        assert!(out.contains("Lines:      3/5 (60.00000%)"));
        assert!(out.contains("Partials:   1"));
        assert!(out.contains("Branches:   1"));
        assert!(out.contains("Sessions:   2"));

        let unit = cmd_summary(&conn, &storage, "v4", "acme/app", "abc", &["unit".to_string()]).unwrap();
        assert!(unit.contains("Files:      1"));
        assert!(unit.contains("Lines:      1/3"));
    }

    #[test]
    fn test_cmd_summary_unknown_commit() {
        let conn = test_db();
        let storage = MemoryStorage::new();
        assert!(cmd_summary(&conn, &storage, "v4", "acme/app", "nope", &[]).is_err());
    }

    #[test]
    fn test_cmd_files_sorted_by_coverage() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "abc", None);

        let out = cmd_files(&conn, &storage, "v4", "acme/app", "abc", &[], true).unwrap();
        let api = out.find("api/handlers.py").unwrap();
        let web = out.find("web/views.py").unwrap();
        assert!(api < web);
        assert!(out.contains("100.00000%"));
    }

    #[test]
    fn test_cmd_lines() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "abc", None);

        let out = cmd_lines(&conn, &storage, "v4", "acme/app", "abc", "api/handlers.py", &[], false)
            .unwrap();
        assert!(out.contains("LINE"));
        assert!(out.contains("1/2"));
        assert!(out.contains("◐"));

        let missed = cmd_lines(&conn, &storage, "v4", "acme/app", "abc", "api/handlers.py", &[], true)
            .unwrap();
        assert!(missed.contains("2-3"));
        assert!(missed.contains("(2 lines)"));

        let covered = cmd_lines(&conn, &storage, "v4", "acme/app", "abc", "web/views.py", &[], true)
            .unwrap();
        assert!(covered.contains("All instrumentable lines are covered"));

        assert!(cmd_lines(&conn, &storage, "v4", "acme/app", "abc", "nope.py", &[], false).is_err());
    }

    #[test]
    fn test_cmd_tree_search() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "abc", None);

        let out = cmd_tree(&conn, &storage, "v4", "acme/app", "abc", &[], "", Some("views"), None)
            .unwrap();
        let nodes: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(nodes.as_array().unwrap().len(), 1);
        assert_eq!(nodes[0]["type"], "file");
        assert_eq!(nodes[0]["full_path"], "web/views.py");
    }

    #[test]
    fn test_cmd_compare_with_parent() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "base", None);
        seed(&mut conn, &storage, "head", Some("base"));

        let args = CompareArgs {
            repository: "acme/app",
            commitid: "head",
            base: None,
            first_pull: false,
            diff_text: None,
            path_prefix: None,
            save: true,
        };
        let out = cmd_compare(&conn, &storage, "v4", &args).unwrap();
        assert!(out.contains("Change:     +0.00"));
        assert!(out.contains("No impacted files."));
        assert!(out.contains("Saved impacted files to"));

        let impacted = cmd_impacted(&conn, &storage, "acme/app", "base", "head").unwrap();
        assert!(impacted.contains("No impacted files."));

        let orphan = CompareArgs {
            commitid: "base",
            save: false,
            ..args
        };
        let out = cmd_compare(&conn, &storage, "v4", &orphan).unwrap();
        assert!(out.contains("has no parent commit"));
    }

    #[test]
    fn test_cmd_compare_pull_outcomes() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "head", None);

        let mut args = CompareArgs {
            repository: "acme/app",
            commitid: "head",
            base: None,
            first_pull: true,
            diff_text: None,
            path_prefix: None,
            save: false,
        };
        let out = cmd_compare(&conn, &storage, "v4", &args).unwrap();
        assert!(out.contains("First pull request"));

        args.first_pull = false;
        args.base = Some("unknown");
        let out = cmd_compare(&conn, &storage, "v4", &args).unwrap();
        assert!(out.contains("Missing base commit"));
    }

    #[test]
    fn test_cmd_components() {
        let mut conn = test_db();
        let storage = MemoryStorage::new();
        seed(&mut conn, &storage, "abc", None);

        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("codecov.yml");
        std::fs::write(
            &yaml,
            "component_management:\n  individual_components:\n    - component_id: api\n      name: API\n      paths: [\"^api/\"]\n    - component_id: broken\n      paths: [\"(\"]\n",
        )
        .unwrap();

        let out = cmd_components(&conn, &storage, "v4", "acme/app", "abc", &yaml, &[]).unwrap();
        assert!(out.contains("api"));
        assert!(out.contains("API"));
        assert!(out.contains("33.33333%"));
        assert!(!out.contains("broken"));
    }
}
