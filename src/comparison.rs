//! Compare two reports: coverage deltas, per-file changes, patch coverage
//! over a diff, and the precomputed impacted-files payload.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::builder::ReportService;
use crate::diff::{FilePatch, PatchStatus};
use crate::error::Result;
use crate::model::{Commit, Totals};
use crate::report::Report;
use crate::storage::ArchiveStorage;

/// Head coverage minus base coverage, or `None` when either side has no
/// coverage value.
#[must_use]
pub fn change_with_parent(totals: &Totals, parent_totals: Option<&Totals>) -> Option<f64> {
    let base = parent_totals?.coverage_f64()?;
    let head = totals.coverage_f64()?;
    Some(head - base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Added,
    Removed,
    Modified,
    /// Not in the diff; coverage may still have moved.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileComparison {
    pub path: String,
    /// Path on the base side when the file was renamed.
    pub base_path: Option<String>,
    pub change: FileChange,
    pub base_totals: Option<Totals>,
    pub head_totals: Option<Totals>,
    /// Totals over the head lines the diff added. `None` without a diff entry.
    pub patch: Option<Totals>,
}

impl FileComparison {
    pub fn coverage_change(&self) -> Option<f64> {
        change_with_parent(self.head_totals.as_ref()?, self.base_totals.as_ref())
    }

    /// True when the diff touched the file or its line outcomes moved.
    pub fn is_impacted(&self) -> bool {
        if self.change != FileChange::Unchanged {
            return true;
        }
        let outcome = |t: &Option<Totals>| t.as_ref().map(|t| (t.lines, t.hits, t.misses, t.partials));
        outcome(&self.base_totals) != outcome(&self.head_totals)
    }
}

/// Result of comparing a base report with a head report.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub base_totals: Totals,
    /// Head totals; `diff` holds the patch totals when a diff was supplied.
    pub head_totals: Totals,
    /// Every file of either report: head order first, then base-only files.
    pub files: Vec<FileComparison>,
}

impl Comparison {
    pub fn change(&self) -> Option<f64> {
        change_with_parent(&self.head_totals, Some(&self.base_totals))
    }

    pub fn patch_totals(&self) -> Option<&Totals> {
        self.head_totals.diff.as_deref()
    }

    pub fn get(&self, path: &str) -> Option<&FileComparison> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn impacted(&self) -> impl Iterator<Item = &FileComparison> {
        self.files.iter().filter(|f| f.is_impacted())
    }
}

/// Compare `base` with `head`. When `patches` is given, patch totals are
/// computed over the added lines of each file and files are classified by
/// what the diff did to them.
pub fn compare_reports(base: &Report, head: &Report, patches: Option<&[FilePatch]>) -> Result<Comparison> {
    let by_path: HashMap<&str, &FilePatch> = patches
        .unwrap_or_default()
        .iter()
        .map(|p| (p.path.as_str(), p))
        .collect();

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut files = Vec::new();
    let mut patch_totals = Totals::default();

    for path in head.paths() {
        let patch = by_path.get(path).copied();
        let base_path = patch.map_or(path, FilePatch::base_path);
        seen.insert(base_path.to_string());
        seen.insert(path.to_string());

        let head_totals = head.file_totals(path)?;
        let base_totals = base.file_totals(base_path)?;
        let patch_coverage = match patch {
            Some(patch) => {
                let mut totals = match head.get(path)? {
                    Some(file) => Totals::from_lines(
                        patch.added_lines.iter().filter_map(|n| file.get(*n)),
                    ),
                    None => Totals::default(),
                };
                totals.files = u64::from(totals.lines > 0);
                patch_totals.accumulate(&totals);
                Some(totals)
            }
            None => None,
        };
        let change = match patch.map(|p| p.status) {
            Some(PatchStatus::Added) => FileChange::Added,
            Some(PatchStatus::Removed) => FileChange::Removed,
            Some(_) => FileChange::Modified,
            None if base_totals.is_none() => FileChange::Added,
            None => FileChange::Unchanged,
        };
        files.push(FileComparison {
            path: path.to_string(),
            base_path: (base_path != path).then(|| base_path.to_string()),
            change,
            base_totals,
            head_totals,
            patch: patch_coverage,
        });
    }

    for path in base.paths() {
        if seen.contains(path) {
            continue;
        }
        // A deleted file has no added lines, so its patch totals stay empty.
        let removed_by_diff = by_path
            .get(path)
            .is_some_and(|p| p.status == PatchStatus::Removed);
        files.push(FileComparison {
            path: path.to_string(),
            base_path: None,
            change: FileChange::Removed,
            base_totals: base.file_totals(path)?,
            head_totals: None,
            patch: removed_by_diff.then(Totals::default),
        });
    }
    files.retain(|f| f.base_totals.is_some() || f.head_totals.is_some());

    let mut head_totals = head.totals()?;
    if patches.is_some() {
        patch_totals.refresh_coverage();
        head_totals.diff = Some(Box::new(patch_totals));
    }

    Ok(Comparison {
        base_totals: base.totals()?,
        head_totals,
        files,
    })
}

/// Compare `commit` with its parent. `None` when no parent is recorded; a
/// side whose report has not been processed compares as empty.
pub fn compare_commit_with_parent(
    service: &ReportService<'_>,
    commit: &Commit,
    patches: Option<&[FilePatch]>,
) -> Result<Option<Comparison>> {
    let Some(parent) = service.store().get_parent_commit(commit)? else {
        return Ok(None);
    };
    let head = service
        .build_report_from_commit(commit)?
        .unwrap_or_else(Report::empty);
    let base = service
        .build_report_from_commit(&parent)?
        .unwrap_or_else(Report::empty);
    compare_reports(&base, &head, patches).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Base,
    Head,
}

/// Outcome of comparing a pull request's base and head.
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonOutcome {
    Ready(Comparison),
    FirstPullRequest,
    MissingBaseCommit,
    MissingHeadCommit,
    MissingReport(Side),
}

/// A pull request's comparison target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullComparison {
    pub repository: String,
    pub base_commitid: Option<String>,
    pub head_commitid: Option<String>,
    /// The author's first pull request to the repository.
    pub is_first_pull: bool,
}

impl PullComparison {
    pub fn resolve(
        &self,
        service: &ReportService<'_>,
        patches: Option<&[FilePatch]>,
    ) -> Result<ComparisonOutcome> {
        let store = service.store();
        let base = match &self.base_commitid {
            Some(sha) => store.get_commit(&self.repository, sha)?,
            None => None,
        };
        let Some(base) = base else {
            return Ok(if self.is_first_pull {
                ComparisonOutcome::FirstPullRequest
            } else {
                ComparisonOutcome::MissingBaseCommit
            });
        };
        let head = match &self.head_commitid {
            Some(sha) => store.get_commit(&self.repository, sha)?,
            None => None,
        };
        let Some(head) = head else {
            return Ok(ComparisonOutcome::MissingHeadCommit);
        };

        let Some(head_report) = service.build_report_from_commit(&head)? else {
            return Ok(ComparisonOutcome::MissingReport(Side::Head));
        };
        let Some(base_report) = service.build_report_from_commit(&base)? else {
            return Ok(ComparisonOutcome::MissingReport(Side::Base));
        };
        compare_reports(&base_report, &head_report, patches).map(ComparisonOutcome::Ready)
    }
}

/// Where a precomputed comparison payload lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRecord {
    pub base_commitid: String,
    pub compare_commitid: String,
    pub report_storage_path: Option<String>,
}

/// One entry of the impacted-files payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactedFile {
    pub base_name: Option<String>,
    pub head_name: Option<String>,
    #[serde(default)]
    pub base_totals: Option<Totals>,
    #[serde(default)]
    pub compare_totals: Option<Totals>,
    #[serde(default)]
    pub patch: Option<Totals>,
    #[serde(default)]
    pub file_was_added_by_diff: bool,
    #[serde(default)]
    pub file_was_removed_by_diff: bool,
}

impl From<&FileComparison> for ImpactedFile {
    fn from(file: &FileComparison) -> Self {
        let base_name = match file.change {
            FileChange::Added => None,
            _ => Some(file.base_path.clone().unwrap_or_else(|| file.path.clone())),
        };
        let head_name = match file.change {
            FileChange::Removed => None,
            _ => Some(file.path.clone()),
        };
        ImpactedFile {
            base_name,
            head_name,
            base_totals: file.base_totals.clone(),
            compare_totals: file.head_totals.clone(),
            patch: file.patch.clone(),
            file_was_added_by_diff: file.change == FileChange::Added && file.patch.is_some(),
            file_was_removed_by_diff: file.change == FileChange::Removed && file.patch.is_some(),
        }
    }
}

/// The impacted-files payload for `comparison`.
#[must_use]
pub fn impacted_files_json(comparison: &Comparison) -> Value {
    let files: Vec<ImpactedFile> = comparison.impacted().map(ImpactedFile::from).collect();
    json!({ "files": files })
}

/// Read the impacted files precomputed for `record`.
///
/// Missing, unreadable or undecodable payloads yield an empty list.
pub fn get_impacted_files(storage: &dyn ArchiveStorage, record: &ComparisonRecord) -> Vec<ImpactedFile> {
    let Some(path) = record.report_storage_path.as_deref() else {
        return Vec::new();
    };
    let bytes = match storage.read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path, "failed to read impacted files: {e}");
            return Vec::new();
        }
    };

    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        files: Vec<ImpactedFile>,
    }
    match serde_json::from_slice::<Payload>(&bytes) {
        Ok(payload) => payload.files,
        Err(e) => {
            tracing::warn!(path, "failed to decode impacted files: {e}");
            Vec::new()
        }
    }
}
