/// Parse unified diffs to find which lines a change touched in each file.
/// Used for patch coverage: how many of the added lines are covered.
///
/// Also provides a [`DiffSource`] trait that abstracts over different
/// ways to obtain a diff (a file, stdin, git).
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// Diff sources
// ---------------------------------------------------------------------------

/// A source for obtaining a unified diff.
pub trait DiffSource {
    /// Fetch the diff text.
    fn fetch_diff(&self) -> Result<String>;
}

/// Diff from stdin.
pub struct StdinDiff;

impl DiffSource for StdinDiff {
    fn fetch_diff(&self) -> Result<String> {
        std::io::read_to_string(std::io::stdin()).context("Failed to read diff from stdin")
    }
}

/// Diff saved to a file.
pub struct FileDiff {
    pub path: PathBuf,
}

impl DiffSource for FileDiff {
    fn fetch_diff(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read diff from {}", self.path.display()))
    }
}

/// Diff from a git command (e.g., `git diff HEAD~1`).
pub struct GitDiff {
    /// Arguments to pass to `git diff`.
    pub args: String,
}

impl DiffSource for GitDiff {
    fn fetch_diff(&self) -> Result<String> {
        let diff_args: Vec<&str> = self.args.split_whitespace().collect();
        let output = Command::new("git")
            .arg("diff")
            .args(&diff_args)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git diff failed: {stderr}");
        }

        String::from_utf8(output.stdout).context("git diff output not valid UTF-8")
    }
}

// ---------------------------------------------------------------------------
// Diff parsing
// ---------------------------------------------------------------------------

/// What a diff did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Added,
    Removed,
    Modified,
    Renamed,
}

/// One file's section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Path in the new tree (the old path for removed files).
    pub path: String,
    /// Path in the old tree when it differs from `path`.
    pub old_path: Option<String>,
    pub status: PatchStatus,
    /// Added line numbers in the new file, ascending.
    pub added_lines: Vec<u32>,
    /// Removed line numbers in the old file, ascending.
    pub removed_lines: Vec<u32>,
}

impl FilePatch {
    fn new() -> Self {
        Self {
            path: String::new(),
            old_path: None,
            status: PatchStatus::Modified,
            added_lines: Vec::new(),
            removed_lines: Vec::new(),
        }
    }

    /// The path this file had before the change.
    pub fn base_path(&self) -> &str {
        self.old_path.as_deref().unwrap_or(&self.path)
    }
}

fn strip_vcs_prefix(path: &str) -> &str {
    // "b/" (default git), "a/" (some tools); --no-prefix diffs have neither.
    let path = path.split('\t').next().unwrap_or(path);
    path.strip_prefix("b/")
        .or_else(|| path.strip_prefix("a/"))
        .unwrap_or(path)
}

#[derive(Default)]
struct PatchBuilder {
    patches: Vec<FilePatch>,
    current: Option<FilePatch>,
    old_line: u32,
    new_line: u32,
    old_remaining: u32,
    new_remaining: u32,
}

impl PatchBuilder {
    fn in_hunk(&self) -> bool {
        self.old_remaining > 0 || self.new_remaining > 0
    }

    fn start_file(&mut self) -> &mut FilePatch {
        self.finish_file();
        self.current.insert(FilePatch::new())
    }

    fn finish_file(&mut self) {
        if let Some(mut patch) = self.current.take() {
            if patch.path.is_empty() {
                match patch.old_path.take() {
                    Some(old) => patch.path = old,
                    None => return,
                }
            }
            if patch.old_path.as_deref() == Some(patch.path.as_str()) {
                patch.old_path = None;
            }
            self.patches.push(patch);
        }
        self.old_remaining = 0;
        self.new_remaining = 0;
    }

    fn body_line(&mut self, line: &str) {
        let Some(patch) = self.current.as_mut() else {
            return;
        };
        if line.starts_with('\\') {
            // "\ No newline at end of file" is diff metadata, not a real line.
            return;
        }
        if line.starts_with('+') {
            patch.added_lines.push(self.new_line);
            self.new_line += 1;
            self.new_remaining = self.new_remaining.saturating_sub(1);
        } else if line.starts_with('-') {
            patch.removed_lines.push(self.old_line);
            self.old_line += 1;
            self.old_remaining = self.old_remaining.saturating_sub(1);
        } else {
            self.old_line += 1;
            self.new_line += 1;
            self.old_remaining = self.old_remaining.saturating_sub(1);
            self.new_remaining = self.new_remaining.saturating_sub(1);
        }
    }

    fn header_line(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let patch = self.start_file();
            if let Some((_, new)) = rest.split_once(" b/") {
                patch.path = new.to_string();
            }
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let fresh = self
                .current
                .as_ref()
                .map_or(true, |p| !p.added_lines.is_empty() || !p.removed_lines.is_empty());
            if fresh {
                self.start_file();
            }
            if let Some(patch) = self.current.as_mut() {
                if rest == "/dev/null" {
                    patch.status = PatchStatus::Added;
                    patch.old_path = None;
                } else {
                    patch.old_path = Some(strip_vcs_prefix(rest).to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(patch) = self.current.as_mut() {
                if rest == "/dev/null" {
                    patch.status = PatchStatus::Removed;
                    if let Some(old) = patch.old_path.take() {
                        patch.path = old;
                    }
                } else {
                    patch.path = strip_vcs_prefix(rest).to_string();
                }
            }
        } else if line.starts_with("new file mode") {
            if let Some(patch) = self.current.as_mut() {
                patch.status = PatchStatus::Added;
            }
        } else if line.starts_with("deleted file mode") {
            if let Some(patch) = self.current.as_mut() {
                patch.status = PatchStatus::Removed;
            }
        } else if let Some(from) = line.strip_prefix("rename from ") {
            if let Some(patch) = self.current.as_mut() {
                patch.status = PatchStatus::Renamed;
                patch.old_path = Some(from.to_string());
            }
        } else if let Some(to) = line.strip_prefix("rename to ") {
            if let Some(patch) = self.current.as_mut() {
                patch.status = PatchStatus::Renamed;
                patch.path = to.to_string();
            }
        } else if line.starts_with("@@ ") {
            if let Some(hunk) = parse_hunk_ranges(line) {
                self.old_line = hunk.old_start;
                self.new_line = hunk.new_start;
                self.old_remaining = hunk.old_count;
                self.new_remaining = hunk.new_count;
            }
        }
    }
}

/// Prepend a path prefix to every path in parsed patches.
pub fn apply_path_prefix(patches: Vec<FilePatch>, prefix: &str) -> Vec<FilePatch> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return patches;
    }
    patches
        .into_iter()
        .map(|mut patch| {
            patch.path = format!("{prefix}/{}", patch.path);
            patch.old_path = patch.old_path.map(|old| format!("{prefix}/{old}"));
            patch
        })
        .collect()
}

/// Parse a unified diff into one [`FilePatch`] per file, in diff order.
pub fn parse_patch(diff_text: &str) -> Vec<FilePatch> {
    let mut builder = PatchBuilder::default();
    for line in diff_text.lines() {
        if builder.in_hunk() {
            builder.body_line(line);
        } else if line.starts_with('\\') {
            continue;
        } else {
            builder.header_line(line);
        }
    }
    builder.finish_file();
    builder.patches
}

/// Parse a unified diff (e.g., `git diff`) and return a map of
/// file path -> list of added line numbers (in the new file).
/// Files without added lines are left out.
pub fn parse_diff(diff_text: &str) -> HashMap<String, Vec<u32>> {
    parse_patch(diff_text)
        .into_iter()
        .filter(|p| p.status != PatchStatus::Removed && !p.added_lines.is_empty())
        .map(|p| (p.path, p.added_lines))
        .collect()
}

struct HunkRanges {
    old_start: u32,
    old_count: u32,
    new_start: u32,
    new_count: u32,
}

fn parse_range(part: &str) -> Option<(u32, u32)> {
    let mut fields = part.splitn(2, ',');
    let start = fields.next()?.parse::<u32>().ok()?;
    let count = match fields.next() {
        Some(count) => count.parse::<u32>().ok()?,
        None => 1,
    };
    Some((start, count))
}

/// Parse a hunk header like "@@ -10,5 +20,8 @@".
fn parse_hunk_ranges(line: &str) -> Option<HunkRanges> {
    let after_at = line.strip_prefix("@@ ")?;
    let mut parts = after_at.split(' ');
    let (old_start, old_count) = parse_range(parts.next()?.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(parts.next()?.strip_prefix('+')?)?;
    Some(HunkRanges {
        old_start,
        old_count,
        new_start,
        new_count,
    })
}
