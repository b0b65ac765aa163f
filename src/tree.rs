//! File tree views of a report: nested directories with aggregated coverage,
//! optionally scoped to a path prefix, or a flat list of search matches.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::model::{percent, Totals};
use crate::report::Report;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OrderingParameter {
    #[default]
    Name,
    Coverage,
    Hits,
    Misses,
    Partials,
    Lines,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OrderingDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct TreeFilters {
    pub search_value: Option<String>,
    pub ordering: Option<(OrderingParameter, OrderingDirection)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeFile {
    pub name: String,
    pub full_path: String,
    pub hits: u64,
    pub misses: u64,
    pub partials: u64,
    pub lines: u64,
    pub coverage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeDir {
    pub name: String,
    pub full_path: String,
    pub hits: u64,
    pub misses: u64,
    pub partials: u64,
    pub lines: u64,
    pub coverage: Option<f64>,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    File(TreeFile),
    Dir(TreeDir),
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::File(f) => &f.name,
            TreeNode::Dir(d) => &d.name,
        }
    }

    pub fn full_path(&self) -> &str {
        match self {
            TreeNode::File(f) => &f.full_path,
            TreeNode::Dir(d) => &d.full_path,
        }
    }

    pub fn hits(&self) -> u64 {
        match self {
            TreeNode::File(f) => f.hits,
            TreeNode::Dir(d) => d.hits,
        }
    }

    pub fn misses(&self) -> u64 {
        match self {
            TreeNode::File(f) => f.misses,
            TreeNode::Dir(d) => d.misses,
        }
    }

    pub fn partials(&self) -> u64 {
        match self {
            TreeNode::File(f) => f.partials,
            TreeNode::Dir(d) => d.partials,
        }
    }

    pub fn lines(&self) -> u64 {
        match self {
            TreeNode::File(f) => f.lines,
            TreeNode::Dir(d) => d.lines,
        }
    }

    pub fn coverage(&self) -> Option<f64> {
        match self {
            TreeNode::File(f) => f.coverage,
            TreeNode::Dir(d) => d.coverage,
        }
    }
}

fn tree_file(name: &str, full_path: &str, totals: &Totals) -> TreeFile {
    TreeFile {
        name: name.to_string(),
        full_path: full_path.to_string(),
        hits: totals.hits,
        misses: totals.misses,
        partials: totals.partials,
        lines: totals.lines,
        coverage: percent(totals.hits, totals.lines),
    }
}

/// Build the tree of `paths` as seen by `report`.
///
/// With a search value the result is a flat list of matching files. Otherwise
/// files under `path_prefix` (all files when it is empty) are nested by
/// directory. Paths the report has no coverage for are left out.
pub fn build_tree<S: AsRef<str>>(
    paths: &[S],
    path_prefix: &str,
    filters: &TreeFilters,
    report: &Report,
) -> Result<Vec<TreeNode>> {
    let mut nodes = match filters.search_value.as_deref() {
        Some(search) if !search.is_empty() => search_tree(paths, search, report)?,
        _ => {
            let prefix = path_prefix.trim_matches('/');
            let entries = if prefix.is_empty() {
                let mut entries = Vec::with_capacity(paths.len());
                for path in paths {
                    let path = path.as_ref();
                    if let Some(totals) = report.file_totals(path)? {
                        entries.push(PathEntry {
                            relative: path.to_string(),
                            full_path: path.to_string(),
                            totals,
                        });
                    }
                }
                entries
            } else {
                filter_files_by_path(paths, prefix, report)?
            };
            build_path_tree(entries, prefix)
        }
    };
    sort_nodes(&mut nodes, filters.ordering.unwrap_or_default());
    Ok(nodes)
}

/// Flat list of files whose path contains `search`, case-insensitively.
pub fn search_tree<S: AsRef<str>>(paths: &[S], search: &str, report: &Report) -> Result<Vec<TreeNode>> {
    let needle = search.to_lowercase();
    let mut nodes = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.to_lowercase().contains(&needle) {
            continue;
        }
        if let Some(totals) = report.file_totals(path)? {
            let name = path.rsplit('/').next().unwrap_or(path);
            nodes.push(TreeNode::File(tree_file(name, path, &totals)));
        }
    }
    Ok(nodes)
}

struct PathEntry {
    /// Path below the tree root.
    relative: String,
    full_path: String,
    totals: Totals,
}

fn filter_files_by_path<S: AsRef<str>>(paths: &[S], prefix: &str, report: &Report) -> Result<Vec<PathEntry>> {
    let mut entries = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let Some(relative) = path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            continue;
        };
        if let Some(totals) = report.file_totals(path)? {
            entries.push(PathEntry {
                relative: relative.to_string(),
                full_path: path.to_string(),
                totals,
            });
        }
    }
    Ok(entries)
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

fn build_path_tree(entries: Vec<PathEntry>, base: &str) -> Vec<TreeNode> {
    let mut nodes = Vec::new();
    let mut dirs: BTreeMap<String, Vec<PathEntry>> = BTreeMap::new();

    for entry in entries {
        match entry.relative.split_once('/') {
            Some((dir, rest)) => {
                let (dir, rest) = (dir.to_string(), rest.to_string());
                dirs.entry(dir).or_default().push(PathEntry {
                    relative: rest,
                    full_path: entry.full_path,
                    totals: entry.totals,
                });
            }
            None => nodes.push(TreeNode::File(tree_file(
                &entry.relative,
                &entry.full_path,
                &entry.totals,
            ))),
        }
    }

    for (name, children) in dirs {
        let full_path = join_path(base, &name);
        let children = build_path_tree(children, &full_path);
        let hits = children.iter().map(TreeNode::hits).sum();
        let misses = children.iter().map(TreeNode::misses).sum();
        let partials = children.iter().map(TreeNode::partials).sum();
        let lines = children.iter().map(TreeNode::lines).sum();
        nodes.push(TreeNode::Dir(TreeDir {
            name,
            full_path,
            hits,
            misses,
            partials,
            lines,
            coverage: percent(hits, lines),
            children,
        }));
    }
    nodes
}

fn compare_nodes(a: &TreeNode, b: &TreeNode, parameter: OrderingParameter) -> Ordering {
    let by_key = match parameter {
        OrderingParameter::Name => Ordering::Equal,
        OrderingParameter::Coverage => a
            .coverage()
            .unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&b.coverage().unwrap_or(f64::NEG_INFINITY)),
        OrderingParameter::Hits => a.hits().cmp(&b.hits()),
        OrderingParameter::Misses => a.misses().cmp(&b.misses()),
        OrderingParameter::Partials => a.partials().cmp(&b.partials()),
        OrderingParameter::Lines => a.lines().cmp(&b.lines()),
    };
    by_key
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.full_path().cmp(b.full_path()))
}

/// Sort siblings at every level. Files without lines sort lowest by coverage.
fn sort_nodes(nodes: &mut [TreeNode], (parameter, direction): (OrderingParameter, OrderingDirection)) {
    nodes.sort_by(|a, b| {
        let ordering = compare_nodes(a, b, parameter);
        match direction {
            OrderingDirection::Asc => ordering,
            OrderingDirection::Desc => ordering.reverse(),
        }
    });
    for node in nodes.iter_mut() {
        if let TreeNode::Dir(dir) = node {
            sort_nodes(&mut dir.children, (parameter, direction));
        }
    }
}
