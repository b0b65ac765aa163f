//! The `Report` aggregate: files, sessions and totals for one commit.
//!
//! File bodies are materialized lazily. A report keeps the raw chunks blob in
//! a shared [`ChunkArena`] and one slot per indexed file; a slot is decoded
//! the first time its lines or totals are needed. Filtered views share the
//! arena with the report they were derived from.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};

use crate::chunks;
use crate::components::Component;
use crate::error::{ReportError, Result};
use crate::model::{ReportLine, Session, Totals};

/// Coverage for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportFile {
    name: String,
    header: Map<String, Value>,
    lines: Vec<ReportLine>,
    totals: Totals,
}

impl ReportFile {
    /// Build a file from its lines. Lines are ordered by number; a repeated
    /// line number keeps the last entry.
    pub fn new(name: impl Into<String>, header: Map<String, Value>, mut lines: Vec<ReportLine>) -> Self {
        lines.sort_by_key(|l| l.number);
        lines.reverse();
        lines.dedup_by_key(|l| l.number);
        lines.reverse();
        let totals = Totals::from_lines(&lines);
        Self {
            name: name.into(),
            header,
            lines,
            totals,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Look up a line by its 1-based number.
    pub fn get(&self, number: u32) -> Option<&ReportLine> {
        self.lines
            .binary_search_by_key(&number, |l| l.number)
            .ok()
            .map(|i| &self.lines[i])
    }
}

/// Which sessions contribute to a report view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionSelection {
    /// Every session; lines without session data keep their stored coverage.
    #[default]
    All,
    /// Only these session ids. Lines left without a session are dropped.
    Only(BTreeSet<u32>),
}

impl SessionSelection {
    pub fn contains(&self, id: u32) -> bool {
        match self {
            SessionSelection::All => true,
            SessionSelection::Only(ids) => ids.contains(&id),
        }
    }

    /// Apply the selection to a decoded line, recomputing its coverage from
    /// the surviving sessions.
    pub fn apply(&self, line: &ReportLine) -> Option<ReportLine> {
        if line.sessions.is_empty() {
            return match self {
                SessionSelection::All => Some(line.clone()),
                SessionSelection::Only(_) => None,
            };
        }
        line.retain_sessions(|id| self.contains(id))
    }
}

/// A chunks blob and the byte range of every section inside it.
#[derive(Debug)]
pub struct ChunkArena {
    text: String,
    ranges: Vec<Range<usize>>,
}

impl ChunkArena {
    /// Split `text` into `expected` sections, failing on a delimiter mismatch.
    pub fn new(text: String, expected: usize) -> Result<Self> {
        let base = text.as_ptr() as usize;
        let ranges = chunks::split(&text, expected)?
            .into_iter()
            .map(|section| {
                let start = section.as_ptr() as usize - base;
                start..start + section.len()
            })
            .collect();
        Ok(Self { text, ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn section(&self, index: usize) -> Option<&str> {
        self.ranges.get(index).map(|r| &self.text[r.clone()])
    }
}

/// An indexed file known to a report before its chunk is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub chunk: usize,
    /// Totals recorded at write time, valid only for the unfiltered report.
    pub totals: Option<Totals>,
}

#[derive(Debug)]
struct FileSlot {
    entry: FileEntry,
    parsed: OnceLock<ReportFile>,
}

impl FileSlot {
    fn fresh(entry: FileEntry) -> Self {
        Self {
            entry,
            parsed: OnceLock::new(),
        }
    }
}

/// A commit's coverage report, or a filtered view of one.
#[derive(Debug)]
pub struct Report {
    arena: Arc<ChunkArena>,
    slots: Vec<FileSlot>,
    index: HashMap<String, usize>,
    sessions: Arc<BTreeMap<u32, Session>>,
    selection: SessionSelection,
}

impl Report {
    /// An empty report with no files and no sessions.
    pub fn empty() -> Self {
        Self {
            arena: Arc::new(ChunkArena {
                text: String::new(),
                ranges: Vec::new(),
            }),
            slots: Vec::new(),
            index: HashMap::new(),
            sessions: Arc::new(BTreeMap::new()),
            selection: SessionSelection::All,
        }
    }

    /// Wrap a chunks blob. `files` must be in index order and their `chunk`
    /// positions must address sections of `text`.
    pub fn from_chunks(
        text: String,
        files: Vec<FileEntry>,
        sessions: BTreeMap<u32, Session>,
        selection: SessionSelection,
    ) -> Result<Self> {
        let arena = ChunkArena::new(text, files.len())?;
        if let Some(bad) = files.iter().find(|f| f.chunk >= arena.len()) {
            return Err(ReportError::malformed(format!(
                "file '{}' points at chunk {} of {}",
                bad.path,
                bad.chunk,
                arena.len()
            )));
        }
        Ok(Self::assemble(Arc::new(arena), files, Arc::new(sessions), selection))
    }

    /// Build a report from already materialized files. A repeated path keeps
    /// its first position and its last body.
    pub fn from_files(files: Vec<ReportFile>, sessions: BTreeMap<u32, Session>) -> Self {
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(files.len());
        let mut unique: Vec<ReportFile> = Vec::with_capacity(files.len());
        for file in files {
            match positions.get(file.name()) {
                Some(&i) => unique[i] = file,
                None => {
                    positions.insert(file.name().to_string(), unique.len());
                    unique.push(file);
                }
            }
        }
        let files = unique;
        let sections: Vec<String> = files.iter().map(chunks::encode).collect();
        let text = chunks::join(&sections);
        let arena = ChunkArena {
            ranges: section_ranges(&sections),
            text,
        };
        let mut report = Self::assemble(
            Arc::new(arena),
            files
                .iter()
                .enumerate()
                .map(|(i, f)| FileEntry {
                    path: f.name().to_string(),
                    chunk: i,
                    totals: Some(f.totals().clone()),
                })
                .collect(),
            Arc::new(sessions),
            SessionSelection::All,
        );
        for (slot, file) in report.slots.iter_mut().zip(files) {
            slot.parsed = OnceLock::from(file);
        }
        report
    }

    fn assemble(
        arena: Arc<ChunkArena>,
        files: Vec<FileEntry>,
        sessions: Arc<BTreeMap<u32, Session>>,
        selection: SessionSelection,
    ) -> Self {
        let mut slots: Vec<FileSlot> = Vec::with_capacity(files.len());
        let mut index = HashMap::with_capacity(files.len());
        for entry in files {
            if let Some(&existing) = index.get(&entry.path) {
                slots[existing] = FileSlot::fresh(entry);
                continue;
            }
            index.insert(entry.path.clone(), slots.len());
            slots.push(FileSlot::fresh(entry));
        }
        Self {
            arena,
            slots,
            index,
            sessions,
            selection,
        }
    }

    /// Every indexed path in index order, including files a filtered view
    /// may leave empty.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.entry.path.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn selection(&self) -> &SessionSelection {
        &self.selection
    }

    /// Sessions contributing to this view, in id order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .values()
            .filter(move |s| self.selection.contains(s.id))
    }

    pub fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id).filter(|s| self.selection.contains(s.id))
    }

    fn materialize<'a>(&'a self, slot: &'a FileSlot) -> Result<&'a ReportFile> {
        if let Some(file) = slot.parsed.get() {
            return Ok(file);
        }
        let section = self.arena.section(slot.entry.chunk).ok_or_else(|| {
            ReportError::malformed(format!("missing chunk {}", slot.entry.chunk))
        })?;
        let decoded = chunks::parse_section(section).map_err(|e| {
            tracing::error!(path = %slot.entry.path, chunk = slot.entry.chunk, "{e}");
            e.in_chunk(slot.entry.chunk)
        })?;
        let lines: Vec<ReportLine> = decoded
            .lines
            .iter()
            .filter_map(|line| self.selection.apply(line))
            .collect();
        let file = ReportFile::new(slot.entry.path.clone(), decoded.header, lines);
        let _ = slot.parsed.set(file);
        slot.parsed
            .get()
            .ok_or_else(|| ReportError::Other("file slot not initialized".to_string()))
    }

    /// The fully materialized file at `path`, or `None` when the path is not
    /// in the report or has no lines in this view.
    pub fn get(&self, path: &str) -> Result<Option<&ReportFile>> {
        let Some(&i) = self.index.get(path) else {
            return Ok(None);
        };
        let file = self.materialize(&self.slots[i])?;
        Ok((!file.is_empty()).then_some(file))
    }

    /// All non-empty files, materialized, in index order.
    pub fn files(&self) -> Result<Vec<&ReportFile>> {
        let mut files = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let file = self.materialize(slot)?;
            if !file.is_empty() {
                files.push(file);
            }
        }
        Ok(files)
    }

    /// Totals for one file, read from the index when the view is unfiltered
    /// and the file has not been decoded yet.
    pub fn file_totals(&self, path: &str) -> Result<Option<Totals>> {
        let Some(&i) = self.index.get(path) else {
            return Ok(None);
        };
        let slot = &self.slots[i];
        if slot.parsed.get().is_none() && self.selection == SessionSelection::All {
            if let Some(totals) = &slot.entry.totals {
                return Ok(Some(totals.clone()));
            }
        }
        let file = self.materialize(slot)?;
        Ok((!file.is_empty()).then(|| file.totals().clone()))
    }

    /// Report-level totals: the fold of every file's totals.
    pub fn totals(&self) -> Result<Totals> {
        let mut totals = Totals::default();
        let mut files = 0;
        for slot in &self.slots {
            if let Some(file_totals) = self.file_totals(&slot.entry.path)? {
                totals.accumulate(&file_totals);
                if file_totals.lines > 0 {
                    files += 1;
                }
            }
        }
        // Per-file index totals carry `files = 0`.
        totals.files = files;
        totals.sessions = self.sessions().count() as u64;
        totals.refresh_coverage();
        Ok(totals)
    }

    /// Session ids tagged with any of `flags`, restricted to this view.
    pub fn sessions_with_flags<S: AsRef<str>>(&self, flags: &[S]) -> BTreeSet<u32> {
        self.sessions()
            .filter(|s| s.has_any_flag(flags))
            .map(|s| s.id)
            .collect()
    }

    /// Paths of files with at least one line seen by a session tagged with
    /// any of `flags`, in index order.
    pub fn files_belonging_to_flags<S: AsRef<str>>(&self, flags: &[S]) -> Result<Vec<String>> {
        let tagged = self.sessions_with_flags(flags);
        if tagged.is_empty() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for file in self.files()? {
            let touched = file
                .lines()
                .iter()
                .any(|line| line.sessions.iter().any(|s| tagged.contains(&s.id)));
            if touched {
                paths.push(file.name().to_string());
            }
        }
        Ok(paths)
    }

    /// Derive a narrower view.
    ///
    /// `flags` keeps only sessions tagged with one of them; line coverage is
    /// recomputed from the surviving sessions. `components` keeps only files
    /// belonging to at least one of the components. The source report is
    /// left untouched and no chunk data is re-read from storage.
    pub fn filter(&self, flags: Option<&[String]>, components: &[Component]) -> Result<Report> {
        let selection = match flags {
            Some(flags) => SessionSelection::Only(self.sessions_with_flags(flags)),
            None => self.selection.clone(),
        };

        let allowed: Option<BTreeSet<String>> = if components.is_empty() {
            None
        } else {
            let mut allowed = BTreeSet::new();
            for component in components {
                allowed.extend(component.files(self)?);
            }
            Some(allowed)
        };

        let entries: Vec<FileEntry> = self
            .slots
            .iter()
            .filter(|s| allowed.as_ref().map_or(true, |a| a.contains(&s.entry.path)))
            .map(|s| FileEntry {
                totals: None,
                ..s.entry.clone()
            })
            .collect();

        let mut view = Self::assemble(
            Arc::clone(&self.arena),
            entries,
            Arc::clone(&self.sessions),
            selection,
        );
        if view.selection == self.selection {
            // Same session view: reuse already decoded files.
            for slot in &mut view.slots {
                if let Some(file) = self.slots[self.index[&slot.entry.path]].parsed.get() {
                    slot.parsed = OnceLock::from(file.clone());
                }
            }
        }
        Ok(view)
    }
}

fn section_ranges(sections: &[String]) -> Vec<Range<usize>> {
    let delimiter = chunks::END_OF_CHUNK.len() + 2;
    let mut ranges = Vec::with_capacity(sections.len());
    let mut start = 0;
    for section in sections {
        ranges.push(start..start + section.len());
        start += section.len() + delimiter;
    }
    ranges
}
