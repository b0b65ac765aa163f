//! Assemble a commit's `Report` from the archived chunks blob and the
//! metadata store, and write reports back out.
use rusqlite::Connection;

use crate::chunks;
use crate::db::{self, MetadataStore};
use crate::error::{ReportError, Result};
use crate::index::ReportIndex;
use crate::model::{Commit, Totals};
use crate::report::{Report, SessionSelection};
use crate::sessions;
use crate::storage::{chunks_key, ArchiveStorage, CancellationToken};

pub const DEFAULT_CHUNKS_VERSION: &str = "v4";

/// Builds reports for commits using injected storage and metadata handles.
pub struct ReportService<'a> {
    storage: &'a dyn ArchiveStorage,
    store: &'a dyn MetadataStore,
    chunks_version: String,
    cancel: CancellationToken,
}

impl<'a> ReportService<'a> {
    pub fn new(storage: &'a dyn ArchiveStorage, store: &'a dyn MetadataStore) -> Self {
        Self {
            storage,
            store,
            chunks_version: DEFAULT_CHUNKS_VERSION.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_chunks_version(mut self, version: impl Into<String>) -> Self {
        self.chunks_version = version.into();
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn storage(&self) -> &'a dyn ArchiveStorage {
        self.storage
    }

    pub fn store(&self) -> &'a dyn MetadataStore {
        self.store
    }

    pub fn chunks_version(&self) -> &str {
        &self.chunks_version
    }

    /// Build the merged report of `commit`.
    ///
    /// Returns `Ok(None)` when the chunks blob has not been written yet.
    /// Storage failures, cancellation and corrupt chunk data are errors.
    pub fn build_report_from_commit(&self, commit: &Commit) -> Result<Option<Report>> {
        let key = chunks_key(&self.chunks_version, &commit.repo_hash, &commit.commitid);

        self.cancel.check()?;
        let bytes = match self.storage.read(&key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                tracing::debug!(commit = %commit.commitid, %key, "no chunks blob for commit");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.cancel.check()?;

        let text = String::from_utf8(bytes)
            .map_err(|e| ReportError::malformed(format!("chunks blob is not UTF-8: {e}")))?;
        let index = ReportIndex {
            files: self.store.get_file_index(commit)?,
            sessions: self.store.get_sessions(commit)?,
        };
        tracing::debug!(
            commit = %commit.commitid,
            files = index.files.len(),
            sessions = index.sessions.len(),
            "building report"
        );
        build_report(text, index).map(Some)
    }

    /// Build the report of the commit recorded as `commitid`'s parent.
    pub fn build_parent_report(&self, commit: &Commit) -> Result<Option<Report>> {
        match self.store.get_parent_commit(commit)? {
            Some(parent) => self.build_report_from_commit(&parent),
            None => Ok(None),
        }
    }

    /// Encode `report` and write its chunks blob for `commit`. Returns the
    /// index describing what was written.
    pub fn write_report(&self, commit: &Commit, report: &Report) -> Result<ReportIndex> {
        let index = ReportIndex::from_report(report)?;
        let sections: Vec<String> = report.files()?.into_iter().map(chunks::encode).collect();
        let key = chunks_key(&self.chunks_version, &commit.repo_hash, &commit.commitid);
        self.cancel.check()?;
        self.storage.write(&key, chunks::join(&sections).as_bytes())?;
        Ok(index)
    }
}

/// Assemble a report from a chunks blob and its index. Carried-forward
/// sessions superseded by direct uploads contribute no lines.
pub fn build_report(text: String, index: ReportIndex) -> Result<Report> {
    let resolution = sessions::resolve(&index.sessions);
    let selection = if resolution.excludes_any() {
        SessionSelection::Only(resolution.included)
    } else {
        SessionSelection::All
    };
    Report::from_chunks(text, index.files, index.sessions, selection)
}

/// Write `report` for `commit` to the archive and record its index, sessions
/// and totals in the metadata database.
pub fn save_report(
    storage: &dyn ArchiveStorage,
    conn: &mut Connection,
    chunks_version: &str,
    commit: &Commit,
    report: &Report,
) -> Result<Totals> {
    let service = ReportService::new(storage, &*conn).with_chunks_version(chunks_version);
    let index = service.write_report(commit, report)?;
    let totals = report.totals()?;
    db::save_report_index(conn, commit.id, &index, &totals)?;
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Session;
    use crate::report::FileEntry;
    use crate::storage::MemoryStorage;
    use std::collections::BTreeMap;

    const CHUNKS: &str = "{}\n[1,null,[[0,1]],null]\n[0,null,[[0,0],[1,1]],null]\n<<<<< end_of_chunk >>>>>\n{}\n\n[1,null,[[1,1]],null]";

    fn index(carried: bool) -> ReportIndex {
        let mut sessions = BTreeMap::new();
        sessions.insert(0, Session::new(0).with_flags(["unit"]));
        let second = Session::new(1).with_flags(["unit"]);
        let second = if carried {
            second.carried_forward(Some("parent"))
        } else {
            second
        };
        sessions.insert(1, second);
        ReportIndex {
            files: vec![
                FileEntry {
                    path: "a.py".to_string(),
                    chunk: 0,
                    totals: None,
                },
                FileEntry {
                    path: "b.py".to_string(),
                    chunk: 1,
                    totals: None,
                },
            ],
            sessions,
        }
    }

    #[test]
    fn test_build_report_keeps_all_direct_sessions() {
        let report = build_report(CHUNKS.to_string(), index(false)).unwrap();
        let totals = report.totals().unwrap();
        assert_eq!(totals.lines, 3);
        assert_eq!(totals.hits, 3);
        assert_eq!(totals.sessions, 2);
        assert_eq!(report.get("b.py").unwrap().unwrap().lines()[0].number, 2);
    }

    #[test]
    fn test_build_report_drops_superseded_sessions() {
        let report = build_report(CHUNKS.to_string(), index(true)).unwrap();
        assert!(report.get("b.py").unwrap().is_none());
        let a = report.get("a.py").unwrap().unwrap();
        assert_eq!(a.totals().hits, 1);
        assert_eq!(a.totals().misses, 1);
        assert_eq!(report.sessions().count(), 1);
    }

    #[test]
    fn test_build_report_delimiter_mismatch() {
        let mut idx = index(false);
        idx.files.pop();
        assert!(matches!(
            build_report(CHUNKS.to_string(), idx),
            Err(ReportError::MalformedChunk { .. })
        ));
    }

    struct NoMetadata;

    impl MetadataStore for NoMetadata {
        fn get_commit(&self, _: &str, _: &str) -> Result<Option<Commit>> {
            Ok(None)
        }
        fn get_file_index(&self, _: &Commit) -> Result<Vec<FileEntry>> {
            Ok(Vec::new())
        }
        fn get_sessions(&self, _: &Commit) -> Result<BTreeMap<u32, Session>> {
            Ok(BTreeMap::new())
        }
        fn get_comparison(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<crate::comparison::ComparisonRecord>> {
            Ok(None)
        }
    }

    fn commit() -> Commit {
        Commit {
            id: 1,
            repository: "acme/api".to_string(),
            repo_hash: "HASH".to_string(),
            commitid: "abc".to_string(),
            parent_commitid: None,
            branch: None,
            totals: None,
        }
    }

    #[test]
    fn test_missing_blob_is_none() {
        let storage = MemoryStorage::new();
        let service = ReportService::new(&storage, &NoMetadata);
        assert!(service.build_report_from_commit(&commit()).unwrap().is_none());
        assert!(service.build_parent_report(&commit()).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_build_fails() {
        let storage = MemoryStorage::new();
        storage
            .write(&chunks_key("v4", "HASH", "abc"), b"")
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let service = ReportService::new(&storage, &NoMetadata).with_cancellation(token);
        assert!(matches!(
            service.build_report_from_commit(&commit()),
            Err(ReportError::Cancelled)
        ));
    }

    #[test]
    fn test_non_utf8_blob_is_malformed() {
        let storage = MemoryStorage::new();
        storage
            .write(&chunks_key("v4", "HASH", "abc"), &[0xff, 0xfe])
            .unwrap();
        let service = ReportService::new(&storage, &NoMetadata);
        assert!(matches!(
            service.build_report_from_commit(&commit()),
            Err(ReportError::MalformedChunk { .. })
        ));
    }

    #[test]
    fn test_write_then_build() {
        let storage = MemoryStorage::new();
        let source = build_report(CHUNKS.to_string(), index(false)).unwrap();
        let service = ReportService::new(&storage, &NoMetadata);
        let written = service.write_report(&commit(), &source).unwrap();

        let blob = storage.read(&chunks_key("v4", "HASH", "abc")).unwrap();
        let rebuilt = build_report(String::from_utf8(blob).unwrap(), written).unwrap();
        assert_eq!(rebuilt.totals().unwrap(), source.totals().unwrap());
        for (left, right) in source.files().unwrap().iter().zip(rebuilt.files().unwrap()) {
            assert_eq!(*left, right);
        }
    }
}
