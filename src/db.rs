//! SQLite metadata store: repositories, commits, the per-commit file index
//! and upload sessions, and precomputed comparison locations.
use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::comparison::ComparisonRecord;
use crate::error::{ReportError, Result};
use crate::index::ReportIndex;
use crate::model::{Commit, Session, Totals};
use crate::report::FileEntry;

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("../schema.sql");

/// Read access to report metadata.
pub trait MetadataStore {
    fn get_commit(&self, repository: &str, commitid: &str) -> Result<Option<Commit>>;

    /// Files of the commit's report, in chunk order.
    fn get_file_index(&self, commit: &Commit) -> Result<Vec<FileEntry>>;

    fn get_sessions(&self, commit: &Commit) -> Result<BTreeMap<u32, Session>>;

    fn get_comparison(
        &self,
        repository: &str,
        base_commitid: &str,
        compare_commitid: &str,
    ) -> Result<Option<ComparisonRecord>>;

    fn get_parent_commit(&self, commit: &Commit) -> Result<Option<Commit>> {
        match &commit.parent_commitid {
            Some(parent) => self.get_commit(&commit.repository, parent),
            None => Ok(None),
        }
    }
}

/// Open (or create) the metadata database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// Ensure the schema is initialized. Safe to call on an already-initialized DB.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: u32 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        return Ok(());
    }

    let version: u32 =
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(ReportError::Other(format!(
            "Database schema version {version} is newer than this binary supports ({SCHEMA_VERSION})."
        )));
    }
    if version < SCHEMA_VERSION {
        tracing::warn!("metadata schema version {version} predates {SCHEMA_VERSION}");
        return Err(ReportError::Other(format!(
            "Database schema version {version} is older than this binary supports ({SCHEMA_VERSION}); recreate the database."
        )));
    }
    Ok(())
}

/// Insert the repository if needed and return its id.
pub fn upsert_repository(conn: &Connection, name: &str, repo_hash: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO repository (name, repo_hash) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET repo_hash = excluded.repo_hash",
        params![name, repo_hash],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM repository WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?)
}

/// Record a commit. Fails if the commit already exists in the repository.
pub fn insert_commit(
    conn: &Connection,
    repository_id: i64,
    commitid: &str,
    parent_commitid: Option<&str>,
    branch: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO commits (repository_id, commitid, parent_commitid, branch, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![repository_id, commitid, parent_commitid, branch, now],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ReportError::Other(format!("Commit '{commitid}' already exists."))
        }
        other => ReportError::Sqlite(other),
    })?;
    Ok(conn.last_insert_rowid())
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_totals(raw: Option<String>) -> Result<Option<Totals>> {
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

type CommitRow = (i64, String, String, String, Option<String>, Option<String>, Option<String>);

const COMMIT_COLUMNS: &str = "c.id, r.name, r.repo_hash, c.commitid, c.parent_commitid, c.branch, c.totals";

fn commit_from_row(row: CommitRow) -> Result<Commit> {
    let (id, repository, repo_hash, commitid, parent_commitid, branch, totals) = row;
    Ok(Commit {
        id,
        repository,
        repo_hash,
        commitid,
        parent_commitid,
        branch,
        totals: parse_totals(totals)?,
    })
}

fn read_commit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommitRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

/// All commits of a repository, oldest first.
pub fn list_commits(conn: &Connection, repository: &str) -> Result<Vec<Commit>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMMIT_COLUMNS} FROM commits c JOIN repository r ON r.id = c.repository_id
         WHERE r.name = ?1 ORDER BY c.created_at, c.id"
    ))?;
    let rows = stmt.query_map(params![repository], read_commit_row)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(commit_from_row(row?)?);
    }
    Ok(result)
}

/// Replace the report index and sessions of a commit, and store its totals.
pub fn save_report_index(
    conn: &mut Connection,
    commit_id: i64,
    index: &ReportIndex,
    totals: &Totals,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM report_file WHERE commit_id = ?1", params![commit_id])?;
    tx.execute("DELETE FROM upload WHERE commit_id = ?1", params![commit_id])?;

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO report_file (commit_id, chunk_index, path, totals) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for file in &index.files {
            let totals = file.totals.as_ref().map(to_json_text).transpose()?;
            stmt.execute(params![commit_id, file.chunk as i64, file.path, totals])?;
        }
    }

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO upload (commit_id, session_id, flags, provider, build, job, name, url,
                                 upload_type, upload_extras, totals, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        for session in index.sessions.values() {
            stmt.execute(params![
                commit_id,
                session.id,
                to_json_text(&session.flags)?,
                session.provider,
                session.build,
                session.job,
                session.name,
                session.url,
                session.upload_type.as_str(),
                to_json_text(&session.upload_extras)?,
                session.totals.as_ref().map(to_json_text).transpose()?,
                session.time,
            ])?;
        }
    }

    tx.execute(
        "UPDATE commits SET totals = ?1 WHERE id = ?2",
        params![to_json_text(totals)?, commit_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Remember where the impacted-files payload for a base/head pair lives.
pub fn record_comparison(
    conn: &Connection,
    repository_id: i64,
    base_commitid: &str,
    compare_commitid: &str,
    report_storage_path: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO comparison (repository_id, base_commitid, compare_commitid, report_storage_path)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(repository_id, base_commitid, compare_commitid)
         DO UPDATE SET report_storage_path = excluded.report_storage_path",
        params![repository_id, base_commitid, compare_commitid, report_storage_path],
    )?;
    Ok(())
}

/// Delete a commit and its index. Index rows go via ON DELETE CASCADE.
pub fn delete_commit(conn: &Connection, repository: &str, commitid: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM commits WHERE commitid = ?1
         AND repository_id = (SELECT id FROM repository WHERE name = ?2)",
        params![commitid, repository],
    )?;
    if deleted == 0 {
        return Err(ReportError::CommitNotFound(commitid.to_string()));
    }
    Ok(())
}

impl MetadataStore for Connection {
    fn get_commit(&self, repository: &str, commitid: &str) -> Result<Option<Commit>> {
        let row = self
            .query_row(
                &format!(
                    "SELECT {COMMIT_COLUMNS} FROM commits c JOIN repository r ON r.id = c.repository_id
                     WHERE r.name = ?1 AND c.commitid = ?2"
                ),
                params![repository, commitid],
                read_commit_row,
            )
            .optional()?;
        row.map(commit_from_row).transpose()
    }

    fn get_file_index(&self, commit: &Commit) -> Result<Vec<FileEntry>> {
        let mut stmt = self.prepare(
            "SELECT path, chunk_index, totals FROM report_file
             WHERE commit_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![commit.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (path, chunk, totals) = row?;
            result.push(FileEntry {
                path,
                chunk: chunk as usize,
                totals: parse_totals(totals)?,
            });
        }
        Ok(result)
    }

    fn get_sessions(&self, commit: &Commit) -> Result<BTreeMap<u32, Session>> {
        let mut stmt = self.prepare(
            "SELECT session_id, flags, provider, build, job, name, url, upload_type,
                    upload_extras, totals, uploaded_at
             FROM upload WHERE commit_id = ?1 ORDER BY session_id",
        )?;
        let rows = stmt.query_map(params![commit.id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                (
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ),
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<i64>>(10)?,
            ))
        })?;

        let mut sessions = BTreeMap::new();
        for row in rows {
            let (id, flags, (provider, build, job, name, url), upload_type, extras, totals, time) =
                row?;
            sessions.insert(
                id,
                Session {
                    id,
                    flags: serde_json::from_str(&flags)?,
                    provider,
                    build,
                    job,
                    name,
                    url,
                    time,
                    upload_type: upload_type.parse()?,
                    upload_extras: serde_json::from_str(&extras)?,
                    totals: parse_totals(totals)?,
                },
            );
        }
        Ok(sessions)
    }

    fn get_comparison(
        &self,
        repository: &str,
        base_commitid: &str,
        compare_commitid: &str,
    ) -> Result<Option<ComparisonRecord>> {
        Ok(self
            .query_row(
                "SELECT cmp.base_commitid, cmp.compare_commitid, cmp.report_storage_path
                 FROM comparison cmp JOIN repository r ON r.id = cmp.repository_id
                 WHERE r.name = ?1 AND cmp.base_commitid = ?2 AND cmp.compare_commitid = ?3",
                params![repository, base_commitid, compare_commitid],
                |row| {
                    Ok(ComparisonRecord {
                        base_commitid: row.get(0)?,
                        compare_commitid: row.get(1)?,
                        report_storage_path: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}
