//! The per-commit report index (`report_json`): which chunk holds which
//! file, the totals recorded for each file, and the upload sessions.
//!
//! ```json
//! {"files": {"src/a.py": [0, [1, 10, 8, 2, 0, "80.00000"], null, null]},
//!  "sessions": {"0": {"t": [...], "f": ["unit"], "p": "github-actions",
//!                     "st": "uploaded", "se": {}}}}
//! ```
use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{ReportError, Result};
use crate::model::{Session, Totals, UploadType};
use crate::report::{FileEntry, Report};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportIndex {
    /// Files in chunk order.
    pub files: Vec<FileEntry>,
    pub sessions: BTreeMap<u32, Session>,
}

impl ReportIndex {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let empty = Map::new();
        let files_obj = value.get("files").and_then(Value::as_object).unwrap_or(&empty);
        let sessions_obj = value.get("sessions").and_then(Value::as_object).unwrap_or(&empty);

        let mut files = Vec::with_capacity(files_obj.len());
        for (path, entry) in files_obj {
            files.push(file_entry(path, entry)?);
        }
        files.sort_by_key(|f| f.chunk);

        let mut sessions = BTreeMap::new();
        for (id, raw) in sessions_obj {
            let id: u32 = id
                .parse()
                .map_err(|_| ReportError::Other(format!("invalid session id '{id}'")))?;
            sessions.insert(id, session_from_json(id, raw)?);
        }

        Ok(Self { files, sessions })
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let files: Map<String, Value> = self
            .files
            .iter()
            .map(|f| {
                (
                    f.path.clone(),
                    json!([f.chunk, f.totals.as_ref().map(Totals::to_json), null, null]),
                )
            })
            .collect();
        let sessions: Map<String, Value> = self
            .sessions
            .values()
            .map(|s| (s.id.to_string(), session_to_json(s)))
            .collect();
        json!({ "files": files, "sessions": sessions })
    }

    /// Index describing `report` as it would be written out: one chunk per
    /// non-empty file, in report order.
    pub fn from_report(report: &Report) -> Result<Self> {
        let files = report
            .files()?
            .into_iter()
            .enumerate()
            .map(|(chunk, f)| FileEntry {
                path: f.name().to_string(),
                chunk,
                totals: Some(f.totals().clone()),
            })
            .collect();
        let sessions = report.sessions().map(|s| (s.id, s.clone())).collect();
        Ok(Self { files, sessions })
    }
}

fn file_entry(path: &str, entry: &Value) -> Result<FileEntry> {
    let invalid = || ReportError::Other(format!("invalid index entry for '{path}': {entry}"));
    let fields = entry.as_array().ok_or_else(invalid)?;
    let chunk = fields.first().and_then(Value::as_u64).ok_or_else(invalid)? as usize;
    let totals = match fields.get(1) {
        None | Some(Value::Null) => None,
        Some(raw) => Some(Totals::from_json(raw)?),
    };
    Ok(FileEntry {
        path: path.to_string(),
        chunk,
        totals,
    })
}

fn opt_string(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn session_from_json(id: u32, raw: &Value) -> Result<Session> {
    let flags = match raw.get("f") {
        Some(Value::Array(flags)) => flags
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let upload_type = match raw.get("st").and_then(Value::as_str) {
        Some(st) => st.parse()?,
        None => UploadType::Uploaded,
    };
    let upload_extras = raw
        .get("se")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let totals = match raw.get("t") {
        None | Some(Value::Null) => None,
        Some(t) => Some(Totals::from_json(t)?),
    };

    Ok(Session {
        id,
        flags,
        provider: opt_string(raw, "p"),
        build: opt_string(raw, "b"),
        job: opt_string(raw, "j"),
        name: opt_string(raw, "n"),
        url: opt_string(raw, "u"),
        time: raw.get("d").and_then(Value::as_i64),
        upload_type,
        upload_extras,
        totals,
    })
}

#[must_use]
pub fn session_to_json(session: &Session) -> Value {
    json!({
        "t": session.totals.as_ref().map(Totals::to_json),
        "f": session.flags,
        "p": session.provider,
        "b": session.build,
        "j": session.job,
        "n": session.name,
        "u": session.url,
        "d": session.time,
        "st": session.upload_type.as_str(),
        "se": session.upload_extras,
    })
}
