//! Codec for the archived "chunks" blob.
//!
//! Layout:
//!
//! ```text
//! {"optional":"report header"}
//! <<<<< end_of_header >>>>>          (optional, only before the first chunk)
//! {}                                 chunk header for file 0
//! [1,null,[[0,1]],null]              line 1
//!                                    line 2 (no data)
//! ["1/2","b",[[0,"1/2"]],null]       line 3
//! <<<<< end_of_chunk >>>>>
//! {}                                 chunk header for file 1
//! ...
//! ```
//!
//! Line arrays are `[coverage, type, sessions, complexity]` where `sessions`
//! is a list of `[session_id, coverage, ...]`. Trailing fields may be
//! missing and `null` entries are treated as absent.
use serde_json::{json, Map, Value};

use crate::error::{ReportError, Result};
use crate::model::{Complexity, CoverageValue, LineKind, LineSession, ReportLine};
use crate::report::ReportFile;

pub const END_OF_CHUNK: &str = "<<<<< end_of_chunk >>>>>";
pub const END_OF_HEADER: &str = "<<<<< end_of_header >>>>>";

/// One decoded chunk: its header object and its non-blank lines in
/// ascending line-number order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFile {
    pub header: Map<String, Value>,
    pub lines: Vec<ReportLine>,
}

/// Split a chunks blob into per-file sections without decoding them.
///
/// Fails when the number of sections differs from `expected` (the length of
/// the file index the blob was written with).
pub fn split(text: &str, expected: usize) -> Result<Vec<&str>> {
    let body = strip_report_header(text);

    if body.trim().is_empty() {
        return if expected == 0 {
            Ok(Vec::new())
        } else if expected == 1 {
            Ok(vec![body])
        } else {
            Err(ReportError::malformed(format!(
                "expected {expected} chunks, found an empty blob"
            )))
        };
    }

    let mut sections = Vec::with_capacity(expected);
    let mut start = 0;
    let mut offset = 0;
    for raw_line in body.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        if line == END_OF_CHUNK {
            sections.push(trim_section(&body[start..offset]));
            start = offset + raw_line.len();
        }
        offset += raw_line.len();
    }
    sections.push(trim_section(&body[start..]));

    if sections.len() != expected {
        return Err(ReportError::malformed(format!(
            "found {} chunk delimiters, expected {}",
            sections.len() - 1,
            expected.saturating_sub(1)
        )));
    }
    Ok(sections)
}

fn strip_report_header(text: &str) -> &str {
    let mut offset = 0;
    for raw_line in text.split_inclusive('\n') {
        offset += raw_line.len();
        let line = raw_line.trim_end_matches(['\n', '\r']);
        if line == END_OF_HEADER {
            return &text[offset..];
        }
        if line == END_OF_CHUNK {
            break;
        }
    }
    text
}

fn trim_section(section: &str) -> &str {
    section.strip_suffix('\n').unwrap_or(section).trim_end_matches('\r')
}

/// Decode every section of a chunks blob.
pub fn parse(text: &str, expected: usize) -> Result<Vec<ChunkFile>> {
    split(text, expected)?
        .into_iter()
        .enumerate()
        .map(|(i, section)| parse_section(section).map_err(|e| e.in_chunk(i)))
        .collect()
}

/// Decode a single section: a header line followed by one entry per line.
pub fn parse_section(section: &str) -> Result<ChunkFile> {
    let mut rows = section.split('\n');
    let header = match rows.next().map(str::trim) {
        None | Some("") | Some("null") => Map::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                return Err(ReportError::malformed(format!(
                    "chunk header is not an object: {other}"
                )))
            }
            Err(e) => return Err(ReportError::malformed(format!("invalid chunk header: {e}"))),
        },
    };

    let mut lines = Vec::new();
    for (i, row) in rows.enumerate() {
        let number = i as u32 + 1;
        let row = row.trim();
        if row.is_empty() || row == "null" {
            continue;
        }
        let value: Value = serde_json::from_str(row).map_err(|e| ReportError::MalformedChunk {
            chunk: None,
            line: Some(number as usize),
            reason: e.to_string(),
        })?;
        let line = decode_line(number, &value).map_err(|e| match e {
            ReportError::MalformedChunk { reason, .. } => ReportError::MalformedChunk {
                chunk: None,
                line: Some(number as usize),
                reason,
            },
            other => other,
        })?;
        if let Some(line) = line {
            lines.push(line);
        }
    }

    Ok(ChunkFile { header, lines })
}

/// Decode one line array. `null` decodes to no line at all.
pub fn decode_line(number: u32, value: &Value) -> Result<Option<ReportLine>> {
    let fields = match value {
        Value::Null => return Ok(None),
        Value::Array(fields) => fields,
        other => {
            return Err(ReportError::malformed(format!(
                "line entry is not an array: {other}"
            )))
        }
    };
    let field = |i: usize| fields.get(i).unwrap_or(&Value::Null);

    let coverage = CoverageValue::from_json(field(0))?;
    let kind = LineKind::from_json(field(1))?;
    let sessions = decode_sessions(field(2))?;
    let complexity = Complexity::from_json(field(3))?;

    Ok(Some(ReportLine {
        number,
        coverage,
        kind,
        sessions,
        complexity,
    }))
}

fn decode_sessions(value: &Value) -> Result<Vec<LineSession>> {
    let entries = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        other => {
            return Err(ReportError::malformed(format!(
                "line sessions are not a list: {other}"
            )))
        }
    };

    let mut sessions = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(parts) = entry else {
            if entry.is_null() {
                continue;
            }
            return Err(ReportError::malformed(format!(
                "line session is not a list: {entry}"
            )));
        };
        let id = parts
            .first()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| ReportError::malformed(format!("line session without id: {entry}")))?;
        let id = u32::try_from(id)
            .map_err(|_| ReportError::malformed(format!("line session id out of range: {entry}")))?;
        let coverage = CoverageValue::from_json(parts.get(1).unwrap_or(&Value::Null))?;
        sessions.push(LineSession { id, coverage });
    }
    Ok(sessions)
}

/// Encode one line as its JSON array.
#[must_use]
pub fn encode_line(line: &ReportLine) -> Value {
    let sessions: Vec<Value> = line
        .sessions
        .iter()
        .map(|s| json!([s.id, s.coverage.to_json()]))
        .collect();
    json!([
        line.coverage.to_json(),
        line.kind.to_json(),
        sessions,
        line.complexity.map(Complexity::to_json),
    ])
}

/// Encode a file back into a chunk section (no trailing delimiter).
#[must_use]
pub fn encode(file: &ReportFile) -> String {
    let mut out = Value::Object(file.header().clone()).to_string();
    let mut next = 1;
    for line in file.lines() {
        while next < line.number {
            out.push('\n');
            next += 1;
        }
        out.push('\n');
        out.push_str(&encode_line(line).to_string());
        next = line.number + 1;
    }
    out
}

/// Join encoded sections into a full blob.
#[must_use]
pub fn join<S: AsRef<str>>(sections: &[S]) -> String {
    let delimiter = format!("\n{END_OF_CHUNK}\n");
    sections
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(&delimiter)
}
