use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive object not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Malformed chunk data{}: {reason}", fmt_location(.chunk, .line))]
    MalformedChunk {
        chunk: Option<usize>,
        line: Option<usize>,
        reason: String,
    },

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

fn fmt_location(chunk: &Option<usize>, line: &Option<usize>) -> String {
    match (chunk, line) {
        (Some(c), Some(l)) => format!(" (chunk {c}, line {l})"),
        (Some(c), None) => format!(" (chunk {c})"),
        (None, Some(l)) => format!(" (line {l})"),
        (None, None) => String::new(),
    }
}

impl ReportError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ReportError::MalformedChunk {
            chunk: None,
            line: None,
            reason: reason.into(),
        }
    }

    /// Attach the chunk position to a malformed-chunk error.
    #[must_use]
    pub fn in_chunk(self, index: usize) -> Self {
        match self {
            ReportError::MalformedChunk { line, reason, .. } => ReportError::MalformedChunk {
                chunk: Some(index),
                line,
                reason,
            },
            other => other,
        }
    }

    /// True for the "nothing stored yet" condition callers treat as an empty result.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReportError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ReportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_includes_position() {
        let err = ReportError::MalformedChunk {
            chunk: Some(2),
            line: Some(7),
            reason: "bad json".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed chunk data (chunk 2, line 7): bad json");

        let err = ReportError::malformed("delimiter count").in_chunk(0);
        assert_eq!(err.to_string(), "Malformed chunk data (chunk 0): delimiter count");
    }
}
