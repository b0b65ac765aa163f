//! In-memory representation of coverage data as it appears in a commit
//! report: per-line coverage values, the upload sessions that produced them,
//! and the aggregated totals derived from both.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{ReportError, Result};

/// Percentage of `hits` over `lines`, or `None` when there is nothing to cover.
#[must_use]
pub fn percent(hits: u64, lines: u64) -> Option<f64> {
    if lines == 0 {
        None
    } else {
        Some(100.0 * hits as f64 / lines as f64)
    }
}

/// Fixed five-decimal rendering of a coverage ratio, e.g. `"85.00000"`.
#[must_use]
pub fn format_coverage(hits: u64, lines: u64) -> Option<String> {
    percent(hits, lines).map(|pct| format!("{pct:.5}"))
}

/// Classification of a single line once all of its sessions are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    Hit,
    Miss,
    Partial,
}

/// Coverage recorded for a line, either by one session or merged across all.
///
/// `Partial` keeps the branch fraction exactly as written (`"1/2"`), including
/// fully-covered (`"2/2"`) and fully-missed (`"0/2"`) fractions; use
/// [`CoverageValue::line_type`] for the hit/miss/partial classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageValue {
    Hit(u64),
    Miss,
    Partial { covered: u32, total: u32 },
}

impl CoverageValue {
    #[must_use]
    pub fn line_type(&self) -> LineType {
        match *self {
            CoverageValue::Hit(0) | CoverageValue::Miss => LineType::Miss,
            CoverageValue::Hit(_) => LineType::Hit,
            CoverageValue::Partial { covered, total } => {
                if covered == 0 {
                    LineType::Miss
                } else if covered >= total {
                    LineType::Hit
                } else {
                    LineType::Partial
                }
            }
        }
    }

    /// Decode the heterogeneous JSON encoding: ints, booleans, `null`,
    /// numeric strings, and `"covered/total"` fractions.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null | Value::Bool(false) => Ok(CoverageValue::Miss),
            Value::Bool(true) => Ok(CoverageValue::Hit(1)),
            Value::Number(n) => {
                if let Some(hits) = n.as_u64() {
                    Ok(hit_or_miss(hits))
                } else {
                    let f = n.as_f64().unwrap_or(0.0);
                    if f > 0.0 {
                        Ok(CoverageValue::Hit(f.ceil() as u64))
                    } else {
                        Ok(CoverageValue::Miss)
                    }
                }
            }
            Value::String(s) => parse_coverage_str(s),
            other => Err(ReportError::malformed(format!(
                "unexpected coverage value: {other}"
            ))),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            CoverageValue::Hit(n) => json!(n),
            CoverageValue::Miss => json!(0),
            CoverageValue::Partial { covered, total } => json!(format!("{covered}/{total}")),
        }
    }

    /// Merge the coverage reported by several sessions for one line.
    ///
    /// Hit counts are summed; when no session has an integer hit, a fully
    /// covered fraction wins, then the widest partial fraction
    /// (max covered, max total); otherwise the line is a miss.
    /// Returns `None` when there is nothing to merge.
    pub fn merge<'a, I>(values: I) -> Option<CoverageValue>
    where
        I: IntoIterator<Item = &'a CoverageValue>,
    {
        let mut seen = false;
        let mut hits: u64 = 0;
        let mut full: Option<u32> = None;
        let mut partial: Option<(u32, u32)> = None;

        for value in values {
            seen = true;
            match *value {
                CoverageValue::Hit(n) => hits = hits.saturating_add(n),
                CoverageValue::Miss => {}
                CoverageValue::Partial { covered, total } => {
                    if value.line_type() == LineType::Hit {
                        full = Some(full.map_or(total, |t| t.max(total)));
                    }
                    partial = Some(match partial {
                        Some((c, t)) => (c.max(covered), t.max(total)),
                        None => (covered, total),
                    });
                }
            }
        }

        if !seen {
            return None;
        }
        if hits > 0 {
            return Some(CoverageValue::Hit(hits));
        }
        if let Some(total) = full {
            return Some(CoverageValue::Partial {
                covered: total,
                total,
            });
        }
        if let Some((covered, total)) = partial {
            return Some(CoverageValue::Partial { covered, total });
        }
        Some(CoverageValue::Miss)
    }
}

fn hit_or_miss(hits: u64) -> CoverageValue {
    if hits == 0 {
        CoverageValue::Miss
    } else {
        CoverageValue::Hit(hits)
    }
}

fn parse_coverage_str(s: &str) -> Result<CoverageValue> {
    let s = s.trim();
    if let Some((covered, total)) = s.split_once('/') {
        let covered = covered
            .trim()
            .parse::<u32>()
            .map_err(|_| ReportError::malformed(format!("invalid branch fraction '{s}'")))?;
        let total = total
            .trim()
            .parse::<u32>()
            .map_err(|_| ReportError::malformed(format!("invalid branch fraction '{s}'")))?;
        return Ok(CoverageValue::Partial { covered, total });
    }
    if s.is_empty() {
        return Ok(CoverageValue::Miss);
    }
    s.parse::<u64>()
        .map(hit_or_miss)
        .map_err(|_| ReportError::malformed(format!("invalid coverage value '{s}'")))
}

/// The `type` column of a line array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineKind {
    #[default]
    Line,
    Branch,
    Method,
}

impl LineKind {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(LineKind::Line),
            Value::String(s) => match s.as_str() {
                "" | "l" => Ok(LineKind::Line),
                "b" => Ok(LineKind::Branch),
                "m" => Ok(LineKind::Method),
                other => Err(ReportError::malformed(format!("unknown line type '{other}'"))),
            },
            other => Err(ReportError::malformed(format!("unknown line type {other}"))),
        }
    }

    #[must_use]
    pub fn to_json(self) -> Value {
        match self {
            LineKind::Line => Value::Null,
            LineKind::Branch => json!("b"),
            LineKind::Method => json!("m"),
        }
    }
}

/// Cyclomatic complexity attached to a line: either a bare count or a
/// `[covered, total]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Complexity {
    pub covered: u32,
    pub total: Option<u32>,
}

impl Complexity {
    pub fn from_json(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => match n.as_u64() {
                Some(c) => Ok(Some(Complexity {
                    covered: complexity_count(c, value)?,
                    total: None,
                })),
                None => Ok(None),
            },
            Value::Array(pair) => {
                let get = |i: usize| pair.get(i).and_then(Value::as_u64);
                match (get(0), get(1)) {
                    (Some(covered), total) => Ok(Some(Complexity {
                        covered: complexity_count(covered, value)?,
                        total: total.map(|t| complexity_count(t, value)).transpose()?,
                    })),
                    _ => Err(ReportError::malformed(format!(
                        "invalid complexity {value}"
                    ))),
                }
            }
            other => Err(ReportError::malformed(format!("invalid complexity {other}"))),
        }
    }

    #[must_use]
    pub fn to_json(self) -> Value {
        match self.total {
            Some(total) => json!([self.covered, total]),
            None => json!(self.covered),
        }
    }
}

fn complexity_count(count: u64, value: &Value) -> Result<u32> {
    u32::try_from(count).map_err(|_| ReportError::malformed(format!("complexity out of range {value}")))
}

/// One session's contribution to a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSession {
    pub id: u32,
    pub coverage: CoverageValue,
}

/// A single instrumented source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    /// 1-based line number.
    pub number: u32,
    pub coverage: CoverageValue,
    pub kind: LineKind,
    pub sessions: Vec<LineSession>,
    pub complexity: Option<Complexity>,
}

impl ReportLine {
    #[must_use]
    pub fn line_type(&self) -> LineType {
        self.coverage.line_type()
    }

    /// Recompute this line's coverage from the sessions that satisfy `keep`.
    /// Returns `None` when no session survives.
    pub fn retain_sessions<F>(&self, keep: F) -> Option<ReportLine>
    where
        F: Fn(u32) -> bool,
    {
        let sessions: Vec<LineSession> =
            self.sessions.iter().filter(|s| keep(s.id)).cloned().collect();
        let coverage = CoverageValue::merge(sessions.iter().map(|s| &s.coverage))?;
        Some(ReportLine {
            number: self.number,
            coverage,
            kind: self.kind,
            sessions,
            complexity: self.complexity,
        })
    }
}

/// Aggregate coverage counters.
///
/// Serialized positionally as
/// `[files, lines, hits, misses, partials, coverage, branches, methods,
/// messages, sessions, complexity, complexity_total, diff]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Totals {
    pub files: u64,
    pub lines: u64,
    pub hits: u64,
    pub misses: u64,
    pub partials: u64,
    pub coverage: Option<String>,
    pub branches: u64,
    pub methods: u64,
    pub messages: u64,
    pub sessions: u64,
    pub complexity: u64,
    pub complexity_total: u64,
    pub diff: Option<Box<Totals>>,
}

impl Totals {
    /// Fold a file's lines into totals. `files` is 1 for a non-empty file.
    pub fn from_lines<'a, I>(lines: I) -> Totals
    where
        I: IntoIterator<Item = &'a ReportLine>,
    {
        let mut totals = Totals::default();
        for line in lines {
            totals.lines += 1;
            match line.line_type() {
                LineType::Hit => totals.hits += 1,
                LineType::Miss => totals.misses += 1,
                LineType::Partial => totals.partials += 1,
            }
            match line.kind {
                LineKind::Branch => totals.branches += 1,
                LineKind::Method => totals.methods += 1,
                LineKind::Line => {}
            }
            if let Some(c) = line.complexity {
                totals.complexity += u64::from(c.covered);
                totals.complexity_total += u64::from(c.total.unwrap_or(0));
            }
        }
        if totals.lines > 0 {
            totals.files = 1;
        }
        totals.refresh_coverage();
        totals
    }

    /// Add another set of totals into this one (diff totals are not carried).
    pub fn accumulate(&mut self, other: &Totals) {
        self.files += other.files;
        self.lines += other.lines;
        self.hits += other.hits;
        self.misses += other.misses;
        self.partials += other.partials;
        self.branches += other.branches;
        self.methods += other.methods;
        self.messages += other.messages;
        self.complexity += other.complexity;
        self.complexity_total += other.complexity_total;
        self.refresh_coverage();
    }

    /// Re-derive `coverage` from `hits` and `lines`.
    pub fn refresh_coverage(&mut self) {
        self.coverage = format_coverage(self.hits, self.lines);
    }

    /// Coverage as a float, if one is recorded and parseable.
    #[must_use]
    pub fn coverage_f64(&self) -> Option<f64> {
        self.coverage.as_deref().and_then(|c| c.trim().parse::<f64>().ok())
    }

    /// Decode from the positional array form. Missing trailing fields
    /// default to zero; `null` entries are treated as absent.
    pub fn from_values(values: &[Value]) -> Result<Totals> {
        let int = |i: usize| -> u64 {
            values
                .get(i)
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
                .unwrap_or(0)
        };
        let coverage = match values.get(5) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(ReportError::Other(format!(
                    "invalid coverage in totals: {other}"
                )))
            }
        };
        let diff = match values.get(12) {
            Some(Value::Array(inner)) => Some(Box::new(Totals::from_values(inner)?)),
            Some(Value::Object(obj)) => Some(Box::new(Totals::from_object(obj)?)),
            _ => None,
        };
        Ok(Totals {
            files: int(0),
            lines: int(1),
            hits: int(2),
            misses: int(3),
            partials: int(4),
            coverage,
            branches: int(6),
            methods: int(7),
            messages: int(8),
            sessions: int(9),
            complexity: int(10),
            complexity_total: int(11),
            diff,
        })
    }

    /// Decode from the keyed form (`{"f":..,"n":..,"h":..,"m":..,"p":..,"c":..}`).
    pub fn from_object(obj: &serde_json::Map<String, Value>) -> Result<Totals> {
        let keys = ["f", "n", "h", "m", "p", "c", "b", "d", "M", "s", "C", "N", "diff"];
        let values: Vec<Value> = keys
            .iter()
            .map(|k| obj.get(*k).cloned().unwrap_or(Value::Null))
            .collect();
        Totals::from_values(&values)
    }

    pub fn from_json(value: &Value) -> Result<Totals> {
        match value {
            Value::Array(values) => Totals::from_values(values),
            Value::Object(obj) => Totals::from_object(obj),
            Value::Null => Ok(Totals::default()),
            other => Err(ReportError::Other(format!("invalid totals: {other}"))),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!([
            self.files,
            self.lines,
            self.hits,
            self.misses,
            self.partials,
            self.coverage,
            self.branches,
            self.methods,
            self.messages,
            self.sessions,
            self.complexity,
            self.complexity_total,
            self.diff.as_ref().map(|d| d.to_json()),
        ])
    }
}

impl Serialize for Totals {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Totals {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Totals::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// How a session entered the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadType {
    #[default]
    #[serde(rename = "uploaded")]
    Uploaded,
    #[serde(rename = "carriedforward")]
    CarriedForward,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadType::Uploaded => "uploaded",
            UploadType::CarriedForward => "carriedforward",
        }
    }
}

impl std::str::FromStr for UploadType {
    type Err = ReportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uploaded" | "" => Ok(UploadType::Uploaded),
            "carriedforward" | "carryforwarded" => Ok(UploadType::CarriedForward),
            other => Err(ReportError::Other(format!("Unknown upload type: '{other}'"))),
        }
    }
}

/// One upload's metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub id: u32,
    pub flags: Vec<String>,
    pub provider: Option<String>,
    pub build: Option<String>,
    pub job: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub time: Option<i64>,
    pub upload_type: UploadType,
    /// e.g. `{"carriedforward_from": "<sha>"}`
    pub upload_extras: serde_json::Map<String, Value>,
    pub totals: Option<Totals>,
}

impl Session {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn carried_forward(mut self, from: Option<&str>) -> Self {
        self.upload_type = UploadType::CarriedForward;
        if let Some(sha) = from {
            self.upload_extras
                .insert("carriedforward_from".to_string(), json!(sha));
        }
        self
    }

    #[must_use]
    pub fn is_carried_forward(&self) -> bool {
        self.upload_type == UploadType::CarriedForward
    }

    #[must_use]
    pub fn has_any_flag<S: AsRef<str>>(&self, flags: &[S]) -> bool {
        self.flags
            .iter()
            .any(|f| flags.iter().any(|wanted| wanted.as_ref() == f))
    }
}

/// A commit as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub id: i64,
    pub repository: String,
    /// Archive directory name of the repository.
    pub repo_hash: String,
    pub commitid: String,
    pub parent_commitid: Option<String>,
    pub branch: Option<String>,
    pub totals: Option<Totals>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(number: u32, sessions: &[(u32, CoverageValue)]) -> ReportLine {
        let sessions: Vec<LineSession> = sessions
            .iter()
            .map(|(id, c)| LineSession {
                id: *id,
                coverage: c.clone(),
            })
            .collect();
        ReportLine {
            number,
            coverage: CoverageValue::merge(sessions.iter().map(|s| &s.coverage)).unwrap(),
            kind: LineKind::Line,
            sessions,
            complexity: None,
        }
    }

    #[test]
    fn test_decode_coverage_values() {
        assert_eq!(CoverageValue::from_json(&json!(3)).unwrap(), CoverageValue::Hit(3));
        assert_eq!(CoverageValue::from_json(&json!(0)).unwrap(), CoverageValue::Miss);
        assert_eq!(CoverageValue::from_json(&json!("0")).unwrap(), CoverageValue::Miss);
        assert_eq!(CoverageValue::from_json(&Value::Null).unwrap(), CoverageValue::Miss);
        assert_eq!(CoverageValue::from_json(&json!(true)).unwrap(), CoverageValue::Hit(1));
        assert_eq!(
            CoverageValue::from_json(&json!("1/2")).unwrap(),
            CoverageValue::Partial { covered: 1, total: 2 }
        );
        assert!(CoverageValue::from_json(&json!("a/b")).is_err());
        assert!(CoverageValue::from_json(&json!({"x": 1})).is_err());
    }

    #[test]
    fn test_fraction_line_types() {
        let full = CoverageValue::Partial { covered: 2, total: 2 };
        let none = CoverageValue::Partial { covered: 0, total: 2 };
        let some = CoverageValue::Partial { covered: 1, total: 2 };
        assert_eq!(full.line_type(), LineType::Hit);
        assert_eq!(none.line_type(), LineType::Miss);
        assert_eq!(some.line_type(), LineType::Partial);
    }

    #[test]
    fn test_merge_prefers_hits() {
        let merged = CoverageValue::merge(&[
            CoverageValue::Miss,
            CoverageValue::Hit(2),
            CoverageValue::Partial { covered: 1, total: 2 },
            CoverageValue::Hit(1),
        ]);
        assert_eq!(merged, Some(CoverageValue::Hit(3)));
    }

    #[test]
    fn test_merge_hit_counts_saturate() {
        let merged = CoverageValue::merge(&[CoverageValue::Hit(u64::MAX), CoverageValue::Hit(1)]);
        assert_eq!(merged, Some(CoverageValue::Hit(u64::MAX)));
    }

    #[test]
    fn test_complexity_out_of_range_is_malformed() {
        assert!(matches!(
            Complexity::from_json(&json!(4_294_967_296u64)),
            Err(ReportError::MalformedChunk { .. })
        ));
        assert!(Complexity::from_json(&json!([1, 4_294_967_296u64])).is_err());
        assert_eq!(
            Complexity::from_json(&json!([1, 4_294_967_295u64])).unwrap(),
            Some(Complexity {
                covered: 1,
                total: Some(u32::MAX)
            })
        );
    }

    #[test]
    fn test_merge_partials_take_max() {
        let merged = CoverageValue::merge(&[
            CoverageValue::Partial { covered: 1, total: 4 },
            CoverageValue::Miss,
            CoverageValue::Partial { covered: 2, total: 3 },
        ]);
        assert_eq!(merged, Some(CoverageValue::Partial { covered: 2, total: 4 }));
    }

    #[test]
    fn test_merge_full_fraction_is_hit() {
        let merged = CoverageValue::merge(&[
            CoverageValue::Partial { covered: 1, total: 4 },
            CoverageValue::Partial { covered: 2, total: 2 },
        ])
        .unwrap();
        assert_eq!(merged.line_type(), LineType::Hit);
    }

    #[test]
    fn test_merge_empty_and_misses() {
        assert_eq!(CoverageValue::merge(&[]), None);
        assert_eq!(
            CoverageValue::merge(&[CoverageValue::Miss, CoverageValue::Miss]),
            Some(CoverageValue::Miss)
        );
    }

    #[test]
    fn test_totals_from_lines() {
        let lines = vec![
            line(1, &[(0, CoverageValue::Hit(1))]),
            line(2, &[(0, CoverageValue::Miss)]),
            line(3, &[(0, CoverageValue::Partial { covered: 1, total: 2 })]),
            line(4, &[(0, CoverageValue::Hit(5)), (1, CoverageValue::Miss)]),
        ];
        let totals = Totals::from_lines(&lines);
        assert_eq!(totals.files, 1);
        assert_eq!(totals.lines, 4);
        assert_eq!(totals.hits, 2);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.partials, 1);
        assert_eq!(totals.hits + totals.misses + totals.partials, totals.lines);
        assert_eq!(totals.coverage.as_deref(), Some("50.00000"));
    }

    #[test]
    fn test_empty_totals_have_no_coverage() {
        let totals = Totals::from_lines(&[]);
        assert_eq!(totals.files, 0);
        assert_eq!(totals.coverage, None);
    }

    #[test]
    fn test_totals_positional_decode() {
        let totals =
            Totals::from_json(&json!([3, 20, 17, 3, 0, "85.00000", 0, 0, 0, 1, 0, 0, null]))
                .unwrap();
        assert_eq!(totals.files, 3);
        assert_eq!(totals.lines, 20);
        assert_eq!(totals.hits, 17);
        assert_eq!(totals.sessions, 1);
        assert_eq!(totals.coverage.as_deref(), Some("85.00000"));

        let short = Totals::from_json(&json!([1, 2, 1])).unwrap();
        assert_eq!(short.misses, 0);
        assert_eq!(short.coverage, None);

        let numeric = Totals::from_json(&json!([1, 2, 1, 1, 0, 79.38])).unwrap();
        assert_eq!(numeric.coverage_f64(), Some(79.38));
    }

    #[test]
    fn test_totals_keyed_decode() {
        let totals =
            Totals::from_json(&json!({"f": 1, "n": 4, "h": 3, "m": 1, "p": 0, "c": "75.00000"}))
                .unwrap();
        assert_eq!(totals.lines, 4);
        assert_eq!(totals.coverage.as_deref(), Some("75.00000"));
    }

    #[test]
    fn test_coverage_formula() {
        assert_eq!(format_coverage(17, 20).as_deref(), Some("85.00000"));
        assert_eq!(format_coverage(1, 3).as_deref(), Some("33.33333"));
        assert_eq!(format_coverage(2, 3).as_deref(), Some("66.66667"));
        assert_eq!(format_coverage(0, 0), None);
    }
}
