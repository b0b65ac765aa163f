//! Components: named groups of files selected by path regexes and/or flags,
//! configured in the repository YAML.
//!
//! Two layouts are accepted:
//!
//! ```yaml
//! component_management:
//!   default_rules:
//!     flag_regexes: ["^unit"]
//!   individual_components:
//!     - component_id: api
//!       name: API
//!       paths: ["^api/"]
//! ```
//!
//! or a bare list of `{component_id, name, paths, flags}` entries.
use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;

use crate::error::Result;
use crate::report::Report;

#[derive(Debug, Default, Deserialize)]
struct RawRules {
    paths: Option<Vec<String>>,
    flags: Option<Vec<String>>,
    flag_regexes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    component_id: Option<String>,
    name: Option<String>,
    paths: Option<Vec<String>>,
    flags: Option<Vec<String>>,
    flag_regexes: Option<Vec<String>>,
}

/// A compiled component definition.
#[derive(Debug, Clone)]
pub struct Component {
    pub component_id: String,
    pub name: String,
    pub paths: Vec<Regex>,
    /// Flags named explicitly.
    pub flags: Vec<String>,
    /// Patterns matched against the flags present in a report.
    pub flag_patterns: Vec<Regex>,
}

impl Component {
    #[must_use]
    pub fn has_flags(&self) -> bool {
        !self.flags.is_empty() || !self.flag_patterns.is_empty()
    }

    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        self.paths.iter().any(|re| re.is_match(path))
    }

    /// Explicit flags plus every flag in `report` matching a flag pattern.
    pub fn flags_for(&self, report: &Report) -> Vec<String> {
        let mut flags = self.flags.clone();
        if !self.flag_patterns.is_empty() {
            for session in report.sessions() {
                for flag in &session.flags {
                    if !flags.contains(flag) && self.flag_patterns.iter().any(|re| re.is_match(flag)) {
                        flags.push(flag.clone());
                    }
                }
            }
        }
        flags
    }

    /// Paths of the report's files that belong to this component, in index
    /// order. A file belongs when its path matches one of the path regexes
    /// or it was touched by a session carrying one of the component's flags.
    /// A component with neither paths nor flags matches every file.
    pub fn files(&self, report: &Report) -> Result<Vec<String>> {
        let match_all = self.paths.is_empty() && !self.has_flags();
        let flagged: HashSet<String> = if self.has_flags() {
            report
                .files_belonging_to_flags(&self.flags_for(report))?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        Ok(report
            .files()?
            .into_iter()
            .map(|f| f.name())
            .filter(|name| match_all || self.matches_path(name) || flagged.contains(*name))
            .map(str::to_string)
            .collect())
    }
}

/// Parse component definitions from repository YAML.
///
/// Only a syntactically invalid document is an error. An entry that cannot
/// be decoded, lacks an id, or carries an invalid regex is skipped with a
/// warning and the remaining components are still returned.
pub fn parse_components(yaml: &str) -> Result<Vec<Component>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;

    let (defaults, entries) = match &doc {
        serde_yaml::Value::Sequence(entries) => (RawRules::default(), entries.clone()),
        serde_yaml::Value::Mapping(_) => {
            let Some(management) = doc.get("component_management") else {
                return Ok(Vec::new());
            };
            let defaults = match management.get("default_rules") {
                Some(rules) => serde_yaml::from_value(rules.clone()).unwrap_or_else(|e| {
                    tracing::warn!("ignoring invalid component default_rules: {e}");
                    RawRules::default()
                }),
                None => RawRules::default(),
            };
            let entries = management
                .get("individual_components")
                .and_then(serde_yaml::Value::as_sequence)
                .cloned()
                .unwrap_or_default();
            (defaults, entries)
        }
        _ => return Ok(Vec::new()),
    };

    let mut components = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let raw: RawComponent = match serde_yaml::from_value(entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(position, "skipping invalid component definition: {e}");
                continue;
            }
        };
        match compile(raw, &defaults) {
            Ok(component) => components.push(component),
            Err(reason) => tracing::warn!(position, "skipping component: {reason}"),
        }
    }
    Ok(components)
}

fn compile(raw: RawComponent, defaults: &RawRules) -> std::result::Result<Component, String> {
    let component_id = raw
        .component_id
        .clone()
        .or_else(|| raw.name.clone())
        .ok_or_else(|| "component has neither component_id nor name".to_string())?;
    let name = raw.name.unwrap_or_else(|| component_id.clone());

    let paths = raw.paths.or_else(|| defaults.paths.clone()).unwrap_or_default();
    let flags = raw.flags.or_else(|| defaults.flags.clone()).unwrap_or_default();
    let flag_regexes = raw
        .flag_regexes
        .or_else(|| defaults.flag_regexes.clone())
        .unwrap_or_default();

    let compile_all = |patterns: &[String]| -> std::result::Result<Vec<Regex>, String> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| format!("component '{component_id}': invalid regex '{p}': {e}"))
            })
            .collect()
    };

    Ok(Component {
        paths: compile_all(&paths)?,
        flag_patterns: compile_all(&flag_regexes)?,
        component_id: component_id.clone(),
        name,
        flags,
    })
}

/// Pick the components with the given ids, keeping configuration order.
pub fn select<'a>(components: &'a [Component], ids: &[String]) -> Vec<&'a Component> {
    components
        .iter()
        .filter(|c| ids.iter().any(|id| *id == c.component_id))
        .collect()
}
