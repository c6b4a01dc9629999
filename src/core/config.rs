//! QF-003: Configuration discovery and merging.
//!
//! Scans an ordered list of directories for pipeline configuration files,
//! parses each as section/key/value triples, and merges them into one
//! immutable [`ParameterMap`]. Keys are `section_key`, except in the
//! `general` section whose keys are used bare. Later files win on collision.
//!
//! Two dialects are accepted: INI (`[section]`, `key = value`) and TOML
//! (files ending in `.toml`).

use super::error::{ConfigError, TaskError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name patterns that mark a pipeline configuration file.
pub const CONFIG_PATTERNS: &[&str] = &["pipeline*.ini", "pipeline*config*", "pipeline*.toml"];

/// Sections whose keys are not prefixed with the section name.
const BARE_SECTIONS: &[&str] = &["general", "DEFAULT"];

// ============================================================================
// Values
// ============================================================================

/// A configuration value: a scalar string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::List(_) => None,
        }
    }

    /// Read the value as a list. Scalars are split on commas.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::Scalar(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Self::List(v) => v.clone(),
        }
    }

    /// Text substituted for a placeholder. Lists are comma-joined.
    pub fn render(&self) -> String {
        match self {
            Self::Scalar(s) => s.clone(),
            Self::List(v) => v.join(","),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Scalar(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Scalar(s)
    }
}

// ============================================================================
// ParameterMap
// ============================================================================

/// Immutable merged parameters. Built once, then only read or layered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    values: BTreeMap<String, ParamValue>,
    sources: Vec<PathBuf>,
}

impl ParameterMap {
    /// Build a map directly from key/value pairs (later pairs win).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            sources: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }

    /// Look up a key that a task cannot run without.
    pub fn require(&self, key: &str) -> Result<&ParamValue, TaskError> {
        self.get(key).ok_or_else(|| TaskError::Interpolation {
            key: key.to_string(),
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Configuration files merged into this map, in merge order.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// A new map with `locals` layered over this one. `self` is untouched.
    pub fn layered<I>(&self, locals: I) -> ParameterMap
    where
        I: IntoIterator<Item = (String, ParamValue)>,
    {
        let mut values = self.values.clone();
        values.extend(locals);
        ParameterMap {
            values,
            sources: self.sources.clone(),
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Default search order: the parent directory, then the current one.
pub fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".."), PathBuf::from(".")]
}

fn is_config_name(name: &str) -> bool {
    CONFIG_PATTERNS
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .any(|p| p.matches(name))
}

/// List configuration files in merge order.
///
/// Directories are visited in the given order (each at most once); files
/// inside a directory are taken in lexicographic order.
pub fn discover(search_paths: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
    let mut visited: Vec<PathBuf> = Vec::new();
    let mut files = Vec::new();

    for dir in search_paths {
        let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        if visited.contains(&canonical) {
            continue;
        }
        visited.push(canonical);

        if !dir.is_dir() {
            debug!(path = %dir.display(), "config search path missing, skipping");
            continue;
        }

        let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_config_name(name))
            .collect();
        names.sort();

        for name in names {
            debug!(file = %dir.join(&name).display(), "found pipeline config");
            files.push(dir.join(name));
        }
    }

    Ok(files)
}

/// Discover, parse, and merge configuration from `search_paths`.
pub fn resolve(search_paths: &[PathBuf]) -> Result<ParameterMap, ConfigError> {
    let files = discover(search_paths)?;
    if files.is_empty() {
        return Err(ConfigError::NotFound {
            searched: search_paths.to_vec(),
        });
    }

    let mut map = ParameterMap::default();
    for file in &files {
        let entries = parse_config_file(file)?;
        debug!(file = %file.display(), keys = entries.len(), "merging config");
        map.values.extend(entries);
        map.sources.push(file.clone());
    }

    info!(
        files = files.len(),
        keys = map.len(),
        "configuration resolved"
    );
    Ok(map)
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse one configuration file, choosing the dialect from its extension.
pub fn parse_config_file(path: &Path) -> Result<Vec<(String, ParamValue)>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        parse_toml(&content, path)
    } else {
        parse_ini(&content, path)
    }
}

fn qualified_key(section: &str, key: &str) -> String {
    if BARE_SECTIONS.contains(&section) {
        key.to_string()
    } else {
        format!("{}_{}", section, key)
    }
}

/// Parse INI text. `path` is only used in error messages.
///
/// Option names are lowercased; indented lines continue the previous value.
pub fn parse_ini(content: &str, path: &Path) -> Result<Vec<(String, ParamValue)>, ConfigError> {
    let mut section: Option<String> = None;
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut continuing = false;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            continuing = false;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if continuing && raw.starts_with(char::is_whitespace) {
            if let Some((_, value)) = entries.last_mut() {
                if !value.is_empty() {
                    value.push('\n');
                }
                value.push_str(trimmed);
            }
            continue;
        }

        if let Some(header) = trimmed.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::parse(path, line_no, "unterminated section header"))?
                .trim();
            if name.is_empty() {
                return Err(ConfigError::parse(path, line_no, "empty section name"));
            }
            section = Some(name.to_string());
            continuing = false;
            continue;
        }

        let Some(current) = section.as_deref() else {
            return Err(ConfigError::parse(
                path,
                line_no,
                "entry before any [section] header",
            ));
        };

        let split_at = trimmed
            .find(['=', ':'])
            .ok_or_else(|| ConfigError::parse(path, line_no, "expected 'key = value'"))?;
        let key = trimmed[..split_at].trim().to_lowercase();
        let value = trimmed[split_at + 1..].trim();
        if key.is_empty() {
            return Err(ConfigError::parse(path, line_no, "empty key"));
        }

        entries.push((qualified_key(current, &key), value.to_string()));
        continuing = true;
    }

    Ok(entries
        .into_iter()
        .map(|(k, v)| (k, ParamValue::Scalar(v)))
        .collect())
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset.min(content.len())].matches('\n').count() + 1
}

fn toml_scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

fn flatten_toml(
    prefix: Option<&str>,
    table: &toml::Table,
    path: &Path,
    out: &mut Vec<(String, ParamValue)>,
) -> Result<(), ConfigError> {
    for (key, value) in table {
        let full_key = match prefix {
            Some(p) => qualified_key(p, key),
            None => key.clone(),
        };
        match value {
            toml::Value::Table(inner) => flatten_toml(Some(&full_key), inner, path, out)?,
            toml::Value::Array(items) => {
                let list = items
                    .iter()
                    .map(|item| {
                        toml_scalar(item).ok_or_else(|| {
                            ConfigError::parse(
                                path,
                                0,
                                format!("'{}': nested arrays and tables are not supported", full_key),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                out.push((full_key, ParamValue::List(list)));
            }
            scalar => {
                if let Some(s) = toml_scalar(scalar) {
                    out.push((full_key, ParamValue::Scalar(s)));
                }
            }
        }
    }
    Ok(())
}

/// Parse TOML text. Top-level tables act as sections.
pub fn parse_toml(content: &str, path: &Path) -> Result<Vec<(String, ParamValue)>, ConfigError> {
    let table: toml::Table = content.parse().map_err(|e: toml::de::Error| {
        let line = e.span().map(|s| line_of(content, s.start)).unwrap_or(0);
        ConfigError::parse(path, line, e.message().to_string())
    })?;
    let mut out = Vec::new();
    flatten_toml(None, &table, path, &mut out)?;
    Ok(out)
}
