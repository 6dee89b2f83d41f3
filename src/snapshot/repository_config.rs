//! Snapshot repository definition and its templating.
//!
//! String values may carry two kinds of placeholders, resolved in two passes:
//! `$(Y)` becomes the current year, then `%(dotted.path)s` is looked up in
//! the build document. Anything left that still looks like a placeholder is
//! an error, raised before any backend is contacted.

use crate::document::lookup_path;
use chrono::{Datelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

lazy_static! {
    static ref YEAR_PLACEHOLDER: Regex = Regex::new(r"\$\(Y\)").expect("Invalid year placeholder regex");
    static ref FIELD_PLACEHOLDER: Regex = Regex::new(r"%\(([^)]+)\)s").expect("Invalid field placeholder regex");
    static ref ANY_PLACEHOLDER: Regex = Regex::new(r"\$\([^)]*\)|%\([^)]*\)s").expect("Invalid placeholder regex");
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Failed to template: placeholder '{0}' left unresolved")]
    Unresolved(String),

    #[error("Failed to template: field '{0}' not found in build document")]
    MissingField(String),

    #[error("Failed to template: field '{0}' is not a scalar value")]
    NotScalar(String),
}

fn default_acl() -> String {
    "private".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub repository_type: String,
    #[serde(default)]
    pub settings: Map<String, JsonValue>,
    #[serde(default = "default_acl")]
    pub acl: String,
}

impl RepositoryConfig {
    /// Bucket backing the repository, if the settings name one.
    pub fn bucket(&self) -> Option<&str> {
        self.settings.get("bucket").and_then(|b| b.as_str())
    }

    /// Region requested in the repository settings.
    pub fn region(&self) -> Option<&str> {
        self.settings.get("region").and_then(|r| r.as_str())
    }

    /// Resolve every placeholder against `doc` and the current year.
    pub fn format(&self, doc: Option<&JsonValue>) -> Result<Self, TemplateError> {
        self.format_at(doc, Utc::now().year())
    }

    pub fn format_at(&self, doc: Option<&JsonValue>, year: i32) -> Result<Self, TemplateError> {
        let settings = match template_value(&JsonValue::Object(self.settings.clone()), doc, year)? {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            name: template_str(&self.name, doc, year)?,
            repository_type: template_str(&self.repository_type, doc, year)?,
            settings,
            acl: template_str(&self.acl, doc, year)?,
        })
    }
}

/// Template every string found in `value`, recursively.
pub fn template_value(
    value: &JsonValue,
    doc: Option<&JsonValue>,
    year: i32,
) -> Result<JsonValue, TemplateError> {
    Ok(match value {
        JsonValue::String(s) => JsonValue::String(template_str(s, doc, year)?),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| template_value(item, doc, year))
                .collect::<Result<_, _>>()?,
        ),
        JsonValue::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), template_value(item, doc, year)?);
            }
            JsonValue::Object(out)
        }
        other => other.clone(),
    })
}

fn template_str(s: &str, doc: Option<&JsonValue>, year: i32) -> Result<String, TemplateError> {
    let with_year = YEAR_PLACEHOLDER.replace_all(s, year.to_string().as_str());
    let resolved = match doc {
        Some(doc) => substitute_fields(&with_year, doc)?,
        None => with_year.into_owned(),
    };

    if let Some(leftover) = ANY_PLACEHOLDER.find(&resolved) {
        return Err(TemplateError::Unresolved(leftover.as_str().to_string()));
    }
    Ok(resolved)
}

fn substitute_fields(s: &str, doc: &JsonValue) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;

    for caps in FIELD_PLACEHOLDER.captures_iter(s) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let path = path.as_str();
        let text = match lookup_path(doc, path) {
            Some(JsonValue::String(v)) => v.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::Bool(b)) => b.to_string(),
            Some(JsonValue::Null) | None => {
                return Err(TemplateError::MissingField(path.to_string()))
            }
            Some(_) => return Err(TemplateError::NotScalar(path.to_string())),
        };
        out.push_str(&s[last..whole.start()]);
        out.push_str(&text);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}
