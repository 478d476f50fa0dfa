//! Core domain types for knowcrawl extraction runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KnowCrawlError, Result};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A named seed subject to be enriched into a knowledge record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Display name; unique within a batch.
    pub name: String,
    /// Optional stable identifier supplied by the input source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// FieldPath
// ---------------------------------------------------------------------------

/// Dotted record path with at most one level of nesting (`field` or `field.key`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    pub field: String,
    pub key: Option<String>,
}

impl FieldPath {
    /// Top-level path.
    pub fn top(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            key: None,
        }
    }
}

impl FromStr for FieldPath {
    type Err = KnowCrawlError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let field = parts.next().unwrap_or_default();
        let key = parts.next();

        if parts.next().is_some() {
            return Err(KnowCrawlError::config(format!(
                "field path `{s}` nests deeper than one level"
            )));
        }
        if field.is_empty() || key.is_some_and(str::is_empty) {
            return Err(KnowCrawlError::config(format!(
                "field path `{s}` has an empty segment"
            )));
        }

        Ok(Self {
            field: field.to_string(),
            key: key.map(String::from),
        })
    }
}

impl TryFrom<String> for FieldPath {
    type Error = KnowCrawlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}.{key}", self.field),
            None => f.write_str(&self.field),
        }
    }
}

// ---------------------------------------------------------------------------
// PromptStep
// ---------------------------------------------------------------------------

/// How a step's raw LLM response is interpreted before assembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Trimmed response text, stored as a JSON string.
    #[default]
    Text,
    /// Response parsed as JSON (an optional Markdown code fence is stripped).
    Json,
}

/// One named, ordered unit of LLM prompting.
///
/// Exactly one of `target` or `spread` decides where the result lands in the
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptStep {
    /// Unique step name; later templates reference the result as `{name}`.
    pub name: String,
    /// Template text with `{slot}` placeholders and `{{`/`}}` escapes.
    pub template: String,
    #[serde(default)]
    pub format: ResponseFormat,
    /// Record path receiving the whole result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<FieldPath>,
    /// Append to a list at `target` instead of overwriting it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub append: bool,
    /// Keys copied from a JSON-object result into same-named top-level fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spread: Vec<String>,
}

/// Resolved field-assignment rule of a [`PromptStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment<'a> {
    Target { path: &'a FieldPath, append: bool },
    Spread(&'a [String]),
}

impl PromptStep {
    /// A text step writing its result to `target`.
    pub fn new(name: impl Into<String>, template: impl Into<String>, target: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            template: template.into(),
            format: ResponseFormat::Text,
            target: Some(target.parse()?),
            append: false,
            spread: Vec::new(),
        })
    }

    /// A JSON step whose object keys are spread into the record.
    pub fn spread(
        name: impl Into<String>,
        template: impl Into<String>,
        keys: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            format: ResponseFormat::Json,
            target: None,
            append: false,
            spread: keys.iter().map(|k| (*k).to_string()).collect(),
        }
    }

    /// Switch the response format to JSON.
    pub fn json(mut self) -> Self {
        self.format = ResponseFormat::Json;
        self
    }

    /// Append to a list-typed target instead of overwriting.
    pub fn appending(mut self) -> Self {
        self.append = true;
        self
    }

    /// Resolve and check the field-assignment rule.
    pub fn assignment(&self) -> Result<Assignment<'_>> {
        match (&self.target, self.spread.is_empty()) {
            (Some(path), true) => Ok(Assignment::Target {
                path,
                append: self.append,
            }),
            (None, false) => {
                if self.format != ResponseFormat::Json {
                    return Err(KnowCrawlError::config(format!(
                        "step `{}` spreads keys but its format is not json",
                        self.name
                    )));
                }
                if self.append {
                    return Err(KnowCrawlError::config(format!(
                        "step `{}` cannot combine `append` with `spread`",
                        self.name
                    )));
                }
                Ok(Assignment::Spread(&self.spread))
            }
            (Some(_), false) => Err(KnowCrawlError::config(format!(
                "step `{}` declares both `target` and `spread`",
                self.name
            ))),
            (None, true) => Err(KnowCrawlError::config(format!(
                "step `{}` declares neither `target` nor `spread`",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_parses_one_level() {
        let top: FieldPath = "description".parse().unwrap();
        assert_eq!(top, FieldPath::top("description"));

        let nested: FieldPath = "attributes.objectives".parse().unwrap();
        assert_eq!(nested.field, "attributes");
        assert_eq!(nested.key.as_deref(), Some("objectives"));
        assert_eq!(nested.to_string(), "attributes.objectives");
    }

    #[test]
    fn field_path_rejects_deep_or_empty() {
        assert!("a.b.c".parse::<FieldPath>().is_err());
        assert!("".parse::<FieldPath>().is_err());
        assert!("a.".parse::<FieldPath>().is_err());
        assert!(".b".parse::<FieldPath>().is_err());
    }

    #[test]
    fn prompt_step_from_toml() {
        let toml_str = r#"
name = "attributes"
template = "Attributes of {entity_name}"
format = "json"
target = "attributes"
"#;
        let step: PromptStep = toml::from_str(toml_str).expect("parse step");
        assert_eq!(step.format, ResponseFormat::Json);
        assert!(matches!(
            step.assignment().unwrap(),
            Assignment::Target { append: false, .. }
        ));
    }

    #[test]
    fn prompt_step_bad_target_fails_deserialize() {
        let toml_str = r#"
name = "x"
template = "t"
target = "a.b.c"
"#;
        assert!(toml::from_str::<PromptStep>(toml_str).is_err());
    }

    #[test]
    fn assignment_rules() {
        let both = PromptStep {
            spread: vec!["description".into()],
            ..PromptStep::new("s", "t", "description").unwrap().json()
        };
        assert!(both.assignment().is_err());

        let neither = PromptStep {
            target: None,
            ..PromptStep::new("s", "t", "description").unwrap()
        };
        assert!(neither.assignment().is_err());

        let text_spread = PromptStep {
            format: ResponseFormat::Text,
            ..PromptStep::spread("s", "t", &["description"])
        };
        assert!(text_spread.assignment().is_err());

        let ok = PromptStep::spread("s", "t", &["description"]);
        assert!(matches!(ok.assignment().unwrap(), Assignment::Spread(keys) if keys.len() == 1));
    }

    #[test]
    fn entity_serializes_without_empty_id() {
        let json = serde_json::to_string(&Entity::new("水资源")).unwrap();
        assert_eq!(json, r#"{"name":"水资源"}"#);
    }
}
