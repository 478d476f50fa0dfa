//! Record validation against a [`Schema`].
//!
//! Validation is pure and total: it never mutates the record, never fails,
//! and reports every violation it finds instead of stopping at the first.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use knowcrawl_shared::ExtraFieldPolicy;

use crate::schema::{FieldType, Schema, type_name};

/// A single schema violation, addressed by a dotted/indexed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The record itself is not a JSON object.
    NotAnObject { actual: String },
    /// A required field is absent.
    MissingField { path: String },
    /// A field is present with the wrong JSON type.
    TypeMismatch {
        path: String,
        expected: FieldType,
        actual: String,
    },
    /// A field the schema does not declare (only under [`ExtraFieldPolicy::Report`]).
    UnexpectedField { path: String },
}

impl Violation {
    /// Path of the offending field (empty for the record root).
    pub fn path(&self) -> &str {
        match self {
            Self::NotAnObject { .. } => "",
            Self::MissingField { path }
            | Self::TypeMismatch { path, .. }
            | Self::UnexpectedField { path } => path,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject { actual } => write!(f, "record is not an object (got {actual})"),
            Self::MissingField { path } => write!(f, "missing field `{path}`"),
            Self::TypeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "type mismatch at `{path}`: expected {expected}, got {actual}"),
            Self::UnexpectedField { path } => write!(f, "unexpected field `{path}`"),
        }
    }
}

/// Outcome of validating one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Paths reported as missing, in report order.
    pub fn missing_fields(&self) -> Vec<&str> {
        self.violations
            .iter()
            .filter_map(|v| match v {
                Violation::MissingField { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            return f.write_str("valid");
        }
        let parts: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

/// Checks records against a fixed schema under an extra-field policy.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: Schema,
    policy: ExtraFieldPolicy,
}

impl Validator {
    pub fn new(schema: Schema, policy: ExtraFieldPolicy) -> Self {
        Self { schema, policy }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validate any JSON value as a record.
    ///
    /// A non-object yields `NotAnObject` plus a `MissingField` for every
    /// required top-level field.
    pub fn validate(&self, record: &Value) -> ValidationReport {
        match record {
            Value::Object(map) => self.validate_map(map),
            other => {
                let mut violations = vec![Violation::NotAnObject {
                    actual: type_name(other).into(),
                }];
                violations.extend(self.schema.required.iter().map(|name| {
                    Violation::MissingField { path: name.clone() }
                }));
                ValidationReport::from_violations(violations)
            }
        }
    }

    /// Validate an already-unwrapped record object.
    pub fn validate_map(&self, record: &Map<String, Value>) -> ValidationReport {
        let mut violations = Vec::new();
        self.check_object(&self.schema, record, "", &mut violations);

        debug!(
            violations = violations.len(),
            "record validated"
        );
        ValidationReport::from_violations(violations)
    }

    /// Missing required fields first (schema order), then per-field checks in record order.
    fn check_object(
        &self,
        node: &Schema,
        object: &Map<String, Value>,
        prefix: &str,
        out: &mut Vec<Violation>,
    ) {
        for name in &node.required {
            if !object.contains_key(name) {
                out.push(Violation::MissingField {
                    path: join(prefix, name),
                });
            }
        }

        for (name, value) in object {
            let path = join(prefix, name);
            match node.properties.get(name) {
                Some(child) => self.check_value(child, value, &path, out),
                None => {
                    // Free-form objects (no declared properties) accept anything.
                    if self.policy == ExtraFieldPolicy::Report && !node.properties.is_empty() {
                        out.push(Violation::UnexpectedField { path });
                    }
                }
            }
        }
    }

    fn check_value(&self, node: &Schema, value: &Value, path: &str, out: &mut Vec<Violation>) {
        if !node.kind.matches(value) {
            out.push(Violation::TypeMismatch {
                path: path.to_string(),
                expected: node.kind,
                actual: type_name(value).into(),
            });
            return;
        }

        match value {
            Value::Object(map) => self.check_object(node, map, path, out),
            Value::Array(items) => {
                if let Some(item_node) = &node.items {
                    for (i, item) in items.iter().enumerate() {
                        self.check_value(item_node, item, &format!("{path}[{i}]"), out);
                    }
                }
            }
            _ => {}
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_field_schema() -> Schema {
        Schema::object()
            .require("description", Schema::of(FieldType::String))
            .require("relationships", Schema::of(FieldType::String))
    }

    fn master() -> Validator {
        Validator::new(Schema::master(), ExtraFieldPolicy::Ignore)
    }

    fn fixture() -> Value {
        let content = std::fs::read_to_string("../../../fixtures/json/record.fixture.json")
            .expect("read record fixture");
        serde_json::from_str(&content).expect("parse record fixture")
    }

    #[test]
    fn fixture_record_is_valid() {
        let report = master().validate(&fixture());
        assert!(report.valid, "unexpected violations: {report}");
        assert!(report.violations.is_empty());
    }

    #[test]
    fn each_missing_field_reported_alone() {
        let validator = master();
        let base = fixture();
        for field in validator.schema().required_fields() {
            let mut record = base.clone();
            record.as_object_mut().unwrap().remove(field);

            let report = validator.validate(&record);
            assert!(!report.valid);
            assert_eq!(
                report.violations,
                vec![Violation::MissingField {
                    path: field.clone()
                }],
                "removing `{field}`"
            );
        }
    }

    #[test]
    fn type_mismatch_reports_expected_and_actual() {
        let report = Validator::new(two_field_schema(), ExtraFieldPolicy::Ignore)
            .validate(&json!({"description": 42, "relationships": "r"}));
        assert_eq!(
            report.violations,
            vec![Violation::TypeMismatch {
                path: "description".into(),
                expected: FieldType::String,
                actual: "number".into(),
            }]
        );
        assert_eq!(
            report.to_string(),
            "type mismatch at `description`: expected string, got number"
        );
    }

    #[test]
    fn extra_fields_ignored_by_default() {
        let record = json!({"description": "d", "relationships": "r", "notes": "x"});
        let report = Validator::new(two_field_schema(), ExtraFieldPolicy::Ignore).validate(&record);
        assert!(report.valid);
    }

    #[test]
    fn extra_fields_reported_when_configured() {
        let record = json!({"description": "d", "relationships": "r", "notes": "x"});
        let report = Validator::new(two_field_schema(), ExtraFieldPolicy::Report).validate(&record);
        assert!(!report.valid);
        assert_eq!(
            report.violations,
            vec![Violation::UnexpectedField {
                path: "notes".into()
            }]
        );
    }

    #[test]
    fn free_form_object_accepts_any_keys() {
        let validator = Validator::new(Schema::master(), ExtraFieldPolicy::Report);
        let mut record = fixture();
        record["attributes"]["anything"] = json!({"nested": true});
        assert!(validator.validate(&record).valid);
    }

    #[test]
    fn nested_rules_use_paths() {
        let mut record = fixture();
        record["entity_type"]
            .as_object_mut()
            .unwrap()
            .remove("sub_type");
        record["relations"][1]["target_label"] = json!(7);

        let report = master().validate(&record);
        assert_eq!(
            report.violations,
            vec![
                Violation::MissingField {
                    path: "entity_type.sub_type".into()
                },
                Violation::TypeMismatch {
                    path: "relations[1].target_label".into(),
                    expected: FieldType::String,
                    actual: "number".into(),
                },
            ]
        );
    }

    #[test]
    fn mismatched_parent_skips_nested_checks() {
        let mut record = fixture();
        record["entity_type"] = json!("EngineeringProcess");
        let report = master().validate(&record);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].path(), "entity_type");
    }

    #[test]
    fn non_object_record_is_maximal_violation_set() {
        let validator = Validator::new(two_field_schema(), ExtraFieldPolicy::Ignore);
        let report = validator.validate(&json!(["not", "a", "record"]));
        assert!(!report.valid);
        assert_eq!(
            report.violations[0],
            Violation::NotAnObject {
                actual: "array".into()
            }
        );
        assert_eq!(report.missing_fields(), ["description", "relationships"]);
    }

    #[test]
    fn validate_does_not_mutate() {
        let record = json!({"description": 1});
        let before = record.clone();
        let _ = Validator::new(two_field_schema(), ExtraFieldPolicy::Report).validate(&record);
        assert_eq!(record, before);
    }

    #[test]
    fn violation_serializes_tagged() {
        let json = serde_json::to_string(&Violation::MissingField {
            path: "description".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"missing_field","path":"description"}"#);
    }
}
