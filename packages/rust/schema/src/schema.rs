//! Declarative record schema.
//!
//! A schema is a JSON-Schema-subset document (`type`, `properties`,
//! `required`, `items`) held as plain data so it can be versioned and tested
//! apart from the validator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use knowcrawl_shared::{KnowCrawlError, Result};

/// Built-in master schema for water-conservancy knowledge entities.
const MASTER_SCHEMA_JSON: &str = include_str!("../schemas/entity.schema.json");

/// Declared JSON type of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    /// Whether `value` has this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON type name of an arbitrary value, including `null`.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A schema node. The root node of a record schema is always an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: FieldType,

    /// Declared properties of an object node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,

    /// Property names that must be present, in report order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// Element schema of an array node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
}

impl Schema {
    /// A node of the given type with no nested rules.
    pub fn of(kind: FieldType) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
            required: Vec::new(),
            items: None,
        }
    }

    /// An empty object node.
    pub fn object() -> Self {
        Self::of(FieldType::Object)
    }

    /// An array node with the given element schema.
    pub fn array_of(items: Schema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of(FieldType::Array)
        }
    }

    /// Declare a required property.
    pub fn require(mut self, name: impl Into<String>, node: Schema) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, node);
        self
    }

    /// The built-in master schema.
    pub fn master() -> Self {
        Self::from_json_str(MASTER_SCHEMA_JSON).expect("embedded master schema is valid")
    }

    /// Parse a schema document and check its structure.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(json)
            .map_err(|e| KnowCrawlError::config(format!("invalid schema document: {e}")))?;
        schema.check()?;
        Ok(schema)
    }

    /// Load a schema document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KnowCrawlError::io(path, e))?;
        Self::from_json_str(&content).map_err(|e| {
            KnowCrawlError::config(format!("{}: {e}", path.display()))
        })
    }

    /// Required top-level field names.
    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// Structural sanity: root is an object and every required name is declared.
    fn check(&self) -> Result<()> {
        if self.kind != FieldType::Object {
            return Err(KnowCrawlError::config(format!(
                "schema root must be an object, found {}",
                self.kind
            )));
        }
        self.check_node("")
    }

    fn check_node(&self, path: &str) -> Result<()> {
        for name in &self.required {
            if !self.properties.contains_key(name) {
                return Err(KnowCrawlError::config(format!(
                    "required field `{}` has no declared type",
                    join(path, name)
                )));
            }
        }
        for (name, node) in &self.properties {
            node.check_node(&join(path, name))?;
        }
        if let Some(items) = &self.items {
            items.check_node(&format!("{path}[]"))?;
        }
        Ok(())
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

    #[test]
    fn master_schema_parses() {
        let schema = Schema::from_json_str(MASTER_SCHEMA_JSON).expect("embedded schema");
        assert_eq!(schema.kind, FieldType::Object);
        assert_eq!(schema.required_fields().len(), 9);
        assert!(schema.required_fields().iter().any(|f| f == "source_file"));
        assert_eq!(schema.required_fields()[0], "entity_id");

        let entity_type = &schema.properties["entity_type"];
        assert_eq!(entity_type.required, ["primary_type", "sub_type"]);

        let relations = &schema.properties["relations"];
        assert_eq!(relations.kind, FieldType::Array);
        assert_eq!(relations.items.as_ref().unwrap().kind, FieldType::Object);
    }

    #[test]
    fn builder_matches_document() {
        let built = Schema::object()
            .require("description", Schema::of(FieldType::String))
            .require("relationships", Schema::of(FieldType::String));
        let parsed = Schema::from_json_str(
            r#"{"type":"object","properties":{"description":{"type":"string"},"relationships":{"type":"string"}},"required":["description","relationships"]}"#,
        )
        .unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn non_object_root_rejected() {
        let err = Schema::from_json_str(r#"{"type":"array"}"#).unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn undeclared_required_rejected() {
        let err = Schema::from_json_str(
            r#"{"type":"object","properties":{"entity_type":{"type":"object","required":["sub_type"]}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("entity_type.sub_type"));
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(Schema::from_json_str(r#"{"type":"tuple"}"#).is_err());
    }

    #[test]
    fn type_names() {
        assert_eq!(type_name(&Value::Null), "null");
        assert_eq!(type_name(&serde_json::json!(1.5)), "number");
        assert!(FieldType::Array.matches(&serde_json::json!([])));
        assert!(!FieldType::Object.matches(&serde_json::json!([])));
    }
}
