//! Record assembler.
//!
//! Merges ordered step results into one insertion-ordered JSON record.
//! Assembly is deterministic: identical inputs give byte-identical output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use knowcrawl_shared::{Assignment, Entity, KnowCrawlError, PromptStep, ResponseFormat, Result};

use crate::prompts::PromptSet;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Insertion-ordered JSON object describing one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Field names in record order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Pretty-printed JSON, key order as assembled.
    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.0)
            .map_err(|e| KnowCrawlError::validation(format!("record serialization failed: {e}")))
    }

    fn set(&mut self, field: &str, value: Value) {
        // Existing keys keep their first-write position.
        self.0.insert(field.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// One step's raw LLM reply plus its parsed value.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step: String,
    pub raw: String,
    pub value: Value,
}

impl StepResult {
    /// Interpret a raw reply according to the step's response format.
    pub fn parse(step: &PromptStep, raw: String) -> Result<Self> {
        let value = match step.format {
            ResponseFormat::Text => Value::String(raw.trim().to_string()),
            ResponseFormat::Json => parse_json_reply(&raw).map_err(|e| {
                KnowCrawlError::service(format!(
                    "step `{}` returned a malformed JSON response: {e}",
                    step.name
                ))
            })?,
        };
        Ok(Self {
            step: step.name.clone(),
            raw,
            value,
        })
    }
}

/// Parse a JSON reply, tolerating a surrounding Markdown code fence.
pub fn parse_json_reply(raw: &str) -> std::result::Result<Value, serde_json::Error> {
    serde_json::from_str(strip_code_fence(raw))
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) on the opening line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Record-level options applied during assembly.
#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    /// Seed `entity_id`, `label`, `aliases` and `source_file` before any
    /// step output.
    pub identity_fields: bool,
    /// Written as `source_file` when identity seeding is on. Pipelines
    /// refuse identity seeding without it.
    pub source_file: Option<String>,
}

/// Merges step results into records according to each step's assignment.
#[derive(Debug, Clone)]
pub struct Assembler {
    options: AssembleOptions,
}

impl Assembler {
    pub fn new(options: AssembleOptions) -> Self {
        Self { options }
    }

    /// Build the record for `entity` from results given in step order.
    ///
    /// `results` must line up with `prompts.steps_in_order()`.
    #[instrument(skip_all, fields(entity = %entity.name, steps = results.len()))]
    pub fn assemble(
        &self,
        entity: &Entity,
        entity_id: &str,
        prompts: &PromptSet,
        results: &[StepResult],
    ) -> Result<Record> {
        let steps = prompts.steps_in_order();
        if steps.len() != results.len() {
            return Err(KnowCrawlError::validation(format!(
                "expected {} step results, got {}",
                steps.len(),
                results.len()
            )));
        }

        let mut record = Record::new();

        if self.options.identity_fields {
            record.set("entity_id", Value::String(entity_id.to_string()));
            record.set("label", Value::String(entity.name.clone()));
            record.set("aliases", Value::Array(Vec::new()));
            if let Some(source) = &self.options.source_file {
                record.set("source_file", Value::String(source.clone()));
            }
        }

        for (step, result) in steps.iter().zip(results) {
            if step.name != result.step {
                return Err(KnowCrawlError::validation(format!(
                    "result for `{}` supplied where `{}` was expected",
                    result.step, step.name
                )));
            }
            apply(&mut record, step, &result.value)?;
        }

        debug!(fields = record.as_map().len(), "record assembled");
        Ok(record)
    }
}

fn apply(record: &mut Record, step: &PromptStep, value: &Value) -> Result<()> {
    match step.assignment()? {
        Assignment::Spread(keys) => {
            let Value::Object(object) = value else {
                return Err(KnowCrawlError::validation(format!(
                    "step `{}` spreads keys but returned {} instead of an object",
                    step.name,
                    knowcrawl_schema::type_name(value)
                )));
            };
            for key in keys {
                match object.get(key) {
                    Some(v) => record.set(key, v.clone()),
                    None => debug!(step = %step.name, %key, "spread key absent from response"),
                }
            }
        }
        Assignment::Target { path, append } => {
            let slot = match &path.key {
                None => record.0.entry(path.field.clone()),
                Some(key) => {
                    let parent = record
                        .0
                        .entry(path.field.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    let Value::Object(parent) = parent else {
                        return Err(KnowCrawlError::validation(format!(
                            "step `{}` targets `{path}` but `{}` is not an object",
                            step.name, path.field
                        )));
                    };
                    parent.entry(key.clone())
                }
            };

            if append {
                let list = slot.or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(items) = list else {
                    return Err(KnowCrawlError::validation(format!(
                        "step `{}` appends to `{path}` which is not a list",
                        step.name
                    )));
                };
                match value {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    single => items.push(single.clone()),
                }
            } else {
                match slot {
                    serde_json::map::Entry::Occupied(mut occupied) => {
                        occupied.insert(value.clone());
                    }
                    serde_json::map::Entry::Vacant(vacant) => {
                        vacant.insert(value.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(step: &str, value: &str) -> StepResult {
        StepResult {
            step: step.into(),
            raw: value.into(),
            value: Value::String(value.into()),
        }
    }

    fn json_result(step: &str, value: Value) -> StepResult {
        StepResult {
            step: step.into(),
            raw: value.to_string(),
            value,
        }
    }

    fn describe_relate() -> PromptSet {
        PromptSet::new(vec![
            PromptStep::new("describe", "Describe {entity_name}", "description").unwrap(),
            PromptStep::new("relate", "Relate {describe}", "relationships").unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn assemble_targets_in_step_order() {
        let record = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("水资源"),
                "水资源",
                &describe_relate(),
                &[text("describe", "desc-text"), text("relate", "rel-text")],
            )
            .unwrap();

        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"description":"desc-text","relationships":"rel-text"}"#
        );
    }

    #[test]
    fn assemble_is_deterministic() {
        let assembler = Assembler::new(AssembleOptions {
            identity_fields: true,
            source_file: Some("entities.csv".into()),
        });
        let prompts = knowcrawl_shared::presets::water_conservancy_steps();
        let prompts = PromptSet::new(prompts).unwrap();
        let results = [
            json_result(
                "typing",
                json!({"description": "d", "entity_type": {"primary_type": "Process", "sub_type": "S"}, "background_context": "b"}),
            ),
            json_result("attributes", json!({"objectives": ["防洪"]})),
            json_result("relations", json!([{"target_entity_id": "x"}])),
        ];

        let first = assembler
            .assemble(&Entity::new("水库调度"), "水库调度", &prompts, &results)
            .unwrap()
            .to_pretty_json()
            .unwrap();
        let second = assembler
            .assemble(&Entity::new("水库调度"), "水库调度", &prompts, &results)
            .unwrap()
            .to_pretty_json()
            .unwrap();
        assert_eq!(first, second);

        let record: Record = serde_json::from_str(&first).unwrap();
        let fields: Vec<&str> = record.fields().collect();
        assert_eq!(
            fields,
            [
                "entity_id",
                "label",
                "aliases",
                "source_file",
                "entity_type",
                "description",
                "background_context",
                "attributes",
                "relations",
            ]
        );
    }

    #[test]
    fn typing_aliases_replace_seeded_list_in_place() {
        let assembler = Assembler::new(AssembleOptions {
            identity_fields: true,
            source_file: Some("entities.csv".into()),
        });
        let prompts =
            PromptSet::new(knowcrawl_shared::presets::water_conservancy_steps()).unwrap();
        let results = [
            json_result(
                "typing",
                json!({"aliases": ["水库调度运行"], "description": "d", "entity_type": {"primary_type": "DomainConcept", "sub_type": "EngineeringProcess"}, "background_context": "b"}),
            ),
            json_result("attributes", json!({})),
            json_result("relations", json!([])),
        ];

        let record = assembler
            .assemble(&Entity::new("水库调度"), "水库调度", &prompts, &results)
            .unwrap();
        assert_eq!(record.get("aliases"), Some(&json!(["水库调度运行"])));
        assert_eq!(record.fields().nth(2), Some("aliases"));
    }

    #[test]
    fn spread_follows_declared_key_order_and_skips_missing() {
        let prompts = PromptSet::new(vec![PromptStep::spread(
            "typing",
            "{entity_name}",
            &["entity_type", "description", "background_context"],
        )])
        .unwrap();
        let record = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("e"),
                "e",
                &prompts,
                &[json_result(
                    "typing",
                    json!({"description": "d", "entity_type": "t", "ignored": 1}),
                )],
            )
            .unwrap();

        let fields: Vec<&str> = record.fields().collect();
        assert_eq!(fields, ["entity_type", "description"]);
        assert!(record.get("ignored").is_none());
    }

    #[test]
    fn spread_requires_object_response() {
        let prompts =
            PromptSet::new(vec![PromptStep::spread("typing", "{entity_name}", &["a"])]).unwrap();
        let err = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("e"),
                "e",
                &prompts,
                &[json_result("typing", json!([1, 2]))],
            )
            .unwrap_err();
        assert!(err.to_string().contains("returned array instead of an object"));
    }

    #[test]
    fn nested_targets_share_parent_object() {
        let prompts = PromptSet::new(vec![
            PromptStep::new("objectives", "{entity_name}", "attributes.objectives").unwrap(),
            PromptStep::new("constraints", "{entity_name}", "attributes.constraints").unwrap(),
        ])
        .unwrap();
        let record = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("e"),
                "e",
                &prompts,
                &[text("objectives", "防洪"), text("constraints", "水位")],
            )
            .unwrap();
        assert_eq!(
            record.into_value(),
            json!({"attributes": {"objectives": "防洪", "constraints": "水位"}})
        );
    }

    #[test]
    fn append_extends_arrays_and_pushes_scalars() {
        let prompts = PromptSet::new(vec![
            PromptStep::new("upstream", "{entity_name}", "relations")
                .unwrap()
                .json()
                .appending(),
            PromptStep::new("downstream", "{entity_name}", "relations")
                .unwrap()
                .json()
                .appending(),
        ])
        .unwrap();
        let record = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("e"),
                "e",
                &prompts,
                &[
                    json_result("upstream", json!([{"id": 1}, {"id": 2}])),
                    json_result("downstream", json!({"id": 3})),
                ],
            )
            .unwrap();
        assert_eq!(
            record.get("relations"),
            Some(&json!([{"id": 1}, {"id": 2}, {"id": 3}]))
        );
    }

    #[test]
    fn overwrite_keeps_first_write_position() {
        let prompts = PromptSet::new(vec![
            PromptStep::new("first", "{entity_name}", "description").unwrap(),
            PromptStep::new("middle", "{entity_name}", "background_context").unwrap(),
            PromptStep::new("last", "{entity_name}", "description").unwrap(),
        ])
        .unwrap();
        let record = Assembler::new(AssembleOptions::default())
            .assemble(
                &Entity::new("e"),
                "e",
                &prompts,
                &[text("first", "a"), text("middle", "b"), text("last", "c")],
            )
            .unwrap();
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"description":"c","background_context":"b"}"#
        );
    }

    #[test]
    fn mismatched_results_rejected() {
        let assembler = Assembler::new(AssembleOptions::default());
        let entity = Entity::new("e");
        assert!(assembler
            .assemble(&entity, "e", &describe_relate(), &[text("describe", "d")])
            .is_err());
        assert!(assembler
            .assemble(
                &entity,
                "e",
                &describe_relate(),
                &[text("relate", "r"), text("describe", "d")]
            )
            .is_err());
    }

    #[test]
    fn json_reply_strips_code_fence() {
        assert_eq!(
            parse_json_reply("```json\n{\"a\": 1}\n```").unwrap(),
            json!({"a": 1})
        );
        assert_eq!(parse_json_reply("  [1, 2]  ").unwrap(), json!([1, 2]));
        assert!(parse_json_reply("not json").is_err());
    }

    #[test]
    fn step_result_parse_by_format() {
        let text_step = PromptStep::new("d", "t", "description").unwrap();
        let parsed = StepResult::parse(&text_step, "  desc-text\n".into()).unwrap();
        assert_eq!(parsed.value, json!("desc-text"));

        let json_step = text_step.json();
        let err = StepResult::parse(&json_step, "oops".into()).unwrap_err();
        assert!(matches!(err, KnowCrawlError::Service(_)));
    }
}
