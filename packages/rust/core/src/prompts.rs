//! Prompt template set: ordered steps, slot parsing, and rendering.
//!
//! Templates use `{slot}` placeholders with `{{` / `}}` as literal braces.
//! A slot is either a built-in context key or the name of an earlier step;
//! dotted slots (`typing.entity_type.sub_type`) reach into a JSON step output.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use knowcrawl_shared::{Entity, KnowCrawlError, PromptStep, ResponseFormat, Result};

/// Entity display name.
pub const SLOT_ENTITY_NAME: &str = "entity_name";
/// Entity identifier (explicit id or derived slug).
pub const SLOT_ENTITY_ID: &str = "entity_id";
/// Aggregated retrieval text.
pub const SLOT_RAW_TEXT: &str = "raw_text";
/// JSON array of every entity name in the batch.
pub const SLOT_ALL_ENTITIES: &str = "all_entities";
/// Assembled record, pretty JSON. Only available to the review prompt.
pub const SLOT_RECORD_JSON: &str = "record_json";

/// Slots a prompt step may reference besides earlier step names.
pub const STEP_BUILTIN_SLOTS: [&str; 4] = [
    SLOT_ENTITY_NAME,
    SLOT_ENTITY_ID,
    SLOT_RAW_TEXT,
    SLOT_ALL_ENTITIES,
];

static SLOT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("valid slot regex")
});

// ---------------------------------------------------------------------------
// Template parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(String),
}

/// Split a template into literal and slot segments.
fn parse_template(label: &str, template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(KnowCrawlError::config(format!(
                                "template `{label}` has an unclosed `{{`"
                            )));
                        }
                    }
                }
                if !SLOT_NAME.is_match(&name) {
                    return Err(KnowCrawlError::config(format!(
                        "template `{label}` has an invalid slot `{{{name}}}`"
                    )));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Slot(name));
            }
            '}' => {
                return Err(KnowCrawlError::config(format!(
                    "template `{label}` has an unmatched `}}`"
                )));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Slot names referenced by a template, in first-use order without duplicates.
pub fn template_slots(label: &str, template: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    Ok(parse_template(label, template)?
        .into_iter()
        .filter_map(|seg| match seg {
            Segment::Slot(name) if seen.insert(name.clone()) => Some(name),
            _ => None,
        })
        .collect())
}

/// First segment of a dotted slot.
fn slot_root(slot: &str) -> &str {
    slot.split('.').next().unwrap_or(slot)
}

// ---------------------------------------------------------------------------
// Render context
// ---------------------------------------------------------------------------

/// Values available to templates while one entity is processed.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    values: HashMap<String, Value>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the entity's name and id and the batch entity list.
    pub fn for_entity(entity: &Entity, entity_id: &str, all_entities_json: &str) -> Self {
        let mut ctx = Self::new();
        ctx.insert(SLOT_ENTITY_NAME, entity.name.clone());
        ctx.insert(SLOT_ENTITY_ID, entity_id);
        ctx.insert(SLOT_ALL_ENTITIES, all_entities_json);
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Resolve a possibly dotted slot to its rendered text.
    fn resolve(&self, slot: &str) -> Option<String> {
        let mut parts = slot.split('.');
        let mut value = self.values.get(parts.next()?)?;
        for part in parts {
            value = match value {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Render an arbitrary template; `label` names it in errors.
///
/// Fails with [`KnowCrawlError::MissingSlot`] on the first slot the context
/// cannot fill. No partial output is ever returned.
pub fn render_template(label: &str, template: &str, ctx: &PromptContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for segment in parse_template(label, template)? {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Slot(name) => {
                let value = ctx
                    .resolve(&name)
                    .ok_or_else(|| KnowCrawlError::missing_slot(label, name.as_str()))?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

/// Render a prompt step against the context.
pub fn render(step: &PromptStep, ctx: &PromptContext) -> Result<String> {
    let prompt = render_template(&step.name, &step.template, ctx)?;
    debug!(step = %step.name, len = prompt.len(), "rendered prompt");
    Ok(prompt)
}

// ---------------------------------------------------------------------------
// PromptSet
// ---------------------------------------------------------------------------

/// Ordered, validated collection of prompt steps.
///
/// The order is fixed at construction: later steps may reference earlier
/// results by name, never the reverse.
#[derive(Debug, Clone)]
pub struct PromptSet {
    steps: Vec<PromptStep>,
}

impl PromptSet {
    /// Validate and freeze a step list.
    ///
    /// Checks name uniqueness, field assignments, template syntax, and that
    /// every slot is a built-in or an earlier step's name.
    pub fn new(steps: Vec<PromptStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(KnowCrawlError::config("at least one prompt step is required"));
        }

        let mut formats: HashMap<&str, ResponseFormat> = HashMap::new();

        for step in &steps {
            if !SLOT_NAME.is_match(&step.name) || step.name.contains('.') {
                return Err(KnowCrawlError::config(format!(
                    "invalid step name `{}`",
                    step.name
                )));
            }
            if STEP_BUILTIN_SLOTS.contains(&step.name.as_str()) || step.name == SLOT_RECORD_JSON
            {
                return Err(KnowCrawlError::config(format!(
                    "step name `{}` shadows a built-in slot",
                    step.name
                )));
            }
            if formats.contains_key(step.name.as_str()) {
                return Err(KnowCrawlError::config(format!(
                    "duplicate step name `{}`",
                    step.name
                )));
            }

            step.assignment()?;

            for slot in template_slots(&step.name, &step.template)? {
                let root = slot_root(&slot);
                if STEP_BUILTIN_SLOTS.contains(&root) {
                    continue;
                }
                match formats.get(root) {
                    Some(ResponseFormat::Json) => {}
                    Some(ResponseFormat::Text) if root == slot => {}
                    Some(ResponseFormat::Text) => {
                        return Err(KnowCrawlError::config(format!(
                            "step `{}` reaches into `{slot}` but `{root}` is a text step",
                            step.name
                        )));
                    }
                    None => return Err(KnowCrawlError::missing_slot(&step.name, slot)),
                }
            }

            formats.insert(&step.name, step.format);
        }

        Ok(Self { steps })
    }

    /// Steps in their configured total order.
    pub fn steps_in_order(&self) -> &[PromptStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn render(&self, step: &PromptStep, ctx: &PromptContext) -> Result<String> {
        render(step, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext::for_entity(&Entity::new("水资源"), "水资源", r#"["水资源","水库调度"]"#)
    }

    fn describe() -> PromptStep {
        PromptStep::new("describe", "Describe {entity_name}.", "description").unwrap()
    }

    fn relate() -> PromptStep {
        PromptStep::new(
            "relate",
            "Relate {entity_name} using {describe} among {all_entities}.",
            "relationships",
        )
        .unwrap()
    }

    #[test]
    fn render_fills_builtins() {
        let out = render(&describe(), &ctx()).unwrap();
        assert_eq!(out, "Describe 水资源.");
    }

    #[test]
    fn render_uses_prior_step_output() {
        let mut ctx = ctx();
        ctx.insert("describe", "desc-text");
        let out = render(&relate(), &ctx).unwrap();
        assert_eq!(
            out,
            r#"Relate 水资源 using desc-text among ["水资源","水库调度"]."#
        );
    }

    #[test]
    fn render_missing_slot_fails_without_output() {
        let err = render(&relate(), &ctx()).unwrap_err();
        match err {
            KnowCrawlError::MissingSlot { step, slot } => {
                assert_eq!(step, "relate");
                assert_eq!(slot, "describe");
            }
            other => panic!("expected MissingSlot, got {other}"),
        }
    }

    #[test]
    fn render_succeeds_iff_all_slots_present() {
        let template = "{a} and {b}";
        let mut ctx = PromptContext::new();
        assert!(render_template("t", template, &ctx).is_err());
        ctx.insert("a", "1");
        assert!(render_template("t", template, &ctx).is_err());
        ctx.insert("b", "2");
        assert_eq!(render_template("t", template, &ctx).unwrap(), "1 and 2");
        // Extra context keys never matter.
        ctx.insert("c", "3");
        assert_eq!(render_template("t", template, &ctx).unwrap(), "1 and 2");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let out = render_template(
            "t",
            r#"{{ "target": "{entity_name}" }}"#,
            &ctx(),
        )
        .unwrap();
        assert_eq!(out, r#"{ "target": "水资源" }"#);
    }

    #[test]
    fn dotted_slot_reads_json_output() {
        let mut ctx = ctx();
        ctx.insert(
            "typing",
            serde_json::json!({"entity_type": {"sub_type": "EngineeringProcess"}, "tags": ["a", "b"]}),
        );
        assert_eq!(
            render_template("t", "{typing.entity_type.sub_type}/{typing.tags.1}", &ctx).unwrap(),
            "EngineeringProcess/b"
        );
        assert!(matches!(
            render_template("t", "{typing.entity_type.primary_type}", &ctx),
            Err(KnowCrawlError::MissingSlot { .. })
        ));
    }

    #[test]
    fn non_string_values_render_as_json() {
        let mut ctx = PromptContext::new();
        ctx.insert("attrs", serde_json::json!({"objectives": ["防洪"]}));
        assert_eq!(
            render_template("t", "{attrs}", &ctx).unwrap(),
            r#"{"objectives":["防洪"]}"#
        );
    }

    #[test]
    fn malformed_templates_rejected() {
        assert!(render_template("t", "{unclosed", &PromptContext::new()).is_err());
        assert!(render_template("t", "stray }", &PromptContext::new()).is_err());
        assert!(render_template("t", "{bad slot}", &PromptContext::new()).is_err());
    }

    #[test]
    fn template_slots_in_first_use_order() {
        let slots = template_slots("t", "{b} {a} {b} {{x}}").unwrap();
        assert_eq!(slots, ["b", "a"]);
    }

    #[test]
    fn prompt_set_keeps_configured_order() {
        let set = PromptSet::new(vec![describe(), relate()]).unwrap();
        let names: Vec<&str> = set.steps_in_order().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["describe", "relate"]);
    }

    #[test]
    fn prompt_set_rejects_forward_reference() {
        let err = PromptSet::new(vec![relate(), describe()]).unwrap_err();
        assert!(matches!(err, KnowCrawlError::MissingSlot { ref slot, .. } if slot == "describe"));
    }

    #[test]
    fn prompt_set_rejects_duplicates_and_shadowing() {
        assert!(PromptSet::new(vec![describe(), describe()]).is_err());

        let shadow = PromptStep::new("raw_text", "x", "description").unwrap();
        assert!(PromptSet::new(vec![shadow]).is_err());

        assert!(PromptSet::new(vec![]).is_err());
    }

    #[test]
    fn prompt_set_rejects_reaching_into_text_step() {
        let deep = PromptStep::new("deep", "{describe.summary}", "notes").unwrap();
        let err = PromptSet::new(vec![describe(), deep]).unwrap_err();
        assert!(err.to_string().contains("text step"));
    }

    #[test]
    fn prompt_set_rejects_review_only_slot() {
        let step = PromptStep::new("s", "{record_json}", "notes").unwrap();
        assert!(matches!(
            PromptSet::new(vec![step]),
            Err(KnowCrawlError::MissingSlot { .. })
        ));
    }

    #[test]
    fn water_conservancy_preset_is_valid() {
        let set = PromptSet::new(knowcrawl_shared::presets::water_conservancy_steps())
            .expect("preset steps validate");
        assert_eq!(set.len(), 3);
    }
}
