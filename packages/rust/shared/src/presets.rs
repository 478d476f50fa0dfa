//! Built-in prompt presets for the water-conservancy knowledge domain.
//!
//! These are the defaults written by `knowcrawl config init`; every template
//! can be overridden from the config file.

use crate::types::{FieldPath, PromptStep, ResponseFormat};

/// Asks the model for a JSON array of search queries about an entity.
pub const QUERY_AUGMENTATION_PROMPT: &str = r#"I am building a knowledge graph about smart water conservancy. For the core entity "{entity_name}", generate 5 specific, technical search-engine queries that find expert-level material on its principles, methods, models and application cases. Prefer terminology from academic and engineering literature and mix Chinese and English queries.

Return only a JSON array of strings."#;

/// Classification, definition and background for an entity.
pub const TYPING_AND_DEFINITION_PROMPT: &str = r#"Based on the following aggregated text about "{entity_name}":
--- TEXT START ---
{raw_text}
--- TEXT END ---

Perform these tasks:
1. Classification: choose the most precise sub-type for "{entity_name}" among the `DomainConcept` sub-types `PhysicalObject`, `PhysicalPhenomenon`, `EngineeringProcess`, `AbstractConcept`, `EconomicTerm`, `Property`.
2. Definition: write an accurate, objective, encyclopedia-style `description` of "{entity_name}".
3. Background: write a more detailed `background_context` covering its role, historical development and importance in water conservancy engineering.
4. Aliases: list other names the text uses for "{entity_name}" as `aliases`, or an empty list.

Return a JSON object with the keys `entity_type` (an object with `primary_type` and `sub_type`), `description`, `background_context` and `aliases`."#;

/// Structured attribute extraction, typed by the classification step.
pub const ATTRIBUTE_EXTRACTION_PROMPT: &str = r#""{entity_name}" is a `{typing.entity_type.sub_type}`. Extract its key structured attributes from the text below. Look for, among others:
- `objectives`: e.g. flood control, power generation, irrigation, ecological protection.
- `input_data`: e.g. real-time hydrological data, weather forecasts, water demand plans.
- `key_constraints`: e.g. flood-limited water level, minimum downstream discharge, navigation requirements.
- `scheduling_rules`: e.g. scheduling charts, dispatching regulations.

--- TEXT START ---
{raw_text}
--- TEXT END ---

Return a JSON object to be used as the `attributes` field. Omit attributes that the text does not mention."#;

/// Relation inference against the batch's entity list.
pub const RELATION_INFERENCE_PROMPT: &str = r#"Re-analyze the text about "{entity_name}" and refer to this list of entities in the water conservancy domain:
{all_entities}

--- TEXT START ---
{raw_text}
--- TEXT END ---

List every explicit or strongly implied relationship between "{entity_name}" and entities in the list, each as
`{{ "target_entity_id": "...", "target_label": "...", "relationship_type": "..." }}`

Relationship types of interest:
- `uses_method`: applies a mathematical method (e.g. `OptimizationAlgorithm`, `LinearProgramming`).
- `governed_by`: constrained by a regulation or technical standard.
- `mitigates`: mitigates a natural phenomenon or disaster (e.g. `Flood`, `Drought`).
- `enables`: supports a goal (e.g. `HydropowerGeneration`, `Irrigation`).

Only output high-confidence relationships supported by the text, as a JSON array."#;

/// Expert review of the assembled record; the model returns the corrected JSON.
pub const FINAL_REVIEW_PROMPT: &str = r#"You are a senior expert in water conservancy engineering. Review the complete JSON data generated for the entity "{entity_name}" for accuracy, logic and completeness.

- Is the classification correct?
- Are the attributes comprehensive and accurate?
- Are the relationships reasonable for engineering practice?

If the data is entirely correct, return it unchanged. Otherwise return the corrected, complete JSON object and nothing else.

JSON_DATA:
{record_json}"#;

/// Default fixed retrieval queries, rendered per entity.
pub fn default_queries() -> Vec<String> {
    vec!["{entity_name}".into(), "{entity_name} 水利".into()]
}

/// The default step chain: typing → attributes → relations.
pub fn water_conservancy_steps() -> Vec<PromptStep> {
    vec![
        PromptStep::spread(
            "typing",
            TYPING_AND_DEFINITION_PROMPT,
            &["aliases", "entity_type", "description", "background_context"],
        ),
        PromptStep {
            name: "attributes".into(),
            template: ATTRIBUTE_EXTRACTION_PROMPT.into(),
            format: ResponseFormat::Json,
            target: Some(FieldPath::top("attributes")),
            append: false,
            spread: Vec::new(),
        },
        PromptStep {
            name: "relations".into(),
            template: RELATION_INFERENCE_PROMPT.into(),
            format: ResponseFormat::Json,
            target: Some(FieldPath::top("relations")),
            append: true,
            spread: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_steps_have_valid_assignments() {
        for step in water_conservancy_steps() {
            assert!(step.assignment().is_ok(), "step {} misconfigured", step.name);
        }
    }

    #[test]
    fn preset_order_is_fixed() {
        let names: Vec<String> = water_conservancy_steps()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["typing", "attributes", "relations"]);
    }
}
