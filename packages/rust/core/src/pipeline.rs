//! Batch extraction pipeline: entity → retrieve → prompt → assemble →
//! validate → [review] → persist.
//!
//! Entities are processed strictly one at a time and every external call is
//! awaited before the next is issued. A failure only ever ends the current
//! entity; the batch always runs to completion (or cancellation).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use knowcrawl_clients::{ContentRetriever, LlmClient};
use knowcrawl_schema::{ValidationReport, Validator};
use knowcrawl_shared::{AppConfig, Entity, KnowCrawlError, PromptStep, Result};

use crate::assembler::{AssembleOptions, Assembler, Record, StepResult, parse_json_reply};
use crate::prompts::{
    PromptContext, PromptSet, SLOT_ALL_ENTITIES, SLOT_ENTITY_ID, SLOT_ENTITY_NAME, SLOT_RAW_TEXT,
    SLOT_RECORD_JSON, STEP_BUILTIN_SLOTS, render_template, template_slots,
};
use crate::report::{EntityOutcome, Outcome, RunReport, Stage};
use crate::sink::{RecordSink, entity_id};

/// Label used in errors raised by the query templates.
const QUERIES_LABEL: &str = "queries";
/// Label used in errors raised by the augmentation prompt.
const AUGMENT_LABEL: &str = "augment_queries";
/// Label used in errors raised by the review prompt.
const REVIEW_LABEL: &str = "review";

/// Slots available before retrieval has run.
const QUERY_SLOTS: [&str; 3] = [SLOT_ENTITY_NAME, SLOT_ENTITY_ID, SLOT_ALL_ENTITIES];

/// Static per-run configuration shared by every entity.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Query templates rendered per entity.
    pub queries: Vec<String>,
    /// Prompt asking the LLM for extra queries as a JSON array.
    pub augment_prompt: Option<String>,
    /// Prompt that receives the valid record as `{record_json}`.
    pub review_prompt: Option<String>,
    pub assemble: AssembleOptions,
    /// Names exposed as `{all_entities}`; the batch itself when empty.
    pub all_entities: Vec<String>,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queries: config.retrieval.queries.clone(),
            augment_prompt: config
                .retrieval
                .augment
                .then(|| config.retrieval.augment_prompt.clone()),
            review_prompt: config.review.enabled.then(|| config.review.template.clone()),
            assemble: AssembleOptions {
                identity_fields: config.record.identity_fields,
                source_file: config.defaults.source_file.clone(),
            },
            all_entities: Vec::new(),
        }
    }
}

/// Progress callback for reporting run status.
pub trait RunProgress: Send + Sync {
    /// Called before an entity enters retrieval.
    fn entity_started(&self, entity: &Entity, current: usize, total: usize);
    /// Called on every stage transition; `step` is set while prompting.
    fn stage(&self, entity: &Entity, stage: Stage, step: Option<&str>);
    /// Called once per entity with its terminal outcome.
    fn entity_finished(&self, outcome: &EntityOutcome);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn entity_started(&self, _entity: &Entity, _current: usize, _total: usize) {}
    fn stage(&self, _entity: &Entity, _stage: Stage, _step: Option<&str>) {}
    fn entity_finished(&self, _outcome: &EntityOutcome) {}
    fn done(&self, _report: &RunReport) {}
}

/// Why an entity stopped short of persistence.
enum Halt {
    Failed {
        stage: Stage,
        step: Option<String>,
        error: KnowCrawlError,
    },
    Rejected {
        stage: Stage,
        report: ValidationReport,
    },
}

fn failed(stage: Stage) -> impl FnOnce(KnowCrawlError) -> Halt {
    move |error| Halt::Failed {
        stage,
        step: None,
        error,
    }
}

/// The extraction orchestrator.
pub struct Pipeline<L, R, S> {
    prompts: PromptSet,
    validator: Validator,
    assembler: Assembler,
    options: PipelineOptions,
    llm: L,
    retriever: R,
    sink: S,
}

impl<L, R, S> Pipeline<L, R, S>
where
    L: LlmClient,
    R: ContentRetriever,
    S: RecordSink,
{
    /// Wire a pipeline, checking the query, augmentation and review
    /// templates against the slots they can actually see.
    pub fn new(
        prompts: PromptSet,
        validator: Validator,
        options: PipelineOptions,
        llm: L,
        retriever: R,
        sink: S,
    ) -> Result<Self> {
        for template in &options.queries {
            check_slots(QUERIES_LABEL, template, &QUERY_SLOTS)?;
        }
        if let Some(template) = &options.augment_prompt {
            check_slots(AUGMENT_LABEL, template, &QUERY_SLOTS)?;
        }
        if let Some(template) = &options.review_prompt {
            let mut allowed: Vec<&str> = STEP_BUILTIN_SLOTS.to_vec();
            allowed.push(SLOT_RECORD_JSON);
            allowed.extend(prompts.steps_in_order().iter().map(|s| s.name.as_str()));
            check_slots(REVIEW_LABEL, template, &allowed)?;
        }
        if options.queries.is_empty() && options.augment_prompt.is_none() {
            return Err(KnowCrawlError::config(
                "no retrieval queries configured and augmentation is off",
            ));
        }
        if options.assemble.identity_fields && options.assemble.source_file.is_none() {
            return Err(KnowCrawlError::config(
                "identity fields are on but no source_file is set",
            ));
        }

        Ok(Self {
            assembler: Assembler::new(options.assemble.clone()),
            prompts,
            validator,
            options,
            llm,
            retriever,
            sink,
        })
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub fn llm(&self) -> &L {
        &self.llm
    }

    pub fn retriever(&self) -> &R {
        &self.retriever
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Process `entities` in order and report every outcome.
    ///
    /// `cancel` is checked before each entity; once set, the rest are
    /// reported as [`Outcome::Cancelled`]. Already persisted records stay.
    #[instrument(skip_all, fields(entities = entities.len()))]
    pub async fn run(
        &self,
        entities: &[Entity],
        progress: &dyn RunProgress,
        cancel: &AtomicBool,
    ) -> RunReport {
        let run_id = uuid::Uuid::now_v7().to_string();
        let started_at = Utc::now();
        let total = entities.len();

        let names: Vec<&str> = if self.options.all_entities.is_empty() {
            entities.iter().map(|e| e.name.as_str()).collect()
        } else {
            self.options.all_entities.iter().map(String::as_str).collect()
        };
        let all_entities = serde_json::to_string(&names).unwrap_or_else(|_| "[]".into());

        info!(%run_id, total, steps = self.prompts.len(), "starting run");

        let mut written: HashMap<PathBuf, &str> = HashMap::new();
        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;

        for (i, entity) in entities.iter().enumerate() {
            if !cancelled && cancel.load(Ordering::SeqCst) {
                warn!(remaining = total - i, "cancellation requested, skipping remaining entities");
                cancelled = true;
            }

            let start = Instant::now();
            let outcome = if cancelled {
                Outcome::Cancelled
            } else {
                progress.entity_started(entity, i + 1, total);
                let target = self.sink.target(entity);
                match written.get(&target) {
                    Some(owner) => {
                        warn!(entity = %entity.name, %owner, "output file already written this run");
                        Outcome::Failed {
                            stage: Stage::Persisting,
                            step: None,
                            message: format!(
                                "{} was already written for `{owner}` in this run",
                                target.display()
                            ),
                        }
                    }
                    None => {
                        let outcome = self.process_entity(entity, &all_entities, progress).await;
                        if let Outcome::Persisted { path } = &outcome {
                            written.insert(path.clone(), &entity.name);
                        }
                        outcome
                    }
                }
            };

            let outcome = EntityOutcome {
                entity: entity.clone(),
                outcome,
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            progress.entity_finished(&outcome);
            outcomes.push(outcome);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            outcomes,
        };

        info!(
            persisted = report.persisted(),
            rejected = report.rejected(),
            failed = report.failed(),
            cancelled = report.skipped(),
            "run complete"
        );
        progress.done(&report);
        report
    }

    /// Drive one entity through every stage to a terminal outcome.
    #[instrument(skip_all, fields(entity = %entity.name))]
    pub async fn process_entity(
        &self,
        entity: &Entity,
        all_entities: &str,
        progress: &dyn RunProgress,
    ) -> Outcome {
        let outcome = match self.advance(entity, all_entities, progress).await {
            Ok(path) => Outcome::Persisted { path },
            Err(Halt::Rejected { stage, report }) => {
                info!(%stage, violations = report.violations.len(), %report, "record rejected");
                Outcome::Rejected { stage, report }
            }
            Err(Halt::Failed { stage, step, error }) => {
                if matches!(error, KnowCrawlError::MissingSlot { .. }) {
                    error!(%stage, step = step.as_deref(), error = %error, "template and context disagree");
                } else {
                    warn!(%stage, step = step.as_deref(), error = %error, "entity failed");
                }
                Outcome::Failed {
                    stage,
                    step,
                    message: error.to_string(),
                }
            }
        };

        info!(outcome = outcome.label(), "entity finished");
        outcome
    }

    async fn advance(
        &self,
        entity: &Entity,
        all_entities: &str,
        progress: &dyn RunProgress,
    ) -> std::result::Result<PathBuf, Halt> {
        let id = entity_id(entity);
        let mut ctx = PromptContext::for_entity(entity, &id, all_entities);

        progress.stage(entity, Stage::Retrieving, None);
        let queries = self
            .plan_queries(&ctx)
            .await
            .map_err(failed(Stage::Retrieving))?;
        let raw_text = self
            .retriever
            .fetch(&queries)
            .await
            .map_err(failed(Stage::Retrieving))?;
        if raw_text.trim().is_empty() {
            return Err(failed(Stage::Retrieving)(KnowCrawlError::service(
                "no content retrieved",
            )));
        }
        debug!(queries = queries.len(), chars = raw_text.chars().count(), "content retrieved");
        ctx.insert(SLOT_RAW_TEXT, raw_text);

        let mut results = Vec::with_capacity(self.prompts.len());
        for step in self.prompts.steps_in_order() {
            progress.stage(entity, Stage::Prompting, Some(&step.name));
            let result = self
                .run_step(step, &ctx)
                .await
                .map_err(|error| Halt::Failed {
                    stage: Stage::Prompting,
                    step: Some(step.name.clone()),
                    error,
                })?;
            ctx.insert(step.name.clone(), result.value.clone());
            results.push(result);
        }

        progress.stage(entity, Stage::Assembling, None);
        let record = self
            .assembler
            .assemble(entity, &id, &self.prompts, &results)
            .map_err(failed(Stage::Assembling))?;

        progress.stage(entity, Stage::Validating, None);
        self.check(&record, Stage::Validating)?;

        let record = match &self.options.review_prompt {
            Some(template) => {
                progress.stage(entity, Stage::Reviewing, None);
                let reviewed = self
                    .review(template, &record, &mut ctx)
                    .await
                    .map_err(failed(Stage::Reviewing))?;
                self.check(&reviewed, Stage::Reviewing)?;
                reviewed
            }
            None => record,
        };

        progress.stage(entity, Stage::Persisting, None);
        let path = self
            .sink
            .persist(entity, &record)
            .map_err(failed(Stage::Persisting))?;
        info!(path = %path.display(), "record persisted");
        Ok(path)
    }

    /// Augmented queries first, then the fixed templates, duplicates removed.
    async fn plan_queries(&self, ctx: &PromptContext) -> Result<Vec<String>> {
        let mut queries = Vec::new();

        if let Some(template) = &self.options.augment_prompt {
            let prompt = render_template(AUGMENT_LABEL, template, ctx)?;
            let reply = self.llm.complete(&prompt).await?;
            let value = parse_json_reply(&reply).map_err(|e| {
                KnowCrawlError::service(format!("query augmentation returned malformed JSON: {e}"))
            })?;
            let Value::Array(items) = value else {
                return Err(KnowCrawlError::service(
                    "query augmentation must return a JSON array of strings",
                ));
            };
            queries.extend(items.into_iter().filter_map(|item| match item {
                Value::String(q) if !q.trim().is_empty() => Some(q.trim().to_string()),
                _ => None,
            }));
        }

        for template in &self.options.queries {
            queries.push(render_template(QUERIES_LABEL, template, ctx)?);
        }

        let mut seen = HashSet::new();
        queries.retain(|q| seen.insert(q.clone()));

        if queries.is_empty() {
            return Err(KnowCrawlError::service("no retrieval queries produced"));
        }
        debug!(?queries, "queries planned");
        Ok(queries)
    }

    async fn run_step(&self, step: &PromptStep, ctx: &PromptContext) -> Result<StepResult> {
        let prompt = self.prompts.render(step, ctx)?;
        let reply = self.llm.complete(&prompt).await?;
        StepResult::parse(step, reply)
    }

    fn check(&self, record: &Record, stage: Stage) -> std::result::Result<(), Halt> {
        let report = self.validator.validate_map(record.as_map());
        if report.valid {
            Ok(())
        } else {
            Err(Halt::Rejected { stage, report })
        }
    }

    async fn review(
        &self,
        template: &str,
        record: &Record,
        ctx: &mut PromptContext,
    ) -> Result<Record> {
        ctx.insert(SLOT_RECORD_JSON, record.to_pretty_json()?);
        let prompt = render_template(REVIEW_LABEL, template, ctx)?;
        let reply = self.llm.complete(&prompt).await?;
        match parse_json_reply(&reply) {
            Ok(Value::Object(map)) => Ok(Record::from_map(map)),
            Ok(other) => Err(KnowCrawlError::service(format!(
                "review returned {} instead of an object",
                knowcrawl_schema::type_name(&other)
            ))),
            Err(e) => Err(KnowCrawlError::service(format!(
                "review returned malformed JSON: {e}"
            ))),
        }
    }
}

/// Every slot root of `template` must be in `allowed`.
fn check_slots(label: &str, template: &str, allowed: &[&str]) -> Result<()> {
    for slot in template_slots(label, template)? {
        let root = slot.split('.').next().unwrap_or(&slot);
        if !allowed.contains(&root) {
            return Err(KnowCrawlError::missing_slot(label, slot));
        }
    }
    Ok(())
}
