//! Core pipeline orchestration and domain logic for knowcrawl.
//!
//! This crate ties together prompt rendering, record assembly, validation
//! and persistence into the batch extraction run ([`Pipeline::run`]).

pub mod assembler;
pub mod input;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod sink;

pub use assembler::{AssembleOptions, Assembler, Record, StepResult};
pub use input::{Selection, load_entities, parse_entities, select_entities};
pub use pipeline::{Pipeline, PipelineOptions, RunProgress, SilentProgress};
pub use prompts::{PromptContext, PromptSet, render, render_template, template_slots};
pub use report::{EntityOutcome, Outcome, RUN_REPORT_FILE, RunReport, Stage};
pub use sink::{FileNamer, JsonDirSink, RecordSink, SlugNamer, slugify};
