//! Shared types, error model, and configuration for knowcrawl.
//!
//! This crate is the foundation depended on by all other knowcrawl crates.
//! It provides:
//! - [`KnowCrawlError`]: the unified error type
//! - Domain types ([`Entity`], [`PromptStep`], [`FieldPath`])
//! - Configuration ([`AppConfig`], config loading) and the built-in [`presets`]

pub mod config;
pub mod error;
pub mod presets;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, ExtraFieldPolicy, LlmConfig, RecordConfig, RetrievalConfig,
    ReviewConfig, ValidationConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{KnowCrawlError, Result};
pub use types::{Assignment, Entity, FieldPath, PromptStep, ResponseFormat};
