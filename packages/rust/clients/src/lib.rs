//! External capabilities consumed by the extraction pipeline.
//!
//! This crate provides:
//! - [`LlmClient`]: `complete(prompt) -> text`
//! - [`ContentRetriever`]: `fetch(queries) -> text`
//! - [`ChatClient`]: OpenAI-compatible chat-completions implementation
//! - [`WebRetriever`]: search-page retriever with HTML → Markdown extraction
//!
//! Every failure of an implementation surfaces as
//! [`KnowCrawlError::Service`](knowcrawl_shared::KnowCrawlError::Service).

pub mod chat;
pub mod web;

use std::future::Future;

use knowcrawl_shared::Result;

pub use chat::ChatClient;
pub use web::{WebRetriever, truncate_chars};

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("knowcrawl/", env!("CARGO_PKG_VERSION"));

/// Submits a filled prompt to a language model and returns its raw reply.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Turns an ordered list of queries into one aggregated text blob.
pub trait ContentRetriever: Send + Sync {
    fn fetch(&self, queries: &[String]) -> impl Future<Output = Result<String>> + Send;
}
