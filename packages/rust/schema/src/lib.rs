//! Schema-as-data and record validation for knowcrawl.
//!
//! This crate provides:
//! - [`Schema`]: declarative description of a record's required shape
//! - [`Validator`]: checks a record against a schema, yielding a [`ValidationReport`]

pub mod schema;
pub mod validator;

pub use schema::{FieldType, Schema, type_name};
pub use validator::{ValidationReport, Validator, Violation};
