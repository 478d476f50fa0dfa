//! Per-entity outcomes and the run report.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use knowcrawl_schema::ValidationReport;
use knowcrawl_shared::{Entity, KnowCrawlError, Result};

use crate::sink::write_json_atomic;

/// File name of the report written next to the records.
///
/// The leading `_` keeps it out of [`slugify`](crate::sink::slugify)'s range.
pub const RUN_REPORT_FILE: &str = "_run-report.json";

/// Processing stage an entity was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieving,
    Prompting,
    Assembling,
    Validating,
    Reviewing,
    Persisting,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieving => "retrieving",
            Self::Prompting => "prompting",
            Self::Assembling => "assembling",
            Self::Validating => "validating",
            Self::Reviewing => "reviewing",
            Self::Persisting => "persisting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Persisted {
        path: PathBuf,
    },
    Rejected {
        stage: Stage,
        report: ValidationReport,
    },
    Failed {
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        message: String,
    },
    Cancelled,
}

impl Outcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }

    /// Short label used in logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Persisted { .. } => "persisted",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted { path } => write!(f, "persisted to {}", path.display()),
            Self::Rejected { stage, report } => write!(f, "rejected at {stage}: {report}"),
            Self::Failed {
                stage,
                step: Some(step),
                message,
            } => write!(f, "failed at {stage} ({step}): {message}"),
            Self::Failed { stage, message, .. } => write!(f, "failed at {stage}: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One entity's outcome as recorded in the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity: Entity,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn persisted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Persisted { .. }))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Rejected { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Cancelled))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn outcome_for(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.entity.name == name)
            .map(|o| &o.outcome)
    }

    /// Entities that did not reach `Persisted`, in run order.
    pub fn unfinished(&self) -> impl Iterator<Item = &Entity> {
        self.outcomes
            .iter()
            .filter(|o| !o.outcome.is_persisted())
            .map(|o| &o.entity)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KnowCrawlError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            KnowCrawlError::parse(format!("invalid run report {}: {e}", path.display()))
        })
    }
}
