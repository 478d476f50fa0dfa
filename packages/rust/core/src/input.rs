//! Entity list loading and batch selection.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use knowcrawl_shared::{Entity, KnowCrawlError, Result};

use crate::report::RunReport;

/// Load an entity list from a text, CSV or TSV file.
pub fn load_entities(path: &Path) -> Result<Vec<Entity>> {
    let content = std::fs::read_to_string(path).map_err(|e| KnowCrawlError::io(path, e))?;
    let entities = parse_entities(&content);
    if entities.is_empty() {
        return Err(KnowCrawlError::parse(format!(
            "no entities found in {}",
            path.display()
        )));
    }
    debug!(path = %path.display(), count = entities.len(), "loaded entities");
    Ok(entities)
}

/// Parse one entity per line: name, then an optional id column.
///
/// Columns split on a tab when the line has one, otherwise on a comma.
/// Blank lines, `#` comments and a leading `name` header are skipped.
/// Repeated names keep their first occurrence.
pub fn parse_entities(content: &str) -> Vec<Entity> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut seen = HashSet::new();
    let mut entities = Vec::new();
    let mut first_row = true;

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut columns = if line.contains('\t') {
            line.split('\t')
        } else {
            line.split(',')
        }
        .map(|col| col.trim().trim_matches('"').trim());

        let name = columns.next().unwrap_or_default();
        let header_candidate = std::mem::replace(&mut first_row, false);
        if name.is_empty() || (header_candidate && name.eq_ignore_ascii_case("name")) {
            continue;
        }
        if !seen.insert(name.to_string()) {
            warn!(line = index + 1, %name, "duplicate entity name, keeping first");
            continue;
        }

        let entity = Entity::new(name);
        entities.push(match columns.next().filter(|id| !id.is_empty()) {
            Some(id) => entity.with_id(id),
            None => entity,
        });
    }

    entities
}

/// Which entities of a loaded list to process.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Process at most this many.
    pub limit: Option<usize>,
    /// Restrict to these names.
    pub only: Vec<String>,
    /// Restrict to entities that did not persist in an earlier run.
    pub retry_from: Option<RunReport>,
}

/// Apply a [`Selection`], keeping input order.
pub fn select_entities(entities: &[Entity], selection: &Selection) -> Vec<Entity> {
    let retry: Option<HashSet<&str>> = selection
        .retry_from
        .as_ref()
        .map(|report| report.unfinished().map(|e| e.name.as_str()).collect());

    let only: HashSet<&str> = selection.only.iter().map(String::as_str).collect();
    for name in &only {
        if !entities.iter().any(|e| e.name == *name) {
            warn!(%name, "requested entity not in input list");
        }
    }

    let selected = entities
        .iter()
        .filter(|e| retry.as_ref().is_none_or(|names| names.contains(e.name.as_str())))
        .filter(|e| only.is_empty() || only.contains(e.name.as_str()))
        .take(selection.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect::<Vec<_>>();

    debug!(total = entities.len(), selected = selected.len(), "entities selected");
    selected
}
