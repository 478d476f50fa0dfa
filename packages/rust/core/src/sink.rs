//! Record persistence.
//!
//! Records are written one file per entity, atomically (temp file, then
//! rename), so a failed write never leaves a partial record behind.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use knowcrawl_shared::{Entity, KnowCrawlError, Result};

use crate::assembler::Record;
use crate::report::RUN_REPORT_FILE;

/// Chooses the file stem a record is persisted under.
pub trait FileNamer: Send + Sync {
    fn stem(&self, entity: &Entity) -> String;
}

/// Entity id when present, otherwise [`slugify`] of the name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlugNamer;

impl FileNamer for SlugNamer {
    fn stem(&self, entity: &Entity) -> String {
        match entity.id.as_deref().map(slug_chars) {
            Some(id) if !id.is_empty() => id,
            _ => slugify(&entity.name),
        }
    }
}

/// Identifier derived from an entity: explicit id, else the slugged name.
pub fn entity_id(entity: &Entity) -> String {
    SlugNamer.stem(entity)
}

/// Filesystem-safe slug that keeps Unicode letters and digits.
///
/// Whitespace, `-` and `_` become single dashes; everything else is dropped.
/// A name with nothing left falls back to `entity-<hash prefix>`.
pub fn slugify(name: &str) -> String {
    let slug = slug_chars(name);
    if slug.is_empty() {
        let digest = Sha256::digest(name.as_bytes());
        let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        return format!("entity-{hex}");
    }
    slug
}

/// The slug of `name` with no fallback; empty when nothing usable is left.
fn slug_chars(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Destination for validated records.
pub trait RecordSink: Send + Sync {
    /// Path the entity's record would be written to.
    fn target(&self, entity: &Entity) -> PathBuf;

    /// Persist the record; returns the final path.
    fn persist(&self, entity: &Entity, record: &Record) -> Result<PathBuf>;
}

/// Writes `<stem>.json` files into one output directory.
#[derive(Debug, Clone)]
pub struct JsonDirSink<N = SlugNamer> {
    dir: PathBuf,
    namer: N,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_namer(dir, SlugNamer)
    }
}

impl<N: FileNamer> JsonDirSink<N> {
    pub fn with_namer(dir: impl Into<PathBuf>, namer: N) -> Self {
        Self {
            dir: dir.into(),
            namer,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<N: FileNamer> RecordSink for JsonDirSink<N> {
    fn target(&self, entity: &Entity) -> PathBuf {
        self.dir.join(format!("{}.json", self.namer.stem(entity)))
    }

    fn persist(&self, entity: &Entity, record: &Record) -> Result<PathBuf> {
        let target = self.target(entity);
        if target.file_name().is_some_and(|n| n == RUN_REPORT_FILE) {
            return Err(KnowCrawlError::io(
                &target,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "name is reserved for the run report",
                ),
            ));
        }
        write_json_atomic(&target, record)?;
        Ok(target)
    }
}

/// Pretty-print `data` to `path` through a sibling temp file and a rename.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(data)
        .map_err(|e| KnowCrawlError::validation(format!("JSON serialization failed: {e}")))?;
    json.push('\n');

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| KnowCrawlError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| KnowCrawlError::io(path, std::io::ErrorKind::InvalidInput.into()))?;
    let temp = parent.join(format!(".{file_name}.tmp"));

    std::fs::write(&temp, json).map_err(|e| KnowCrawlError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(KnowCrawlError::io(path, e));
    }

    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}
