//! Ordered migration manifest and SQL bodies, embedded at build time.

use std::collections::{HashMap, HashSet};

use include_dir::{include_dir, Dir};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::AppError;

static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/migrations");

pub const MANIFEST_PATH: &str = "meta/_journal.json";
pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub idx: u32,
    #[serde(default)]
    pub version: Option<String>,
    /// Authoring time, epoch milliseconds.
    pub when: i64,
    pub tag: String,
    #[serde(default = "default_breakpoints")]
    pub breakpoints: bool,
}

fn default_breakpoints() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    dialect: Option<String>,
    entries: Vec<JournalEntry>,
}

/// Statements of one migration plus the hash of its unsplit source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationBatch {
    pub tag: String,
    pub statements: Vec<String>,
    pub hash: String,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("migration manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("migration manifest meta/_journal.json is missing")]
    ManifestMissing,
    #[error("migration manifest targets {0:?}, expected \"sqlite\"")]
    Dialect(String),
    #[error("migration tag {tag:?} appears more than once")]
    DuplicateTag { tag: String },
    #[error("migration tag {tag:?} is out of order (follows {previous:?})")]
    OutOfOrder { tag: String, previous: String },
    #[error("no file {tag}.sql found in migrations folder")]
    MissingSource { tag: String },
    #[error("migration source {tag}.sql is not valid UTF-8")]
    InvalidSource { tag: String },
}

impl From<JournalError> for AppError {
    fn from(err: JournalError) -> Self {
        let message = err.to_string();
        match err {
            JournalError::MissingSource { tag } | JournalError::InvalidSource { tag } => {
                AppError::new(AppError::MIGRATION_MISSING_SOURCE, message).with_context("tag", tag)
            }
            JournalError::DuplicateTag { tag } | JournalError::OutOfOrder { tag, .. } => {
                AppError::new(AppError::MIGRATION_MANIFEST, message).with_context("tag", tag)
            }
            JournalError::Parse(_) | JournalError::ManifestMissing | JournalError::Dialect(_) => {
                AppError::new(AppError::MIGRATION_MANIFEST, message)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    sources: HashMap<String, String>,
}

impl Journal {
    /// The journal compiled into the binary.
    pub fn embedded() -> Result<Self, JournalError> {
        let manifest = MIGRATIONS_DIR
            .get_file(MANIFEST_PATH)
            .ok_or(JournalError::ManifestMissing)?;
        let manifest: Manifest = serde_json::from_slice(manifest.contents())?;
        if let Some(dialect) = manifest.dialect.filter(|d| d != "sqlite") {
            return Err(JournalError::Dialect(dialect));
        }

        let mut sources = HashMap::new();
        for file in MIGRATIONS_DIR.files() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(tag) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = file
                .contents_utf8()
                .ok_or_else(|| JournalError::InvalidSource {
                    tag: tag.to_string(),
                })?;
            sources.insert(tag.to_string(), body.to_string());
        }
        Self::build(manifest.entries, sources)
    }

    /// Builds a journal from `(tag, sql)` pairs in application order.
    pub fn from_sources<T, S>(sources: &[(T, S)]) -> Result<Self, JournalError>
    where
        T: AsRef<str>,
        S: AsRef<str>,
    {
        let entries = sources
            .iter()
            .enumerate()
            .map(|(idx, (tag, _))| JournalEntry {
                idx: idx as u32,
                version: None,
                when: 0,
                tag: tag.as_ref().to_string(),
                breakpoints: true,
            })
            .collect();
        let sources = sources
            .iter()
            .map(|(tag, sql)| (tag.as_ref().to_string(), sql.as_ref().to_string()))
            .collect();
        Self::build(entries, sources)
    }

    fn build(
        entries: Vec<JournalEntry>,
        sources: HashMap<String, String>,
    ) -> Result<Self, JournalError> {
        let mut seen = HashSet::new();
        let mut previous: Option<&str> = None;
        for entry in &entries {
            if !seen.insert(entry.tag.as_str()) {
                return Err(JournalError::DuplicateTag {
                    tag: entry.tag.clone(),
                });
            }
            if let Some(prev) = previous {
                if entry.tag.as_str() <= prev {
                    return Err(JournalError::OutOfOrder {
                        tag: entry.tag.clone(),
                        previous: prev.to_string(),
                    });
                }
            }
            previous = Some(entry.tag.as_str());
        }
        Ok(Self { entries, sources })
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tag of the newest migration, if any.
    pub fn head(&self) -> Option<&str> {
        self.entries.last().map(|e| e.tag.as_str())
    }

    pub fn source(&self, tag: &str) -> Result<&str, JournalError> {
        self.sources
            .get(tag)
            .map(String::as_str)
            .ok_or_else(|| JournalError::MissingSource {
                tag: tag.to_string(),
            })
    }

    pub fn batch(&self, entry: &JournalEntry) -> Result<MigrationBatch, JournalError> {
        let source = self.source(&entry.tag)?;
        let statements = if entry.breakpoints {
            split_statements(source)
        } else {
            let whole = source.trim();
            if whole.is_empty() {
                Vec::new()
            } else {
                vec![whole.to_string()]
            }
        };
        Ok(MigrationBatch {
            tag: entry.tag.clone(),
            statements,
            hash: hash_source(source),
        })
    }
}

/// Splits on the breakpoint marker; pieces are trimmed and empties dropped.
pub fn split_statements(source: &str) -> Vec<String> {
    source
        .split(STATEMENT_BREAKPOINT)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercase hex SHA-256 of the exact source bytes.
pub fn hash_source(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}
